//! CodeTap bridges a workstation editor with a remote development
//! environment: it provisions and runs the versioned editor server, serves
//! the CTAP1 control socket for session discovery and version negotiation,
//! and multiplexes editor connections over a single stdio pipe when host
//! and remote do not share a filesystem namespace.

pub mod commands;
pub mod provision;
pub mod relay;
pub mod runner;
pub mod service;
