//! Core protocol and platform support for CodeTap.
//!
//! This crate holds everything shared between the session process, the relay
//! process, and control-socket clients:
//!
//! - [`frame`]: the binary multiplexing protocol carried over stdio pipes
//! - [`control`]: the line-oriented CTAP1 control protocol
//! - [`ctl_client`]: client helpers for querying control sockets
//! - [`store`]: socket paths and session discovery in the socket directory
//! - [`token`]: connection token generation
//! - [`platform`]: architecture detection and filesystem path resolution
//! - [`logging`]: process-level tracing setup

pub mod control;
pub mod ctl_client;
pub mod frame;
pub mod logging;
pub mod platform;
pub mod store;
pub mod token;
