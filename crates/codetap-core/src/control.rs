//! CTAP1 control protocol wire types and request grammar.
//!
//! The control protocol is line-oriented ASCII over a per-session Unix
//! socket (`<name>.ctl.sock`), one request per connection:
//!
//! ```text
//! request  := "CTAP1 INFO" LF
//!           | "CTAP1 CONNECT" SP commit SP client_id LF
//! response := json LF               ; for INFO
//!           | "OK" SP token LF      ; for CONNECT success (token may be empty)
//!           | "ERR" SP reason LF    ; for any failure
//! ```
//!
//! `CONNECT OK` keeps the connection open: the live connection is the
//! client's lease on the session.

use serde::{Deserialize, Serialize};

/// Session metadata served as one JSON line in response to `CTAP1 INFO`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Stable session name; keys the socket pair in the session directory.
    pub name: String,
    /// Commit of the currently running server (40-char lowercase hex).
    pub commit: String,
    /// Server architecture string (`x64` or `arm64`).
    pub arch: String,
    /// Workspace folder the session serves.
    pub folder: String,
    /// PID of the codetap process owning the session.
    pub pid: u32,
    /// RFC3339 timestamp of when the current server started.
    pub started_at: String,
}

impl SessionInfo {
    /// Parse `started_at` back into a timestamp; `None` if it is absent or
    /// malformed (a dead or foreign session).
    pub fn started_at_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::parse_from_rfc3339(&self.started_at)
            .ok()
            .map(|t| t.with_timezone(&chrono::Utc))
    }
}

/// A parsed control request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlRequest {
    /// `CTAP1 INFO`
    Info,
    /// `CTAP1 CONNECT <commit> <client_id>`
    Connect { commit: String, client_id: String },
}

/// Why a request line was rejected. The server answers each variant with a
/// fixed `ERR` line and closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlRequestError {
    UnknownCommand,
    InvalidConnectSyntax,
}

impl CtlRequestError {
    /// The newline-terminated `ERR` response for this rejection.
    pub fn response_line(self) -> &'static str {
        match self {
            Self::UnknownCommand => "ERR unknown command\n",
            Self::InvalidConnectSyntax => "ERR invalid CONNECT syntax\n",
        }
    }
}

/// Parse one request line (trailing newline tolerated).
pub fn parse_request(line: &str) -> Result<CtlRequest, CtlRequestError> {
    let line = line.trim();
    if line == "CTAP1 INFO" {
        return Ok(CtlRequest::Info);
    }
    if line.starts_with("CTAP1 CONNECT ") {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 4 {
            return Err(CtlRequestError::InvalidConnectSyntax);
        }
        return Ok(CtlRequest::Connect {
            commit: parts[2].to_string(),
            client_id: parts[3].to_string(),
        });
    }
    Err(CtlRequestError::UnknownCommand)
}
