//! # podium-types
//!
//! Shared type definitions for the podium score-following ecosystem.
//! This crate contains the wire types used by podium-net and the podium binary.

pub mod discovery;
pub mod message;
pub mod role;

pub use discovery::{Announcement, ConductorInfo, ANNOUNCEMENT_TYPE};
pub use message::{Action, ControlMessage, Status};
pub use role::Role;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of one connected peer.
///
/// The conductor assigns `client_<sequence>` at accept time; performers
/// identify themselves with `client_<millis>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_sequence(seq: u64) -> Self {
        Self(format!("client_{}", seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
