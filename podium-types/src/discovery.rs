//! UDP discovery payloads.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Value of the `type` field in every conductor announcement.
pub const ANNOUNCEMENT_TYPE: &str = "conductor_announcement";

/// Datagram broadcast by a conductor so performers can find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(rename = "type")]
    pub kind: String,
    pub conductor_name: Option<String>,
    pub websocket_port: Option<u16>,
    pub timestamp: Option<u64>,
    pub ip_address: Option<String>,
}

impl Announcement {
    pub fn new(conductor_name: &str, websocket_port: u16, ip_address: &str, timestamp: u64) -> Self {
        Self {
            kind: ANNOUNCEMENT_TYPE.to_string(),
            conductor_name: Some(conductor_name.to_string()),
            websocket_port: Some(websocket_port),
            timestamp: Some(timestamp),
            ip_address: Some(ip_address.to_string()),
        }
    }

    pub fn is_conductor_announcement(&self) -> bool {
        self.kind == ANNOUNCEMENT_TYPE
    }
}

/// A conductor seen on the network.
///
/// Identity is `(ip_address, port)`; `announced_at` tracks the latest sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductorInfo {
    pub name: String,
    pub ip_address: IpAddr,
    pub port: u16,
    pub announced_at: u64,
}

impl ConductorInfo {
    pub fn key(&self) -> (IpAddr, u16) {
        (self.ip_address, self.port)
    }

    /// `ip:port` form suitable for dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}
