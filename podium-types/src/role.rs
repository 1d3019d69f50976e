//! Collaboration role of this device.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Exactly one role is active per device at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    None,
    Conductor,
    Performer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Conductor => "conductor",
            Role::Performer => "performer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Role::None),
            "conductor" => Ok(Role::Conductor),
            "performer" => Ok(Role::Performer),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}
