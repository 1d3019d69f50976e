//! Control messages exchanged between conductor and performers.
//!
//! Every message is a flat JSON object. `action` is always present; the other
//! fields are optional and interpreted per action. Absent fields are omitted
//! from the encoded text.

use serde::{Deserialize, Serialize};

use crate::{now_millis, ClientId};

/// What a control message asks the receiver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    PageChange,
    FileChange,
    ClientConnect,
    ConnectResponse,
    Heartbeat,
    HeartbeatResponse,
    RequestSync,
    SyncResponse,
    ClientDisconnect,
    ConductorShutdown,
    Error,
    BackToList,
    /// An action this build does not know. Peers may run newer versions.
    #[serde(other)]
    Unknown,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::PageChange => "page_change",
            Action::FileChange => "file_change",
            Action::ClientConnect => "client_connect",
            Action::ConnectResponse => "connect_response",
            Action::Heartbeat => "heartbeat",
            Action::HeartbeatResponse => "heartbeat_response",
            Action::RequestSync => "request_sync",
            Action::SyncResponse => "sync_response",
            Action::ClientDisconnect => "client_disconnect",
            Action::ConductorShutdown => "conductor_shutdown",
            Action::Error => "error",
            Action::BackToList => "back_to_list",
            Action::Unknown => "unknown",
        }
    }
}

/// Outcome carried by `connect_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
    Rejected,
    #[serde(other)]
    Other,
}

/// The wire payload of every WebSocket text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: Action,
    /// Producer clock, milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// 1-based page number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Logical file name, never a path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub two_page_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_server_url: Option<String>,
}

impl ControlMessage {
    /// A bare message for `action`, stamped with the current time.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            timestamp: now_millis(),
            client_id: None,
            device_id: None,
            device_name: None,
            page: None,
            file: None,
            two_page_mode: None,
            status: None,
            master_id: None,
            current_file: None,
            current_page: None,
            app_version: None,
            server_version: None,
            error_message: None,
            file_server_url: None,
        }
    }

    pub fn page_change(page: u32, file: &str) -> Self {
        Self {
            page: Some(page),
            file: Some(file.to_string()),
            ..Self::new(Action::PageChange)
        }
    }

    pub fn file_change(file: &str, page: u32, file_server_url: Option<String>) -> Self {
        Self {
            file: Some(file.to_string()),
            page: Some(page),
            file_server_url,
            ..Self::new(Action::FileChange)
        }
    }

    pub fn back_to_list() -> Self {
        Self::new(Action::BackToList)
    }

    pub fn client_connect(device_id: &str, device_name: &str, app_version: &str) -> Self {
        Self {
            device_id: Some(device_id.to_string()),
            device_name: Some(device_name.to_string()),
            app_version: Some(app_version.to_string()),
            ..Self::new(Action::ClientConnect)
        }
    }

    pub fn connect_response(
        status: Status,
        conductor_id: &str,
        client_id: Option<ClientId>,
        current_file: Option<String>,
        current_page: Option<u32>,
    ) -> Self {
        Self {
            status: Some(status),
            master_id: Some(conductor_id.to_string()),
            client_id,
            current_file,
            current_page,
            ..Self::new(Action::ConnectResponse)
        }
    }

    pub fn heartbeat(client_id: Option<ClientId>) -> Self {
        Self {
            client_id,
            ..Self::new(Action::Heartbeat)
        }
    }

    pub fn heartbeat_response() -> Self {
        Self::new(Action::HeartbeatResponse)
    }

    pub fn request_sync(client_id: ClientId, device_name: &str) -> Self {
        Self {
            client_id: Some(client_id),
            device_name: Some(device_name.to_string()),
            ..Self::new(Action::RequestSync)
        }
    }

    pub fn sync_response(current_file: Option<String>, current_page: Option<u32>) -> Self {
        Self {
            current_file,
            current_page,
            ..Self::new(Action::SyncResponse)
        }
    }

    pub fn client_disconnect(client_id: ClientId) -> Self {
        Self {
            client_id: Some(client_id),
            ..Self::new(Action::ClientDisconnect)
        }
    }

    pub fn conductor_shutdown() -> Self {
        Self::new(Action::ConductorShutdown)
    }

    pub fn error(message: &str, client_id: Option<ClientId>) -> Self {
        Self {
            error_message: Some(message.to_string()),
            client_id,
            ..Self::new(Action::Error)
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(Status::Success)
    }
}
