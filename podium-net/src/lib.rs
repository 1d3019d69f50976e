//! Network layer for podium score following.
//!
//! One conductor drives the page shown on any number of performers over a
//! LAN. This crate holds the whole protocol stack: a small WebSocket
//! transport over raw TCP, the conductor's session manager, the performer's
//! message reliability queue, UDP discovery, and the role context that ties
//! them together.

pub mod client;
pub mod collaborator;
pub mod config;
pub mod connection;
pub mod context;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod interfaces;
pub mod queue;
pub mod server;
pub mod session;
mod sync;

pub use client::{parse_host_port, ClientEvent, ReconnectPolicy, WsClient};
pub use collaborator::{
    DirectoryLibrary, FileDistributor, FileIndex, FileLibrary, JsonFileSettings, MemorySettings, SettingsStore,
    KEY_COLLABORATION_MODE, KEY_LAST_SERVER_ADDRESS,
};
pub use config::{ConfigError, NetConfig};
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use context::{Collaboration, PerformerEvent, RoleEvents};
pub use discovery::{Announcer, DiscoveryEvent, DiscoveryListener};
pub use error::{HandshakeError, NetError};
pub use queue::{HandlerResult, MessageHandler, MessageKind, MessageQueue, Outcome, Priority, QueueStats, QueuedMessage};
pub use server::{BindRetry, BroadcastHandle, WsServer};
pub use session::{ClientSession, SessionEvent, SessionManager};

pub use podium_types::{Action, ClientId, ConductorInfo, ControlMessage, Role, Status};
