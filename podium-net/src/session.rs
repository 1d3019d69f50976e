//! Conductor-side session management.
//!
//! Tracks which performers have introduced themselves, answers their
//! protocol messages, and broadcasts page and file changes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, Receiver, Sender};
use log::{debug, info, warn};

use podium_types::{now_millis, Action, ClientId, ControlMessage, Status};

use crate::collaborator::FileDistributor;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::error::NetError;
use crate::framing::{CLOSE_GOING_AWAY, CLOSE_NORMAL};
use crate::server::{BroadcastHandle, WsServer};
use crate::sync::lock;

const UNKNOWN_DEVICE: &str = "Unknown Device";

/// A performer that completed `client_connect`.
#[derive(Clone)]
pub struct ClientSession {
    pub client_id: ClientId,
    pub device_id: Option<String>,
    pub device_name: String,
    pub app_version: Option<String>,
    /// Epoch milliseconds.
    pub connected_at: u64,
    connection: Arc<Connection>,
}

impl ClientSession {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("client_id", &self.client_id)
            .field("device_name", &self.device_name)
            .field("app_version", &self.app_version)
            .field("connected_at", &self.connected_at)
            .field("peer", &self.connection.peer_addr())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ClientConnected { client_id: ClientId, device_name: String },
    ClientDisconnected { client_id: ClientId },
}

/// Connected performers. Clones share the same map.
#[derive(Clone, Default)]
struct SessionRegistry {
    inner: Arc<Mutex<HashMap<ClientId, ClientSession>>>,
}

impl SessionRegistry {
    fn insert(&self, session: ClientSession) -> Option<ClientSession> {
        lock(&self.inner).insert(session.client_id.clone(), session)
    }

    fn remove(&self, id: &ClientId) -> Option<ClientSession> {
        lock(&self.inner).remove(id)
    }

    fn sorted(&self) -> Vec<ClientSession> {
        let mut sessions: Vec<_> = lock(&self.inner).values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        sessions
    }

    fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    fn clear(&self) {
        lock(&self.inner).clear();
    }
}

/// What the conductor is currently showing.
#[derive(Debug, Clone, Default)]
struct Current {
    file: Option<String>,
    page: Option<u32>,
}

pub struct SessionManager {
    name: String,
    server: Arc<WsServer>,
    sessions: SessionRegistry,
    current: Arc<Mutex<Current>>,
    distributor: Option<Box<dyn FileDistributor>>,
    stop_tx: Sender<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SessionManager {
    /// Start the WebSocket server and the session dispatcher.
    pub fn start(
        config: ServerConfig,
        conductor_name: &str,
        events: Sender<SessionEvent>,
    ) -> Result<Self, NetError> {
        let (conn_tx, conn_rx) = crossbeam_channel::unbounded();
        let server = Arc::new(WsServer::start(config, conn_tx)?);
        let sessions = SessionRegistry::default();
        let current = Arc::new(Mutex::new(Current::default()));
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);

        let dispatcher = Dispatcher {
            name: conductor_name.to_string(),
            server: Arc::clone(&server),
            sessions: sessions.clone(),
            current: Arc::clone(&current),
            events,
        };
        let handle = thread::Builder::new()
            .name("session-dispatch".into())
            .spawn(move || dispatcher.run(conn_rx, stop_rx))
            .expect("failed to spawn session-dispatch thread");

        info!("conductor '{}' accepting performers on {}", conductor_name, server.local_addr());

        Ok(Self {
            name: conductor_name.to_string(),
            server,
            sessions,
            current,
            distributor: None,
            stop_tx,
            dispatcher: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn conductor_name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.server.is_alive()
    }

    /// `(client_id, device_name)` for every performer, oldest first.
    pub fn connected_clients(&self) -> Vec<(ClientId, String)> {
        self.sessions
            .sorted()
            .into_iter()
            .map(|s| (s.client_id, s.device_name))
            .collect()
    }

    pub fn sessions(&self) -> Vec<ClientSession> {
        self.sessions.sorted()
    }

    pub fn client_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn current_file(&self) -> Option<String> {
        lock(&self.current).file.clone()
    }

    pub fn current_page(&self) -> Option<u32> {
        lock(&self.current).page
    }

    pub fn broadcast_page_change(&self, page: u32, file: &str) -> Result<BroadcastHandle, NetError> {
        {
            let mut current = lock(&self.current);
            current.file = Some(file.to_string());
            current.page = Some(page);
        }
        debug!("broadcasting page change: page={}, file={}", page, file);
        self.broadcast(&ControlMessage::page_change(page, file))
    }

    /// Announce a new file. Performers also get the file server URL when
    /// one is available, so they can fetch a score they lack.
    pub fn broadcast_file_change(&self, file: &str, page: u32) -> Result<BroadcastHandle, NetError> {
        {
            let mut current = lock(&self.current);
            current.file = Some(file.to_string());
            current.page = Some(page);
        }
        let url = self.file_server_url();
        debug!("broadcasting file change: file={}, page={}, url={:?}", file, page, url);
        self.broadcast(&ControlMessage::file_change(file, page, url))
    }

    pub fn broadcast_back_to_list(&self) -> Result<BroadcastHandle, NetError> {
        *lock(&self.current) = Current::default();
        self.broadcast(&ControlMessage::back_to_list())
    }

    /// Fan a message out to every open connection. The handle yields the
    /// number of performers reached.
    pub fn broadcast(&self, message: &ControlMessage) -> Result<BroadcastHandle, NetError> {
        let text = message.to_json()?;
        Ok(self.server.broadcast(&text))
    }

    pub fn send_to(&self, client_id: &ClientId, message: &ControlMessage) -> bool {
        match message.to_json() {
            Ok(text) => self.server.send_to(client_id, &text),
            Err(_) => false,
        }
    }

    pub fn add_file(&mut self, name: &str, path: &Path) -> bool {
        match self.distributor.as_mut() {
            Some(d) => d.add_file(name, path),
            None => false,
        }
    }

    pub fn remove_file(&mut self, name: &str) -> bool {
        match self.distributor.as_mut() {
            Some(d) => d.remove_file(name),
            None => false,
        }
    }

    pub fn file_server_url(&self) -> Option<String> {
        self.distributor.as_ref().and_then(|d| d.base_url())
    }

    /// Share files through `distributor` from now on.
    pub fn set_distributor(&mut self, distributor: Box<dyn FileDistributor>) {
        self.distributor = Some(distributor);
    }

    /// Hand the file distributor back, e.g. to reuse it for the next run.
    pub fn take_distributor(&mut self) -> Option<Box<dyn FileDistributor>> {
        self.distributor.take()
    }

    /// Tell performers we are leaving, then stop the server and dispatcher.
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("conductor '{}' shutting down", self.name);

        if let Ok(text) = ControlMessage::conductor_shutdown().to_json() {
            let notified = self.server.broadcast(&text).join().unwrap_or(0);
            debug!("notified {} performers of shutdown", notified);
        }

        self.server.shutdown();

        let _ = self.stop_tx.try_send(());
        if let Some(handle) = lock(&self.dispatcher).take() {
            if handle.join().is_err() {
                log::error!("session-dispatch thread panicked");
            }
        }

        self.sessions.clear();
        if let Some(d) = self.distributor.as_mut() {
            d.clear_files();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Dispatcher {
    name: String,
    server: Arc<WsServer>,
    sessions: SessionRegistry,
    current: Arc<Mutex<Current>>,
    events: Sender<SessionEvent>,
}

impl Dispatcher {
    fn run(self, conn_rx: Receiver<ConnectionEvent>, stop_rx: Receiver<()>) {
        loop {
            select! {
                recv(stop_rx) -> _ => break,
                recv(conn_rx) -> event => match event {
                    Ok(event) => self.on_event(event),
                    Err(_) => break,
                },
            }
        }
        debug!("session dispatcher exiting");
    }

    fn on_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { client_id } => {
                debug!("{} upgraded, waiting for client_connect", client_id);
            }
            ConnectionEvent::Text { client_id, text } => match ControlMessage::from_json(&text) {
                Ok(message) => self.on_message(&client_id, message),
                Err(e) => {
                    warn!("malformed message from {}: {}", client_id, e);
                    self.reply(
                        &client_id,
                        &ControlMessage::error("malformed message", Some(client_id.clone())),
                    );
                }
            },
            ConnectionEvent::Closed { client_id, .. } => {
                if let Some(session) = self.sessions.remove(&client_id) {
                    info!("performer {} ({}) disconnected", client_id, session.device_name);
                    let _ = self.events.send(SessionEvent::ClientDisconnected { client_id });
                }
            }
        }
    }

    fn on_message(&self, client_id: &ClientId, message: ControlMessage) {
        match message.action {
            Action::ClientConnect => self.register(client_id, message),
            Action::Heartbeat => self.reply(client_id, &ControlMessage::heartbeat_response()),
            Action::RequestSync => {
                let current = lock(&self.current).clone();
                debug!("{} requested sync: {:?}", client_id, current);
                self.reply(client_id, &ControlMessage::sync_response(current.file, current.page));
            }
            Action::ClientDisconnect => {
                info!("{} asked to disconnect", client_id);
                self.server.close_client(client_id, CLOSE_NORMAL);
            }
            other => warn!("ignoring {} from {}", other.as_str(), client_id),
        }
    }

    fn register(&self, client_id: &ClientId, message: ControlMessage) {
        let Some(connection) = self.server.connection(client_id) else {
            debug!("{} vanished before registering", client_id);
            return;
        };

        let device_name = message
            .device_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
        let session = ClientSession {
            client_id: client_id.clone(),
            device_id: message.device_id,
            device_name: device_name.clone(),
            app_version: message.app_version,
            connected_at: now_millis(),
            connection,
        };
        info!(
            "performer {} connected: {} ({})",
            client_id,
            device_name,
            session.app_version.as_deref().unwrap_or("unknown version")
        );
        let is_new = self.sessions.insert(session).is_none();

        let current = lock(&self.current).clone();
        let mut response = ControlMessage::connect_response(
            Status::Success,
            &self.name,
            Some(client_id.clone()),
            current.file,
            current.page,
        );
        response.server_version = Some(env!("CARGO_PKG_VERSION").to_string());
        self.reply(client_id, &response);

        if is_new {
            let _ = self.events.send(SessionEvent::ClientConnected {
                client_id: client_id.clone(),
                device_name,
            });
        }
    }

    fn reply(&self, client_id: &ClientId, message: &ControlMessage) {
        let sent = message
            .to_json()
            .map(|text| self.server.send_to(client_id, &text))
            .unwrap_or(false);
        if !sent {
            debug!("could not send {} to {}; closing", message.action.as_str(), client_id);
            self.server.close_client(client_id, CLOSE_GOING_AWAY);
        }
    }
}
