//! Role context: the one place that knows whether this device conducts,
//! performs, or neither.
//!
//! The application owns a single [`Collaboration`]. Switching roles tears
//! the previous role down completely (sockets closed, threads joined)
//! before the next one starts, so a device never holds the conductor port
//! while performing.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};

use podium_types::{Action, ConductorInfo, ControlMessage, Role};

use crate::client::{parse_host_port, ClientEvent, WsClient};
use crate::collaborator::{
    FileDistributor, FileLibrary, SettingsStore, KEY_COLLABORATION_MODE, KEY_LAST_SERVER_ADDRESS,
};
use crate::config::NetConfig;
use crate::discovery::{Announcer, DiscoveryEvent, DiscoveryListener};
use crate::error::NetError;
use crate::interfaces;
use crate::queue::{HandlerResult, MessageHandler, MessageKind, MessageQueue, Priority, QueueStats, QueuedMessage};
use crate::session::{SessionEvent, SessionManager};

/// What the performer UI needs to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum PerformerEvent {
    ConnectionStatus(bool),
    /// Reconnection gave up.
    ConnectFailed,
    PageChange { page: u32, file: String },
    FileChange { file: String, page: u32, file_server_url: Option<String> },
    /// The conductor switched to a file this device does not have.
    FileNotFound { file: String, file_server_url: Option<String> },
    BackToList,
    ConductorDiscovered(ConductorInfo),
    DiscoveryTimeout,
    ConductorShutdown,
    QueueStats(QueueStats),
}

/// Event stream of whichever role [`Collaboration::restore`] brought back.
pub enum RoleEvents {
    None,
    Conductor(Receiver<SessionEvent>),
    Performer(Receiver<PerformerEvent>),
}

struct ConductorRole {
    session: SessionManager,
    announcer: Option<Announcer>,
}

struct PerformerRole {
    queue: Arc<MessageQueue>,
    events: Sender<PerformerEvent>,
    client: Option<WsClient>,
    client_pump: Option<JoinHandle<()>>,
    discovery: Option<DiscoveryListener>,
    discovery_pump: Option<JoinHandle<()>>,
}

impl PerformerRole {
    fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            client.disconnect();
        }
        join_pump(self.client_pump.take(), "performer-pump");
    }

    fn stop_discovery(&mut self) {
        if let Some(mut listener) = self.discovery.take() {
            listener.stop();
        }
        join_pump(self.discovery_pump.take(), "discovery-pump");
    }

    fn shutdown(mut self) {
        self.stop_discovery();
        self.disconnect();
        self.queue.stop_processing();
        self.queue.clear();
    }
}

fn join_pump(handle: Option<JoinHandle<()>>, name: &str) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            log::error!("{} thread panicked", name);
        }
    }
}

enum Active {
    None,
    Conductor(ConductorRole),
    Performer(PerformerRole),
}

pub struct Collaboration {
    config: NetConfig,
    settings: Box<dyn SettingsStore>,
    library: Option<Arc<dyn FileLibrary>>,
    distributor: Option<Box<dyn FileDistributor>>,
    active: Active,
}

impl Collaboration {
    pub fn new(config: NetConfig, settings: Box<dyn SettingsStore>) -> Self {
        Self {
            config,
            settings,
            library: None,
            distributor: None,
            active: Active::None,
        }
    }

    /// Check incoming file changes against the performer's local scores.
    pub fn with_library(mut self, library: Arc<dyn FileLibrary>) -> Self {
        self.library = Some(library);
        self
    }

    /// Share files with performers while conducting.
    pub fn with_distributor(mut self, distributor: Box<dyn FileDistributor>) -> Self {
        self.distributor = Some(distributor);
        self
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        match self.active {
            Active::None => Role::None,
            Active::Conductor(_) => Role::Conductor,
            Active::Performer(_) => Role::Performer,
        }
    }

    /// The role stored by the last activation, whether or not it is running.
    pub fn saved_role(&self) -> Role {
        self.settings
            .get(KEY_COLLABORATION_MODE)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    fn persist_role(&mut self, role: Role) {
        if let Err(e) = self.settings.set(KEY_COLLABORATION_MODE, role.as_str()) {
            warn!("could not save collaboration mode: {}", e);
        }
    }

    /// Stop whatever role is running. Returns true if something was torn down.
    fn teardown(&mut self) -> bool {
        match std::mem::replace(&mut self.active, Active::None) {
            Active::None => false,
            Active::Conductor(mut role) => {
                if let Some(mut announcer) = role.announcer.take() {
                    announcer.stop();
                }
                role.session.shutdown();
                if let Some(distributor) = role.session.take_distributor() {
                    self.distributor = Some(distributor);
                }
                info!("conductor role stopped");
                true
            }
            Active::Performer(role) => {
                role.shutdown();
                info!("performer role stopped");
                true
            }
        }
    }

    fn teardown_and_settle(&mut self) {
        if self.teardown() && !self.config.role_settle.is_zero() {
            debug!("waiting {:?} for resources to settle", self.config.role_settle);
            thread::sleep(self.config.role_settle);
        }
    }

    /// Become the conductor: start the session manager, then announce it.
    pub fn activate_conductor(&mut self, name: &str) -> Result<Receiver<SessionEvent>, NetError> {
        info!("activating conductor mode as '{}'", name);
        self.teardown_and_settle();

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut session = SessionManager::start(self.config.server.clone(), name, tx)?;
        if let Some(distributor) = self.distributor.take() {
            session.set_distributor(distributor);
        }

        let announcer = match Announcer::start(&self.config.discovery, name, session.port()) {
            Ok(a) => Some(a),
            Err(e) => {
                warn!("conductor announcements unavailable: {}", e);
                None
            }
        };

        self.active = Active::Conductor(ConductorRole { session, announcer });
        self.persist_role(Role::Conductor);
        Ok(rx)
    }

    /// Become a performer. Nothing is dialed until `connect` or discovery.
    pub fn activate_performer(&mut self) -> Result<Receiver<PerformerEvent>, NetError> {
        info!("activating performer mode");
        self.teardown_and_settle();

        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = Arc::new(MessageQueue::new(self.config.queue.clone()));
        {
            let tx = tx.clone();
            queue.set_stats_sink(move |stats| {
                let _ = tx.send(PerformerEvent::QueueStats(stats));
            });
        }
        queue.start_processing(PerformerHandler {
            events: tx.clone(),
            library: self.library.clone(),
        });

        self.active = Active::Performer(PerformerRole {
            queue,
            events: tx,
            client: None,
            client_pump: None,
            discovery: None,
            discovery_pump: None,
        });
        self.persist_role(Role::Performer);
        Ok(rx)
    }

    /// Leave any role and remember that none is active.
    pub fn deactivate(&mut self) {
        info!("deactivating collaboration mode");
        self.teardown();
        self.persist_role(Role::None);
    }

    /// Bring back the role saved by the previous run.
    pub fn restore(&mut self, conductor_name: &str) -> Result<RoleEvents, NetError> {
        match self.saved_role() {
            Role::Conductor => {
                info!("restoring conductor mode");
                self.activate_conductor(conductor_name).map(RoleEvents::Conductor)
            }
            Role::Performer => {
                info!("restoring performer mode");
                self.activate_performer().map(RoleEvents::Performer)
            }
            Role::None => Ok(RoleEvents::None),
        }
    }

    /// One-line summary for a status bar.
    pub fn status_text(&self) -> String {
        match &self.active {
            Active::None => "Collaboration: off".to_string(),
            Active::Conductor(role) => format!(
                "Collaboration: conductor ({} connected)",
                role.session.client_count()
            ),
            Active::Performer(role) => match &role.client {
                Some(client) if client.is_connected() => {
                    format!("Collaboration: performer (connected to {})", client.conductor_address())
                }
                _ => "Collaboration: performer (disconnected)".to_string(),
            },
        }
    }

    fn conductor(&self) -> Result<&ConductorRole, NetError> {
        match &self.active {
            Active::Conductor(role) => Ok(role),
            _ => Err(NetError::WrongRole {
                expected: Role::Conductor,
            }),
        }
    }

    fn conductor_mut(&mut self) -> Result<&mut ConductorRole, NetError> {
        match &mut self.active {
            Active::Conductor(role) => Ok(role),
            _ => Err(NetError::WrongRole {
                expected: Role::Conductor,
            }),
        }
    }

    fn performer(&self) -> Result<&PerformerRole, NetError> {
        match &self.active {
            Active::Performer(role) => Ok(role),
            _ => Err(NetError::WrongRole {
                expected: Role::Performer,
            }),
        }
    }

    fn performer_mut(&mut self) -> Result<&mut PerformerRole, NetError> {
        match &mut self.active {
            Active::Performer(role) => Ok(role),
            _ => Err(NetError::WrongRole {
                expected: Role::Performer,
            }),
        }
    }

    // Conductor operations

    pub fn broadcast_page_change(&self, page: u32, file: &str) -> Result<(), NetError> {
        self.conductor()?.session.broadcast_page_change(page, file)?;
        Ok(())
    }

    pub fn broadcast_file_change(&self, file: &str, page: u32) -> Result<(), NetError> {
        self.conductor()?.session.broadcast_file_change(file, page)?;
        Ok(())
    }

    pub fn broadcast_back_to_list(&self) -> Result<(), NetError> {
        self.conductor()?.session.broadcast_back_to_list()?;
        Ok(())
    }

    pub fn connected_clients(&self) -> Vec<(podium_types::ClientId, String)> {
        self.conductor()
            .map(|role| role.session.connected_clients())
            .unwrap_or_default()
    }

    pub fn client_count(&self) -> usize {
        self.conductor().map(|role| role.session.client_count()).unwrap_or(0)
    }

    pub fn is_server_running(&self) -> bool {
        self.conductor().map(|role| role.session.is_running()).unwrap_or(false)
    }

    /// `ip:port` performers should dial, when conducting.
    pub fn conductor_addr(&self) -> Option<String> {
        let role = self.conductor().ok()?;
        let ip = interfaces::local_ipv4()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        Some(format!("{}:{}", ip, role.session.port()))
    }

    pub fn add_file(&mut self, name: &str, path: &Path) -> Result<bool, NetError> {
        Ok(self.conductor_mut()?.session.add_file(name, path))
    }

    pub fn remove_file(&mut self, name: &str) -> Result<bool, NetError> {
        Ok(self.conductor_mut()?.session.remove_file(name))
    }

    pub fn file_server_url(&self) -> Option<String> {
        self.conductor().ok()?.session.file_server_url()
    }

    // Performer operations

    /// Listen for conductor announcements for one discovery window.
    pub fn start_discovery(&mut self) -> Result<(), NetError> {
        let config = self.config.discovery.clone();
        let role = self.performer_mut()?;
        role.stop_discovery();

        let (tx, rx) = crossbeam_channel::unbounded();
        let listener = DiscoveryListener::start(&config, tx)?;
        let events = role.events.clone();
        let pump = thread::Builder::new()
            .name("discovery-pump".into())
            .spawn(move || {
                for event in rx {
                    let forwarded = match event {
                        DiscoveryEvent::ConductorFound(info) => PerformerEvent::ConductorDiscovered(info),
                        DiscoveryEvent::Timeout => PerformerEvent::DiscoveryTimeout,
                    };
                    if events.send(forwarded).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn discovery-pump thread");

        role.discovery = Some(listener);
        role.discovery_pump = Some(pump);
        Ok(())
    }

    pub fn stop_discovery(&mut self) {
        if let Ok(role) = self.performer_mut() {
            role.stop_discovery();
        }
    }

    pub fn discovered(&self) -> Vec<ConductorInfo> {
        self.performer()
            .ok()
            .and_then(|role| role.discovery.as_ref().map(|d| d.discovered()))
            .unwrap_or_default()
    }

    /// Dial a conductor, replacing any existing link, and remember the
    /// address for `reconnect_last`.
    pub fn connect(&mut self, host: &str, port: u16, device_name: &str) -> Result<(), NetError> {
        let client_config = self.config.client.clone();
        let role = self.performer_mut()?;
        role.disconnect();

        let (tx, rx) = crossbeam_channel::unbounded();
        let client = WsClient::connect(host, port, device_name, client_config, tx)?;
        let queue = Arc::clone(&role.queue);
        let events = role.events.clone();
        let pump = thread::Builder::new()
            .name("performer-pump".into())
            .spawn(move || {
                for event in rx {
                    match event {
                        ClientEvent::StatusChanged(connected) => {
                            let _ = events.send(PerformerEvent::ConnectionStatus(connected));
                        }
                        ClientEvent::ConnectFailed => {
                            let _ = events.send(PerformerEvent::ConnectFailed);
                        }
                        ClientEvent::Message(message) => route(message, &queue, &events),
                    }
                }
            })
            .expect("failed to spawn performer-pump thread");

        let address = client.conductor_address();
        role.client = Some(client);
        role.client_pump = Some(pump);

        if let Err(e) = self.settings.set(KEY_LAST_SERVER_ADDRESS, &address) {
            warn!("could not save last conductor address: {}", e);
        }
        Ok(())
    }

    pub fn connect_to(&mut self, conductor: &ConductorInfo, device_name: &str) -> Result<(), NetError> {
        self.connect(&conductor.ip_address.to_string(), conductor.port, device_name)
    }

    /// Dial the last conductor used. `Ok(false)` if none was saved.
    pub fn reconnect_last(&mut self, device_name: &str) -> Result<bool, NetError> {
        let Some(address) = self.settings.get(KEY_LAST_SERVER_ADDRESS) else {
            return Ok(false);
        };
        let (host, port) = parse_host_port(&address, self.config.server.port)?;
        self.connect(&host, port, device_name)?;
        Ok(true)
    }

    pub fn last_server_address(&self) -> Option<String> {
        self.settings.get(KEY_LAST_SERVER_ADDRESS)
    }

    pub fn disconnect(&mut self) {
        if let Ok(role) = self.performer_mut() {
            role.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.performer()
            .ok()
            .and_then(|role| role.client.as_ref())
            .is_some_and(|client| client.is_connected())
    }

    pub fn conductor_address(&self) -> Option<String> {
        let role = self.performer().ok()?;
        role.client.as_ref().map(|c| c.conductor_address())
    }

    pub fn request_sync(&self) -> bool {
        self.performer()
            .ok()
            .and_then(|role| role.client.as_ref())
            .is_some_and(|client| client.request_sync())
    }

    pub fn queue_stats(&self) -> Option<QueueStats> {
        self.performer().ok().map(|role| role.queue.stats())
    }
}

impl Drop for Collaboration {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Content-derived id, so the same broadcast arriving twice is delivered
/// once. Messages without a timestamp get a random id.
fn message_id(message: &ControlMessage) -> Option<String> {
    if message.timestamp == 0 {
        return None;
    }
    Some(format!(
        "{}:{}:{}:{}",
        message.action.as_str(),
        message.timestamp,
        message.file.as_deref().or(message.current_file.as_deref()).unwrap_or(""),
        message.page.or(message.current_page).unwrap_or(0)
    ))
}

/// Send a conductor message through the reliability queue, or straight to
/// the UI for the few that bypass it.
fn route(message: ControlMessage, queue: &MessageQueue, events: &Sender<PerformerEvent>) {
    let (kind, priority) = match message.action {
        Action::PageChange => (MessageKind::PageChange, Priority::High),
        Action::FileChange => (MessageKind::FileChange, Priority::High),
        Action::SyncResponse if message.current_file.is_some() => (MessageKind::FileChange, Priority::High),
        Action::SyncResponse => {
            debug!("conductor has nothing open yet");
            return;
        }
        Action::BackToList => (MessageKind::BackToList, Priority::Normal),
        Action::ConductorShutdown => {
            info!("conductor is shutting down");
            let _ = events.send(PerformerEvent::ConductorShutdown);
            return;
        }
        Action::ConnectResponse => return,
        Action::Error => {
            warn!("conductor reported: {}", message.error_message.as_deref().unwrap_or("unknown error"));
            return;
        }
        other => {
            debug!("ignoring {} from conductor", other.as_str());
            return;
        }
    };

    let payload = match message.to_json() {
        Ok(p) => p,
        Err(e) => {
            warn!("could not re-encode {}: {}", message.action.as_str(), e);
            return;
        }
    };
    let mut queued = QueuedMessage::new(kind, payload, priority);
    if let Some(id) = message_id(&message) {
        queued = queued.with_id(id);
    }
    queue.enqueue(queued);
}

/// Turns delivered queue entries into UI events.
struct PerformerHandler {
    events: Sender<PerformerEvent>,
    library: Option<Arc<dyn FileLibrary>>,
}

impl MessageHandler for PerformerHandler {
    fn handle(&mut self, queued: &QueuedMessage) -> HandlerResult {
        let message = ControlMessage::from_json(&queued.payload)?;
        let event = match queued.kind {
            MessageKind::PageChange => PerformerEvent::PageChange {
                page: message.page.unwrap_or(1),
                file: message.file.unwrap_or_default(),
            },
            MessageKind::FileChange => {
                let file = message.file.or(message.current_file).unwrap_or_default();
                let page = message.page.or(message.current_page).unwrap_or(1);
                let missing = self
                    .library
                    .as_ref()
                    .is_some_and(|library| !library.contains(&file));
                if missing {
                    PerformerEvent::FileNotFound {
                        file,
                        file_server_url: message.file_server_url,
                    }
                } else {
                    PerformerEvent::FileChange {
                        file,
                        page,
                        file_server_url: message.file_server_url,
                    }
                }
            }
            MessageKind::BackToList => PerformerEvent::BackToList,
            MessageKind::Pointer | MessageKind::Annotation | MessageKind::ConnectionStatus => return Ok(()),
        };
        self.events.send(event)?;
        Ok(())
    }
}
