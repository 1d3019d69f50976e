//! WebSocket client run by a performer.
//!
//! Dials the conductor, introduces itself, keeps the link alive with
//! heartbeats and reconnects with a linear backoff when the link drops.
//! Everything the conductor sends is surfaced as [`ClientEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, select, tick, Receiver, Sender};
use log::{debug, info, warn};

use podium_types::{now_millis, Action, ClientId, ControlMessage};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::error::NetError;
use crate::framing::CLOSE_NORMAL;
use crate::sync::lock;

/// Delay before reconnect attempt `n` is `base × n`, for `n` up to the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// `None` once the attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            None
        } else {
            Some(self.base_delay * attempt)
        }
    }
}

/// Split `host[:port]`, using `default_port` when none is given.
pub fn parse_host_port(address: &str, default_port: u16) -> Result<(String, u16), NetError> {
    let address = address.trim();
    let invalid = || NetError::InvalidAddress(address.to_string());
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (address, default_port),
    };
    if host.is_empty() || port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StatusChanged(bool),
    /// Any message from the conductor other than heartbeat replies.
    Message(ControlMessage),
    /// Reconnection gave up. Sent once; the client is inert afterwards.
    ConnectFailed,
}

enum Command {
    Disconnect,
}

struct Shared {
    host: String,
    port: u16,
    device_id: ClientId,
    device_name: String,
    connected: AtomicBool,
    conn: Mutex<Option<Arc<Connection>>>,
    /// Id the conductor gave us in `connect_response`.
    assigned_id: Mutex<Option<ClientId>>,
}

impl Shared {
    fn send(&self, message: &ControlMessage) -> bool {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("could not encode {}: {}", message.action.as_str(), e);
                return false;
            }
        };
        match lock(&self.conn).as_ref() {
            Some(conn) => conn.send(&text),
            None => false,
        }
    }

    fn sync_id(&self) -> ClientId {
        lock(&self.assigned_id)
            .clone()
            .unwrap_or_else(|| self.device_id.clone())
    }
}

pub struct WsClient {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WsClient {
    /// Start connecting to `host:port` in the background. Progress is
    /// reported on `events`.
    pub fn connect(
        host: &str,
        port: u16,
        device_name: &str,
        config: ClientConfig,
        events: Sender<ClientEvent>,
    ) -> Result<Self, NetError> {
        let host = host.trim();
        if host.is_empty() || port == 0 {
            return Err(NetError::InvalidAddress(format!("{}:{}", host, port)));
        }

        let shared = Arc::new(Shared {
            host: host.to_string(),
            port,
            device_id: ClientId::new(format!("client_{}", now_millis())),
            device_name: device_name.to_string(),
            connected: AtomicBool::new(false),
            conn: Mutex::new(None),
            assigned_id: Mutex::new(None),
        });

        let (commands, command_rx) = crossbeam_channel::unbounded();
        let handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("ws-client".into())
                .spawn(move || Supervisor::new(shared, config, events).run(command_rx))
                .expect("failed to spawn ws-client thread")
        };

        Ok(Self {
            shared,
            commands,
            supervisor: Mutex::new(Some(handle)),
        })
    }

    pub fn send(&self, message: &ControlMessage) -> bool {
        self.shared.send(message)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// `host:port` of the conductor this client targets.
    pub fn conductor_address(&self) -> String {
        format!("{}:{}", self.shared.host, self.shared.port)
    }

    pub fn device_id(&self) -> &ClientId {
        &self.shared.device_id
    }

    /// Ask the conductor for its current file and page.
    pub fn request_sync(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.shared
            .send(&ControlMessage::request_sync(self.shared.sync_id(), &self.shared.device_name))
    }

    /// Close the link and stop reconnecting. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
        if let Some(handle) = lock(&self.supervisor).take() {
            if handle.join().is_err() {
                log::error!("ws-client thread panicked");
            }
        }
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct Supervisor {
    shared: Arc<Shared>,
    config: ClientConfig,
    policy: ReconnectPolicy,
    events: Sender<ClientEvent>,
    conn_tx: Sender<ConnectionEvent>,
    conn_rx: Receiver<ConnectionEvent>,
    attempt: u32,
    heartbeat: Receiver<Instant>,
    reconnect: Receiver<Instant>,
}

impl Supervisor {
    fn new(shared: Arc<Shared>, config: ClientConfig, events: Sender<ClientEvent>) -> Self {
        let (conn_tx, conn_rx) = crossbeam_channel::unbounded();
        Self {
            shared,
            policy: ReconnectPolicy::from_config(&config),
            config,
            events,
            conn_tx,
            conn_rx,
            attempt: 0,
            heartbeat: never(),
            reconnect: never(),
        }
    }

    fn run(mut self, commands: Receiver<Command>) {
        if !self.dial() && !self.schedule_reconnect() {
            return;
        }

        loop {
            let conn_rx = self.conn_rx.clone();
            let heartbeat = self.heartbeat.clone();
            let reconnect = self.reconnect.clone();
            select! {
                recv(commands) -> _ => {
                    // Explicit disconnect, or the client handle is gone.
                    self.close_link();
                    break;
                }
                recv(conn_rx) -> event => {
                    let Ok(event) = event else { break };
                    if !self.on_connection_event(event) {
                        break;
                    }
                }
                recv(heartbeat) -> _ => {
                    if self.shared.connected.load(Ordering::SeqCst) {
                        self.shared.send(&ControlMessage::heartbeat(Some(self.shared.device_id.clone())));
                    }
                }
                recv(reconnect) -> _ => {
                    self.reconnect = never();
                    info!("reconnecting to {}:{}", self.shared.host, self.shared.port);
                    if !self.dial() && !self.schedule_reconnect() {
                        break;
                    }
                }
            }
        }
        debug!("ws-client supervisor exiting");
    }

    /// Returns false when the supervisor should stop.
    fn on_connection_event(&mut self, event: ConnectionEvent) -> bool {
        match event {
            ConnectionEvent::Opened { .. } => {
                let hello = ControlMessage::client_connect(
                    self.shared.device_id.as_str(),
                    &self.shared.device_name,
                    env!("CARGO_PKG_VERSION"),
                );
                self.shared.send(&hello);
                true
            }
            ConnectionEvent::Text { text, .. } => {
                match ControlMessage::from_json(&text) {
                    Ok(message) => self.on_message(message),
                    Err(e) => warn!("ignoring malformed message from conductor: {}", e),
                }
                true
            }
            ConnectionEvent::Closed { code, .. } => {
                *lock(&self.shared.conn) = None;
                self.heartbeat = never();
                self.set_connected(false);
                if code == Some(CLOSE_NORMAL) {
                    info!("conductor closed the connection normally");
                    true
                } else {
                    info!("connection lost (code {:?})", code);
                    self.schedule_reconnect()
                }
            }
        }
    }

    fn on_message(&mut self, message: ControlMessage) {
        match message.action {
            Action::ConnectResponse if message.is_success() => {
                *lock(&self.shared.assigned_id) = message.client_id.clone();
                self.attempt = 0;
                self.heartbeat = tick(self.config.heartbeat_interval);
                self.set_connected(true);
                info!("connected to conductor {}:{}", self.shared.host, self.shared.port);

                let _ = self.events.send(ClientEvent::Message(message));
                self.shared.send(&ControlMessage::request_sync(
                    self.shared.sync_id(),
                    &self.shared.device_name,
                ));
            }
            Action::ConnectResponse => {
                warn!("conductor refused connection: {:?}", message.error_message);
                let _ = self.events.send(ClientEvent::Message(message));
            }
            Action::HeartbeatResponse => debug!("heartbeat acknowledged"),
            _ => {
                let _ = self.events.send(ClientEvent::Message(message));
            }
        }
    }

    /// One connection attempt. False if it failed before opening.
    fn dial(&mut self) -> bool {
        match Connection::connect(
            self.shared.device_id.clone(),
            &self.shared.host,
            self.shared.port,
            self.config.connect_timeout,
            self.config.write_timeout,
            self.conn_tx.clone(),
        ) {
            Ok(conn) => {
                *lock(&self.shared.conn) = Some(conn);
                true
            }
            Err(e) => {
                warn!("could not reach {}:{}: {}", self.shared.host, self.shared.port, e);
                self.set_connected(false);
                false
            }
        }
    }

    /// Arm the reconnect timer. False once attempts are exhausted, after
    /// reporting `ConnectFailed`.
    fn schedule_reconnect(&mut self) -> bool {
        self.attempt += 1;
        match self.policy.delay_for(self.attempt) {
            Some(delay) => {
                info!("reconnect attempt {} in {:?}", self.attempt, delay);
                self.reconnect = after(delay);
                true
            }
            None => {
                warn!("giving up after {} reconnect attempts", self.attempt - 1);
                let _ = self.events.send(ClientEvent::ConnectFailed);
                false
            }
        }
    }

    fn set_connected(&self, connected: bool) {
        if self.shared.connected.swap(connected, Ordering::SeqCst) != connected {
            let _ = self.events.send(ClientEvent::StatusChanged(connected));
        }
    }

    fn close_link(&mut self) {
        self.heartbeat = never();
        self.reconnect = never();
        if let Some(conn) = lock(&self.shared.conn).take() {
            conn.close(CLOSE_NORMAL);
        }
        self.set_connected(false);
    }
}
