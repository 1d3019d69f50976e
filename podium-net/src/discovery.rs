//! UDP announce/listen discovery.
//!
//! A conductor broadcasts a small JSON announcement every few seconds.
//! Performers listen on the discovery port for a bounded window and report
//! each conductor the first time it is heard.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{debug, info, warn};

use podium_types::{now_millis, Announcement, ConductorInfo};

use crate::config::DiscoveryConfig;
use crate::error::NetError;
use crate::interfaces;
use crate::sync::lock;

const DEFAULT_WS_PORT: u16 = 9090;
const UNKNOWN_CONDUCTOR: &str = "Unknown Conductor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    ConductorFound(ConductorInfo),
    /// The listen window closed without hearing any conductor.
    Timeout,
}

/// Decode an announcement datagram from `sender`.
///
/// The sender's address is trusted over the `ip_address` in the payload;
/// missing fields fall back to defaults.
pub fn parse_announcement(bytes: &[u8], sender: SocketAddr) -> Option<ConductorInfo> {
    let announcement: Announcement = match serde_json::from_slice(bytes) {
        Ok(a) => a,
        Err(e) => {
            debug!(target: "podium::discovery", "malformed announcement from {}: {}", sender, e);
            return None;
        }
    };
    if !announcement.is_conductor_announcement() {
        debug!(target: "podium::discovery", "ignoring '{}' datagram from {}", announcement.kind, sender);
        return None;
    }
    Some(ConductorInfo {
        name: announcement
            .conductor_name
            .unwrap_or_else(|| UNKNOWN_CONDUCTOR.to_string()),
        ip_address: sender.ip(),
        port: announcement.websocket_port.unwrap_or(DEFAULT_WS_PORT),
        announced_at: announcement.timestamp.unwrap_or_else(now_millis),
    })
}

/// Periodic conductor announcement.
pub struct Announcer {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Announcer {
    /// Start announcing `conductor_name` with its WebSocket port.
    pub fn start(config: &DiscoveryConfig, conductor_name: &str, websocket_port: u16) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_broadcast(true)?;

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let name = conductor_name.to_string();
        let config = config.clone();

        let handle = thread::Builder::new()
            .name("discovery-announce".into())
            .spawn(move || {
                let mut count: u64 = 0;
                loop {
                    count += 1;
                    announce_once(&socket, &config, &name, websocket_port, count);
                    match stop_rx.recv_timeout(config.announce_interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                drop(socket);
                debug!(target: "podium::discovery", "announcer stopped after {} rounds", count);
            })
            .expect("failed to spawn discovery-announce thread");

        info!(
            target: "podium::discovery",
            "announcing conductor '{}' (port {})", conductor_name, websocket_port
        );
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop announcing. The socket is closed by the time this returns.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!(target: "podium::discovery", "discovery-announce thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn announce_once(socket: &UdpSocket, config: &DiscoveryConfig, name: &str, port: u16, round: u64) {
    let ip = interfaces::local_ipv4()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    let announcement = Announcement::new(name, port, &ip, now_millis());
    let payload = match serde_json::to_vec(&announcement) {
        Ok(p) => p,
        Err(e) => {
            warn!(target: "podium::discovery", "could not encode announcement: {}", e);
            return;
        }
    };

    let targets = if config.targets.is_empty() {
        interfaces::broadcast_addresses()
    } else {
        config.targets.clone()
    };
    for target in &targets {
        if let Err(e) = socket.send_to(&payload, (*target, config.port)) {
            debug!(target: "podium::discovery", "announce to {} failed: {}", target, e);
        }
    }
    if round == 1 {
        debug!(target: "podium::discovery", "announcing to {:?}", targets);
    }
}

type Seen = Arc<Mutex<HashMap<(IpAddr, u16), ConductorInfo>>>;

/// One discovery run on the performer.
pub struct DiscoveryListener {
    local_addr: SocketAddr,
    seen: Seen,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DiscoveryListener {
    /// Bind the discovery port and listen for one window.
    pub fn start(config: &DiscoveryConfig, events: Sender<DiscoveryEvent>) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(("0.0.0.0", config.port))?;
        socket.set_read_timeout(Some(config.receive_timeout))?;
        let local_addr = socket.local_addr()?;

        let seen: Seen = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));
        let window = config.window;
        let receive_timeout = config.receive_timeout;

        let handle = {
            let seen = Arc::clone(&seen);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("discovery-listen".into())
                .spawn(move || {
                    let started = Instant::now();
                    let mut buf = [0u8; 1024];

                    while !stop.load(Ordering::SeqCst) {
                        let remaining = window.saturating_sub(started.elapsed());
                        if remaining.is_zero() {
                            break;
                        }
                        // Never wait past the end of the window.
                        let wait = remaining.min(receive_timeout).max(Duration::from_millis(1));
                        if let Err(e) = socket.set_read_timeout(Some(wait)) {
                            warn!(target: "podium::discovery", "could not set receive timeout: {}", e);
                            break;
                        }
                        let (len, sender) = match socket.recv_from(&mut buf) {
                            Ok(r) => r,
                            Err(ref e)
                                if e.kind() == io::ErrorKind::WouldBlock
                                    || e.kind() == io::ErrorKind::TimedOut =>
                            {
                                continue
                            }
                            Err(e) => {
                                warn!(target: "podium::discovery", "discovery receive failed: {}", e);
                                continue;
                            }
                        };

                        let Some(info) = parse_announcement(&buf[..len], sender) else {
                            continue;
                        };
                        let first_sighting = {
                            let mut seen = lock(&seen);
                            let first = !seen.contains_key(&info.key());
                            seen.insert(info.key(), info.clone());
                            first
                        };
                        if first_sighting {
                            info!(
                                target: "podium::discovery",
                                "found conductor '{}' at {}", info.name, info.address()
                            );
                            let _ = events.send(DiscoveryEvent::ConductorFound(info));
                        }
                    }

                    drop(socket);
                    if !stop.load(Ordering::SeqCst) && lock(&seen).is_empty() {
                        info!(target: "podium::discovery", "no conductor found within {:?}", window);
                        let _ = events.send(DiscoveryEvent::Timeout);
                    }
                })
                .expect("failed to spawn discovery-listen thread")
        };

        info!(target: "podium::discovery", "listening for conductors on {}", local_addr);
        Ok(Self {
            local_addr,
            seen,
            stop,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Conductors heard so far, latest sighting of each.
    pub fn discovered(&self) -> Vec<ConductorInfo> {
        let mut list: Vec<_> = lock(&self.seen).values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.key().cmp(&b.key())));
        list
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// End the run early. Returns once the socket is closed.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!(target: "podium::discovery", "discovery-listen thread panicked");
            }
        }
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.stop();
    }
}
