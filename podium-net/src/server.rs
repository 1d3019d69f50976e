//! WebSocket server run by the conductor.
//!
//! Accepts performer sockets, hands each one to a [`Connection`], and fans
//! text out to every open connection.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvError, Sender};
use log::{error, info, warn};

use podium_types::ClientId;

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionRegistry};
use crate::error::NetError;
use crate::framing::CLOSE_GOING_AWAY;
use crate::sync::lock;

/// How long to wait between failed bind attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRetry {
    pub attempts: u32,
    pub early_delay: Duration,
    pub late_delay: Duration,
}

impl BindRetry {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            attempts: config.bind_attempts,
            early_delay: config.bind_retry_delay,
            late_delay: config.bind_retry_late_delay,
        }
    }

    /// Delay after failed attempt `attempt` (1-based), or `None` once the
    /// attempts are used up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.attempts {
            None
        } else if attempt <= self.attempts / 2 {
            Some(self.early_delay)
        } else {
            Some(self.late_delay)
        }
    }
}

fn bind_with_retry(port: u16, retry: BindRetry) -> Result<TcpListener, NetError> {
    let mut attempt = 1;
    loop {
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => return Ok(listener),
            Err(e) => match retry.delay(attempt) {
                Some(delay) => {
                    warn!(
                        "bind to port {} failed (attempt {}/{}): {}; retrying in {:?}",
                        port, attempt, retry.attempts, e, delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                None => {
                    return Err(NetError::PortUnavailable {
                        port,
                        attempts: attempt,
                        source: e,
                    })
                }
            },
        }
    }
}

/// One queued broadcast: the text and the connections open when it was
/// requested.
struct Broadcast {
    targets: Vec<Arc<Connection>>,
    text: String,
    done: Sender<usize>,
}

/// Completion of a queued broadcast.
pub struct BroadcastHandle {
    done: Receiver<usize>,
}

impl BroadcastHandle {
    fn finished(sent: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(sent);
        Self { done: rx }
    }

    /// Wait for the fan-out. Yields how many sends succeeded.
    pub fn join(self) -> Result<usize, RecvError> {
        self.done.recv()
    }
}

pub struct WsServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    stop: Arc<AtomicBool>,
    listening: Arc<AtomicBool>,
    accept_thread: Mutex<Option<(JoinHandle<()>, Receiver<()>)>>,
    broadcasts: Mutex<Option<Sender<Broadcast>>>,
    broadcaster: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl WsServer {
    /// Bind `config.port` (0 picks an ephemeral port) and start accepting.
    pub fn start(config: ServerConfig, events: Sender<ConnectionEvent>) -> Result<Self, NetError> {
        let listener = bind_with_retry(config.port, BindRetry::from_config(&config))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let registry = ConnectionRegistry::new();
        let stop = Arc::new(AtomicBool::new(false));
        let listening = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let handle = {
            let registry = registry.clone();
            let stop = Arc::clone(&stop);
            let listening = Arc::clone(&listening);
            let config = config.clone();
            thread::Builder::new()
                .name("ws-accept".into())
                .spawn(move || {
                    accept_loop(listener, &config, &registry, &stop, &events);
                    listening.store(false, Ordering::SeqCst);
                    let _ = done_tx.send(());
                })
                .expect("failed to spawn ws-accept thread")
        };

        let (broadcast_tx, broadcast_rx) = crossbeam_channel::unbounded::<Broadcast>();
        let broadcaster = thread::Builder::new()
            .name("ws-broadcast".into())
            .spawn(move || {
                for job in broadcast_rx {
                    let sent = fan_out(&job.targets, &job.text);
                    let _ = job.done.send(sent);
                }
            })
            .expect("failed to spawn ws-broadcast thread");

        info!("WebSocket server listening on {}", local_addr);

        Ok(Self {
            config,
            local_addr,
            registry,
            stop,
            listening,
            accept_thread: Mutex::new(Some((handle, done_rx))),
            broadcasts: Mutex::new(Some(broadcast_tx)),
            broadcaster: Mutex::new(Some(broadcaster)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// True while the stop flag is unset and the listener is open.
    pub fn is_alive(&self) -> bool {
        !self.stop.load(Ordering::SeqCst) && self.listening.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.open_count()
    }

    /// Queue `text` for every open connection. Broadcasts are written in
    /// the order they were requested; connections that fail are closed.
    pub fn broadcast(&self, text: &str) -> BroadcastHandle {
        let sender = lock(&self.broadcasts).clone();
        let Some(sender) = sender else {
            return BroadcastHandle::finished(0);
        };
        let (done, done_rx) = crossbeam_channel::bounded(1);
        let job = Broadcast {
            targets: self.registry.open_connections(),
            text: text.to_string(),
            done,
        };
        match sender.send(job) {
            Ok(()) => BroadcastHandle { done: done_rx },
            Err(_) => BroadcastHandle::finished(0),
        }
    }

    pub fn connection(&self, id: &ClientId) -> Option<Arc<Connection>> {
        self.registry.get(id)
    }

    /// Send to one connection. False if it is unknown, not open, or the
    /// write failed.
    pub fn send_to(&self, id: &ClientId, text: &str) -> bool {
        match self.registry.get(id) {
            Some(conn) => conn.send(text),
            None => false,
        }
    }

    /// Close one connection with a normal close code.
    pub fn close_client(&self, id: &ClientId, code: u16) -> bool {
        match self.registry.get(id) {
            Some(conn) => {
                conn.close(code);
                true
            }
            None => false,
        }
    }

    /// Stop accepting, close every connection, release the port.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);

        // Queued broadcasts go out before the close frames.
        lock(&self.broadcasts).take();
        if let Some(handle) = lock(&self.broadcaster).take() {
            if handle.join().is_err() {
                error!("ws-broadcast thread panicked");
            }
        }

        for conn in self.registry.snapshot() {
            conn.close(CLOSE_GOING_AWAY);
        }

        if let Some((handle, done)) = lock(&self.accept_thread).take() {
            match done.recv_timeout(self.config.shutdown_join) {
                Ok(()) => {
                    if handle.join().is_err() {
                        error!("ws-accept thread panicked");
                    }
                }
                Err(_) => warn!(
                    "ws-accept thread still running after {:?}; detaching",
                    self.config.shutdown_join
                ),
            }
        }

        // Anything accepted while the flag was being noticed.
        for conn in self.registry.snapshot() {
            conn.close(CLOSE_GOING_AWAY);
        }

        thread::sleep(self.config.port_release);
        info!("WebSocket server on {} stopped", self.local_addr);
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fan_out(targets: &[Arc<Connection>], text: &str) -> usize {
    let mut failed = Vec::new();
    let mut sent = 0;
    for conn in targets {
        if conn.send(text) {
            sent += 1;
        } else {
            failed.push(conn);
        }
    }
    for conn in failed {
        warn!("broadcast to {} failed; closing", conn.id());
        conn.close(CLOSE_GOING_AWAY);
    }
    sent
}

fn accept_loop(
    listener: TcpListener,
    config: &ServerConfig,
    registry: &ConnectionRegistry,
    stop: &AtomicBool,
    events: &Sender<ConnectionEvent>,
) {
    let next_id = AtomicU64::new(1);

    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let id = ClientId::from_sequence(next_id.fetch_add(1, Ordering::Relaxed));
                info!("accepted {} from {}", id, addr);
                if let Err(e) = Connection::accept(
                    id,
                    stream,
                    config.write_timeout,
                    registry.clone(),
                    events.clone(),
                ) {
                    warn!("could not set up connection from {}: {}", addr, e);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(config.accept_poll);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!("accept failed: {}", e);
                break;
            }
        }
    }
    drop(listener);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;

    #[test]
    fn bind_retry_schedule() {
        let retry = BindRetry::from_config(&NetConfig::default().server);
        assert_eq!(retry.delay(1), Some(Duration::from_millis(800)));
        assert_eq!(retry.delay(2), Some(Duration::from_millis(800)));
        assert_eq!(retry.delay(3), Some(Duration::from_millis(1000)));
        assert_eq!(retry.delay(4), Some(Duration::from_millis(1000)));
        assert_eq!(retry.delay(5), None);
    }

    #[test]
    fn port_in_use_is_reported() {
        let holder = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let retry = BindRetry {
            attempts: 2,
            early_delay: Duration::from_millis(1),
            late_delay: Duration::from_millis(1),
        };
        match bind_with_retry(port, retry) {
            Err(NetError::PortUnavailable { port: p, attempts, .. }) => {
                assert_eq!(p, port);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected PortUnavailable, got {:?}", other.map(|_| ())),
        }
    }
}
