//! One WebSocket connection and the registry that owns open connections.
//!
//! Each connection has a reader thread that performs the handshake, then
//! decodes frames and forwards them as [`ConnectionEvent`]s. Writes go
//! through a locked clone of the stream and may come from any thread.

use std::collections::HashMap;
use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, info, warn};

use podium_types::ClientId;

use crate::error::{HandshakeError, NetError};
use crate::framing::{self, Frame, Frames};
use crate::handshake;
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Which end of the socket we are. Clients mask what they write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

/// Emitted by a connection's reader thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened { client_id: ClientId },
    Text { client_id: ClientId, text: String },
    /// Sent exactly once per opened connection. `code` is the peer's close
    /// code, or ours if we closed first.
    Closed { client_id: ClientId, code: Option<u16> },
}

/// Open connections keyed by id. Clones share the same map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<ClientId, Arc<Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        lock(&self.inner).insert(conn.id().clone(), conn);
    }

    pub fn remove(&self, id: &ClientId) -> Option<Arc<Connection>> {
        lock(&self.inner).remove(id)
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<Connection>> {
        lock(&self.inner).get(id).cloned()
    }

    /// Point-in-time copy of every live connection, including ones still
    /// in the handshake.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        lock(&self.inner).values().cloned().collect()
    }

    /// Connections past the handshake, copied so callers can write without
    /// holding the lock.
    pub fn open_connections(&self) -> Vec<Arc<Connection>> {
        lock(&self.inner).values().filter(|c| c.is_open()).cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.inner).values().filter(|c| c.is_open()).count()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Connection {
    id: ClientId,
    peer: SocketAddr,
    side: Side,
    state: Mutex<ConnectionState>,
    /// Close code we sent, reported if the peer never answers with its own.
    local_code: Mutex<Option<u16>>,
    writer: Mutex<TcpStream>,
    registry: Option<ConnectionRegistry>,
}

impl Connection {
    fn new(
        id: ClientId,
        stream: &TcpStream,
        side: Side,
        write_timeout: Duration,
        registry: Option<ConnectionRegistry>,
    ) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        writer.set_write_timeout(Some(write_timeout))?;
        Ok(Self {
            id,
            peer: stream.peer_addr()?,
            side,
            state: Mutex::new(ConnectionState::Connecting),
            local_code: Mutex::new(None),
            writer: Mutex::new(writer),
            registry,
        })
    }

    /// Take ownership of an accepted socket and add it to `registry`. The
    /// handshake runs on the new reader thread; once it succeeds `Opened` is
    /// emitted.
    pub fn accept(
        id: ClientId,
        stream: TcpStream,
        write_timeout: Duration,
        registry: ConnectionRegistry,
        events: Sender<ConnectionEvent>,
    ) -> io::Result<Arc<Self>> {
        stream.set_nonblocking(false)?;
        let conn = Arc::new(Self::new(id, &stream, Side::Server, write_timeout, Some(registry.clone()))?);
        registry.insert(Arc::clone(&conn));

        let worker = Arc::clone(&conn);
        let spawned = thread::Builder::new()
            .name(format!("ws-{}", conn.id))
            .spawn(move || {
                let mut reader = BufReader::new(stream);
                match worker.server_handshake(&mut reader, write_timeout) {
                    Ok(_) if worker.open(&events) => worker.read_loop(reader, &events),
                    Ok(_) => worker.abort(),
                    Err(e) => {
                        warn!("handshake with {} failed: {}", worker.peer, e);
                        worker.abort();
                    }
                }
            });
        if let Err(e) = spawned {
            conn.abort();
            return Err(e);
        }
        Ok(conn)
    }

    /// Dial a server and complete the handshake before returning.
    pub fn connect(
        id: ClientId,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        write_timeout: Duration,
        events: Sender<ConnectionEvent>,
    ) -> Result<Arc<Self>, NetError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| NetError::InvalidAddress(format!("{}:{}", host, port)))?;
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
        stream.set_nodelay(true)?;

        let conn = Arc::new(Self::new(id, &stream, Side::Client, write_timeout, None)?);

        stream.set_read_timeout(Some(connect_timeout))?;
        let mut reader = BufReader::new(stream);
        let host_header = format!("{}:{}", host, port);
        let result = {
            let mut writer = lock(&conn.writer);
            handshake::client_handshake(&mut reader, &mut *writer, &host_header)
        };
        if let Err(e) = result {
            conn.abort();
            return Err(NetError::Handshake(e));
        }
        reader.get_ref().set_read_timeout(None)?;

        if !conn.open(&events) {
            conn.abort();
            return Err(NetError::Handshake(HandshakeError::ConnectionClosed));
        }
        let worker = Arc::clone(&conn);
        let spawned = thread::Builder::new()
            .name(format!("ws-client-{}", conn.id))
            .spawn(move || worker.read_loop(reader, &events));
        if let Err(e) = spawned {
            conn.abort();
            return Err(NetError::Io(e));
        }
        Ok(conn)
    }

    /// Read the upgrade request without holding the writer, so a concurrent
    /// `close` can still shut the socket down.
    fn server_handshake(&self, reader: &mut BufReader<TcpStream>, timeout: Duration) -> Result<(), HandshakeError> {
        reader.get_ref().set_read_timeout(Some(timeout))?;
        let request = handshake::read_upgrade_request(reader)?;
        handshake::write_upgrade_response(&mut *lock(&self.writer), &request.key)?;
        reader.get_ref().set_read_timeout(None)?;
        debug!("{} upgraded on {}", self.id, request.path);
        Ok(())
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Send one text frame. Returns false unless the connection is open and
    /// the whole frame was written.
    pub fn send(&self, text: &str) -> bool {
        if !self.is_open() {
            return false;
        }
        let frame = match self.side {
            Side::Server => framing::encode_text(text),
            Side::Client => framing::encode_text_masked(text, framing::fresh_mask()),
        };
        if frame.is_empty() {
            warn!("{}: message of {} bytes exceeds frame limit", self.id, text.len());
            return false;
        }
        match self.write_frame(&frame) {
            Ok(()) => true,
            Err(e) => {
                debug!("{}: send failed: {}", self.id, e);
                false
            }
        }
    }

    /// Begin closing: leave the registry, tell the peer, shut the socket.
    /// The reader thread then reports `Closed`. Idempotent.
    pub fn close(&self, code: u16) {
        if !self.begin_closing() {
            return;
        }
        *lock(&self.local_code) = Some(code);
        self.unregister();
        let _ = self.write_frame(&framing::encode_close(Some(code), self.mask()));
        self.shutdown_socket();
    }

    fn mask(&self) -> Option<[u8; 4]> {
        match self.side {
            Side::Server => None,
            Side::Client => Some(framing::fresh_mask()),
        }
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        writer.write_all(frame)?;
        writer.flush()
    }

    /// Connecting/Open -> Closing. False if already closing or closed.
    fn begin_closing(&self) -> bool {
        let mut state = lock(&self.state);
        match *state {
            ConnectionState::Connecting | ConnectionState::Open => {
                *state = ConnectionState::Closing;
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        }
    }

    fn unregister(&self) {
        if let Some(registry) = &self.registry {
            registry.remove(&self.id);
        }
    }

    fn shutdown_socket(&self) {
        let _ = lock(&self.writer).shutdown(Shutdown::Both);
    }

    /// Connecting -> Open. False if a close raced the handshake.
    fn open(&self, events: &Sender<ConnectionEvent>) -> bool {
        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::Connecting {
                return false;
            }
            *state = ConnectionState::Open;
        }
        info!("{} open ({})", self.id, self.peer);
        let _ = events.send(ConnectionEvent::Opened {
            client_id: self.id.clone(),
        });
        true
    }

    /// Handshake failed: straight to Closed without events.
    fn abort(&self) {
        self.begin_closing();
        self.unregister();
        self.shutdown_socket();
        *lock(&self.state) = ConnectionState::Closed;
    }

    fn read_loop(&self, reader: BufReader<TcpStream>, events: &Sender<ConnectionEvent>) {
        let mut peer_code = None;
        for frame in Frames::new(reader) {
            match frame {
                Ok(Frame::Text(text)) => {
                    let event = ConnectionEvent::Text {
                        client_id: self.id.clone(),
                        text,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Ok(Frame::Ping(payload)) => {
                    if let Err(e) = self.write_frame(&framing::encode_pong(&payload, self.mask())) {
                        debug!("{}: pong failed: {}", self.id, e);
                    }
                }
                Ok(Frame::Pong(_)) => {}
                Ok(Frame::Close(code)) => {
                    peer_code = code;
                    if self.begin_closing() {
                        self.unregister();
                        let _ = self.write_frame(&framing::encode_close(code, self.mask()));
                    }
                    break;
                }
                Err(e) => {
                    if self.state() == ConnectionState::Open {
                        debug!("{}: read error: {}", self.id, e);
                    }
                    break;
                }
            }
        }

        self.begin_closing();
        self.unregister();
        self.shutdown_socket();
        *lock(&self.state) = ConnectionState::Closed;

        let code = peer_code.or(*lock(&self.local_code));
        info!("{} closed (code {:?})", self.id, code);
        let _ = events.send(ConnectionEvent::Closed {
            client_id: self.id.clone(),
            code,
        });
    }
}
