#![allow(dead_code)]
//! Test harness utilities for podium-net integration tests.

use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use podium_net::framing::{encode_close, encode_frame, encode_text_masked, fresh_mask, read_frame, Frame, Opcode};
use podium_net::handshake::client_handshake;
use podium_net::{ControlMessage, NetConfig};

/// Config with every delay shrunk so tests run fast. Ports are ephemeral.
pub fn fast_config() -> NetConfig {
    NetConfig::from_toml_str(
        r#"
        [server]
        port = 0
        bind_attempts = 2
        bind_retry_delay_ms = 10
        bind_retry_late_delay_ms = 10
        accept_poll_ms = 5
        shutdown_join_ms = 500
        port_release_ms = 0

        [client]
        heartbeat_interval_ms = 60000
        reconnect_base_delay_ms = 50
        max_reconnect_attempts = 3
        connect_timeout_ms = 1000

        [queue]
        poll_timeout_ms = 10
        maintenance_interval_ms = 50

        [discovery]
        announce_interval_ms = 50
        receive_timeout_ms = 20
        window_ms = 500
        targets = ["127.0.0.1"]

        [role]
        settle_ms = 0
        "#,
    )
    .expect("fast config parses")
}

/// A hand-driven WebSocket client speaking raw frames.
pub struct RawWsClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl RawWsClient {
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2))?;
        stream.set_read_timeout(Some(Duration::from_secs(2)))?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        client_handshake(&mut reader, &mut writer, &addr.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(Self { reader, writer })
    }

    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.writer.write_all(&encode_text_masked(text, fresh_mask()))
    }

    pub fn send(&mut self, message: &ControlMessage) -> io::Result<()> {
        self.send_text(&message.to_json().expect("message encodes"))
    }

    pub fn send_ping(&mut self, payload: &[u8]) -> io::Result<()> {
        self.writer.write_all(&encode_frame(Opcode::Ping, payload, Some(fresh_mask())))
    }

    pub fn send_close(&mut self, code: u16) -> io::Result<()> {
        self.writer.write_all(&encode_close(Some(code), Some(fresh_mask())))
    }

    pub fn recv_frame(&mut self) -> io::Result<Option<Frame>> {
        read_frame(&mut self.reader)
    }

    /// Next control message, skipping non-text frames.
    pub fn recv(&mut self) -> ControlMessage {
        loop {
            match self.recv_frame() {
                Ok(Some(Frame::Text(text))) => {
                    return ControlMessage::from_json(&text).expect("server sent valid json")
                }
                Ok(Some(other)) => panic!("Expected text frame, got {:?}", other),
                Ok(None) => panic!("Connection closed while waiting for a message"),
                Err(e) => panic!("Read failed: {}", e),
            }
        }
    }

    /// Send `client_connect` and return the `connect_response`.
    pub fn join(&mut self, device_name: &str) -> ControlMessage {
        self.send(&ControlMessage::client_connect("test-device", device_name, "1.0"))
            .expect("send client_connect");
        self.recv()
    }
}

/// Wait until `cond` holds, or panic after `timeout`.
pub fn wait_for(timeout: Duration, what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("Timed out waiting for {}", what);
}

/// Receive events until one matches, or panic after `timeout`.
pub fn expect_event<T: std::fmt::Debug>(
    rx: &Receiver<T>,
    timeout: Duration,
    mut matches: impl FnMut(&T) -> bool,
) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(event) if matches(&event) => return event,
            Ok(_) => continue,
            Err(_) => panic!("Timed out waiting for event"),
        }
    }
}
