//! WebSocket frame codec.
//!
//! Wire format (RFC 6455, the subset this transport speaks):
//! `[FIN|opcode][MASK|len7][len16?][mask key?][payload]`
//!
//! Payloads above 65535 bytes are not supported in either direction. An
//! incoming frame that declares a 64-bit length is read and thrown away so
//! the stream stays aligned.

use std::io::{self, Read};

/// Frame opcodes we recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }
}

/// A decoded frame the connection acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close(Option<u16>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// Largest payload the encoder will produce.
pub const MAX_PAYLOAD: usize = 65_535;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// XOR `data` in place with `mask`, cycling the key every four bytes.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// A fresh masking key for client-originated frames.
pub fn fresh_mask() -> [u8; 4] {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// Encode one final frame. Returns an empty vector when the payload is too
/// large to express with a 16-bit length.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len();
    if len > MAX_PAYLOAD {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(len + 8);
    out.push(0x80 | opcode as u8);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Unmasked text frame, as the server writes them.
pub fn encode_text(text: &str) -> Vec<u8> {
    encode_frame(Opcode::Text, text.as_bytes(), None)
}

/// Masked text frame, as the client writes them.
pub fn encode_text_masked(text: &str, mask: [u8; 4]) -> Vec<u8> {
    encode_frame(Opcode::Text, text.as_bytes(), Some(mask))
}

pub fn encode_pong(payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    encode_frame(Opcode::Pong, payload, mask)
}

pub fn encode_close(code: Option<u16>, mask: Option<[u8; 4]>) -> Vec<u8> {
    match code {
        Some(code) => encode_frame(Opcode::Close, &code.to_be_bytes(), mask),
        None => encode_frame(Opcode::Close, &[], mask),
    }
}

/// Read one raw frame. `Ok(None)` means the stream ended cleanly between
/// frames; `Ok(Some(None))` means a frame was read but is not one we act on.
fn read_raw<R: Read>(reader: &mut R) -> io::Result<Option<Option<Frame>>> {
    let mut first = [0u8; 1];
    loop {
        match reader.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let mut second = [0u8; 1];
    reader.read_exact(&mut second)?;

    let opcode = Opcode::from_bits(first[0] & 0x0F);
    let masked = second[0] & 0x80 != 0;
    let len = match second[0] & 0x7F {
        126 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;
            u16::from_be_bytes(buf) as u64
        }
        127 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            let len = u64::from_be_bytes(buf);
            if masked {
                reader.read_exact(&mut [0u8; 4])?;
            }
            discard(reader, len)?;
            log::debug!("dropped frame with 64-bit length ({} bytes)", len);
            return Ok(Some(None));
        }
        n => n as u64,
    };

    let mask = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key)?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    let frame = match opcode {
        Some(Opcode::Text) => match String::from_utf8(payload) {
            Ok(text) => Some(Frame::Text(text)),
            Err(_) => {
                log::debug!("dropped text frame with invalid UTF-8");
                None
            }
        },
        Some(Opcode::Close) => {
            let code = (payload.len() >= 2).then(|| u16::from_be_bytes([payload[0], payload[1]]));
            Some(Frame::Close(code))
        }
        Some(Opcode::Ping) => Some(Frame::Ping(payload)),
        Some(Opcode::Pong) => Some(Frame::Pong(payload)),
        Some(Opcode::Binary) | Some(Opcode::Continuation) | None => None,
    };
    Ok(Some(frame))
}

fn discard<R: Read>(reader: &mut R, len: u64) -> io::Result<()> {
    let copied = io::copy(&mut reader.take(len), &mut io::sink())?;
    if copied < len {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

/// Read the next frame we act on, skipping the ones we drop.
///
/// Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Frame>> {
    loop {
        match read_raw(reader)? {
            None => return Ok(None),
            Some(Some(frame)) => return Ok(Some(frame)),
            Some(None) => continue,
        }
    }
}

/// Lazy iterator over the frames of a stream.
///
/// Ends on clean EOF; yields an error once and then ends on I/O failure.
/// The underlying reader can be recovered with [`Frames::into_inner`].
pub struct Frames<R> {
    reader: R,
    done: bool,
}

impl<R: Read> Frames<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, done: false }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Iterator for Frames<R> {
    type Item = io::Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_frame(&mut self.reader) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode_all(bytes: Vec<u8>) -> Vec<Frame> {
        Frames::new(Cursor::new(bytes)).map(|f| f.unwrap()).collect()
    }

    #[test]
    fn text_roundtrip_at_length_boundaries() {
        for len in [0usize, 1, 125, 126, 1000, 65_535] {
            let text = "x".repeat(len);
            let unmasked = encode_text(&text);
            assert_eq!(decode_all(unmasked), vec![Frame::Text(text.clone())], "len {}", len);

            let masked = encode_text_masked(&text, [0x12, 0x34, 0x56, 0x78]);
            assert_eq!(decode_all(masked), vec![Frame::Text(text)], "masked len {}", len);
        }
    }

    #[test]
    fn oversize_payload_encodes_to_nothing() {
        let text = "x".repeat(65_536);
        assert!(encode_text(&text).is_empty());
        assert!(decode_all(encode_text(&text)).is_empty());
    }

    #[test]
    fn header_bytes() {
        let frame = encode_text("hi");
        assert_eq!(&frame[..2], &[0x81, 0x02]);

        let frame = encode_text(&"a".repeat(300));
        assert_eq!(&frame[..4], &[0x81, 126, 0x01, 0x2C]);

        let frame = encode_text_masked("hi", [1, 2, 3, 4]);
        assert_eq!(frame[1], 0x80 | 2);
        assert_eq!(&frame[2..6], &[1, 2, 3, 4]);
        assert_eq!(&frame[6..], &[b'h' ^ 1, b'i' ^ 2]);
    }

    #[test]
    fn rfc_masked_hello() {
        let bytes = vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        assert_eq!(decode_all(bytes), vec![Frame::Text("Hello".into())]);
    }

    #[test]
    fn control_frames() {
        let mut bytes = encode_frame(Opcode::Ping, b"abc", Some([9, 9, 9, 9]));
        bytes.extend(encode_close(Some(CLOSE_GOING_AWAY), None));
        bytes.extend(encode_close(None, None));
        assert_eq!(
            decode_all(bytes),
            vec![
                Frame::Ping(b"abc".to_vec()),
                Frame::Close(Some(1001)),
                Frame::Close(None)
            ]
        );

        let pong = encode_pong(b"abc", None);
        assert_eq!(decode_all(pong), vec![Frame::Pong(b"abc".to_vec())]);
    }

    #[test]
    fn dropped_frames_keep_stream_aligned() {
        let mut bytes = encode_frame(Opcode::Binary, &[1, 2, 3], None);
        bytes.extend(encode_frame(Opcode::Text, &[0xff, 0xfe], None));

        // 64-bit length header with a 10-byte payload.
        bytes.extend([0x81, 127]);
        bytes.extend(10u64.to_be_bytes());
        bytes.extend([b'z'; 10]);

        bytes.extend(encode_text("after"));
        assert_eq!(decode_all(bytes), vec![Frame::Text("after".into())]);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut bytes = encode_text("hello");
        bytes.truncate(4);
        let mut frames = Frames::new(Cursor::new(bytes));
        assert!(frames.next().unwrap().is_err());
        assert!(frames.next().is_none());
    }

    #[test]
    fn iterator_resumes_from_reader() {
        let mut bytes = encode_text("one");
        bytes.extend(encode_text("two"));
        let mut frames = Frames::new(Cursor::new(bytes));
        assert_eq!(frames.next().unwrap().unwrap(), Frame::Text("one".into()));

        let mut frames = Frames::new(frames.into_inner());
        assert_eq!(frames.next().unwrap().unwrap(), Frame::Text("two".into()));
        assert!(frames.next().is_none());
    }
}
