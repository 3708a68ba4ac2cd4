use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + length (4) + channel (2) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "PB" (0x50 0x42).
pub const MAGIC: [u8; 2] = [0x50, 0x42];

/// Default maximum payload size: 256 MiB.
///
/// Dense images travel as a single payload, so this is far larger than a
/// typical control-plane limit.
pub const DEFAULT_MAX_PAYLOAD: usize = 256 * 1024 * 1024;

/// A received message with its channel tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The channel this message belongs to.
    pub channel: u16,
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Encode only the 8-byte frame header for a payload of `payload_len` bytes.
///
/// The writer sends this header and then the caller's payload slice as-is,
/// so large payloads are never copied into an intermediate buffer.
pub fn encode_header(channel: u16, payload_len: usize) -> Result<[u8; HEADER_SIZE]> {
    let len = u32::try_from(payload_len).map_err(|_| FrameError::PayloadTooLarge {
        size: payload_len,
        max: u32::MAX as usize,
    })?;
    let mut header = [0u8; HEADER_SIZE];
    header[0..2].copy_from_slice(&MAGIC);
    header[2..6].copy_from_slice(&len.to_le_bytes());
    header[6..8].copy_from_slice(&channel.to_le_bytes());
    Ok(header)
}

/// Encode a complete frame into `dst`.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬──────────┬─────────────────┐
/// │ Magic (2B)   │ Length    │ Channel  │ Payload          │
/// │ 0x50 0x42    │ (4B LE)  │ (2B LE)  │ (Length bytes)   │
/// │ "PB"         │          │          │                  │
/// └──────────────┴───────────┴──────────┴─────────────────┘
/// ```
pub fn encode_frame(channel: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let header = encode_header(channel, payload.len())?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&header);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    let Some(payload_len) = peek_payload_len(src, max_payload)? else {
        return Ok(None);
    };

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    let channel = u16::from_le_bytes([src[6], src[7]]);
    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame { channel, payload }))
}

/// Number of bytes still missing before `src` holds a complete frame.
///
/// Returns `Ok(None)` while the header itself is incomplete.
pub fn missing_bytes(src: &BytesMut, max_payload: usize) -> Result<Option<usize>> {
    Ok(peek_payload_len(src, max_payload)?
        .map(|payload_len| (HEADER_SIZE + payload_len).saturating_sub(src.len())))
}

fn peek_payload_len(src: &BytesMut, max_payload: usize) -> Result<Option<usize>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }
    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    Ok(Some(payload_len))
}

/// Configuration for frame readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 256 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations. `None` blocks indefinitely.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations. `None` blocks indefinitely.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let payload = b"plt.plot(x, y)";

        encode_frame(crate::SCRIPT, payload, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + payload.len());

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(frame.channel, crate::SCRIPT);
        assert_eq!(frame.payload.as_ref(), payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn header_layout_is_little_endian() {
        let header = encode_header(0x0102, 0x0A0B0C0D).unwrap();
        assert_eq!(header, [0x50, 0x42, 0x0D, 0x0C, 0x0B, 0x0A, 0x02, 0x01]);
    }

    #[test]
    fn decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x50, 0x42, 0x00][..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
        assert_eq!(missing_bytes(&buf, DEFAULT_MAX_PAYLOAD).unwrap(), None);
    }

    #[test]
    fn decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(crate::DATA, b"hello", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        assert_eq!(missing_bytes(&buf, DEFAULT_MAX_PAYLOAD).unwrap(), Some(3));
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn decode_invalid_magic() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::InvalidMagic)));
    }

    #[test]
    fn decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(1024);
        buf.put_u16_le(crate::DATA);

        let result = decode_frame(&mut buf, 16);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn consecutive_frames_keep_their_order() {
        let mut buf = BytesMut::new();
        encode_frame(crate::DATA, b"data|x|f|3|(3,)", &mut buf).unwrap();
        encode_frame(crate::DATA, &[0u8; 12], &mut buf).unwrap();
        encode_frame(crate::CONTROL, b"finalize", &mut buf).unwrap();

        let header = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        let payload = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        let sentinel = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();

        assert_eq!(header.text(), Some("data|x|f|3|(3,)"));
        assert_eq!(payload.payload.len(), 12);
        assert_eq!(sentinel.channel, crate::CONTROL);
        assert_eq!(sentinel.text(), Some("finalize"));
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload_roundtrips() {
        let mut buf = BytesMut::new();
        encode_frame(crate::SCRIPT, b"", &mut buf).unwrap();

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(frame.channel, crate::SCRIPT);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn frame_wire_size() {
        let frame = Frame::new(crate::CONTROL, Bytes::from_static(b"exit"));
        assert_eq!(frame.wire_size(), HEADER_SIZE + 4);
    }
}
