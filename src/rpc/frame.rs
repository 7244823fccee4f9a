//! Multipart message framing.
//!
//! A message is a sequence of opaque frames:
//!
//! ```text
//! +-------------+-----------+---------+-----------+---------+-----
//! | count (u32) | len (u32) | frame 0 | len (u32) | frame 1 | ...
//! +-------------+-----------+---------+-----------+---------+-----
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

/// One multipart message.
pub type Multipart = Vec<Bytes>;

/// Default upper bound on an encoded message: 64 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const MAX_FRAMES: usize = 1024;
const WORD: usize = 4;

/// `tokio_util` codec for [`Multipart`] messages.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl FrameCodec {
    /// Creates a codec with [`DEFAULT_MAX_MESSAGE_SIZE`].
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Creates a codec rejecting messages larger than `max_message_size`.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn read_word(src: &[u8], at: usize) -> usize {
    let mut word = [0u8; WORD];
    word.copy_from_slice(&src[at..at + WORD]);
    u32::from_be_bytes(word) as usize
}

impl Decoder for FrameCodec {
    type Item = Multipart;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Multipart>, TransportError> {
        if src.len() < WORD {
            return Ok(None);
        }
        let count = read_word(src, 0);
        if count > MAX_FRAMES {
            return Err(TransportError::Protocol(format!(
                "message declares {count} frames (max {MAX_FRAMES})"
            )));
        }

        // Walk the length prefixes without consuming until the whole message
        // is buffered.
        let mut offset = WORD;
        let mut lengths = Vec::with_capacity(count);
        for _ in 0..count {
            if src.len() < offset + WORD {
                return Ok(None);
            }
            let len = read_word(src, offset);
            offset += WORD;
            if offset + len > self.max_message_size {
                return Err(TransportError::Protocol(format!(
                    "message exceeds {} bytes",
                    self.max_message_size
                )));
            }
            if src.len() < offset + len {
                src.reserve(offset + len - src.len());
                return Ok(None);
            }
            lengths.push(len);
            offset += len;
        }

        let mut message = src.split_to(offset);
        message.advance(WORD);
        let mut frames = Vec::with_capacity(count);
        for len in lengths {
            message.advance(WORD);
            frames.push(message.split_to(len).freeze());
        }
        Ok(Some(frames))
    }
}

impl Encoder<Multipart> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Multipart, dst: &mut BytesMut) -> Result<(), TransportError> {
        if item.len() > MAX_FRAMES {
            return Err(TransportError::Protocol(format!(
                "cannot send {} frames (max {MAX_FRAMES})",
                item.len()
            )));
        }
        let size = WORD + item.iter().map(|f| WORD + f.len()).sum::<usize>();
        if size > self.max_message_size {
            return Err(TransportError::Protocol(format!(
                "message of {size} bytes exceeds {}",
                self.max_message_size
            )));
        }
        dst.reserve(size);
        dst.put_u32(item.len() as u32);
        for frame in item {
            dst.put_u32(frame.len() as u32);
            dst.put_slice(&frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&'static [u8]]) -> Multipart {
        parts.iter().map(|p| Bytes::from_static(p)).collect()
    }

    #[test]
    fn decodes_across_partial_reads() {
        let mut codec = FrameCodec::new();
        let mut encoded = BytesMut::new();
        codec
            .encode(frames(&[b"TRC01", b"task", b""]), &mut encoded)
            .unwrap();

        let mut buf = BytesMut::new();
        let bytes = encoded.freeze();
        for (i, byte) in bytes.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(decoded.is_none(), "decoded early at byte {i}");
            } else {
                assert_eq!(decoded, Some(frames(&[b"TRC01", b"task", b""])));
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_back_to_back_messages() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frames(&[b"a"]), &mut buf).unwrap();
        codec.encode(frames(&[b"b", b"c"]), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frames(&[b"a"])));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frames(&[b"b", b"c"])));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut codec = FrameCodec::with_max_message_size(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(1024);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::Protocol(_))
        ));
        assert!(codec
            .encode(vec![Bytes::from(vec![0u8; 64])], &mut BytesMut::new())
            .is_err());
    }
}
