//! Wire codec for message framing.
//!
//! Every message is a fixed 24-byte header followed by the payload:
//!
//! ```text
//! +----------+-----------+----------+----------+
//! |  Magic   |  Command  |  Length  | Checksum |
//! | 4 bytes  | 12 bytes  | 4 bytes  | 4 bytes  |
//! +----------+-----------+----------+----------+
//! |                 Payload                    |
//! |              (Length bytes)                |
//! +--------------------------------------------+
//! ```
//!
//! - Magic: network identifier, little-endian
//! - Command: ASCII, NUL-padded on the right
//! - Length: payload length in bytes, little-endian
//! - Checksum: first 4 bytes of dsha256(payload)
//!
//! Unknown commands are frame-validated (length and checksum) and surfaced
//! as [`Message::Unknown`] so the connection can log and discard them; only
//! magic, checksum or payload parse failures are errors.

use crate::message::{Command, Message, COMMAND_SIZE};
use crate::{NetworkError, NetworkResult};
use bytes::{Buf, BufMut, BytesMut};
use spv_chain::dsha256;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Frame header size: magic (4) + command (12) + length (4) + checksum (4).
pub const FRAME_HEADER_SIZE: usize = 24;

/// Maximum payload this leaf client accepts.
pub const MAX_PAYLOAD_SIZE: usize = 2 * 1024 * 1024;

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = dsha256(payload);
    let mut sum = [0u8; 4];
    sum.copy_from_slice(&hash.as_bytes()[0..4]);
    sum
}

/// Message codec bound to one network's magic.
pub struct MessageCodec {
    magic: u32,
    max_size: usize,
}

impl MessageCodec {
    /// Create a codec for the given network magic.
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            max_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Parse the header without consuming.
        let magic = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if magic != self.magic {
            return Err(NetworkError::MagicMismatch {
                expected: self.magic,
                got: magic,
            });
        }

        let mut command_field = [0u8; COMMAND_SIZE];
        command_field.copy_from_slice(&src[4..16]);
        let length = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        let expected_sum = [src[20], src[21], src[22], src[23]];

        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total = FRAME_HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(length);

        if checksum(&payload) != expected_sum {
            return Err(NetworkError::ChecksumMismatch);
        }

        let command = Command::from_wire(&command_field)?;
        let message = Message::decode_payload(&command, &payload)?;
        if let Message::Unknown {
            ref command,
            payload_len,
        } = message
        {
            debug!(command, payload_len, "discarding unknown command");
        }
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        item.encode_payload(&mut payload)?;

        if payload.len() > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: payload.len(),
                max: self.max_size,
            });
        }

        dst.reserve(FRAME_HEADER_SIZE + payload.len());
        dst.put_u32_le(self.magic);
        dst.put_slice(&item.command().to_wire());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum(&payload));
        dst.put_slice(&payload);
        Ok(())
    }
}
