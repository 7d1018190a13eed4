//! Device frame codec.
//!
//! Wire format (little-endian, packed):
//! ```text
//! [event_id:4][app_id:8][len:1][payload:len]
//! ```
//! Header size is 13 bytes and `len` never exceeds [`MAX_RX_PACKET`].  The
//! character device delivers exactly one frame per `read`, so a decoded
//! frame must account for every byte that was read.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::commands::{MAX_RX_PACKET, MAX_TX_PACKET};
use crate::protocol::message_buf::{MessageBuf, MessageView};

/// Size of the frame header preceding the payload.
pub const FRAME_HEADER_SIZE: usize = 13;

/// Largest frame the device will ever hand us.
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_RX_PACKET;

/// 64-bit identity of an app running on the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub u64);

/// The reserved identity of the firmware-management (system) app.
pub const SYSTEM_APP_ID: AppId = AppId(0);

impl AppId {
    pub fn is_system(self) -> bool {
        self == SYSTEM_APP_ID
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Errors produced while framing or unframing device packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than a frame header were read.
    #[error("short frame: need {needed} header bytes, got {available}")]
    ShortHeader { needed: usize, available: usize },

    /// The header declares more payload than any frame can carry.
    #[error("declared payload length {declared} exceeds maximum {max}")]
    PayloadTooLarge { declared: usize, max: usize },

    /// The read size disagrees with the declared payload length.
    #[error("frame length mismatch: header declares {declared} payload bytes, read {available}")]
    LengthMismatch { declared: usize, available: usize },
}

/// One packet exchanged with the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event_id: u32,
    pub app_id: AppId,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(event_id: u32, app_id: AppId, payload: &[u8]) -> Self {
        Self {
            event_id,
            app_id,
            payload: payload.to_vec(),
        }
    }

    /// Read-only cursor over the payload.
    pub fn view(&self) -> MessageView<'_> {
        MessageView::new(&self.payload)
    }

    /// Serialises the frame for a single device `write`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] when the payload exceeds
    /// [`MAX_TX_PACKET`].
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_TX_PACKET {
            return Err(FrameError::PayloadTooLarge {
                declared: self.payload.len(),
                max: MAX_TX_PACKET,
            });
        }

        let mut out = vec![0u8; FRAME_HEADER_SIZE + self.payload.len()];
        let mut buf = MessageBuf::new(&mut out);
        buf.write_u32(self.event_id);
        buf.write_u64(self.app_id.0);
        buf.write_u8(self.payload.len() as u8);
        buf.write_raw(&self.payload);
        Ok(out)
    }

    /// Parses the bytes returned by one device `read`.
    ///
    /// # Errors
    ///
    /// Any [`FrameError`] is fatal to the link: the stream has lost sync.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use nanohub_core::protocol::frame::{AppId, Frame};
    ///
    /// let frame = Frame::new(0xF8, AppId(0), &[4, 0, 0, 0, 0]);
    /// let bytes = frame.encode().unwrap();
    /// assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::ShortHeader {
                needed: FRAME_HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let mut view = MessageView::new(bytes);
        let event_id = view.read_u32();
        let app_id = AppId(view.read_u64());
        let len = view.read_u8() as usize;

        if len > MAX_RX_PACKET {
            return Err(FrameError::PayloadTooLarge {
                declared: len,
                max: MAX_RX_PACKET,
            });
        }
        if view.room() != len {
            return Err(FrameError::LengthMismatch {
                declared: len,
                available: view.room(),
            });
        }

        Ok(Self {
            event_id,
            app_id,
            payload: view.read_raw(len).to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands::EVT_APP_FROM_HOST;

    #[test]
    fn test_header_layout_is_event_then_app_then_len() {
        let frame = Frame::new(0x0102_0304, AppId(0x1122_3344_5566_7788), &[0xAA]);

        let bytes = frame.encode().unwrap();

        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..12], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(bytes[12], 1);
        assert_eq!(bytes[13], 0xAA);
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 1);
    }

    #[test]
    fn test_decode_returns_original_frame() {
        let frame = Frame::new(EVT_APP_FROM_HOST, AppId(7), &[1, 2, 3]);
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let frame = Frame::new(EVT_APP_FROM_HOST, SYSTEM_APP_ID, &[0u8; MAX_TX_PACKET + 1]);
        assert_eq!(
            frame.encode(),
            Err(FrameError::PayloadTooLarge {
                declared: MAX_TX_PACKET + 1,
                max: MAX_TX_PACKET
            })
        );
    }

    #[test]
    fn test_encode_accepts_exactly_max_payload() {
        let frame = Frame::new(EVT_APP_FROM_HOST, SYSTEM_APP_ID, &[0u8; MAX_TX_PACKET]);
        assert_eq!(frame.encode().unwrap().len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn test_decode_short_header_is_error() {
        let result = Frame::decode(&[0u8; 12]);
        assert!(matches!(result, Err(FrameError::ShortHeader { available: 12, .. })));
    }

    #[test]
    fn test_decode_declared_length_above_capacity_is_error() {
        let mut bytes = vec![0u8; FRAME_HEADER_SIZE];
        bytes[12] = 200;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::PayloadTooLarge { declared: 200, .. })
        ));
    }

    #[test]
    fn test_decode_short_read_is_length_mismatch() {
        let mut bytes = Frame::new(1, AppId(1), &[1, 2, 3, 4]).encode().unwrap();
        bytes.truncate(bytes.len() - 2);
        assert_eq!(
            Frame::decode(&bytes),
            Err(FrameError::LengthMismatch {
                declared: 4,
                available: 2
            })
        );
    }

    #[test]
    fn test_app_id_display_is_fixed_width_hex() {
        assert_eq!(AppId(0x476F_6F67_6C00_0001).to_string(), "476F6F676C000001");
        assert!(SYSTEM_APP_ID.is_system());
        assert!(!AppId(1).is_system());
    }
}
