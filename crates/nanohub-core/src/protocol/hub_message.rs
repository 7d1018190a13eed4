//! Owned envelope handed to the application layer.

use crate::protocol::frame::{AppId, Frame};

/// A message bound for the upstream callback.
///
/// The payload is an owned copy, so the message outlives the transient frame
/// buffer it was decoded from.  Not `Clone`: each message has exactly one
/// consumer and is moved through the delivery queue.
#[derive(Debug, PartialEq, Eq)]
pub struct HubMessage {
    /// The app the message came from (or, for replies, the app addressed).
    pub app_id: AppId,
    /// Upstream message type; the frame's event id for user-app traffic.
    pub message_type: u32,
    pub payload: Vec<u8>,
}

impl HubMessage {
    pub fn new(app_id: AppId, message_type: u32, payload: &[u8]) -> Self {
        Self {
            app_id,
            message_type,
            payload: payload.to_vec(),
        }
    }

    /// Wraps a frame received from a user app.
    pub fn from_frame(frame: &Frame) -> Self {
        Self::new(frame.app_id, frame.event_id, &frame.payload)
    }

    /// Builds a reply carrying a single `i32` result code.
    pub fn with_result(app_id: AppId, message_type: u32, result: i32) -> Self {
        Self {
            app_id,
            message_type,
            payload: result.to_le_bytes().to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Interprets the payload as a single `i32` result code.
    pub fn result_code(&self) -> Option<i32> {
        let raw: [u8; 4] = self.payload.as_slice().try_into().ok()?;
        Some(i32::from_le_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::SYSTEM_APP_ID;

    #[test]
    fn test_from_frame_copies_payload() {
        // Arrange
        let frame = Frame::new(0x401, AppId(5), &[1, 2, 3]);

        // Act
        let msg = HubMessage::from_frame(&frame);
        drop(frame);

        // Assert – the message owns its bytes after the frame is gone
        assert_eq!(msg.app_id, AppId(5));
        assert_eq!(msg.message_type, 0x401);
        assert_eq!(msg.payload, vec![1, 2, 3]);
        assert_eq!(msg.len(), 3);
    }

    #[test]
    fn test_result_code_round_trip() {
        let msg = HubMessage::with_result(SYSTEM_APP_ID, 3, -1);
        assert_eq!(msg.result_code(), Some(-1));
        assert_eq!(msg.len(), 4);
    }

    #[test]
    fn test_result_code_requires_exactly_four_bytes() {
        let msg = HubMessage::new(SYSTEM_APP_ID, 5, &[0; 20]);
        assert_eq!(msg.result_code(), None);
    }
}
