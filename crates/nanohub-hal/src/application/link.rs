//! The session engine's view of the outside world.
//!
//! Sessions never touch the device or the delivery queue directly.  They talk
//! through [`HubLink`], which the runtime implements on top of the transport
//! and which tests replace with a `mockall` mock or a [`RecordingLink`].

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use nanohub_core::protocol::commands::EVT_APP_FROM_HOST;
use nanohub_core::{AppId, HubMessage, SYSTEM_APP_ID};

use crate::application::session::SessionError;

/// An outbound request from the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubRequest {
    /// Target app; [`SYSTEM_APP_ID`] routes to a session.
    pub app_id: AppId,
    /// Upstream message type (see `HubRequestType`).
    pub message_type: u32,
    pub payload: Vec<u8>,
}

impl HubRequest {
    pub fn new(app_id: AppId, message_type: u32, payload: &[u8]) -> Self {
        Self {
            app_id,
            message_type,
            payload: payload.to_vec(),
        }
    }

    /// A system-app request of the given type.
    pub fn system(message_type: u32, payload: &[u8]) -> Self {
        Self::new(SYSTEM_APP_ID, message_type, payload)
    }
}

/// Outbound side of the session engine.
#[cfg_attr(test, mockall::automock)]
pub trait HubLink: Send + Sync {
    /// Frames `payload` and writes it to the device.
    fn send_to_device(&self, app_id: AppId, payload: &[u8], event_id: u32)
        -> Result<(), SessionError>;

    /// Queues `msg` for delivery to the registered client callback.
    fn send_to_app(&self, msg: HubMessage);

    /// Sends a request to the system app.
    fn send_to_system(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.send_to_device(SYSTEM_APP_ID, payload, EVT_APP_FROM_HOST)
    }
}

/// A device write captured by [`RecordingLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub app_id: AppId,
    pub event_id: u32,
    pub payload: Vec<u8>,
}

impl SentFrame {
    /// The command byte of a system-app request.
    pub fn command(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// A [`HubLink`] that records every write and delivery.
///
/// Used for scripted multi-frame exchanges where setting up one expectation
/// per frame would obscure the flow.  Writes can be made to fail with a
/// given status to exercise link errors.
#[derive(Debug, Default)]
pub struct RecordingLink {
    sent: Mutex<Vec<SentFrame>>,
    delivered: Mutex<VecDeque<HubMessage>>,
    fail_with: Mutex<Option<i32>>,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every device write so far, oldest first.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Command bytes of every system-app write so far.
    pub fn sent_commands(&self) -> Vec<u8> {
        self.sent()
            .iter()
            .filter(|f| f.app_id.is_system())
            .filter_map(SentFrame::command)
            .collect()
    }

    /// Removes and returns everything delivered upstream so far.
    pub fn take_delivered(&self) -> Vec<HubMessage> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Makes every later write fail with `status` (`None` restores success).
    pub fn fail_writes(&self, status: Option<i32>) {
        *self.fail_with.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

impl HubLink for RecordingLink {
    fn send_to_device(
        &self,
        app_id: AppId,
        payload: &[u8],
        event_id: u32,
    ) -> Result<(), SessionError> {
        if let Some(status) = *self.fail_with.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(SessionError::Link(status));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentFrame {
                app_id,
                event_id,
                payload: payload.to_vec(),
            });
        Ok(())
    }

    fn send_to_app(&self, msg: HubMessage) {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(msg);
    }
}
