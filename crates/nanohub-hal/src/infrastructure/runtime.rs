//! Wires the transport and the session engine together.
//!
//! ```text
//!   HubRuntime
//!    ├─ Arc<NanoHub>     implements HubLink      (sessions → device/client)
//!    └─ Arc<SystemComm>  implements InboundHandler (poll thread → sessions)
//! ```
//!
//! The session engine holds a strong reference to the transport; the
//! transport only holds a `Weak` reference back, so dropping the runtime
//! frees both.

use std::sync::Arc;

use nanohub_core::{AppId, Frame, HubMessage};
use tracing::warn;

use crate::application::link::{HubLink, HubRequest};
use crate::application::session::{RxOutcome, SessionError};
use crate::application::system_comm::SystemComm;
use crate::infrastructure::storage::config::TransportConfig;
use crate::infrastructure::transport::device::CharDeviceOpener;
use crate::infrastructure::transport::{
    ClientCallback, DeviceOpener, InboundHandler, NanoHub, TransportError, TransportSettings,
};

impl HubLink for NanoHub {
    fn send_to_device(
        &self,
        app_id: AppId,
        payload: &[u8],
        event_id: u32,
    ) -> Result<(), SessionError> {
        NanoHub::send_to_device(self, app_id, payload, event_id).map_err(|e| {
            warn!(%app_id, "device write failed: {e}");
            SessionError::Link(e.status())
        })
    }

    fn send_to_app(&self, msg: HubMessage) {
        NanoHub::send_to_app(self, msg);
    }
}

impl InboundHandler for SystemComm {
    fn handle_system_frame(&self, frame: &Frame) -> Result<RxOutcome, SessionError> {
        self.handle_rx(frame)
    }
}

/// One transport plus one session engine.
pub struct HubRuntime {
    hub: Arc<NanoHub>,
    comm: Arc<SystemComm>,
}

impl HubRuntime {
    pub fn new(settings: TransportSettings, opener: Box<dyn DeviceOpener>) -> Self {
        let hub = Arc::new(NanoHub::new(opener, settings));
        let link: Arc<dyn HubLink> = hub.clone();
        let comm = Arc::new(SystemComm::new(link));
        let handler: Arc<dyn InboundHandler> = comm.clone();
        hub.set_handler(Arc::downgrade(&handler));
        Self { hub, comm }
    }

    /// A runtime on the character device named in `config`.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            TransportSettings::from(config),
            Box::new(CharDeviceOpener::new(config.device_path.clone())),
        )
    }

    /// Opens the device (if needed) and routes upstream messages to `callback`.
    ///
    /// # Errors
    ///
    /// See [`NanoHub::subscribe`].
    pub fn subscribe(&self, callback: ClientCallback) -> Result<(), TransportError> {
        self.hub.subscribe(Some(callback))
    }

    /// Stops the transport threads and closes the device.
    pub fn unsubscribe(&self) {
        // Removing a callback cannot fail.
        let _ = self.hub.subscribe(None);
    }

    /// Sends a client request through the session engine.
    ///
    /// # Errors
    ///
    /// See [`SystemComm::handle_tx`].
    pub fn send(&self, request: &HubRequest) -> Result<(), SessionError> {
        self.comm.handle_tx(request)
    }

    pub fn comm(&self) -> &SystemComm {
        &self.comm
    }

    pub fn hub(&self) -> &NanoHub {
        &self.hub
    }
}

impl Drop for HubRuntime {
    fn drop(&mut self) {
        // Stop the threads while both halves are alive, so the last reference
        // is never released on the poll thread.
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::mock::{MockDevice, MockOpener};
    use nanohub_core::protocol::commands::{status, HubRequestType, SystemCommand, EVT_APP_FROM_HOST};
    use nanohub_core::SYSTEM_APP_ID;
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;

    fn runtime() -> (HubRuntime, Arc<MockDevice>) {
        let device = MockDevice::new();
        let settings = TransportSettings {
            poll_interval: Duration::from_millis(10),
            lock: None,
            debug_level: 1,
        };
        let runtime = HubRuntime::new(settings, Box::new(MockOpener::new(Arc::clone(&device))));
        (runtime, device)
    }

    fn subscribe(runtime: &HubRuntime) -> mpsc::Receiver<HubMessage> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        runtime
            .subscribe(Arc::new(move |msg: &HubMessage| {
                let copy = HubMessage::new(msg.app_id, msg.message_type, &msg.payload);
                let _ = tx.lock().unwrap().send(copy);
            }))
            .unwrap();
        rx
    }

    #[test]
    fn test_memory_query_round_trip_through_device() {
        // Arrange
        let (runtime, device) = runtime();
        let rx = subscribe(&runtime);

        // Act
        runtime
            .send(&HubRequest::system(HubRequestType::QueryMemory.as_u32(), &[]))
            .unwrap();
        let request = device.next_write(Duration::from_secs(2)).expect("query written");
        let mut reply = vec![SystemCommand::QueryMemInfo.as_u8()];
        reply.extend_from_slice(&[0u8; 48]);
        device.push_frame(&Frame::new(0, SYSTEM_APP_ID, &reply));

        // Assert
        assert_eq!(request.event_id, EVT_APP_FROM_HOST);
        assert_eq!(request.payload, vec![SystemCommand::QueryMemInfo.as_u8()]);
        let msg = rx.recv_timeout(Duration::from_secs(2)).expect("result delivered");
        assert_eq!(msg.message_type, HubRequestType::QueryMemory.as_u32());
    }

    #[test]
    fn test_request_before_subscribe_fails_with_enodev() {
        let (runtime, _device) = runtime();

        let err = runtime
            .send(&HubRequest::system(HubRequestType::QueryApps.as_u32(), &[]))
            .unwrap_err();

        assert_eq!(err.status(), status::ENODEV);
        assert!(runtime.comm().busy_keys().is_empty());
    }

    #[test]
    fn test_unsubscribe_then_resubscribe_with_payload_dumps() {
        // Arrange
        let (runtime, device) = runtime();
        runtime.hub().set_debug_level(2);
        let _first = subscribe(&runtime);

        // Act
        runtime.unsubscribe();
        let stopped = runtime.hub().is_subscribed();
        let rx = subscribe(&runtime);
        device.push_frame(&Frame::new(0x401, AppId(3), &[0xAB, 0xCD]));

        // Assert
        assert!(!stopped);
        assert!(runtime.hub().is_subscribed());
        let msg = rx.recv_timeout(Duration::from_secs(2)).expect("user frame delivered");
        assert_eq!(msg.payload, vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_drop_while_subscribed_stops_threads() {
        let (runtime, device) = runtime();
        let _rx = subscribe(&runtime);

        drop(runtime);

        assert!(device.written_frames().is_empty());
    }
}
