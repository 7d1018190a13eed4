//! The hub transport: owns the device link and the delivery queue.
//!
//! # Threads (for beginners)
//!
//! While a client is subscribed, [`NanoHub`] runs two background threads:
//!
//! ```text
//!   device ──read──▶ nanohub-rx ──system app──▶ InboundHandler (sessions)
//!                        │
//!                        └──user app──▶ queue ──▶ nanohub-tx ──▶ callback
//!
//!   callers ──send_to_device──▶ write lock ──▶ device
//!   sessions ──send_to_app────▶ queue
//! ```
//!
//! - **nanohub-rx** (poll thread) waits for the device to become readable,
//!   decodes one frame per read and either hands it to the session engine or
//!   queues it for the client.  It parks while the hub lock file exists.
//! - **nanohub-tx** (delivery thread) pops queued messages in FIFO order and
//!   invokes the client callback, one message at a time, outside every lock.
//!
//! A malformed frame means the stream has lost sync: the poll thread logs it,
//! closes the device and exits.  Writes then fail with `ENODEV` until the
//! client subscribes again.
//!
//! The callback runs on the delivery thread and must not call
//! [`NanoHub::subscribe`] itself; stopping joins that very thread.

pub mod device;
pub mod lock_watch;
pub mod mock;

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nanohub_core::protocol::commands::status;
use nanohub_core::protocol::frame::MAX_FRAME_SIZE;
use nanohub_core::{AppId, Frame, FrameError, HubMessage};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::application::session::{RxOutcome, SessionError};
use crate::infrastructure::storage::config::TransportConfig;

use self::lock_watch::{LockWatch, LockWaker};

// ── Device seam ───────────────────────────────────────────────────────────────

/// Result of waiting for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A frame can be read.
    Readable,
    /// [`HubDevice::wake`] was called.
    Woken,
    TimedOut,
}

/// A frame-oriented link to the hub: one frame per `read`, one per `write`.
pub trait HubDevice: Send + Sync {
    /// Blocks until a frame is available, the device is woken, or `timeout`
    /// elapses.
    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness>;

    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Makes a concurrent or the next `wait_readable` return `Woken`.
    fn wake(&self) -> io::Result<()>;
}

/// Opens a fresh device for each subscription.
pub trait DeviceOpener: Send + Sync {
    fn open(&self) -> io::Result<Arc<dyn HubDevice>>;

    /// Human-readable name of what is opened, for logs and errors.
    fn describe(&self) -> String;
}

/// Receives every system-app frame on the poll thread.
pub trait InboundHandler: Send + Sync {
    fn handle_system_frame(&self, frame: &Frame) -> Result<RxOutcome, SessionError>;
}

/// Client callback invoked on the delivery thread.
pub type ClientCallback = Arc<dyn Fn(&HubMessage) + Send + Sync>;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The frame could not be encoded (payload over one packet).
    #[error("cannot frame payload: {0}")]
    Frame(#[from] FrameError),

    /// No client is subscribed, or the link was closed after a fatal error.
    #[error("hub device is not open")]
    NotOpen,

    #[error("could not open hub device {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("hub device write failed: {0}")]
    Write(#[source] io::Error),

    #[error("short write to hub device: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("could not spawn transport thread: {0}")]
    Spawn(#[source] io::Error),
}

impl TransportError {
    /// The errno-style status reported upstream for this error.
    pub fn status(&self) -> i32 {
        match self {
            Self::Frame(_) => status::EINVAL,
            Self::NotOpen | Self::Open { .. } => status::ENODEV,
            Self::Write(e) => e.raw_os_error().map_or(status::EIO, |code| -code),
            Self::ShortWrite { .. } | Self::Spawn(_) => status::EIO,
        }
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// Where the exclusive-access lock file lives and how long to park on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub dir: PathBuf,
    pub file: String,
    pub max_park: Duration,
}

/// Runtime settings for [`NanoHub`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub poll_interval: Duration,
    /// `None` disables lock watching.
    pub lock: Option<LockSettings>,
    pub debug_level: u8,
}

impl From<&TransportConfig> for TransportSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            lock: Some(LockSettings {
                dir: config.lock_dir.clone(),
                file: config.lock_file.clone(),
                max_park: config.lock_wait(),
            }),
            debug_level: config.debug_level,
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct Queue {
    messages: VecDeque<HubMessage>,
    quit: bool,
}

/// State shared between the `NanoHub` handle and its threads.
struct Shared {
    /// The open device.  Holding this lock is the write lock.
    device: Mutex<Option<Arc<dyn HubDevice>>>,
    queue: Mutex<Queue>,
    queue_ready: Condvar,
    callback: Mutex<Option<ClientCallback>>,
    handler: Mutex<Option<Weak<dyn InboundHandler>>>,
    running: AtomicBool,
    debug_level: AtomicU8,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn enqueue(&self, msg: HubMessage) {
        lock(&self.queue).messages.push_back(msg);
        self.queue_ready.notify_one();
    }

    /// Drops the device after a fatal error so later writes see `ENODEV`.
    fn close_device(&self) {
        lock(&self.device).take();
    }

    fn dispatch_system(&self, frame: &Frame) {
        let handler = lock(&self.handler).as_ref().and_then(Weak::upgrade);
        let Some(handler) = handler else {
            warn!(len = frame.payload.len(), "system frame with no handler attached");
            return;
        };
        match handler.handle_system_frame(frame) {
            Ok(RxOutcome::Handled) => {}
            Ok(RxOutcome::NotMine) => {
                warn!(cmd = ?frame.payload.first(), "system frame not claimed by any session");
            }
            Err(e) => warn!(status = e.status(), "system frame rejected: {e}"),
        }
    }
}

struct Workers {
    poll: JoinHandle<()>,
    delivery: JoinHandle<()>,
    device: Arc<dyn HubDevice>,
    lock_waker: Option<LockWaker>,
}

// ── NanoHub ───────────────────────────────────────────────────────────────────

/// Owns the hub link while a client is subscribed.
pub struct NanoHub {
    opener: Box<dyn DeviceOpener>,
    settings: TransportSettings,
    shared: Arc<Shared>,
    workers: Mutex<Option<Workers>>,
}

impl NanoHub {
    pub fn new(opener: Box<dyn DeviceOpener>, settings: TransportSettings) -> Self {
        let debug_level = settings.debug_level;
        Self {
            opener,
            settings,
            shared: Arc::new(Shared {
                device: Mutex::new(None),
                queue: Mutex::new(Queue::default()),
                queue_ready: Condvar::new(),
                callback: Mutex::new(None),
                handler: Mutex::new(None),
                running: AtomicBool::new(false),
                debug_level: AtomicU8::new(debug_level),
            }),
            workers: Mutex::new(None),
        }
    }

    /// Attaches the receiver of system-app frames.
    pub fn set_handler(&self, handler: Weak<dyn InboundHandler>) {
        *lock(&self.shared.handler) = Some(handler);
    }

    /// Sets frame logging verbosity; takes effect at the next subscribe.
    pub fn set_debug_level(&self, level: u8) {
        self.shared.debug_level.store(level, Ordering::Relaxed);
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.workers).is_some()
    }

    /// Registers (`Some`) or removes (`None`) the client callback.
    ///
    /// The first registration opens the device and starts both threads;
    /// removal stops them and closes the device.  Registering while already
    /// subscribed only replaces the callback, unless the link was closed by a
    /// fatal error, in which case it is reopened.
    ///
    /// # Errors
    ///
    /// [`TransportError::Open`] or [`TransportError::Spawn`]; the hub is left
    /// unsubscribed.
    pub fn subscribe(&self, callback: Option<ClientCallback>) -> Result<(), TransportError> {
        let mut workers = lock(&self.workers);

        let Some(callback) = callback else {
            if let Some(running) = workers.take() {
                self.stop(running);
                info!("client unsubscribed");
            }
            *lock(&self.shared.callback) = None;
            return Ok(());
        };

        let link_closed = lock(&self.shared.device).is_none();
        if workers.is_some() && link_closed {
            info!("hub link was closed, reopening");
            if let Some(dead) = workers.take() {
                self.stop(dead);
            }
        }

        *lock(&self.shared.callback) = Some(callback);
        if workers.is_none() {
            match self.start() {
                Ok(started) => {
                    *workers = Some(started);
                    info!(device = %self.opener.describe(), "client subscribed");
                }
                Err(e) => {
                    *lock(&self.shared.callback) = None;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Frames `payload` for `app_id` and writes it to the device.
    ///
    /// Writes are serialised by the device lock; an interrupted write is
    /// retried, any other failure is returned.
    ///
    /// # Errors
    ///
    /// [`TransportError::Frame`] for a payload over one packet,
    /// [`TransportError::NotOpen`] when unsubscribed, or a write failure.
    pub fn send_to_device(
        &self,
        app_id: AppId,
        payload: &[u8],
        event_id: u32,
    ) -> Result<(), TransportError> {
        let bytes = Frame::new(event_id, app_id, payload).encode()?;

        let slot = lock(&self.shared.device);
        let device = slot.as_ref().ok_or(TransportError::NotOpen)?;
        if self.shared.debug_level.load(Ordering::Relaxed) >= 1 {
            debug!(%app_id, event_id, len = payload.len(), "tx frame");
        }
        loop {
            match device.write(&bytes) {
                Ok(n) if n == bytes.len() => return Ok(()),
                Ok(n) => {
                    return Err(TransportError::ShortWrite {
                        written: n,
                        expected: bytes.len(),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Write(e)),
            }
        }
    }

    /// Queues `msg` for the client callback.
    pub fn send_to_app(&self, msg: HubMessage) {
        self.shared.enqueue(msg);
    }

    fn start(&self) -> Result<Workers, TransportError> {
        let device = self.opener.open().map_err(|source| TransportError::Open {
            target: self.opener.describe(),
            source,
        })?;

        let lock_watch = self.settings.lock.as_ref().and_then(|lock| {
            LockWatch::new(&lock.dir, &lock.file)
                .map_err(|e| warn!("hub lock watching disabled: {e}"))
                .ok()
        });
        if let Some(watch) = &lock_watch {
            debug!(path = %watch.lock_path().display(), locked = watch.is_locked(), "watching hub lock");
        }
        let lock_waker = lock_watch.as_ref().map(LockWatch::waker);
        let lock_wait = self.settings.lock.as_ref().map(|l| l.max_park);

        *lock(&self.shared.queue) = Queue::default();
        *lock(&self.shared.device) = Some(Arc::clone(&device));
        self.shared.running.store(true, Ordering::Release);

        let poll = {
            let shared = Arc::clone(&self.shared);
            let device = Arc::clone(&device);
            let poll_interval = self.settings.poll_interval;
            thread::Builder::new()
                .name("nanohub-rx".to_string())
                .spawn(move || {
                    let watch = lock_watch.zip(lock_wait);
                    poll_loop(&shared, device.as_ref(), watch.as_ref(), poll_interval);
                })
        };
        let poll = match poll {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.close_device();
                return Err(TransportError::Spawn(e));
            }
        };

        let delivery = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("nanohub-tx".to_string())
                .spawn(move || delivery_loop(&shared))
        };
        match delivery {
            Ok(delivery) => Ok(Workers {
                poll,
                delivery,
                device,
                lock_waker,
            }),
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                let _ = device.wake();
                if let Some(waker) = &lock_waker {
                    waker.wake();
                }
                let _ = poll.join();
                self.shared.close_device();
                Err(TransportError::Spawn(e))
            }
        }
    }

    fn stop(&self, workers: Workers) {
        self.shared.running.store(false, Ordering::Release);
        if let Err(e) = workers.device.wake() {
            warn!("could not wake hub device: {e}");
        }
        if let Some(waker) = &workers.lock_waker {
            waker.wake();
        }
        lock(&self.shared.queue).quit = true;
        self.shared.queue_ready.notify_all();

        if workers.poll.join().is_err() {
            error!("poll thread panicked");
        }
        if workers.delivery.join().is_err() {
            error!("delivery thread panicked");
        }
        self.shared.close_device();
    }
}

impl Drop for NanoHub {
    fn drop(&mut self) {
        let workers = self
            .workers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(workers) = workers {
            self.stop(workers);
        }
    }
}

// ── Thread bodies ─────────────────────────────────────────────────────────────

fn poll_loop(
    shared: &Shared,
    device: &dyn HubDevice,
    lock_watch: Option<&(LockWatch, Duration)>,
    poll_interval: Duration,
) {
    let debug_level = shared.debug_level.load(Ordering::Relaxed);
    let mut buf = [0u8; MAX_FRAME_SIZE];
    debug!(debug_level, "poll thread started");

    while shared.running.load(Ordering::Acquire) {
        if let Some((watch, max_park)) = lock_watch {
            if !watch.wait_while_locked(&shared.running, *max_park) {
                break;
            }
        }

        match device.wait_readable(poll_interval) {
            Ok(Readiness::Readable) => {}
            Ok(Readiness::Woken | Readiness::TimedOut) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("hub device poll failed, closing link: {e}");
                shared.close_device();
                break;
            }
        }

        let n = match device.read(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                continue
            }
            Err(e) => {
                error!("hub device read failed, closing link: {e}");
                shared.close_device();
                break;
            }
        };

        let frame = match Frame::decode(&buf[..n]) {
            Ok(frame) => frame,
            Err(e) => {
                error!(len = n, "malformed frame, closing link: {e}");
                shared.close_device();
                break;
            }
        };

        if debug_level >= 1 {
            debug!(app_id = %frame.app_id, event_id = frame.event_id, len = frame.payload.len(), "rx frame");
        }
        if debug_level >= 2 {
            trace!(payload = %hex_dump(&frame.payload), "rx payload");
        }

        if frame.app_id.is_system() {
            if frame.payload.is_empty() {
                warn!("dropping empty system frame");
                continue;
            }
            shared.dispatch_system(&frame);
        } else {
            shared.enqueue(HubMessage::from_frame(&frame));
        }
    }

    debug!("poll thread stopped");
}

fn delivery_loop(shared: &Shared) {
    debug!("delivery thread started");
    loop {
        let msg = {
            let mut queue = lock(&shared.queue);
            loop {
                if queue.quit {
                    debug!(dropped = queue.messages.len(), "delivery thread stopped");
                    return;
                }
                if let Some(msg) = queue.messages.pop_front() {
                    break msg;
                }
                queue = shared
                    .queue_ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let callback = lock(&shared.callback).clone();
        match callback {
            Some(callback) => callback(&msg),
            None => debug!(app_id = %msg.app_id, "no callback, message dropped"),
        }
    }
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::mock::{MockDevice, MockOpener};
    use std::sync::mpsc;

    fn settings() -> TransportSettings {
        TransportSettings {
            poll_interval: Duration::from_millis(10),
            lock: None,
            debug_level: 2,
        }
    }

    fn hub() -> (NanoHub, Arc<MockDevice>) {
        let device = MockDevice::new();
        let opener = MockOpener::new(Arc::clone(&device));
        (NanoHub::new(Box::new(opener), settings()), device)
    }

    fn channel_callback() -> (ClientCallback, mpsc::Receiver<HubMessage>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: ClientCallback = Arc::new(move |msg: &HubMessage| {
            let copy = HubMessage::new(msg.app_id, msg.message_type, &msg.payload);
            let _ = lock(&tx).send(copy);
        });
        (callback, rx)
    }

    #[test]
    fn test_send_without_subscriber_is_enodev() {
        let (hub, _device) = hub();

        let err = hub.send_to_device(AppId(1), &[1], 0xF8).unwrap_err();

        assert!(matches!(err, TransportError::NotOpen));
        assert_eq!(err.status(), status::ENODEV);
    }

    #[test]
    fn test_oversized_payload_is_einval() {
        let (hub, _device) = hub();
        let (callback, _rx) = channel_callback();
        hub.subscribe(Some(callback)).unwrap();

        let err = hub.send_to_device(AppId(1), &[0; 129], 0xF8).unwrap_err();

        assert_eq!(err.status(), status::EINVAL);
    }

    #[test]
    fn test_interrupted_write_is_retried() {
        // Arrange
        let (hub, device) = hub();
        let (callback, _rx) = channel_callback();
        hub.subscribe(Some(callback)).unwrap();
        device.interrupt_next_writes(2);

        // Act
        hub.send_to_device(AppId(7), &[1, 2], 0xF8).unwrap();

        // Assert
        assert_eq!(device.written_frames(), vec![Frame::new(0xF8, AppId(7), &[1, 2])]);
    }

    #[test]
    fn test_write_failure_reports_errno() {
        let (hub, device) = hub();
        let (callback, _rx) = channel_callback();
        hub.subscribe(Some(callback)).unwrap();
        device.fail_writes(Some(io::ErrorKind::BrokenPipe));

        let err = hub.send_to_device(AppId(7), &[1], 0xF8).unwrap_err();

        assert!(matches!(err, TransportError::Write(_)));
        assert_eq!(err.status(), status::EIO);
    }

    #[test]
    fn test_user_frames_are_delivered_in_order() {
        // Arrange
        let (hub, device) = hub();
        let (callback, rx) = channel_callback();
        hub.subscribe(Some(callback)).unwrap();

        // Act
        for i in 0..5u8 {
            device.push_frame(&Frame::new(0x400 + u32::from(i), AppId(9), &[i]));
        }

        // Assert
        for i in 0..5u8 {
            let msg = rx.recv_timeout(Duration::from_secs(2)).expect("delivery");
            assert_eq!(msg.message_type, 0x400 + u32::from(i));
            assert_eq!(msg.payload, vec![i]);
        }
    }

    #[test]
    fn test_send_to_app_reaches_callback() {
        let (hub, _device) = hub();
        let (callback, rx) = channel_callback();
        hub.subscribe(Some(callback)).unwrap();

        hub.send_to_app(HubMessage::with_result(AppId(0), 5, -1));

        let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(msg.result_code(), Some(-1));
    }

    #[test]
    fn test_unsubscribe_closes_device() {
        let (hub, _device) = hub();
        let (callback, _rx) = channel_callback();
        hub.subscribe(Some(callback)).unwrap();

        hub.subscribe(None).unwrap();

        assert!(!hub.is_subscribed());
        assert!(matches!(
            hub.send_to_device(AppId(1), &[], 0xF8),
            Err(TransportError::NotOpen)
        ));
    }

    #[test]
    fn test_resubscribe_only_replaces_callback() {
        // Arrange
        let device = MockDevice::new();
        let opener = Arc::new(MockOpener::new(Arc::clone(&device)));
        struct SharedOpener(Arc<MockOpener>);
        impl DeviceOpener for SharedOpener {
            fn open(&self) -> io::Result<Arc<dyn HubDevice>> {
                self.0.open()
            }
            fn describe(&self) -> String {
                self.0.describe()
            }
        }
        let hub = NanoHub::new(Box::new(SharedOpener(Arc::clone(&opener))), settings());
        let (first, first_rx) = channel_callback();
        let (second, second_rx) = channel_callback();

        // Act
        hub.subscribe(Some(first)).unwrap();
        hub.subscribe(Some(second)).unwrap();
        device.push_frame(&Frame::new(1, AppId(3), &[1]));

        // Assert
        assert_eq!(opener.open_count(), 1);
        assert!(second_rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(first_rx.try_recv().is_err());
    }

    #[test]
    fn test_open_failure_leaves_hub_unsubscribed() {
        let opener = MockOpener::new(MockDevice::new());
        opener.fail_opens(true);
        let hub = NanoHub::new(Box::new(opener), settings());
        let (callback, _rx) = channel_callback();

        let err = hub.subscribe(Some(callback)).unwrap_err();

        assert!(matches!(err, TransportError::Open { .. }));
        assert_eq!(err.status(), status::ENODEV);
        assert!(!hub.is_subscribed());
    }

    #[test]
    fn test_hex_dump_formats_bytes() {
        assert_eq!(hex_dump(&[0x00, 0xab, 0x10]), "00 ab 10");
        assert_eq!(hex_dump(&[]), "");
    }
}
