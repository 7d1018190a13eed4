//! In-memory hub device for tests.
//!
//! Allows tests to play the hub's side of the link: queue frames for the poll
//! thread to read, and inspect or consume the frames the host wrote, without a
//! kernel driver.  Frame helpers panic on malformed bytes, which is what a
//! test wants.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nanohub_core::Frame;

use super::{DeviceOpener, HubDevice, Readiness};

#[derive(Debug, Default)]
struct MockState {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    unclaimed: VecDeque<Vec<u8>>,
    woken: bool,
    interrupt_writes: usize,
    fail_writes: Option<io::ErrorKind>,
}

/// A [`HubDevice`] backed by in-memory queues.
#[derive(Debug, Default)]
pub struct MockDevice {
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `frame` to be returned by a later `read`.
    pub fn push_frame(&self, frame: &Frame) {
        let bytes = frame.encode().expect("test frame must fit in one packet");
        self.push_raw(bytes);
    }

    /// Queues raw bytes, which need not form a valid frame.
    pub fn push_raw(&self, bytes: Vec<u8>) {
        self.lock().inbound.push_back(bytes);
        self.changed.notify_all();
    }

    /// Every frame written so far, decoded.
    pub fn written_frames(&self) -> Vec<Frame> {
        self.lock()
            .written
            .iter()
            .map(|bytes| Frame::decode(bytes).expect("host wrote a malformed frame"))
            .collect()
    }

    /// Takes the oldest write not yet returned by this method, waiting up to
    /// `timeout` for one to arrive.
    pub fn next_write(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(bytes) = state.unclaimed.pop_front() {
                return Some(Frame::decode(&bytes).expect("host wrote a malformed frame"));
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Makes the next `n` writes fail with `EINTR`.
    pub fn interrupt_next_writes(&self, n: usize) {
        self.lock().interrupt_writes = n;
    }

    /// Makes every later write fail with `kind` (`None` restores success).
    pub fn fail_writes(&self, kind: Option<io::ErrorKind>) {
        self.lock().fail_writes = kind;
    }
}

impl HubDevice for MockDevice {
    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        let state = self.lock();
        let (mut state, result) = self
            .changed
            .wait_timeout_while(state, timeout, |s| s.inbound.is_empty() && !s.woken)
            .unwrap_or_else(PoisonError::into_inner);
        if state.woken {
            state.woken = false;
            return Ok(Readiness::Woken);
        }
        if result.timed_out() {
            return Ok(Readiness::TimedOut);
        }
        Ok(Readiness::Readable)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(bytes) = self.lock().inbound.pop_front() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.interrupt_writes > 0 {
            state.interrupt_writes -= 1;
            return Err(io::ErrorKind::Interrupted.into());
        }
        if let Some(kind) = state.fail_writes {
            return Err(kind.into());
        }
        state.written.push(buf.to_vec());
        state.unclaimed.push_back(buf.to_vec());
        self.changed.notify_all();
        Ok(buf.len())
    }

    fn wake(&self) -> io::Result<()> {
        self.lock().woken = true;
        self.changed.notify_all();
        Ok(())
    }
}

/// Hands out the same [`MockDevice`] on every open.
#[derive(Debug)]
pub struct MockOpener {
    device: Arc<MockDevice>,
    opens: AtomicUsize,
    fail: AtomicBool,
}

impl MockOpener {
    pub fn new(device: Arc<MockDevice>) -> Self {
        Self {
            device,
            opens: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Makes later opens fail with `NotFound`.
    pub fn fail_opens(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl DeviceOpener for MockOpener {
    fn open(&self) -> io::Result<Arc<dyn HubDevice>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::NotFound.into());
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.device.clone())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanohub_core::AppId;

    #[test]
    fn test_pushed_frame_is_readable_then_read() {
        // Arrange
        let device = MockDevice::new();
        let frame = Frame::new(1, AppId(2), &[3, 4]);
        device.push_frame(&frame);

        // Act
        let readiness = device.wait_readable(Duration::from_millis(10)).unwrap();
        let mut buf = [0u8; 64];
        let n = device.read(&mut buf).unwrap();

        // Assert
        assert_eq!(readiness, Readiness::Readable);
        assert_eq!(Frame::decode(&buf[..n]).unwrap(), frame);
    }

    #[test]
    fn test_wake_is_reported_once() {
        let device = MockDevice::new();
        device.wake().unwrap();

        assert_eq!(device.wait_readable(Duration::from_secs(1)).unwrap(), Readiness::Woken);
        assert_eq!(
            device.wait_readable(Duration::from_millis(5)).unwrap(),
            Readiness::TimedOut
        );
    }

    #[test]
    fn test_interrupted_writes_are_not_recorded() {
        let device = MockDevice::new();
        device.interrupt_next_writes(1);

        assert_eq!(
            device.write(&[0]).unwrap_err().kind(),
            io::ErrorKind::Interrupted
        );
        assert!(device.write(&Frame::new(0, AppId(0), &[]).encode().unwrap()).is_ok());
        assert_eq!(device.written_frames().len(), 1);
    }

    #[test]
    fn test_next_write_times_out_when_nothing_written() {
        let device = MockDevice::new();
        assert!(device.next_write(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_opener_counts_and_fails_on_request() {
        let opener = MockOpener::new(MockDevice::new());
        opener.open().unwrap();
        opener.fail_opens(true);

        assert!(opener.open().is_err());
        assert_eq!(opener.open_count(), 1);
    }
}
