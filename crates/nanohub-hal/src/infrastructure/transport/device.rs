//! Character-device backend for [`HubDevice`].
//!
//! The device delivers one frame per `read` and accepts one frame per
//! `write`.  Readiness is multiplexed with `libc::poll` over two descriptors:
//!
//! ```text
//!  pollfd[0]  /dev/nanohub_comms   POLLIN → Readable
//!  pollfd[1]  wake pipe (read end) POLLIN → Woken
//! ```
//!
//! Writing one byte to the pipe's write end is how shutdown interrupts a
//! blocked poll without closing the device under the poll thread's feet.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{DeviceOpener, HubDevice, Readiness};

/// An open hub character device plus its wake pipe.
#[derive(Debug)]
pub struct CharDevice {
    file: File,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
}

impl CharDevice {
    /// Opens `path` read/write and creates the wake pipe.
    ///
    /// # Errors
    ///
    /// Any error from `open(2)` or `pipe(2)`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let (wake_rx, wake_tx) = wake_pipe()?;
        debug!(path = %path.display(), fd = file.as_raw_fd(), "hub device opened");
        Ok(Self {
            file,
            wake_rx,
            wake_tx,
        })
    }

    fn drain_wake_pipe(&self) {
        let mut byte = [0u8; 16];
        // The read end is non-blocking; stop at EAGAIN.
        loop {
            // SAFETY: `byte` is a live local buffer and the length passed is
            // its own; the descriptor is owned by `self`.
            let n = unsafe {
                libc::read(
                    self.wake_rx.as_raw_fd(),
                    byte.as_mut_ptr() as *mut libc::c_void,
                    byte.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

/// Creates a pipe whose read end is non-blocking.
fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe(2) succeeded, so both descriptors are open and owned here.
    let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    for fd in [&rx, &tx] {
        add_fd_flags(fd, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    }
    add_fd_flags(&rx, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;
    Ok((rx, tx))
}

/// Read-modify-write of one `fcntl` flag word.
fn add_fd_flags(
    fd: &OwnedFd,
    get: libc::c_int,
    set: libc::c_int,
    extra: libc::c_int,
) -> io::Result<()> {
    // SAFETY: `fd` is an open descriptor borrowed for the duration of the
    // call; F_GETFD/F_GETFL take no pointer argument.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), get) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above; F_SETFD/F_SETFL take an integer argument.
    if unsafe { libc::fcntl(fd.as_raw_fd(), set, flags | extra) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn timeout_ms(timeout: Duration) -> libc::c_int {
    timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

impl HubDevice for CharDevice {
    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        let mut fds = [
            libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake_rx.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // SAFETY: `fds` is a live array of initialised pollfd entries and the
        // count passed is its length; both descriptors outlive the call.
        let ready =
            unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms(timeout)) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        if ready == 0 {
            return Ok(Readiness::TimedOut);
        }
        if fds[1].revents & libc::POLLIN != 0 {
            self.drain_wake_pipe();
            return Ok(Readiness::Woken);
        }
        if fds[0].revents & libc::POLLIN != 0 {
            return Ok(Readiness::Readable);
        }
        if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("hub device poll error (revents=0x{:x})", fds[0].revents),
            ));
        }
        Ok(Readiness::TimedOut)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn wake(&self) -> io::Result<()> {
        let byte = [1u8];
        // SAFETY: one byte is written from a live local buffer to a pipe
        // descriptor owned by `self`.
        let n = unsafe {
            libc::write(
                self.wake_tx.as_raw_fd(),
                byte.as_ptr() as *const libc::c_void,
                byte.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Opens a fresh [`CharDevice`] at a fixed path for every subscription.
#[derive(Debug, Clone)]
pub struct CharDeviceOpener {
    path: PathBuf,
}

impl CharDeviceOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeviceOpener for CharDeviceOpener {
    fn open(&self) -> io::Result<Arc<dyn HubDevice>> {
        Ok(Arc::new(CharDevice::open(&self.path)?))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
