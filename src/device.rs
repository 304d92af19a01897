//! FUSE kernel driver communication
//!
//! Raw communication device to the FUSE kernel driver. The kernel hands out exactly one request
//! per read and expects exactly one write per reply.

use log::{debug, warn};
use std::ffi::CStr;
use std::fmt;
use std::io::{self, IoSlice};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::sys;


/// A duplex message device the read pump is driven by.
///
/// `receive` blocks until one complete frame is available and returns its length. `send` must
/// deliver all slices as one message; the kernel treats a reply split over several writes as a
/// protocol violation.
pub trait Device: Send + Sync + 'static {
    /// Read one frame into `buf`.
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one message gathered from `bufs`.
    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
}


/// The `/dev/fuse` character device.
pub struct DevFuse {
    fd: RawFd,
    closed: AtomicBool,
}

impl fmt::Debug for DevFuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevFuse")
            .field("fd", &self.fd)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl DevFuse {
    /// Open `/dev/fuse` for reading and writing, closed on exec.
    pub fn open() -> io::Result<Self> {
        let path = CStr::from_bytes_with_nul(b"/dev/fuse\0")
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let fd = sys::open(path, libc::O_RDWR | libc::O_CLOEXEC)?;
        debug!("Opened /dev/fuse as fd {}", fd);
        Ok(Self { fd, closed: AtomicBool::new(false) })
    }

    /// Stop all further I/O on the device.
    ///
    /// A receive that starts after this fails with ENODEV, the same condition the kernel reports
    /// once the filesystem is unmounted, and a send fails with EBADF. The descriptor itself stays
    /// open until `release` or drop, so its number cannot be handed out again while a reader or
    /// writer still holds the device.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the descriptor, reporting failure.
    pub fn release(self) -> io::Result<()> {
        let fd = self.fd;
        mem::forget(self);
        debug!("Closing /dev/fuse fd {}", fd);
        sys::close(fd)
    }
}

impl AsRawFd for DevFuse {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Device for DevFuse {
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        sys::read(self.fd, buf)
    }

    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        sys::writev(self.fd, bufs)
    }
}

impl FromRawFd for DevFuse {
    /// Take ownership of an already open FUSE descriptor.
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd, closed: AtomicBool::new(false) }
    }
}

impl Drop for DevFuse {
    fn drop(&mut self) {
        if let Err(err) = sys::close(self.fd) {
            warn!("Unable to close /dev/fuse fd {}: {}", self.fd, err);
        }
    }
}
