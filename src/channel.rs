//! Channel lifecycle.
//!
//! A channel backs one mounted filesystem. Attaching opens `/dev/fuse`, starts the read pump and
//! mounts the filesystem with the descriptor passed in the mount options. Detaching unmounts and
//! closes the device, which makes the pump's next read fail with ENODEV; the pump then drains
//! in-flight requests and reports on its `Completion`. The descriptor is released after that.

use bitflags::bitflags;
use log::{debug, error, info, warn};
use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::callbacks::Callbacks;
use crate::device::DevFuse;
use crate::drain::PumpStats;
use crate::error::{Error, Result};
use crate::pump::{self, Completion, PumpHandle};
use crate::sys;


/// Smallest accepted write size. Request buffers never shrink below the kernel's minimum read
/// buffer, see `pump::frame_size`.
pub const MIN_MAX_WRITE: u32 = 4096;
/// Largest write size the kernel accepts.
pub const MAX_MAX_WRITE: u32 = 16 * 1024 * 1024;
/// Write size used unless configured otherwise, libfuse's default.
pub const DEFAULT_MAX_WRITE: u32 = 128 * 1024;

const FUSE_FSTYPE: &[u8] = b"fuse\0";

bitflags! {
    /// Generic mount flags passed to the mount call.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct MountFlags: libc::c_ulong {
        const RDONLY = libc::MS_RDONLY;
        const NOSUID = libc::MS_NOSUID;
        const NODEV = libc::MS_NODEV;
        const NOEXEC = libc::MS_NOEXEC;
        const SYNCHRONOUS = libc::MS_SYNCHRONOUS;
        const DIRSYNC = libc::MS_DIRSYNC;
        const NOATIME = libc::MS_NOATIME;
        const NODIRATIME = libc::MS_NODIRATIME;
    }
}

/// Filesystem specific mount options for the kernel driver.
fn mount_options(fd: RawFd, root_mode: u32, uid: u32, gid: u32) -> String {
    [
        format!("fd={}", fd),
        format!("rootmode={:o}", root_mode),
        format!("user_id={}", uid),
        format!("group_id={}", gid),
    ]
    .join(",")
}


/// Close the descriptor once the pump is gone.
///
/// A reply handle kept past the drain still references the device, the descriptor is then
/// closed when the last of them is dropped.
fn release(device: Arc<DevFuse>) -> io::Result<()> {
    match Arc::try_unwrap(device) {
        Ok(device) => device.release(),
        Err(device) => {
            debug!("/dev/fuse fd {} still referenced, closing it on last drop", device.as_raw_fd());
            Ok(())
        }
    }
}

/// Forced unmount. A mountpoint that is no longer mounted, e.g. because it was unmounted from
/// outside, counts as detached.
fn unmount(mountpoint: &CStr) -> io::Result<()> {
    match sys::force_unmount(mountpoint) {
        Err(ref err) if err.raw_os_error() == Some(libc::EINVAL) => {
            debug!("{:?} is not mounted", mountpoint);
            Ok(())
        }
        result => result,
    }
}


/// Builder for configuring a `Channel`.
///
/// Use the various methods of this type to configure the channel and eventually call `attach`
/// to mount the filesystem and start serving it.
pub struct ChannelBuilder {
    name: String,
    mountpoint: PathBuf,
    mount_flags: MountFlags,
    max_write: u32,
    callbacks: Arc<dyn Callbacks>,
}

impl fmt::Debug for ChannelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBuilder")
            .field("name", &self.name)
            .field("mountpoint", &self.mountpoint)
            .field("mount_flags", &self.mount_flags)
            .field("max_write", &self.max_write)
            .finish()
    }
}

impl ChannelBuilder {
    /// Create a new channel builder.
    ///
    /// `name` identifies the volume; it is used as the mount source and to prefix log output.
    pub fn new<P: AsRef<Path>, C: Callbacks>(name: &str, mountpoint: P, callbacks: C) -> Self {
        Self {
            name: name.to_owned(),
            mountpoint: mountpoint.as_ref().to_owned(),
            mount_flags: MountFlags::empty(),
            max_write: DEFAULT_MAX_WRITE,
            callbacks: Arc::new(callbacks),
        }
    }

    /// Set generic mount flags, e.g. `MountFlags::NOSUID | MountFlags::NODEV`.
    pub fn mount_flags(mut self, mount_flags: MountFlags) -> Self {
        self.mount_flags = mount_flags;
        self
    }

    /// Set max size of write requests.
    ///
    /// This determines the size of every request buffer: a buffer holds the request header, the
    /// fixed part of a write request and up to this many bytes of data, and never less than the
    /// 8k the kernel requires of a read buffer. The value is clamped to 4k..16M. It is most
    /// efficient to choose a multiple of the page size here.
    pub fn max_write(mut self, max_write: u32) -> Self {
        let clamped = max_write.max(MIN_MAX_WRITE).min(MAX_MAX_WRITE);
        if clamped != max_write {
            warn!("Volume {}: max write {} clamped to {}", self.name, max_write, clamped);
        }
        self.max_write = clamped;
        self
    }

    /// Size of the request buffers a channel built from this configuration uses.
    pub fn frame_size(&self) -> usize {
        pump::frame_size(self.max_write)
    }

    /// Mount the filesystem and start serving it.
    ///
    /// Any stale mount at the mountpoint is forcibly detached first. If mounting fails, the read
    /// pump is stopped before the error is returned.
    pub fn attach(self) -> Result<(Channel, Completion)> {
        let ChannelBuilder { name, mountpoint, mount_flags, max_write, callbacks } = self;

        let c_mountpoint = CString::new(mountpoint.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidPath(mountpoint.clone()))?;
        let c_name = CString::new(name.as_bytes())
            .map_err(|_| Error::InvalidName(name.clone()))?;

        // Leftover of a previous run, absence is fine
        let _ = sys::force_unmount(&c_mountpoint);

        let device = match DevFuse::open() {
            Ok(device) => Arc::new(device),
            Err(err) => {
                error!("Volume {} unable to open /dev/fuse: {}", name, err);
                return Err(Error::Open(err));
            }
        };

        let (pump, completion) = pump::spawn(&name, Arc::clone(&device), max_write, callbacks)
            .map_err(Error::Spawn)?;

        let (uid, gid) = sys::effective_ids();
        let options = mount_options(device.as_raw_fd(), libc::S_IFDIR as u32, uid, gid);
        let mounted = CString::new(options)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
            .and_then(|data| {
                let fstype = CStr::from_bytes_with_nul(FUSE_FSTYPE)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
                sys::mount(&c_name, &c_mountpoint, fstype, mount_flags.bits(), &data)
            });

        if let Err(source) = mounted {
            error!("Volume {} mount on mountpoint {} failed: {}", name, mountpoint.display(), source);
            device.close();
            pump.join();
            if let Err(err) = release(device) {
                warn!("Volume {} unable to close /dev/fuse: {}", name, err);
            }
            return Err(Error::Mount { path: mountpoint, source });
        }
        info!("Volume {} mounted on mountpoint {}", name, mountpoint.display());

        let channel = Channel {
            name,
            mountpoint,
            c_mountpoint,
            mount_flags,
            max_write,
            device: Some(device),
            pump: Some(pump),
        };
        Ok((channel, completion))
    }
}


/// A mounted filesystem and the channel serving it.
///
/// Dropping an attached channel detaches it, logging any error.
pub struct Channel {
    name: String,
    mountpoint: PathBuf,
    c_mountpoint: CString,
    mount_flags: MountFlags,
    max_write: u32,
    device: Option<Arc<DevFuse>>,
    pump: Option<PumpHandle>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("mountpoint", &self.mountpoint)
            .field("mount_flags", &self.mount_flags)
            .field("max_write", &self.max_write)
            .field("device", &self.device)
            .field("pump", &self.pump)
            .finish()
    }
}

impl Channel {
    /// Start configuring a channel.
    pub fn builder<P: AsRef<Path>, C: Callbacks>(name: &str, mountpoint: P, callbacks: C) -> ChannelBuilder {
        ChannelBuilder::new(name, mountpoint, callbacks)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the path of the mounted filesystem.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn mount_flags(&self) -> MountFlags {
        self.mount_flags
    }

    /// Max write size the request buffers were sized for.
    pub fn max_write(&self) -> u32 {
        self.max_write
    }

    /// Capacity of every request buffer.
    pub fn frame_size(&self) -> usize {
        pump::frame_size(self.max_write)
    }

    /// Max write size agreed on in the INIT handshake, once it has happened.
    pub fn negotiated_max_write(&self) -> Option<u32> {
        self.pump.as_ref().and_then(|pump| pump.sender().negotiated_max_write())
    }

    /// Activity counters of the read pump.
    pub fn stats(&self) -> PumpStats {
        self.pump.as_ref().map(PumpHandle::stats).unwrap_or_default()
    }

    /// Unmount the filesystem and close the channel.
    ///
    /// Returns once the read pump has exited. The pump's outcome is delivered on the
    /// `Completion` returned by `attach`.
    pub fn detach(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let pump = match self.pump.take() {
            Some(pump) => pump,
            None => return Ok(()),
        };

        let unmounted = unmount(&self.c_mountpoint).map_err(|source| {
            error!("Unable to unmount {}: {}", self.mountpoint.display(), source);
            Error::Unmount { path: self.mountpoint.clone(), source }
        });
        // Closed even if unmounting failed, the pump is waited for either way
        let closed = match self.device.take() {
            Some(device) => {
                device.close();
                pump.join();
                release(device).map_err(|err| {
                    error!("Unable to close /dev/fuse: {}", err);
                    Error::Close(err)
                })
            }
            None => {
                pump.join();
                Ok(())
            }
        };

        unmounted?;
        closed?;
        info!("Volume {} unmounted from mountpoint {}", self.name, self.mountpoint.display());
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.pump.is_some() {
            info!("Unmounting {}", self.mountpoint.display());
            if let Err(err) = self.shutdown() {
                error!("Volume {}: {}", self.name, err);
            }
        }
    }
}
