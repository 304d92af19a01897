//! Filesystem operation reply
//!
//! Replies are framed with a `fuse_out_header` and handed to the device in a single gathered
//! write. A reply carries the unique id of the request it answers, a status (zero or a positive
//! errno, negated on the wire) and any number of payload segments which are written back to
//! back after the header.
//!
//! Sending is fire-and-forget: short writes and write errors are logged, never returned.

use fuse_abi::{fuse_in_header, fuse_init_out, fuse_opcode, fuse_out_header};
use libc::c_int;
use log::{debug, error, info, warn};
use std::fmt;
use std::io::IoSlice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::device::Device;


struct SenderInner {
    name: String,
    device: Arc<dyn Device>,
    max_write: u32,
    negotiated_max_write: AtomicU32,
}

/// Writer half of a channel, shared by all units of work answering requests.
#[derive(Clone)]
pub struct ChannelSender {
    inner: Arc<SenderInner>,
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("name", &self.inner.name)
            .field("max_write", &self.inner.max_write)
            .field("negotiated_max_write", &self.negotiated_max_write())
            .finish()
    }
}

impl ChannelSender {
    pub(crate) fn new(name: &str, device: Arc<dyn Device>, max_write: u32) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                name: name.to_owned(),
                device,
                max_write,
                negotiated_max_write: AtomicU32::new(0),
            }),
        }
    }

    /// Name of the channel, used to prefix log output.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Maximum write size the channel's request buffers were sized for.
    pub fn max_write(&self) -> u32 {
        self.inner.max_write
    }

    /// Maximum write size agreed on in the INIT handshake, if it has completed.
    pub fn negotiated_max_write(&self) -> Option<u32> {
        match self.inner.negotiated_max_write.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Send a reply to the request described by `header`.
    ///
    /// `errno` is zero for success or a positive OS error number. Header and payload segments
    /// are delivered in one `writev`, the length field covers all of them.
    pub fn send(&self, header: &fuse_in_header, errno: c_int, payload: &[&[u8]]) {
        if errno == libc::ENOSYS {
            warn!(
                "{}: replying ENOSYS to unsupported/unrecognized opcode {} (unique {})",
                self.inner.name, header.opcode, header.unique
            );
        }

        let payload_len: usize = payload.iter().map(|segment| segment.len()).sum();
        let out = fuse_out_header::new(header.unique, errno, payload_len);
        let out_bytes = out.to_bytes();

        if errno == 0 && header.opcode == fuse_opcode::FUSE_INIT as u32 {
            self.observe_init(payload);
        }

        let mut iov = Vec::with_capacity(payload.len() + 1);
        iov.push(IoSlice::new(&out_bytes));
        iov.extend(payload.iter().filter(|segment| !segment.is_empty()).map(|segment| IoSlice::new(segment)));

        match self.inner.device.send(&iov) {
            Ok(written) if written == out.len as usize => {
                debug!("{}: reply to {} ({} bytes, error {})", self.inner.name, out.unique, out.len, out.error);
            }
            Ok(written) => error!(
                "{}: write to /dev/fuse returned bad bytesWritten: {} of {}",
                self.inner.name, written, out.len
            ),
            Err(err) => error!("{}: write to /dev/fuse failed: {}", self.inner.name, err),
        }
    }

    // Record the max write size of a successful INIT reply and flag it if it differs from the
    // size the request buffers were allocated for.
    fn observe_init(&self, payload: &[&[u8]]) {
        let bytes: Vec<u8> = payload.iter().flat_map(|segment| segment.iter().copied()).collect();
        let init = match fuse_init_out::decode(&bytes) {
            Ok(init) => init,
            Err(err) => {
                warn!("{}: unable to inspect INIT reply: {}", self.inner.name, err);
                return;
            }
        };
        self.inner.negotiated_max_write.store(init.max_write, Ordering::Release);
        let configured = self.inner.max_write;
        if init.max_write > configured {
            warn!(
                "{}: negotiated max write {} exceeds the {} bytes request buffers were sized for, large writes will be truncated",
                self.inner.name, init.max_write, configured
            );
        } else if init.max_write < configured {
            warn!(
                "{}: negotiated max write {} is below the configured {}",
                self.inner.name, init.max_write, configured
            );
        } else {
            info!("{}: negotiated ABI {}.{}, max write {}", self.inner.name, init.major, init.minor, init.max_write);
        }
    }
}


/// An owned handle for answering one request.
///
/// Obtained from `Request::responder`, it can be moved to another thread to reply after the
/// callback has returned. Each reply method consumes the handle so a request is answered at
/// most once through it.
#[derive(Clone, Debug)]
pub struct Responder {
    sender: ChannelSender,
    header: fuse_in_header,
}

impl Responder {
    pub(crate) fn new(sender: ChannelSender, header: fuse_in_header) -> Self {
        Self { sender, header }
    }

    /// Unique id of the request this responder answers.
    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    /// Reply with the given status and payload segments.
    pub fn reply(self, errno: c_int, payload: &[&[u8]]) {
        self.sender.send(&self.header, errno, payload);
    }

    /// Reply successfully with the given payload segments.
    pub fn ok(self, payload: &[&[u8]]) {
        self.reply(0, payload);
    }

    /// Reply with the given error code and no payload.
    pub fn error(self, errno: c_int) {
        self.reply(errno, &[]);
    }
}
