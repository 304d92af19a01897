//! Filesystem operation request
//!
//! A request represents information about a filesystem operation the kernel driver wants us to
//! perform. Only the fixed header is decoded, the operation specific payload is handed to the
//! callbacks as raw bytes.

use fuse_abi::{fuse_in_header, fuse_opcode};
use libc::c_int;
use std::convert::TryFrom;
use std::fmt;

use crate::reply::{ChannelSender, Responder};


/// Request data structure
#[derive(Debug)]
pub struct Request<'a> {
    /// Header of the FUSE request
    header: fuse_in_header,
    /// Operation-specific data payload
    payload: &'a [u8],
    /// Channel sender for sending the reply
    sender: &'a ChannelSender,
}

impl<'a> Request<'a> {
    pub(crate) fn new(header: fuse_in_header, payload: &'a [u8], sender: &'a ChannelSender) -> Self {
        Self { header, payload, sender }
    }

    /// The decoded request header
    #[inline]
    pub fn header(&self) -> &fuse_in_header {
        &self.header
    }

    /// Raw operation specific payload following the header
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Returns the operation of this request, or the raw code if it is not a known one
    #[inline]
    pub fn operation(&self) -> Result<fuse_opcode, u32> {
        fuse_opcode::try_from(self.header.opcode)
    }

    /// Returns the unique identifier of this request
    #[inline]
    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    /// Returns the node id the request is about
    #[inline]
    pub fn nodeid(&self) -> u64 {
        self.header.nodeid
    }

    /// Returns the uid of this request
    #[inline]
    pub fn uid(&self) -> u32 {
        self.header.uid
    }

    /// Returns the gid of this request
    #[inline]
    pub fn gid(&self) -> u32 {
        self.header.gid
    }

    /// Returns the pid of this request
    #[inline]
    pub fn pid(&self) -> u32 {
        self.header.pid
    }

    /// Maximum write size the channel's request buffers were sized for
    #[inline]
    pub fn max_write(&self) -> u32 {
        self.sender.max_write()
    }

    /// Reply with the given status (zero or a positive errno) and payload segments.
    pub fn reply(&self, errno: c_int, payload: &[&[u8]]) {
        self.sender.send(&self.header, errno, payload);
    }

    /// Reply successfully with the given payload segments.
    pub fn reply_ok(&self, payload: &[&[u8]]) {
        self.reply(0, payload);
    }

    /// Reply with the given error code.
    pub fn reply_error(&self, errno: c_int) {
        self.reply(errno, &[]);
    }

    /// Create an owned reply handle, for answering after the callback has returned.
    pub fn responder(&self) -> Responder {
        Responder::new(self.sender.clone(), self.header)
    }
}

impl fmt::Display for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation() {
            Ok(op) => write!(f, "{}({})", op, self.header.unique)?,
            Err(code) => write!(f, "OPCODE {}({})", code, self.header.unique)?,
        }
        write!(
            f,
            " ino {:#018x}, uid {}, gid {}, pid {}, {} payload bytes",
            self.header.nodeid,
            self.header.uid,
            self.header.gid,
            self.header.pid,
            self.payload.len()
        )
    }
}
