//! FUSE kernel interface
//!
//! Types and definitions used for communication between the kernel driver and the userspace
//! part of a FUSE filesystem. Every request starts with a fixed `fuse_in_header`, every reply
//! starts with a fixed `fuse_out_header`. Both are encoded in the host's native byte order at
//! fixed offsets; anything following the header is operation specific and is carried as an
//! opaque payload.
//!
//! libfuse (Linux/BSD): https://github.com/libfuse/libfuse/blob/master/include/fuse_kernel.h
//! - supports ABI 7.26 since FUSE 3.0.0

#![allow(non_camel_case_types)]

use std::convert::TryFrom;
use std::fmt;

use thiserror::Error;

pub const FUSE_KERNEL_VERSION: u32 = 7;
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 26;

pub const FUSE_ROOT_ID: u64 = 1;

/// Size of `fuse_in_header` on the wire.
pub const IN_HEADER_SIZE: usize = 40;
/// Size of `fuse_out_header` on the wire.
pub const OUT_HEADER_SIZE: usize = 16;
/// Size of the fixed portion of a write request (`fuse_write_in`) that precedes its data.
pub const WRITE_IN_SIZE: usize = 40;
/// Size of `fuse_init_in` as sent by every kernel since ABI 7.6.
pub const INIT_IN_SIZE: usize = 16;
/// Size of `fuse_init_out` since ABI 7.23.
pub const INIT_OUT_SIZE: usize = 64;
/// Size of `fuse_init_out` expected by kernels older than ABI 7.23.
pub const FUSE_COMPAT_22_INIT_OUT_SIZE: usize = 24;
/// Reads into a buffer smaller than this are rejected by the kernel with EINVAL.
pub const FUSE_MIN_READ_BUFFER: usize = 8192;

/// Errors produced while decoding kernel frames.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum DecodeError {
    /// The frame is too short to contain even the request header.
    #[error("malformed frame: {len} bytes is shorter than the {expected} byte request header")]
    MalformedFrame { len: usize, expected: usize },
    /// An operation payload is shorter than the structure it must contain.
    #[error("short payload: {len} bytes, expected at least {expected}")]
    ShortPayload { len: usize, expected: usize },
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum fuse_opcode {
    FUSE_LOOKUP = 1,
    FUSE_FORGET = 2,                                    // no reply
    FUSE_GETATTR = 3,
    FUSE_SETATTR = 4,
    FUSE_READLINK = 5,
    FUSE_SYMLINK = 6,
    FUSE_MKNOD = 8,
    FUSE_MKDIR = 9,
    FUSE_UNLINK = 10,
    FUSE_RMDIR = 11,
    FUSE_RENAME = 12,
    FUSE_LINK = 13,
    FUSE_OPEN = 14,
    FUSE_READ = 15,
    FUSE_WRITE = 16,
    FUSE_STATFS = 17,
    FUSE_RELEASE = 18,
    FUSE_FSYNC = 20,
    FUSE_SETXATTR = 21,
    FUSE_GETXATTR = 22,
    FUSE_LISTXATTR = 23,
    FUSE_REMOVEXATTR = 24,
    FUSE_FLUSH = 25,
    FUSE_INIT = 26,
    FUSE_OPENDIR = 27,
    FUSE_READDIR = 28,
    FUSE_RELEASEDIR = 29,
    FUSE_FSYNCDIR = 30,
    FUSE_GETLK = 31,
    FUSE_SETLK = 32,
    FUSE_SETLKW = 33,
    FUSE_ACCESS = 34,
    FUSE_CREATE = 35,
    FUSE_INTERRUPT = 36,
    FUSE_BMAP = 37,
    FUSE_DESTROY = 38,
    FUSE_IOCTL = 39,                                    // since ABI 7.11
    FUSE_POLL = 40,                                     // since ABI 7.11
    FUSE_NOTIFY_REPLY = 41,                             // since ABI 7.15
    FUSE_BATCH_FORGET = 42,                             // since ABI 7.16, no reply
    FUSE_FALLOCATE = 43,                                // since ABI 7.19
    FUSE_READDIRPLUS = 44,                              // since ABI 7.21
    FUSE_RENAME2 = 45,                                  // since ABI 7.23
    FUSE_LSEEK = 46,                                    // since ABI 7.24
}

impl TryFrom<u32> for fuse_opcode {
    /// Codes outside the known set are handed back unchanged.
    type Error = u32;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        use fuse_opcode::*;
        Ok(match n {
            1 => FUSE_LOOKUP,
            2 => FUSE_FORGET,
            3 => FUSE_GETATTR,
            4 => FUSE_SETATTR,
            5 => FUSE_READLINK,
            6 => FUSE_SYMLINK,
            8 => FUSE_MKNOD,
            9 => FUSE_MKDIR,
            10 => FUSE_UNLINK,
            11 => FUSE_RMDIR,
            12 => FUSE_RENAME,
            13 => FUSE_LINK,
            14 => FUSE_OPEN,
            15 => FUSE_READ,
            16 => FUSE_WRITE,
            17 => FUSE_STATFS,
            18 => FUSE_RELEASE,
            20 => FUSE_FSYNC,
            21 => FUSE_SETXATTR,
            22 => FUSE_GETXATTR,
            23 => FUSE_LISTXATTR,
            24 => FUSE_REMOVEXATTR,
            25 => FUSE_FLUSH,
            26 => FUSE_INIT,
            27 => FUSE_OPENDIR,
            28 => FUSE_READDIR,
            29 => FUSE_RELEASEDIR,
            30 => FUSE_FSYNCDIR,
            31 => FUSE_GETLK,
            32 => FUSE_SETLK,
            33 => FUSE_SETLKW,
            34 => FUSE_ACCESS,
            35 => FUSE_CREATE,
            36 => FUSE_INTERRUPT,
            37 => FUSE_BMAP,
            38 => FUSE_DESTROY,
            39 => FUSE_IOCTL,
            40 => FUSE_POLL,
            41 => FUSE_NOTIFY_REPLY,
            42 => FUSE_BATCH_FORGET,
            43 => FUSE_FALLOCATE,
            44 => FUSE_READDIRPLUS,
            45 => FUSE_RENAME2,
            46 => FUSE_LSEEK,
            n => return Err(n),
        })
    }
}

impl fuse_opcode {
    /// Short upper case name of the operation, as used in log output.
    pub fn name(self) -> &'static str {
        use fuse_opcode::*;
        match self {
            FUSE_LOOKUP => "LOOKUP",
            FUSE_FORGET => "FORGET",
            FUSE_GETATTR => "GETATTR",
            FUSE_SETATTR => "SETATTR",
            FUSE_READLINK => "READLINK",
            FUSE_SYMLINK => "SYMLINK",
            FUSE_MKNOD => "MKNOD",
            FUSE_MKDIR => "MKDIR",
            FUSE_UNLINK => "UNLINK",
            FUSE_RMDIR => "RMDIR",
            FUSE_RENAME => "RENAME",
            FUSE_LINK => "LINK",
            FUSE_OPEN => "OPEN",
            FUSE_READ => "READ",
            FUSE_WRITE => "WRITE",
            FUSE_STATFS => "STATFS",
            FUSE_RELEASE => "RELEASE",
            FUSE_FSYNC => "FSYNC",
            FUSE_SETXATTR => "SETXATTR",
            FUSE_GETXATTR => "GETXATTR",
            FUSE_LISTXATTR => "LISTXATTR",
            FUSE_REMOVEXATTR => "REMOVEXATTR",
            FUSE_FLUSH => "FLUSH",
            FUSE_INIT => "INIT",
            FUSE_OPENDIR => "OPENDIR",
            FUSE_READDIR => "READDIR",
            FUSE_RELEASEDIR => "RELEASEDIR",
            FUSE_FSYNCDIR => "FSYNCDIR",
            FUSE_GETLK => "GETLK",
            FUSE_SETLK => "SETLK",
            FUSE_SETLKW => "SETLKW",
            FUSE_ACCESS => "ACCESS",
            FUSE_CREATE => "CREATE",
            FUSE_INTERRUPT => "INTERRUPT",
            FUSE_BMAP => "BMAP",
            FUSE_DESTROY => "DESTROY",
            FUSE_IOCTL => "IOCTL",
            FUSE_POLL => "POLL",
            FUSE_NOTIFY_REPLY => "NOTIFY_REPLY",
            FUSE_BATCH_FORGET => "BATCH_FORGET",
            FUSE_FALLOCATE => "FALLOCATE",
            FUSE_READDIRPLUS => "READDIRPLUS",
            FUSE_RENAME2 => "RENAME2",
            FUSE_LSEEK => "LSEEK",
        }
    }
}

impl fmt::Display for fuse_opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Callers check the slice length before reading a field.
#[inline]
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_ne_bytes(bytes)
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

#[inline]
fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

/// Header of every request sent by the kernel driver.
///
/// | offset | width | field   |
/// |--------|-------|---------|
/// | 0      | 4     | len     |
/// | 4      | 4     | opcode  |
/// | 8      | 8     | unique  |
/// | 16     | 8     | nodeid  |
/// | 24     | 4     | uid     |
/// | 28     | 4     | gid     |
/// | 32     | 4     | pid     |
/// | 36     | 4     | padding |
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct fuse_in_header {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

impl fuse_in_header {
    /// Decode the header at the front of `frame`.
    ///
    /// Returns the header together with the bytes that follow it. The payload borrows from
    /// `frame`, nothing is copied.
    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        if frame.len() < IN_HEADER_SIZE {
            return Err(DecodeError::MalformedFrame { len: frame.len(), expected: IN_HEADER_SIZE });
        }
        let header = Self {
            len: read_u32(frame, 0),
            opcode: read_u32(frame, 4),
            unique: read_u64(frame, 8),
            nodeid: read_u64(frame, 16),
            uid: read_u32(frame, 24),
            gid: read_u32(frame, 28),
            pid: read_u32(frame, 32),
            padding: read_u32(frame, 36),
        };
        Ok((header, &frame[IN_HEADER_SIZE..]))
    }

    /// Encode the header into its wire form.
    pub fn to_bytes(&self) -> [u8; IN_HEADER_SIZE] {
        let mut buf = [0; IN_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.len.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.opcode.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.unique.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.nodeid.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.uid.to_ne_bytes());
        buf[28..32].copy_from_slice(&self.gid.to_ne_bytes());
        buf[32..36].copy_from_slice(&self.pid.to_ne_bytes());
        buf[36..40].copy_from_slice(&self.padding.to_ne_bytes());
        buf
    }

    /// The operation this request asks for, or the raw code if it is not a known one.
    pub fn operation(&self) -> Result<fuse_opcode, u32> {
        fuse_opcode::try_from(self.opcode)
    }
}

/// Header of every reply sent back to the kernel driver.
///
/// `error` is zero on success and a negated errno otherwise.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct fuse_out_header {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

impl fuse_out_header {
    /// Header for a reply to request `unique` carrying `payload_len` bytes after the header.
    ///
    /// `errno` is a positive OS error number (or zero), it is negated on the wire.
    pub fn new(unique: u64, errno: i32, payload_len: usize) -> Self {
        Self {
            len: (OUT_HEADER_SIZE + payload_len) as u32,
            error: -errno,
            unique,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < OUT_HEADER_SIZE {
            return Err(DecodeError::ShortPayload { len: buf.len(), expected: OUT_HEADER_SIZE });
        }
        Ok(Self {
            len: read_u32(buf, 0),
            error: read_u32(buf, 4) as i32,
            unique: read_u64(buf, 8),
        })
    }

    pub fn to_bytes(&self) -> [u8; OUT_HEADER_SIZE] {
        let mut buf = [0; OUT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.len.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.error.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.unique.to_ne_bytes());
        buf
    }
}

/// Payload of the INIT request.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct fuse_init_in {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

impl fuse_init_in {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < INIT_IN_SIZE {
            return Err(DecodeError::ShortPayload { len: payload.len(), expected: INIT_IN_SIZE });
        }
        Ok(Self {
            major: read_u32(payload, 0),
            minor: read_u32(payload, 4),
            max_readahead: read_u32(payload, 8),
            flags: read_u32(payload, 12),
        })
    }

    pub fn to_bytes(&self) -> [u8; INIT_IN_SIZE] {
        let mut buf = [0; INIT_IN_SIZE];
        buf[0..4].copy_from_slice(&self.major.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.minor.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.max_readahead.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_ne_bytes());
        buf
    }
}

/// Payload of the INIT reply.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct fuse_init_out {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,                            // since ABI 7.13
    pub congestion_threshold: u16,                      // since ABI 7.13
    pub max_write: u32,
    pub time_gran: u32,                                 // since ABI 7.23
}

impl fuse_init_out {
    /// Offset of `max_write` within the encoded reply.
    pub const MAX_WRITE_OFFSET: usize = 20;

    /// Encode for a kernel speaking ABI 7.`minor`. Kernels before 7.23 expect the short form.
    pub fn to_bytes(&self, minor: u32) -> Vec<u8> {
        let mut buf = vec![0; INIT_OUT_SIZE];
        buf[0..4].copy_from_slice(&self.major.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.minor.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.max_readahead.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_ne_bytes());
        buf[16..18].copy_from_slice(&self.max_background.to_ne_bytes());
        buf[18..20].copy_from_slice(&self.congestion_threshold.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.max_write.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.time_gran.to_ne_bytes());
        if minor < 23 {
            buf.truncate(FUSE_COMPAT_22_INIT_OUT_SIZE);
        }
        buf
    }

    /// Decode an encoded reply, short or full form.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < FUSE_COMPAT_22_INIT_OUT_SIZE {
            return Err(DecodeError::ShortPayload {
                len: payload.len(),
                expected: FUSE_COMPAT_22_INIT_OUT_SIZE,
            });
        }
        let time_gran = if payload.len() >= 28 { read_u32(payload, 24) } else { 0 };
        Ok(Self {
            major: read_u32(payload, 0),
            minor: read_u32(payload, 4),
            max_readahead: read_u32(payload, 8),
            flags: read_u32(payload, 12),
            max_background: read_u16(payload, 16),
            congestion_threshold: read_u16(payload, 18),
            max_write: read_u32(payload, Self::MAX_WRITE_OFFSET),
            time_gran,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> fuse_in_header {
        fuse_in_header {
            len: 0x30,
            opcode: fuse_opcode::FUSE_GETATTR as u32,
            unique: 0xdeadbeef,
            nodeid: 0x1122334455667788,
            uid: 1000,
            gid: 100,
            pid: 4242,
            padding: 0,
        }
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn decode_in_header_offsets() {
        let mut frame = vec![
            0x30, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00,  0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00,
            0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11,  0xe8, 0x03, 0x00, 0x00, 0x64, 0x00, 0x00, 0x00,
            0x92, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        frame.extend_from_slice(b"payload!");
        let (header, payload) = fuse_in_header::decode(&frame).unwrap();
        assert_eq!(header, sample_header());
        assert_eq!(payload, b"payload!");
        assert_eq!(header.operation(), Ok(fuse_opcode::FUSE_GETATTR));
    }

    #[test]
    fn decode_in_header_without_payload() {
        let bytes = sample_header().to_bytes();
        let (header, payload) = fuse_in_header::decode(&bytes).unwrap();
        assert_eq!(header.unique, 0xdeadbeef);
        assert!(payload.is_empty());
    }

    #[test]
    fn decode_short_frame() {
        let bytes = sample_header().to_bytes();
        assert_eq!(
            fuse_in_header::decode(&bytes[..IN_HEADER_SIZE - 1]),
            Err(DecodeError::MalformedFrame { len: 39, expected: 40 })
        );
        assert!(fuse_in_header::decode(&[]).is_err());
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn encode_out_header() {
        let header = fuse_out_header::new(0xdeadbeef, libc_enosys(), 0);
        assert_eq!(
            header.to_bytes(),
            [0x10, 0x00, 0x00, 0x00, 0xda, 0xff, 0xff, 0xff, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00]
        );
    }

    // ENOSYS on Linux; kept local so this crate needs no libc.
    fn libc_enosys() -> i32 {
        38
    }

    #[test]
    fn out_header_counts_payload() {
        let header = fuse_out_header::new(7, 0, 24);
        assert_eq!(header.len, 40);
        assert_eq!(header.error, 0);
        assert_eq!(fuse_out_header::decode(&header.to_bytes()), Ok(header));
    }

    #[test]
    fn opcode_conversion() {
        assert_eq!(fuse_opcode::try_from(26), Ok(fuse_opcode::FUSE_INIT));
        assert_eq!(fuse_opcode::try_from(46), Ok(fuse_opcode::FUSE_LSEEK));
        assert_eq!(fuse_opcode::try_from(7), Err(7));
        assert_eq!(fuse_opcode::try_from(19), Err(19));
        assert_eq!(fuse_opcode::try_from(4096), Err(4096));
        assert_eq!(fuse_opcode::FUSE_BATCH_FORGET.to_string(), "BATCH_FORGET");
    }

    #[test]
    fn init_out_forms() {
        let out = fuse_init_out {
            major: 7,
            minor: 26,
            max_readahead: 4096,
            max_write: 131072,
            ..Default::default()
        };
        let full = out.to_bytes(26);
        assert_eq!(full.len(), INIT_OUT_SIZE);
        assert_eq!(fuse_init_out::decode(&full), Ok(out));

        let short = out.to_bytes(19);
        assert_eq!(short.len(), FUSE_COMPAT_22_INIT_OUT_SIZE);
        assert_eq!(fuse_init_out::decode(&short).unwrap().max_write, 131072);
        assert!(fuse_init_out::decode(&short[..8]).is_err());
    }

    #[test]
    fn init_in_short_payload() {
        let init = fuse_init_in { major: 7, minor: 31, max_readahead: 65536, flags: 1 };
        let bytes = init.to_bytes();
        assert_eq!(fuse_init_in::decode(&bytes), Ok(init));
        assert_eq!(
            fuse_init_in::decode(&bytes[..8]),
            Err(DecodeError::ShortPayload { len: 8, expected: 16 })
        );
    }
}
