//! Userspace end of the FUSE kernel channel.
//!
//! A `Channel` mounts a filesystem and serves it over `/dev/fuse`. Frames read from the kernel
//! are placed in pooled buffers, decoded, and dispatched by opcode to a `Callbacks`
//! implementation, each on its own thread. Replies are written back as a single message per
//! request. Detaching unmounts the filesystem and waits for every in-flight request before the
//! pump reports its outcome on the `Completion`.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub use fuse_abi as abi;

mod buffer;
pub use buffer::{Buffer, BufferPool};

mod callbacks;
pub use callbacks::{dispatch, reply_init, Callbacks};

mod channel;
pub use channel::{Channel, ChannelBuilder, MountFlags, DEFAULT_MAX_WRITE, MAX_MAX_WRITE, MIN_MAX_WRITE};

mod device;
pub use device::{DevFuse, Device};

mod drain;
pub use drain::PumpStats;

mod error;
pub use error::{Error, Result};

pub mod pump;
pub use pump::{Completion, PumpHandle};

mod reply;
pub use reply::{ChannelSender, Responder};

mod request;
pub use request::Request;

mod sys;

#[cfg(test)]
mod testing;
