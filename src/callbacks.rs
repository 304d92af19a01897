//! Filesystem callbacks.
//!
//! Interface the surrounding filesystem implements to serve requests. There is one method per
//! operation code. Each receives the request, whose header is decoded and whose payload is left
//! as raw bytes, and is responsible for answering it through one of the request's reply methods,
//! either before returning or later through a `Responder`.

use fuse_abi::{fuse_init_in, fuse_init_out, fuse_opcode, FUSE_KERNEL_MINOR_VERSION, FUSE_KERNEL_VERSION};
use libc::{ENOSYS, EPROTO};
use log::{debug, error};

use crate::request::Request;


/// Filesystem callbacks trait.
///
/// Reasonable default implementations are provided here to get a mountable filesystem that does
/// nothing: `init` completes the handshake, `destroy` is acknowledged, the forget family is
/// ignored (the kernel expects no reply to those) and everything else answers ENOSYS.
///
/// Callbacks are invoked concurrently from one thread per request.
#[allow(unused_variables)]
pub trait Callbacks: Send + Sync + 'static {
    /// Look up a directory entry by name and get its attributes.
    fn lookup(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Forget about an inode. Must not be replied to.
    fn forget(&self, req: &Request<'_>) {}

    /// Get file attributes.
    fn getattr(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Set file attributes.
    fn setattr(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Read the target of a symbolic link.
    fn readlink(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Create a symbolic link.
    fn symlink(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Create a file node.
    fn mknod(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Create a directory.
    fn mkdir(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Remove a file.
    fn unlink(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Remove a directory.
    fn rmdir(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Rename a file.
    fn rename(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Create a hard link to a file.
    fn link(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Open a file.
    fn open(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Read data.
    fn read(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Write data.
    fn write(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Get file system statistics.
    fn statfs(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Release an open file.
    fn release(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Synchronize file contents.
    fn fsync(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Set an extended attribute.
    fn setxattr(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Get an extended attribute.
    fn getxattr(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// List extended attribute names.
    fn listxattr(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Remove an extended attribute.
    fn removexattr(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Flush method, called on each close() of an opened file.
    fn flush(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Initialize filesystem.
    ///
    /// Called once before any other filesystem method. The default accepts any kernel speaking
    /// ABI 7.6 or later and offers the max write size the channel's buffers were sized for.
    fn init(&self, req: &Request<'_>) {
        reply_init(req, 0);
    }

    /// Open a directory.
    fn opendir(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Read directory.
    fn readdir(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Release an open directory.
    fn releasedir(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Synchronize directory contents.
    fn fsyncdir(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Test for a POSIX file lock.
    fn getlk(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Acquire, modify or release a POSIX file lock.
    fn setlk(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Like `setlk`, but waits for a conflicting lock to be released.
    fn setlkw(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Check file access permissions.
    fn access(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Create and open a file.
    fn create(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Interrupt a pending request, identified by the unique id in the payload.
    fn interrupt(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Map block index within file to block index within device.
    fn bmap(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Clean up filesystem. Called on filesystem exit.
    fn destroy(&self, req: &Request<'_>) {
        req.reply_ok(&[]);
    }

    /// Control device.
    fn ioctl(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Poll for IO readiness.
    fn poll(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Data of a retrieve notification. Must not be replied to.
    fn notify_reply(&self, req: &Request<'_>) {}

    /// Forget about multiple inodes. Must not be replied to.
    fn batch_forget(&self, req: &Request<'_>) {}

    /// Preallocate or deallocate space.
    fn fallocate(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Read directory with attributes.
    fn readdirplus(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Rename a file, with flags.
    fn rename2(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }

    /// Reposition read/write file offset.
    fn lseek(&self, req: &Request<'_>) {
        req.reply_error(ENOSYS);
    }
}


/// Answer an INIT request with our ABI version and the channel's max write size.
///
/// `flags` is intersected with the capabilities the kernel offered. Filesystems overriding
/// `Callbacks::init` can use this to finish the handshake after their own setup.
pub fn reply_init(req: &Request<'_>, flags: u32) {
    let arg = match fuse_init_in::decode(req.payload()) {
        Ok(arg) => arg,
        Err(err) => {
            error!("INIT({}) {}", req.unique(), err);
            return req.reply_error(EPROTO);
        }
    };
    debug!(
        "INIT({})   kernel: ABI {}.{}, flags {:#x}, max readahead {}",
        req.unique(), arg.major, arg.minor, arg.flags, arg.max_readahead
    );
    // We don't support ABI versions before 7.6
    if arg.major < 7 || (arg.major == 7 && arg.minor < 6) {
        error!("Unsupported FUSE ABI version {}.{}", arg.major, arg.minor);
        return req.reply_error(EPROTO);
    }
    // If the kernel supports a larger major version, it'll re-send a matching init message
    let init = fuse_init_out {
        major: FUSE_KERNEL_VERSION,
        minor: FUSE_KERNEL_MINOR_VERSION,
        max_readahead: arg.max_readahead,
        flags: arg.flags & flags,
        max_background: 0,
        congestion_threshold: 0,
        max_write: req.max_write(),
        time_gran: 1,
    };
    debug!(
        "INIT({}) response: ABI {}.{}, flags {:#x}, max readahead {}, max write {}",
        req.unique(), init.major, init.minor, init.flags, init.max_readahead, init.max_write
    );
    let bytes = init.to_bytes(arg.minor);
    req.reply_ok(&[&bytes[..]]);
}


/// Dispatch a request to the callback bound to its operation code.
///
/// Codes outside the known set are answered with ENOSYS.
pub fn dispatch<C: Callbacks + ?Sized>(callbacks: &C, req: &Request<'_>) {
    use fuse_opcode::*;

    let op = match req.operation() {
        Ok(op) => op,
        Err(_) => return req.reply_error(ENOSYS),
    };
    match op {
        FUSE_LOOKUP => callbacks.lookup(req),
        FUSE_FORGET => callbacks.forget(req),
        FUSE_GETATTR => callbacks.getattr(req),
        FUSE_SETATTR => callbacks.setattr(req),
        FUSE_READLINK => callbacks.readlink(req),
        FUSE_SYMLINK => callbacks.symlink(req),
        FUSE_MKNOD => callbacks.mknod(req),
        FUSE_MKDIR => callbacks.mkdir(req),
        FUSE_UNLINK => callbacks.unlink(req),
        FUSE_RMDIR => callbacks.rmdir(req),
        FUSE_RENAME => callbacks.rename(req),
        FUSE_LINK => callbacks.link(req),
        FUSE_OPEN => callbacks.open(req),
        FUSE_READ => callbacks.read(req),
        FUSE_WRITE => callbacks.write(req),
        FUSE_STATFS => callbacks.statfs(req),
        FUSE_RELEASE => callbacks.release(req),
        FUSE_FSYNC => callbacks.fsync(req),
        FUSE_SETXATTR => callbacks.setxattr(req),
        FUSE_GETXATTR => callbacks.getxattr(req),
        FUSE_LISTXATTR => callbacks.listxattr(req),
        FUSE_REMOVEXATTR => callbacks.removexattr(req),
        FUSE_FLUSH => callbacks.flush(req),
        FUSE_INIT => callbacks.init(req),
        FUSE_OPENDIR => callbacks.opendir(req),
        FUSE_READDIR => callbacks.readdir(req),
        FUSE_RELEASEDIR => callbacks.releasedir(req),
        FUSE_FSYNCDIR => callbacks.fsyncdir(req),
        FUSE_GETLK => callbacks.getlk(req),
        FUSE_SETLK => callbacks.setlk(req),
        FUSE_SETLKW => callbacks.setlkw(req),
        FUSE_ACCESS => callbacks.access(req),
        FUSE_CREATE => callbacks.create(req),
        FUSE_INTERRUPT => callbacks.interrupt(req),
        FUSE_BMAP => callbacks.bmap(req),
        FUSE_DESTROY => callbacks.destroy(req),
        FUSE_IOCTL => callbacks.ioctl(req),
        FUSE_POLL => callbacks.poll(req),
        FUSE_NOTIFY_REPLY => callbacks.notify_reply(req),
        FUSE_BATCH_FORGET => callbacks.batch_forget(req),
        FUSE_FALLOCATE => callbacks.fallocate(req),
        FUSE_READDIRPLUS => callbacks.readdirplus(req),
        FUSE_RENAME2 => callbacks.rename2(req),
        FUSE_LSEEK => callbacks.lseek(req),
    }
}
