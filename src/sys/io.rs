use libc::{self, c_int, c_void, size_t};
use std::ffi::CStr;
use std::io::{self, IoSlice};
use std::os::unix::io::RawFd;

pub fn open(path: &CStr, flags: c_int) -> io::Result<RawFd> {
    Ok(try_io!(unsafe { libc::open(path.as_ptr(), flags) }))
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    Ok(try_io!(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len() as size_t) }) as usize)
}

/// Gather `bufs` into a single `writev(2)`.
pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    // IoSlice is ABI compatible with iovec on unix
    Ok(try_io!(unsafe {
        libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as c_int)
    }) as usize)
}

pub fn close(fd: RawFd) -> io::Result<()> {
    try_io!(unsafe { libc::close(fd) });
    Ok(())
}
