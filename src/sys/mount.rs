use libc::{self, c_ulong};
use std::ffi::CStr;
use std::io;

pub fn mount(source: &CStr, target: &CStr, fstype: &CStr, flags: c_ulong, data: &CStr) -> io::Result<()> {
    try_io!(unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            flags,
            data.as_ptr() as *const libc::c_void,
        )
    });
    Ok(())
}

/// Forced unmount, detaches even if the mountpoint is busy.
pub fn force_unmount(target: &CStr) -> io::Result<()> {
    try_io!(unsafe { libc::umount2(target.as_ptr(), libc::MNT_FORCE) });
    Ok(())
}

pub fn effective_ids() -> (u32, u32) {
    unsafe { (libc::geteuid(), libc::getegid()) }
}
