macro_rules! try_io {
    ($x:expr) => {
        match $x {
            rc if rc < 0 => return Err(std::io::Error::last_os_error()),
            rc => rc,
        }
    };
}

mod io;
mod mount;

pub use self::io::*;
pub use self::mount::*;
