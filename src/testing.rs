//! In-memory device for driving the pump in tests, and a logger recording error entries.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::{Condvar, Mutex, Once};
use std::time::{Duration, Instant};

use crate::device::Device;


enum Inbound {
    Frame(Vec<u8>),
    Error(i32),
}

#[derive(Default)]
struct State {
    inbound: VecDeque<Inbound>,
    closed: bool,
    written: Vec<Vec<u8>>,
    segments: Vec<usize>,
    write_error: Option<i32>,
}

/// A device whose frames are queued by the test and whose writes are recorded.
///
/// `receive` blocks until a frame or a scripted error is queued. Once closed and drained it
/// reports ENODEV like `/dev/fuse` after unmount.
#[derive(Default)]
pub struct MemoryDevice {
    state: Mutex<State>,
    changed: Condvar,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&self, frame: Vec<u8>) {
        self.state.lock().unwrap().inbound.push_back(Inbound::Frame(frame));
        self.changed.notify_all();
    }

    pub fn push_error(&self, errno: i32) {
        self.state.lock().unwrap().inbound.push_back(Inbound::Error(errno));
        self.changed.notify_all();
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.changed.notify_all();
    }

    pub fn fail_writes(&self, errno: i32) {
        self.state.lock().unwrap().write_error = Some(errno);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().written.clone()
    }

    /// Number of slices each recorded write was gathered from.
    pub fn segments(&self) -> Vec<usize> {
        self.state.lock().unwrap().segments.clone()
    }

    /// Wait until at least `count` writes were recorded.
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.written.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.changed.wait_timeout(state, deadline - now).unwrap().0;
        }
        true
    }
}

impl Device for MemoryDevice {
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.inbound.pop_front() {
                Some(Inbound::Frame(frame)) => {
                    let len = frame.len().min(buf.len());
                    buf[..len].copy_from_slice(&frame[..len]);
                    return Ok(len);
                }
                Some(Inbound::Error(errno)) => return Err(io::Error::from_raw_os_error(errno)),
                None if state.closed => return Err(io::Error::from_raw_os_error(libc::ENODEV)),
                None => state = self.changed.wait(state).unwrap(),
            }
        }
    }

    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if let Some(errno) = state.write_error {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let message: Vec<u8> = bufs.iter().flat_map(|buf| buf.iter().copied()).collect();
        let len = message.len();
        state.written.push(message);
        state.segments.push(bufs.len());
        drop(state);
        self.changed.notify_all();
        Ok(len)
    }
}


struct CaptureLogger {
    errors: Mutex<Vec<String>>,
}

static LOGGER: CaptureLogger = CaptureLogger { errors: Mutex::new(Vec::new()) };

impl Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Error
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            self.errors.lock().unwrap().push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

/// Number of error entries logged so far whose message starts with `prefix`.
///
/// The first call installs the recording logger, so call it before the code under test runs.
/// Tests share the logger, pick a prefix (usually the channel name) no other test uses.
pub fn logged_errors(prefix: &str) -> usize {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Error);
        }
    });
    LOGGER.errors.lock().unwrap().iter().filter(|message| message.starts_with(prefix)).count()
}
