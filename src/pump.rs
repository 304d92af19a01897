//! Read pump.
//!
//! A pump runs a device while the filesystem is mounted. It owns a dedicated thread that reads
//! one frame at a time into a pooled buffer and hands every frame to a freshly spawned thread,
//! which decodes the header and dispatches the request to the filesystem callbacks. Requests are
//! independent and replies are matched by their unique id, so units of work run concurrently and
//! may answer in any order.
//!
//! EPERM is what a read reports before the filesystem is mounted and is retried. Otherwise the
//! pump ends when a read fails. ENODEV means the device was closed (unmount or detach) and is
//! a graceful end, any other error is reported as the outcome. Either way the pump waits for all
//! in-flight requests to finish before delivering the outcome on its `Completion`, exactly once.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use fuse_abi::{fuse_in_header, FUSE_MIN_READ_BUFFER, IN_HEADER_SIZE, WRITE_IN_SIZE};
use log::{debug, error, info};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::buffer::{Buffer, BufferPool};
use crate::callbacks::{self, Callbacks};
use crate::device::Device;
use crate::drain::{Counters, DrainBarrier, PumpStats};
use crate::reply::ChannelSender;
use crate::request::Request;


/// Size of the largest frame the kernel may send when writes are capped at `max_write`.
///
/// Never less than the smallest read buffer the kernel accepts.
pub fn frame_size(max_write: u32) -> usize {
    (IN_HEADER_SIZE + WRITE_IN_SIZE + max_write as usize).max(FUSE_MIN_READ_BUFFER)
}


/// One-shot outcome of a pump.
///
/// Delivers `Ok(())` when the device was closed and `Err` with the terminal read error otherwise.
/// The outcome is only sent after every in-flight request has finished.
#[derive(Debug)]
pub struct Completion {
    rx: Receiver<io::Result<()>>,
}

fn vanished() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "read pump exited without reporting an outcome")
}

impl Completion {
    /// Block until the pump has finished.
    pub fn wait(self) -> io::Result<()> {
        self.rx.recv().unwrap_or_else(|_| Err(vanished()))
    }

    /// Block for at most `timeout`. Returns `None` if the pump is still running.
    ///
    /// The outcome is handed out once; asking again after it was received reports an error.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<io::Result<()>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(vanished())),
        }
    }

    /// Returns the outcome if the pump has finished, without blocking.
    pub fn try_wait(&self) -> Option<io::Result<()>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(vanished())),
        }
    }
}


/// Handle to a running pump.
///
/// Stopping the pump is done by closing its device; `join` then waits for the pump thread to
/// exit. Dropping the handle detaches the thread.
pub struct PumpHandle {
    name: String,
    thread: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
    sender: ChannelSender,
    pool: Arc<BufferPool>,
}

impl fmt::Debug for PumpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PumpHandle")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PumpHandle {
    /// Activity counters of the pump.
    pub fn stats(&self) -> PumpStats {
        self.counters.snapshot()
    }

    /// Writer used for replies, shared with every request.
    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    /// Pool the pump reads frames into.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Whether the pump thread is still alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |thread| !thread.is_finished())
    }

    /// Wait for the pump thread to exit.
    ///
    /// The caller must have closed the device, otherwise this blocks until the kernel ends the
    /// connection.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{}: read pump panicked", self.name);
            }
        }
    }
}


/// Start a pump reading from `device`.
///
/// Frame buffers are sized for writes of up to `max_write` bytes. Returns the handle of the pump
/// and the completion its outcome is delivered on.
pub fn spawn<D: Device>(
    name: &str,
    device: Arc<D>,
    max_write: u32,
    callbacks: Arc<dyn Callbacks>,
) -> io::Result<(PumpHandle, Completion)> {
    let pool = BufferPool::new(frame_size(max_write));
    let sender = ChannelSender::new(name, device.clone(), max_write);
    let counters = Arc::new(Counters::default());
    let (done, rx) = channel::bounded(1);

    let pump = Pump {
        name: name.to_owned(),
        device,
        pool: Arc::clone(&pool),
        worker: Arc::new(Worker { name: name.to_owned(), sender: sender.clone(), callbacks }),
        counters: Arc::clone(&counters),
        done,
    };
    let thread = thread::Builder::new()
        .name(format!("fuse-pump:{}", name))
        .spawn(move || pump.run())?;
    debug!("{}: read pump started, frame size {}", name, pool.capacity());

    let handle = PumpHandle { name: name.to_owned(), thread: Some(thread), counters, sender, pool };
    Ok((handle, Completion { rx }))
}


struct Pump<D> {
    name: String,
    device: Arc<D>,
    pool: Arc<BufferPool>,
    worker: Arc<Worker>,
    counters: Arc<Counters>,
    done: Sender<io::Result<()>>,
}

impl<D: Device> Pump<D> {
    /// Read next frame from the kernel driver
    fn next_frame(&self, buffer: &mut Buffer) -> io::Result<usize> {
        loop {
            match self.device.receive(buffer.as_mut_capacity()) {
                Ok(len) => return Ok(len),
                Err(err) => match err.raw_os_error() {
                    // Not mounted yet or a transient kernel condition, retry
                    Some(libc::EPERM) => continue,
                    _ => return Err(err),
                },
            }
        }
    }

    fn run(self) {
        let barrier = DrainBarrier::new(Arc::clone(&self.counters));

        let outcome = loop {
            let mut buffer = self.pool.acquire();
            match self.next_frame(&mut buffer) {
                Ok(len) => buffer.truncate(len),
                // Device closed, quit the loop
                Err(ref err) if err.raw_os_error() == Some(libc::ENODEV) => break Ok(()),
                Err(err) => {
                    error!("{}: exiting due to /dev/fuse read error: {}", self.name, err);
                    break Err(err);
                }
            }

            let ticket = barrier.enter();
            let worker = Arc::clone(&self.worker);
            let spawned = thread::Builder::new()
                .name(format!("fuse-req:{}", self.name))
                .spawn(move || {
                    worker.process(buffer);
                    drop(ticket);
                });
            if let Err(err) = spawned {
                error!("{}: unable to spawn request thread: {}", self.name, err);
                break Err(err);
            }
        };

        debug!("{}: draining {} in-flight requests", self.name, self.counters.snapshot().in_flight);
        barrier.wait();
        info!("{}: read pump exiting after {} requests", self.name, self.counters.snapshot().dispatched);

        if self.done.send(outcome).is_err() {
            debug!("{}: nobody is waiting for the pump outcome", self.name);
        }
    }
}


/// Everything a unit of work needs to process one frame.
struct Worker {
    name: String,
    sender: ChannelSender,
    callbacks: Arc<dyn Callbacks>,
}

impl Worker {
    fn process(&self, buffer: Buffer) {
        let (header, payload) = match fuse_in_header::decode(&buffer) {
            Ok(decoded) => decoded,
            Err(err) => {
                // No unique id to answer with, all we can do is drop it
                error!("{}: read malformed message from /dev/fuse: {}", self.name, err);
                return;
            }
        };
        let req = Request::new(header, payload, &self.sender);
        debug!("{}", req);
        callbacks::dispatch(&*self.callbacks, &req);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{logged_errors, MemoryDevice};
    use fuse_abi::{fuse_init_in, fuse_opcode, fuse_out_header, OUT_HEADER_SIZE};
    use std::collections::HashSet;
    use std::sync::Mutex;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn frame(opcode: u32, unique: u64, payload: &[u8]) -> Vec<u8> {
        let header = fuse_in_header {
            len: (IN_HEADER_SIZE + payload.len()) as u32,
            opcode,
            unique,
            nodeid: 1,
            uid: 1000,
            gid: 1000,
            pid: 1,
            padding: 0,
        };
        let mut frame = header.to_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    fn replies(device: &MemoryDevice) -> Vec<fuse_out_header> {
        device.written().iter().map(|message| fuse_out_header::decode(message).unwrap()).collect()
    }

    struct NullFS;

    impl Callbacks for NullFS {}

    /// Answers GETATTR with the node id, records LOOKUP payloads.
    #[derive(Default)]
    struct EchoFS {
        lookups: Mutex<Vec<Vec<u8>>>,
    }

    impl Callbacks for EchoFS {
        fn getattr(&self, req: &Request<'_>) {
            req.reply_ok(&[&req.nodeid().to_ne_bytes()]);
        }

        fn lookup(&self, req: &Request<'_>) {
            self.lookups.lock().unwrap().push(req.payload().to_vec());
            req.reply_error(libc::ENOENT);
        }
    }

    /// Blocks every READ until the test lets it go.
    struct GateFS {
        entered: channel::Sender<u64>,
        release: channel::Receiver<()>,
    }

    impl Callbacks for GateFS {
        fn read(&self, req: &Request<'_>) {
            self.entered.send(req.unique()).unwrap();
            self.release.recv().unwrap();
            req.reply_ok(&[b"late"]);
        }
    }

    fn start<C: Callbacks>(device: &Arc<MemoryDevice>, callbacks: C) -> (PumpHandle, Completion) {
        spawn("test", Arc::clone(device), 4096, Arc::new(callbacks)).unwrap()
    }

    #[test]
    fn frame_size_covers_largest_write() {
        assert_eq!(frame_size(65536), 40 + 40 + 65536);
        assert_eq!(frame_size(8192), 40 + 40 + 8192);
    }

    #[test]
    fn frame_size_respects_kernel_minimum() {
        assert_eq!(frame_size(4096), 8192);
        assert_eq!(frame_size(8192 - 80), 8192);
    }

    #[test]
    fn close_without_traffic() {
        let device = Arc::new(MemoryDevice::new());
        let (pump, completion) = start(&device, NullFS);
        device.close();
        assert!(completion.wait_timeout(TIMEOUT).unwrap().is_ok());
        assert_eq!(pump.stats(), PumpStats { dispatched: 0, in_flight: 0 });
        pump.join();
        assert!(device.written().is_empty());
    }

    #[test]
    fn concurrent_frames_answer_their_unique() {
        let device = Arc::new(MemoryDevice::new());
        let (pump, completion) = start(&device, EchoFS::default());
        let uniques: HashSet<u64> = (1..=64).map(|n| n * 2).collect();
        for unique in &uniques {
            device.push_frame(frame(fuse_opcode::FUSE_GETATTR as u32, *unique, &[]));
        }
        assert!(device.wait_for_writes(uniques.len(), TIMEOUT));
        device.close();
        completion.wait().unwrap();

        let seen: Vec<u64> = replies(&device).iter().map(|reply| reply.unique).collect();
        assert_eq!(seen.len(), uniques.len());
        assert_eq!(seen.iter().copied().collect::<HashSet<_>>(), uniques);
        assert_eq!(pump.stats().dispatched, 64);
        pump.join();
    }

    #[test]
    fn payload_is_forwarded_unparsed() {
        let device = Arc::new(MemoryDevice::new());
        let fs = Arc::new(EchoFS::default());
        let (pump, completion) = spawn("test", Arc::clone(&device), 4096, fs.clone()).unwrap();
        device.push_frame(frame(fuse_opcode::FUSE_LOOKUP as u32, 5, b"file.txt\0"));
        device.close();
        completion.wait().unwrap();
        pump.join();

        assert_eq!(fs.lookups.lock().unwrap().as_slice(), &[b"file.txt\0".to_vec()]);
        assert_eq!(replies(&device), vec![fuse_out_header { len: 16, error: -libc::ENOENT, unique: 5 }]);
    }

    #[test]
    fn unsupported_opcode() {
        let device = Arc::new(MemoryDevice::new());
        let (pump, completion) = start(&device, NullFS);
        device.push_frame(frame(1234, 0xabcdef, b"whatever"));
        device.close();
        completion.wait().unwrap();
        pump.join();

        let written = device.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].len(), OUT_HEADER_SIZE);
        assert_eq!(replies(&device), vec![fuse_out_header { len: 16, error: -libc::ENOSYS, unique: 0xabcdef }]);
    }

    #[test]
    fn malformed_frame_is_dropped() {
        assert_eq!(logged_errors("short-frame:"), 0);
        let device = Arc::new(MemoryDevice::new());
        let callbacks = Arc::new(EchoFS::default());
        let (pump, completion) = spawn("short-frame", Arc::clone(&device), 4096, callbacks).unwrap();
        device.push_frame(vec![0x28, 0, 0, 0, 3, 0, 0, 0, 1, 2, 3]);
        device.close();
        completion.wait().unwrap();
        let pool = Arc::clone(pump.pool());
        pump.join();

        assert!(device.written().is_empty());
        assert_eq!(pool.idle(), pool.allocated());
        assert_eq!(logged_errors("short-frame:"), 1);
    }

    #[test]
    fn drain_waits_for_in_flight_requests() {
        let device = Arc::new(MemoryDevice::new());
        let (entered_tx, entered_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::unbounded();
        let (pump, completion) = start(&device, GateFS { entered: entered_tx, release: release_rx });

        device.push_frame(frame(fuse_opcode::FUSE_READ as u32, 10, &[]));
        device.push_frame(frame(fuse_opcode::FUSE_READ as u32, 11, &[]));
        entered_rx.recv_timeout(TIMEOUT).unwrap();
        entered_rx.recv_timeout(TIMEOUT).unwrap();
        device.close();

        assert!(completion.wait_timeout(Duration::from_millis(200)).is_none());
        assert_eq!(pump.stats().in_flight, 2);

        release_tx.send(()).unwrap();
        assert!(completion.wait_timeout(Duration::from_millis(200)).is_none());
        release_tx.send(()).unwrap();

        assert!(completion.wait_timeout(TIMEOUT).unwrap().is_ok());
        assert_eq!(device.written().len(), 2);
        assert_eq!(pump.stats(), PumpStats { dispatched: 2, in_flight: 0 });
        pump.join();
    }

    #[test]
    fn not_permitted_is_retried() {
        let device = Arc::new(MemoryDevice::new());
        let (pump, completion) = start(&device, EchoFS::default());
        device.push_error(libc::EPERM);
        device.push_error(libc::EPERM);
        device.push_frame(frame(fuse_opcode::FUSE_GETATTR as u32, 3, &[]));
        device.close();
        assert!(completion.wait().is_ok());
        pump.join();
        assert_eq!(replies(&device).len(), 1);
    }

    #[test]
    fn fatal_read_error_is_the_outcome() {
        let device = Arc::new(MemoryDevice::new());
        let (pump, completion) = start(&device, EchoFS::default());
        device.push_frame(frame(fuse_opcode::FUSE_GETATTR as u32, 1, &[]));
        device.push_error(libc::EIO);
        device.push_frame(frame(fuse_opcode::FUSE_GETATTR as u32, 2, &[]));
        let err = completion.wait().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
        pump.join();

        assert_eq!(replies(&device).iter().map(|reply| reply.unique).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn interrupted_read_ends_the_pump() {
        let device = Arc::new(MemoryDevice::new());
        let (pump, completion) = start(&device, EchoFS::default());
        device.push_error(libc::EINTR);
        let err = completion.wait_timeout(TIMEOUT).unwrap().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINTR));
        pump.join();
        assert!(device.written().is_empty());
    }

    #[test]
    fn outcome_is_delivered_once() {
        let device = Arc::new(MemoryDevice::new());
        let (pump, completion) = start(&device, NullFS);
        device.close();
        assert!(completion.wait_timeout(TIMEOUT).unwrap().is_ok());
        pump.join();
        assert!(completion.try_wait().unwrap().is_err());
    }

    #[test]
    fn init_through_pump_records_max_write() {
        let device = Arc::new(MemoryDevice::new());
        let (pump, completion) = start(&device, NullFS);
        let init = fuse_init_in { major: 7, minor: 26, max_readahead: 131072, flags: 0 };
        device.push_frame(frame(fuse_opcode::FUSE_INIT as u32, 1, &init.to_bytes()));
        assert!(device.wait_for_writes(1, TIMEOUT));
        assert_eq!(pump.sender().negotiated_max_write(), Some(4096));
        device.close();
        completion.wait().unwrap();
        pump.join();
    }
}
