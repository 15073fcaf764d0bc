//! Asynchronous I/O engine over `io_uring`.
//!
//! Single-issuer design: exactly one thread, the reaper, runs
//! [`AsyncIo::event_loop`] and is the only thread that ever touches the
//! kernel submission and completion rings. Producers on any thread stage
//! operation records through a lock-free MPSC ring and rouse the reaper by
//! raising the process wake signal, which the reaper observes through a
//! long-lived multi-shot poll on a signal-fd.

use std::collections::HashSet;
use std::ffi::CStr;
use std::fmt::{self, Display, Formatter};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::{cmp, io, mem, ptr};

use libc::c_void;

use crate::cqueue::CompletionQueue;
use crate::executor::CompleteFn;
use crate::opcode;
use crate::ring::Mpsc;
use crate::signal;
use crate::squeue::{Entry, Flags, SubmissionQueue};
use crate::sys;
use crate::util::{kernel_at_least, kernel_release, Fd, Mmap};

pub use crate::opcode::Timespec;

/// Everything below this release lacks the uring features the engine
/// leans on.
const MIN_KERNEL: (u32, u32, u32) = (6, 8, 0);

/// `user_data` of the engine's own signal-fd poll. Never a valid record
/// address; allocations on the supported platforms start well above it.
const SELF_POLL_TOKEN: u64 = 1;

/// Per-submission ordering mode. The default issues from async context
/// with no ordering constraint; these are the only ordering primitives
/// the engine exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No ordering relation to other submissions.
    Async,
    /// Wait for every prior submission to complete first.
    Drain,
    /// Chain the next submission to this one.
    Link,
}

impl Mode {
    fn flags(self) -> Flags {
        match self {
            Mode::Async => Flags::ASYNC,
            Mode::Drain => Flags::ASYNC | Flags::IO_DRAIN,
            Mode::Link => Flags::ASYNC | Flags::IO_LINK,
        }
    }
}

/// Which half of a socket a [shutdown](AsyncIo::shutdown) closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    Both,
}

impl Direction {
    fn how(self) -> i32 {
        match self {
            Direction::Read => libc::SHUT_RD,
            Direction::Write => libc::SHUT_WR,
            Direction::Both => libc::SHUT_RDWR,
        }
    }
}

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Inactive,
    Running,
    Closing,
    Closed,
}

const INACTIVE: u8 = 0;
const RUNNING: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

/// I/O submission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The staging ring is full.
    Overflow,
    /// The engine has shut down.
    Closed,
}

impl Display for SubmitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Overflow => f.write_str("staging queue is full"),
            SubmitError::Closed => f.write_str("engine is closed"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Handle to an accepted submission, usable with [`AsyncIo::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpToken(u64);

/// Opcode-specific parameters. Storage the kernel must keep addressable
/// for the lifetime of the operation lives inline in the record.
enum Params {
    Nop,
    Timeout {
        ts: Timespec,
    },
    Accept {
        fd: RawFd,
        addr: libc::sockaddr_storage,
        len: libc::socklen_t,
    },
    Shutdown {
        fd: RawFd,
        how: i32,
    },
    Open {
        path: std::ffi::CString,
        flags: i32,
        mode: libc::mode_t,
    },
    Close {
        fd: RawFd,
    },
    Send {
        fd: RawFd,
        buf: *const u8,
        len: u32,
    },
    Recv {
        fd: RawFd,
        buf: *mut u8,
        len: u32,
    },
    Read {
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
    },
    Write {
        fd: RawFd,
        buf: *const u8,
        len: u32,
        offset: u64,
    },
    Status {
        path: std::ffi::CString,
        statxbuf: *mut libc::statx,
        mask: u32,
        flags: i32,
    },
    Cancel {
        target: u64,
    },
}

/// Operation record. Its heap address doubles as the kernel-visible
/// `user_data` token; it stays allocated until the terminal completion is
/// dispatched (for multi-shot, until a completion without `F_MORE`).
struct Op {
    params: Params,
    mode: Mode,
    callback: Option<CompleteFn>,
    userdata: *mut c_void,
}

impl Op {
    /// Build the sqe for this record. Pointers into `self` are stable:
    /// the record is boxed and never moves until freed.
    fn prepare(&self, token: u64) -> Entry {
        let entry = match &self.params {
            Params::Nop => opcode::Nop::new().build(),
            Params::Timeout { ts } => opcode::Timeout::new(ts as *const Timespec).build(),
            Params::Accept { fd, addr, len } => opcode::Accept::new(
                *fd,
                addr as *const libc::sockaddr_storage as *mut libc::sockaddr,
                len as *const libc::socklen_t as *mut libc::socklen_t,
            )
            .build(),
            Params::Shutdown { fd, how } => opcode::Shutdown::new(*fd, *how).build(),
            Params::Open { path, flags, mode } => opcode::OpenAt::new(path.as_ptr())
                .flags(*flags)
                .mode(*mode)
                .build(),
            Params::Close { fd } => opcode::Close::new(*fd).build(),
            Params::Send { fd, buf, len } => opcode::Send::new(*fd, *buf, *len).build(),
            Params::Recv { fd, buf, len } => opcode::Recv::new(*fd, *buf, *len).build(),
            Params::Read {
                fd,
                buf,
                len,
                offset,
            } => opcode::Read::new(*fd, *buf, *len).offset(*offset).build(),
            Params::Write {
                fd,
                buf,
                len,
                offset,
            } => opcode::Write::new(*fd, *buf, *len).offset(*offset).build(),
            Params::Status {
                path,
                statxbuf,
                mask,
                flags,
            } => opcode::Statx::new(path.as_ptr(), *statxbuf)
                .mask(*mask)
                .flags(*flags)
                .build(),
            Params::Cancel { target } => opcode::AsyncCancel::new(*target).build(),
        };

        entry.flags(self.mode.flags()).user_data(token)
    }
}

#[allow(dead_code)]
struct MemoryMap {
    scq_mmap: Mmap,
    sqe_mmap: Mmap,
}

/// Engine build params.
#[derive(Clone, Copy, Default)]
pub struct Builder {
    attach_wq: Option<RawFd>,
    debug_alloc: bool,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Share the kernel worker pool of another ring instead of creating
    /// one.
    pub fn attach_wq(mut self, ring_fd: RawFd) -> Builder {
        self.attach_wq = Some(ring_fd);
        self
    }

    /// Count live operation records and panic on leaks at teardown.
    pub fn debug_alloc(mut self, on: bool) -> Builder {
        self.debug_alloc = on;
        self
    }

    /// Build an [AsyncIo] with ring capacity `N`.
    pub fn build<const N: usize>(&self) -> io::Result<AsyncIo<N>> {
        AsyncIo::with_builder(self)
    }
}

/// The asynchronous I/O engine.
///
/// `N` is the capacity of both the staging ring and the kernel submission
/// ring, a power of two. Construct [`crate::Signal`] first: the wake
/// signal must already be blocked for the signal-fd to observe it.
pub struct AsyncIo<const N: usize> {
    fd: Fd,
    sfd: Fd,
    params: sys::io_uring_params,
    memory: MemoryMap,
    sq: SubmissionQueue,
    cq: CompletionQueue,
    staging: Mpsc<N>,
    ongoing_ios: AtomicU32,
    status: AtomicU8,
    debug_alloc: bool,
    live: AtomicUsize,
}

unsafe impl<const N: usize> Send for AsyncIo<N> {}
unsafe impl<const N: usize> Sync for AsyncIo<N> {}

impl<const N: usize> AsyncIo<N> {
    /// Create an engine with default build params.
    pub fn new(debug_alloc: bool) -> io::Result<AsyncIo<N>> {
        Builder::new().debug_alloc(debug_alloc).build()
    }

    fn with_builder(b: &Builder) -> io::Result<AsyncIo<N>> {
        let release = kernel_release()?;
        if !kernel_at_least(&release, MIN_KERNEL) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("kernel {} is too old, need 6.8", release),
            ));
        }

        let sfd = unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, signal::WAKE_SIGNAL);
            let fd = libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Fd::from_raw(fd)
        };

        let mut p = sys::io_uring_params {
            flags: sys::IORING_SETUP_SQPOLL | sys::IORING_SETUP_SINGLE_ISSUER,
            ..Default::default()
        };
        if let Some(wq_fd) = b.attach_wq {
            p.flags |= sys::IORING_SETUP_ATTACH_WQ;
            p.wq_fd = wq_fd as u32;
        }

        let fd = unsafe {
            let ret = sys::io_uring_setup(N as u32, &mut p)?;
            Fd::from_raw(ret)
        };

        if p.features & sys::IORING_FEAT_SINGLE_MMAP == 0 {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "kernel lacks IORING_FEAT_SINGLE_MMAP",
            ));
        }

        let sq_len = p.sq_off.array as usize + p.sq_entries as usize * mem::size_of::<u32>();
        let cq_len =
            p.cq_off.cqes as usize + p.cq_entries as usize * mem::size_of::<sys::io_uring_cqe>();
        let sqe_len = p.sq_entries as usize * mem::size_of::<sys::io_uring_sqe>();

        let scq_mmap = Mmap::new(&fd, sys::IORING_OFF_SQ_RING as i64, cmp::max(sq_len, cq_len))?;
        let sqe_mmap = Mmap::new(&fd, sys::IORING_OFF_SQES as i64, sqe_len)?;

        let sq = unsafe { SubmissionQueue::new(&scq_mmap, &sqe_mmap, &p) };
        let cq = unsafe { CompletionQueue::new(&scq_mmap, &p) };

        Ok(AsyncIo {
            fd,
            sfd,
            params: p,
            memory: MemoryMap { scq_mmap, sqe_mmap },
            sq,
            cq,
            staging: Mpsc::new(),
            ongoing_ios: AtomicU32::new(0),
            status: AtomicU8::new(INACTIVE),
            debug_alloc: b.debug_alloc,
            live: AtomicUsize::new(0),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Status {
        match self.status.load(Ordering::Acquire) {
            INACTIVE => Status::Inactive,
            RUNNING => Status::Running,
            CLOSING => Status::Closing,
            _ => Status::Closed,
        }
    }

    /// In-flight submissions, the pinned self-poll included. Quiescence
    /// is 1, not 0.
    pub fn ongoing(&self) -> u32 {
        self.ongoing_ios.load(Ordering::Acquire)
    }

    /// The ring descriptor, usable as an [attach target](Builder::attach_wq).
    pub fn ring_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Submission ring capacity granted by the kernel.
    pub fn sq_entries(&self) -> u32 {
        self.params.sq_entries
    }

    /// Completion ring capacity granted by the kernel.
    pub fn cq_entries(&self) -> u32 {
        self.params.cq_entries
    }

    // ---- submission API -------------------------------------------------

    /// Arm a relative timeout. The callback receives `-ETIME` on expiry.
    ///
    /// # Safety
    ///
    /// `userdata` must stay valid until the callback has run.
    pub unsafe fn timeout(
        &self,
        ts: Timespec,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(Params::Timeout { ts }, mode, callback, userdata)
    }

    /// Arm a multi-shot accept; every completion carries one connected
    /// descriptor in the result, with `F_MORE` on all non-terminal ones.
    ///
    /// # Safety
    ///
    /// `fd` must be a listening socket; `userdata` must stay valid until
    /// the terminal completion.
    pub unsafe fn accept(
        &self,
        fd: RawFd,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(
            Params::Accept {
                fd,
                addr: mem::zeroed(),
                len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            },
            mode,
            callback,
            userdata,
        )
    }

    /// Shut down one or both halves of a connected socket.
    ///
    /// # Safety
    ///
    /// `userdata` must stay valid until the callback has run.
    pub unsafe fn shutdown(
        &self,
        fd: RawFd,
        direction: Direction,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(
            Params::Shutdown {
                fd,
                how: direction.how(),
            },
            mode,
            callback,
            userdata,
        )
    }

    /// Open `path`, which must be absolute. The callback result is the
    /// new descriptor.
    ///
    /// # Safety
    ///
    /// `userdata` must stay valid until the callback has run.
    pub unsafe fn open(
        &self,
        path: &CStr,
        flags: i32,
        file_mode: libc::mode_t,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(
            Params::Open {
                path: path.to_owned(),
                flags,
                mode: file_mode,
            },
            mode,
            callback,
            userdata,
        )
    }

    /// Close a descriptor.
    ///
    /// # Safety
    ///
    /// `userdata` must stay valid until the callback has run.
    pub unsafe fn close(
        &self,
        fd: RawFd,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(Params::Close { fd }, mode, callback, userdata)
    }

    /// Send from a caller-owned buffer.
    ///
    /// # Safety
    ///
    /// `buf..buf+len` and `userdata` must stay valid until the callback
    /// has run.
    pub unsafe fn send(
        &self,
        fd: RawFd,
        buf: *const u8,
        len: u32,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(Params::Send { fd, buf, len }, mode, callback, userdata)
    }

    /// Receive into a caller-owned buffer.
    ///
    /// # Safety
    ///
    /// `buf..buf+len` and `userdata` must stay valid until the callback
    /// has run.
    pub unsafe fn recv(
        &self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(Params::Recv { fd, buf, len }, mode, callback, userdata)
    }

    /// Positional read into a caller-owned buffer. The callback result is
    /// the byte count.
    ///
    /// # Safety
    ///
    /// `buf..buf+len` and `userdata` must stay valid until the callback
    /// has run.
    pub unsafe fn read(
        &self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(
            Params::Read {
                fd,
                buf,
                len,
                offset,
            },
            mode,
            callback,
            userdata,
        )
    }

    /// Positional write from a caller-owned buffer. The callback result
    /// is the byte count.
    ///
    /// # Safety
    ///
    /// `buf..buf+len` and `userdata` must stay valid until the callback
    /// has run.
    pub unsafe fn write(
        &self,
        fd: RawFd,
        buf: *const u8,
        len: u32,
        offset: u64,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(
            Params::Write {
                fd,
                buf,
                len,
                offset,
            },
            mode,
            callback,
            userdata,
        )
    }

    /// `statx` by absolute path into a caller-owned output struct.
    ///
    /// # Safety
    ///
    /// `statxbuf` and `userdata` must stay valid until the callback has
    /// run.
    pub unsafe fn status(
        &self,
        path: &CStr,
        mask: u32,
        flags: i32,
        statxbuf: *mut libc::statx,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(
            Params::Status {
                path: path.to_owned(),
                statxbuf,
                mask,
                flags,
            },
            mode,
            callback,
            userdata,
        )
    }

    /// Submit a no-op that completes immediately.
    ///
    /// # Safety
    ///
    /// `userdata` must stay valid until the callback has run.
    pub unsafe fn nop(
        &self,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(Params::Nop, mode, callback, userdata)
    }

    /// Cancel an in-flight submission. The cancelled operation's callback
    /// runs with `-ECANCELED`; this one's runs with 0, or `-ENOENT` when
    /// nothing matched.
    ///
    /// # Safety
    ///
    /// `userdata` must stay valid until the callback has run.
    pub unsafe fn cancel(
        &self,
        token: OpToken,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        self.submit_op(Params::Cancel { target: token.0 }, mode, callback, userdata)
    }

    unsafe fn submit_op(
        &self,
        params: Params,
        mode: Mode,
        callback: Option<CompleteFn>,
        userdata: *mut c_void,
    ) -> Result<OpToken, SubmitError> {
        if self.state() == Status::Closed {
            return Err(SubmitError::Closed);
        }

        let record = Box::into_raw(Box::new(Op {
            params,
            mode,
            callback,
            userdata,
        }));
        if self.debug_alloc {
            self.live.fetch_add(1, Ordering::Relaxed);
        }

        if self.staging.push(record as usize).is_none() {
            if self.debug_alloc {
                self.live.fetch_sub(1, Ordering::Relaxed);
            }
            drop(Box::from_raw(record));
            return Err(SubmitError::Overflow);
        }

        signal::emit_wake();
        Ok(OpToken(record as u64))
    }

    // ---- event loop -----------------------------------------------------

    /// Run the reaper loop on the calling thread until shutdown drains
    /// every in-flight completion.
    ///
    /// `exit_callbacks` run exactly once, on this thread, when the
    /// shutdown latch is first observed. Only one call per engine is
    /// allowed.
    pub fn event_loop(&self, exit_callbacks: &[&dyn Fn()]) -> io::Result<()> {
        if self
            .status
            .compare_exchange(INACTIVE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("event loop entered twice");
        }

        // Reaper-local: addresses of every record pushed to the kernel
        // and not yet terminally reaped, for cancel-on-shutdown, and the
        // subset a cancel has already been staged for.
        let mut inflight: HashSet<u64> = HashSet::new();
        let mut cancelled: HashSet<u64> = HashSet::new();

        self.install_self_poll()?;

        let mut exit_ran = false;
        loop {
            let batch = unsafe { self.flush(&mut inflight) };

            if batch == 0 && self.state() != Status::Closed {
                match unsafe {
                    sys::io_uring_enter(
                        self.fd.as_raw_fd(),
                        0,
                        1,
                        sys::IORING_ENTER_GETEVENTS,
                    )
                } {
                    Ok(_) => {}
                    Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => {}
                    Err(e) => log::error!("io_uring_enter: {}", e),
                }
            }

            unsafe { self.reap(&mut inflight) };

            match self.state() {
                Status::Running if signal::pending() != 0 => {
                    if !exit_ran {
                        for cb in exit_callbacks {
                            cb();
                        }
                        exit_ran = true;
                    }
                    self.cancel_inflight(&inflight, &mut cancelled);
                    signal::emit_wake();
                    self.status.store(CLOSING, Ordering::Release);
                    if self.ongoing() == 1 {
                        self.status.store(CLOSED, Ordering::Release);
                    }
                }
                Status::Closing => {
                    // Staging may have been full on the first pass; keep
                    // chasing whatever is still uncancelled.
                    self.cancel_inflight(&inflight, &mut cancelled);
                    if self.ongoing() == 1 {
                        self.status.store(CLOSED, Ordering::Release);
                    }
                }
                _ => {}
            }

            if self.state() == Status::Closed {
                return Ok(());
            }
        }
    }

    /// Arm the multi-shot poll on the signal-fd. It is the single
    /// residual in `ongoing_ios` for the life of the engine.
    fn install_self_poll(&self) -> io::Result<()> {
        let entry = opcode::PollAdd::new(self.sfd.as_raw_fd(), libc::POLLIN as u32)
            .multi(true)
            .build()
            .user_data(SELF_POLL_TOKEN);

        unsafe {
            let tail = self.sq.local_tail();
            self.sq.stage(tail, &entry);
            self.sq.publish(tail.wrapping_add(1));
            loop {
                match self.enter_submit(1) {
                    Ok(_) => break,
                    Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.ongoing_ios.store(1, Ordering::Release);
        Ok(())
    }

    /// Drain the staging ring into the kernel submission ring. Returns
    /// the number of entries handed over.
    unsafe fn flush(&self, inflight: &mut HashSet<u64>) -> u32 {
        let mut tail = self.sq.local_tail();
        let mut batch = 0u32;

        // sq.len() only counts published entries; the batch staged so far
        // must be added or a large flush would overrun the ring.
        while self.sq.len() + (batch as usize) < self.sq.capacity() {
            // Single consumer: this thread is the only popper.
            let addr = match self.staging.pop() {
                Some((_, addr)) => addr,
                None => break,
            };

            let op = &*(addr as *const Op);
            self.sq.stage(tail, &op.prepare(addr as u64));
            tail = tail.wrapping_add(1);
            batch += 1;
            inflight.insert(addr as u64);
        }

        if batch > 0 {
            self.sq.publish(tail);
            match self.enter_submit(batch) {
                Ok(_) => {}
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => {}
                Err(e) => log::error!("io_uring_enter: {}", e),
            }
            self.ongoing_ios.fetch_add(batch, Ordering::Release);
        }

        batch
    }

    unsafe fn enter_submit(&self, to_submit: u32) -> io::Result<i32> {
        let mut flags = sys::IORING_ENTER_SQ_WAIT;
        if self.sq.need_wakeup() {
            flags |= sys::IORING_ENTER_SQ_WAKEUP;
        }
        sys::io_uring_enter(self.fd.as_raw_fd(), to_submit, 0, flags)
    }

    /// Process every available completion.
    unsafe fn reap(&self, inflight: &mut HashSet<u64>) {
        while let Some(cqe) = self.cq.next() {
            let more = cqe.more();
            if !more {
                self.ongoing_ios.fetch_sub(1, Ordering::Release);
            }

            match cqe.user_data() {
                0 => unreachable!("completion without an owning record"),
                SELF_POLL_TOKEN => self.drain_wake(),
                addr => {
                    let op = addr as *mut Op;
                    match (*op).callback {
                        Some(cb) => cb(cqe.result(), (*op).userdata),
                        None => {
                            if cqe.result() < 0 {
                                log::error!(
                                    "completion failed: {}",
                                    io::Error::from_raw_os_error(-cqe.result())
                                );
                            }
                        }
                    }

                    if !more {
                        inflight.remove(&addr);
                        if self.debug_alloc {
                            self.live.fetch_sub(1, Ordering::Relaxed);
                        }
                        drop(Box::from_raw(op));
                    }
                }
            }
        }

        let dropped = self.cq.overflow();
        if dropped != 0 {
            log::error!("completion ring overflowed, {} events dropped", dropped);
        }
    }

    /// Consume one pending wake signal off the signal-fd. Raises get
    /// coalesced while pending, so one read clears any burst.
    fn drain_wake(&self) {
        unsafe {
            let mut info: libc::signalfd_siginfo = mem::zeroed();
            libc::read(
                self.sfd.as_raw_fd(),
                &mut info as *mut libc::signalfd_siginfo as *mut c_void,
                mem::size_of::<libc::signalfd_siginfo>(),
            );
        }
    }

    /// Stage a cancel for everything still in flight, so shutdown is not
    /// hostage to a distant timeout. Cancelled callbacks observe
    /// `-ECANCELED` rather than being dropped. Cancel records themselves
    /// are marked so they are never targeted in turn.
    fn cancel_inflight(&self, inflight: &HashSet<u64>, cancelled: &mut HashSet<u64>) {
        for &target in inflight {
            if cancelled.contains(&target) {
                continue;
            }
            let staged = unsafe {
                self.submit_op(
                    Params::Cancel { target },
                    Mode::Async,
                    Some(discard_result),
                    ptr::null_mut(),
                )
            };
            match staged {
                Ok(token) => {
                    cancelled.insert(target);
                    cancelled.insert(token.0);
                }
                Err(_) => {
                    // Staging is full; retried on the next state pass.
                    log::debug!("staging full during shutdown, cancels deferred");
                    break;
                }
            }
        }
    }
}

fn discard_result(_res: i32, _userdata: *mut c_void) {}

impl<const N: usize> Drop for AsyncIo<N> {
    fn drop(&mut self) {
        // Records staged but never flushed are unreachable now; reclaim
        // them before the leak check.
        unsafe {
            while let Some((_, addr)) = self.staging.pop() {
                drop(Box::from_raw(addr as *mut Op));
                if self.debug_alloc {
                    self.live.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        if self.debug_alloc {
            let live = self.live.load(Ordering::Relaxed);
            assert_eq!(live, 0, "{} operation records leaked", live);
        }
    }
}
