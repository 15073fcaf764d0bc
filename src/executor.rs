//! Fixed-pool task executor.
//!
//! A set of detached worker threads racing on one MPMC ring of task-record
//! addresses. Workers drain until the ring looks empty, then park on a
//! condition variable; the mutex protects no data, it only makes the
//! park/notify handshake reliable. There is no fairness, no ordering and
//! no worker affinity - any worker may take any task.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::{io, thread};

use libc::c_void;
use parking_lot::{Condvar, Mutex};

use crate::ring::Mpmc;
use crate::signal;

/// Pure CPU callback.
pub type WorkFn = fn(userdata: *mut c_void);

/// I/O-completion continuation; the first argument is the kernel result.
pub type CompleteFn = fn(result: i32, userdata: *mut c_void);

/// The task payload: either plain CPU work or an I/O-completion
/// continuation carried over from the engine.
#[derive(Clone, Copy)]
pub enum Callback {
    Work(WorkFn),
    Complete(CompleteFn),
}

pub(crate) struct Task {
    callback: Callback,
    userdata: *mut c_void,
    result: Option<i32>,
}

impl Task {
    fn run(&self) {
        match self.callback {
            Callback::Work(f) => f(self.userdata),
            Callback::Complete(f) => f(self.result.unwrap_or(0), self.userdata),
        }
    }
}

/// Task submission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// The task ring is full.
    Overflow,
    /// Shutdown is latched; the pool is draining.
    Draining,
}

impl Display for TaskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Overflow => f.write_str("task queue is full"),
            TaskError::Draining => f.write_str("executor is draining"),
        }
    }
}

impl std::error::Error for TaskError {}

struct Inner<const N: usize> {
    queue: Mpmc<N>,
    /// Advisory gauge of queued records; the parking predicate.
    pending: AtomicU32,
    park_lock: Mutex<()>,
    park_cond: Condvar,
    workers: usize,
    debug_alloc: bool,
    live: AtomicUsize,
}

/// Fixed thread-pool executor over an MPMC ring of `N` task records.
pub struct Executor<const N: usize> {
    inner: Arc<Inner<N>>,
}

impl<const N: usize> Clone for Executor<N> {
    fn clone(&self) -> Executor<N> {
        Executor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<const N: usize> Executor<N> {
    /// Spawn the pool. `workers` defaults to the number of online logical
    /// CPUs; zero is rejected. With `debug_alloc`, live task records are
    /// counted and a leak at teardown panics.
    pub fn new(workers: Option<usize>, debug_alloc: bool) -> io::Result<Executor<N>> {
        let workers = match workers {
            Some(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "worker count must be non-zero",
                ))
            }
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let inner = Arc::new(Inner {
            queue: Mpmc::new(),
            pending: AtomicU32::new(0),
            park_lock: Mutex::new(()),
            park_cond: Condvar::new(),
            workers,
            debug_alloc,
            live: AtomicUsize::new(0),
        });

        for i in 0..workers {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("riptide-worker-{}", i))
                .spawn(move || tick(&inner))?;
        }

        Ok(Executor { inner })
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Enqueue a task record and wake a parked worker.
    ///
    /// `result` is attached by the I/O engine when the record continues a
    /// completion; plain CPU submissions pass `None`.
    ///
    /// # Safety
    ///
    /// `userdata` must stay valid until the callback has run, on whichever
    /// worker thread takes it.
    pub unsafe fn submit(
        &self,
        callback: Callback,
        userdata: *mut c_void,
        result: Option<i32>,
    ) -> Result<(), TaskError> {
        let inner = &*self.inner;

        if signal::pending() != 0 {
            return Err(TaskError::Draining);
        }

        let record = Box::into_raw(Box::new(Task {
            callback,
            userdata,
            result,
        }));
        if inner.debug_alloc {
            inner.live.fetch_add(1, Ordering::Relaxed);
        }

        // Gauge goes up before the slot so a popping worker never sees the
        // count below the queue contents.
        inner.pending.fetch_add(1, Ordering::Release);
        if inner.queue.push(record as usize).is_none() {
            inner.pending.fetch_sub(1, Ordering::Release);
            if inner.debug_alloc {
                inner.live.fetch_sub(1, Ordering::Relaxed);
            }
            drop(Box::from_raw(record));
            return Err(TaskError::Overflow);
        }

        // Notify under the parking mutex: a worker that read the gauge as
        // zero is either still holding the lock (and will re-read) or
        // already waiting (and will hear this).
        let _guard = inner.park_lock.lock();
        inner.park_cond.notify_one();
        Ok(())
    }

    pub(crate) fn wake_all(&self) {
        let _guard = self.inner.park_lock.lock();
        self.inner.park_cond.notify_all();
    }
}

/// Worker loop: drain, check the latch, park.
fn tick<const N: usize>(inner: &Inner<N>) {
    loop {
        while let Some((_, addr)) = inner.queue.pop() {
            inner.pending.fetch_sub(1, Ordering::Release);
            let task = unsafe { Box::from_raw(addr as *mut Task) };
            task.run();
            if inner.debug_alloc {
                inner.live.fetch_sub(1, Ordering::Relaxed);
            }
        }

        if signal::pending() != 0 {
            signal::arrive();
            return;
        }

        let mut guard = inner.park_lock.lock();
        if inner.pending.load(Ordering::Acquire) == 0 && signal::pending() == 0 {
            inner.park_cond.wait(&mut guard);
        }
    }
}

impl<const N: usize> Drop for Inner<N> {
    fn drop(&mut self) {
        // Last reference: every worker has exited. Anything still queued
        // was never taken; reclaim it before the leak check.
        while let Some((_, addr)) = self.queue.pop() {
            unsafe {
                drop(Box::from_raw(addr as *mut Task));
            }
            if self.debug_alloc {
                self.live.fetch_sub(1, Ordering::Relaxed);
            }
        }

        if self.debug_alloc {
            let live = self.live.load(Ordering::Relaxed);
            assert_eq!(live, 0, "{} task records leaked", live);
        }
    }
}
