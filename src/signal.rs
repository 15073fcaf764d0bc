//! Process-wide shutdown latch and worker rendezvous.
//!
//! The latch and the participant counter are necessarily process-global:
//! a signal handler has nowhere else to write. The [`Signal`] handle only
//! guards installation, so a process constructs at most one.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::time::Duration;
use std::{mem, ptr, thread};

use crate::executor::Executor;

/// The wake signal consumed by the engine's signal-fd. Blocked in the
/// process mask at [`Signal::init`] so it never interrupts a thread.
pub const WAKE_SIGNAL: libc::c_int = libc::SIGUSR1;

static LATCHED: AtomicI32 = AtomicI32::new(0);
static PARTICIPANTS: AtomicU32 = AtomicU32::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

// Async-signal-safe: a relaxed store plus kill(2), no allocation, no
// locking, no logging. Diagnostics happen later on the reaper. The kill
// re-raises the (blocked) wake signal so a reaper parked inside
// io_uring_enter notices the latch through its signal-fd no matter which
// thread this handler landed on.
extern "C" fn on_terminate(signum: libc::c_int) {
    LATCHED.store(signum, Ordering::Relaxed);
    unsafe {
        libc::kill(libc::getpid(), WAKE_SIGNAL);
    }
}

/// Latched terminate signal number, 0 when no shutdown is pending.
#[inline]
pub fn pending() -> i32 {
    LATCHED.load(Ordering::Relaxed)
}

/// Send the wake signal to the current process. Which thread it lands on
/// is irrelevant; it is blocked everywhere and consumed via the engine's
/// signal-fd.
pub fn emit_wake() {
    unsafe {
        libc::kill(libc::getpid(), WAKE_SIGNAL);
    }
}

/// Number of workers that have drained and exited.
pub fn participants() -> u32 {
    PARTICIPANTS.load(Ordering::Acquire)
}

pub(crate) fn arrive() {
    PARTICIPANTS.fetch_add(1, Ordering::Release);
}

/// Signal controller handle.
pub struct Signal {
    _private: (),
}

impl Signal {
    /// Install the terminate handler for `SIGINT`/`SIGTERM` and block the
    /// wake signal in the process mask. Call once, before spawning any
    /// executor or reaper thread so they inherit the mask.
    pub fn init() -> io::Result<Signal> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "signal controller is already installed",
            ));
        }

        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = on_terminate as usize;
            sa.sa_flags = 0;
            libc::sigemptyset(&mut sa.sa_mask);

            for sig in &[libc::SIGINT, libc::SIGTERM] {
                if libc::sigaction(*sig, &sa, ptr::null_mut()) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, WAKE_SIGNAL);
            let ret = libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret));
            }
        }

        Ok(Signal { _private: () })
    }

    /// Latch a shutdown programmatically, as if `signum` had been
    /// delivered, and rouse the reaper.
    pub fn latch(&self, signum: i32) {
        LATCHED.store(signum, Ordering::Relaxed);
        emit_wake();
    }

    /// Release parked workers and wait until every one of them has drained
    /// and checked out. The broadcast repeats each round so a worker that
    /// was between its latch check and its park cannot be stranded.
    pub fn terminate<const N: usize>(&self, pool: &Executor<N>) {
        let want = pool.workers() as u32;
        loop {
            pool.wake_all();
            if participants() >= want {
                return;
            }
            thread::sleep(Duration::from_millis(500));
        }
    }
}
