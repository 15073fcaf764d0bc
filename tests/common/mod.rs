#![allow(dead_code)]

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use libc::c_void;
use parking_lot::Mutex;

/// Whether the running kernel is new enough for the engine. Engine tests
/// skip quietly on older CI kernels.
pub fn uring_supported() -> bool {
    let uts = nix::sys::utsname::uname();
    let mut parts = uts.release().split(|ch: char| !ch.is_ascii_digit());
    let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (major, minor) >= (6, 8)
}

/// Completion observer handed to callbacks through the userdata pointer.
#[derive(Default)]
pub struct Probe {
    pub hits: AtomicU32,
    pub last: AtomicI32,
    pub results: Mutex<Vec<i32>>,
}

impl Probe {
    pub fn new() -> Probe {
        Probe::default()
    }

    pub fn userdata(&self) -> *mut c_void {
        self as *const Probe as *mut c_void
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::Acquire)
    }

    pub fn last(&self) -> i32 {
        self.last.load(Ordering::Acquire)
    }
}

/// The callback shape the engine and executor dispatch: records the
/// result into the [`Probe`] behind `userdata`.
pub fn observe(result: i32, userdata: *mut c_void) {
    let probe = unsafe { &*(userdata as *const Probe) };
    probe.results.lock().push(result);
    probe.last.store(result, Ordering::Release);
    probe.hits.fetch_add(1, Ordering::Release);
}
