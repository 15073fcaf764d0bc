#![allow(clippy::missing_safety_doc)]

//! Raw `io_uring` syscalls.
//!
//! Both entry points go through the literal syscall numbers; there is no
//! liburing in between. The default path uses `libc::syscall`, the
//! `direct-syscall` feature swaps in `sc` to bypass libc entirely.

mod sys;

pub use sys::*;

use std::io;

use libc::{c_int, c_long, c_uint};

// Kernel _NSIG; io_uring_enter validates the sigset size argument against it.
const NSIG: usize = 64;

#[cfg(not(feature = "direct-syscall"))]
pub unsafe fn io_uring_setup(entries: c_uint, p: *mut io_uring_params) -> io::Result<c_int> {
    let ret = libc::syscall(
        libc::SYS_io_uring_setup,
        entries as c_long,
        p as c_long,
    );
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as c_int)
    }
}

#[cfg(feature = "direct-syscall")]
pub unsafe fn io_uring_setup(entries: c_uint, p: *mut io_uring_params) -> io::Result<c_int> {
    let ret = sc::syscall2(
        libc::SYS_io_uring_setup as usize,
        entries as usize,
        p as usize,
    ) as isize;
    if ret < 0 {
        Err(io::Error::from_raw_os_error(-ret as i32))
    } else {
        Ok(ret as c_int)
    }
}

#[cfg(not(feature = "direct-syscall"))]
pub unsafe fn io_uring_enter(
    fd: c_int,
    to_submit: c_uint,
    min_complete: c_uint,
    flags: c_uint,
) -> io::Result<c_int> {
    // The last two arguments are the optional sigset and its size; the
    // engine never masks signals across enter, so they stay null/NSIG/8.
    let ret = libc::syscall(
        libc::SYS_io_uring_enter,
        fd as c_long,
        to_submit as c_long,
        min_complete as c_long,
        flags as c_long,
        0 as c_long,
        (NSIG / 8) as c_long,
    );
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as c_int)
    }
}

#[cfg(feature = "direct-syscall")]
pub unsafe fn io_uring_enter(
    fd: c_int,
    to_submit: c_uint,
    min_complete: c_uint,
    flags: c_uint,
) -> io::Result<c_int> {
    let ret = sc::syscall6(
        libc::SYS_io_uring_enter as usize,
        fd as usize,
        to_submit as usize,
        min_complete as usize,
        flags as usize,
        0,
        NSIG / 8,
    ) as isize;
    if ret < 0 {
        Err(io::Error::from_raw_os_error(-ret as i32))
    } else {
        Ok(ret as c_int)
    }
}
