//! A concurrency substrate for server applications on Linux: a fixed-pool
//! task executor and a completion-based I/O engine over `io_uring`, glued
//! together by bounded lock-free rings.
//!
//! An I/O completion callback may schedule CPU follow-up work on the
//! [`Executor`] without any user-space polling in between; both sides
//! hand records across threads through the [`ring`] module.
//!
//! Construct a [`Signal`] controller first, then the executor and the
//! [`AsyncIo`] engine, and run [`AsyncIo::event_loop`] on a dedicated
//! thread. Requires Linux 6.8 or newer on x86-64 or aarch64.

mod cqueue;
mod engine;
pub mod executor;
mod opcode;
pub mod ring;
pub mod signal;
mod squeue;
mod sys;
mod util;

pub use engine::{AsyncIo, Builder, Direction, Mode, OpToken, Status, SubmitError, Timespec};
pub use executor::{Callback, CompleteFn, Executor, TaskError, WorkFn};
pub use signal::Signal;
