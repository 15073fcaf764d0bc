#![allow(clippy::new_without_default, dead_code)]

//! Builders for the supported submission opcodes.
//!
//! Every builder zeroes the sqe and fills only the fields its opcode
//! reads. Pointer parameters are raw on purpose: the engine guarantees
//! the pointed-to storage lives until the terminal completion, either by
//! owning it inside the operation record or by contract with the caller.

use std::os::unix::io::RawFd;

use crate::squeue::Entry;
use crate::sys;

pub use crate::sys::__kernel_timespec as Timespec;

macro_rules! opcode {
    (
        $( #[$outer:meta] )*
        pub struct $name:ident {
            $( #[$new_meta:meta] )*
            $( $field:ident : $tname:ty ),* $(,)?
            ;;
            $(
                $( #[$opt_meta:meta] )*
                $opt_field:ident : $opt_tname:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $( #[$outer] )*
        pub struct $name {
            $( $field : $tname, )*
            $( $opt_field : $opt_tname, )*
        }

        impl $name {
            $( #[$new_meta] )*
            pub const fn new( $( $field : $tname ),* ) -> Self {
                $name {
                    $( $field , )*
                    $( $opt_field: $default, )*
                }
            }

            $(
                $( #[$opt_meta] )*
                pub const fn $opt_field(mut self, $opt_field: $opt_tname) -> Self {
                    self.$opt_field = $opt_field;
                    self
                }
            )*
        }
    }
}

opcode!(
    /// Do not perform any I/O; completes immediately.
    #[derive(Debug)]
    pub struct Nop { ;; }
);

impl Nop {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_NOP;
        sqe.fd = -1;
        Entry(sqe)
    }
}

opcode!(
    /// Poll `fd` for the events in `mask`.
    ///
    /// In multi-shot form the poll stays armed and produces a completion
    /// every time the mask fires, until a terminal completion without
    /// `F_MORE`.
    #[derive(Debug)]
    pub struct PollAdd {
        fd: RawFd,
        mask: u32,
        ;;
        multi: bool = false
    }
);

impl PollAdd {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_POLL_ADD;
        sqe.fd = self.fd;
        if self.multi {
            sqe.len = sys::IORING_POLL_ADD_MULTI;
        }
        sqe.op_flags = self.mask;
        Entry(sqe)
    }
}

opcode!(
    /// Relative timeout measured on the boottime clock, so suspend time
    /// counts. Pure expiry completes with `-ETIME`.
    #[derive(Debug)]
    pub struct Timeout {
        timespec: *const Timespec,
        ;;
        /// Completion event count that also satisfies the timeout before
        /// it expires; 0 waits for expiry alone.
        count: u32 = 0,
        flags: u32 = sys::IORING_TIMEOUT_BOOTTIME
    }
);

impl Timeout {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_TIMEOUT;
        sqe.fd = 0;
        sqe.addr = self.timespec as u64;
        // One timespec; the kernel insists on exactly 1 here.
        sqe.len = 1;
        sqe.off = self.count as u64;
        sqe.op_flags = self.flags;
        Entry(sqe)
    }
}

opcode!(
    /// Multi-shot accept on a listening socket. Each completion carries a
    /// connected descriptor in the result.
    #[derive(Debug)]
    pub struct Accept {
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        ;;
        flags: u32 = 0
    }
);

impl Accept {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_ACCEPT;
        sqe.fd = self.fd;
        sqe.addr = self.addr as u64;
        sqe.off = self.addrlen as u64;
        sqe.op_flags = self.flags;
        sqe.ioprio = sys::IORING_ACCEPT_MULTISHOT;
        Entry(sqe)
    }
}

opcode!(
    /// `shutdown(2)` on a socket; `how` picks the half to close.
    #[derive(Debug)]
    pub struct Shutdown {
        fd: RawFd,
        how: i32,
        ;;
    }
);

impl Shutdown {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_SHUTDOWN;
        sqe.fd = self.fd;
        sqe.len = self.how as u32;
        Entry(sqe)
    }
}

opcode!(
    /// Open by absolute path. The dirfd slot stays zero, so relative
    /// paths are not supported.
    #[derive(Debug)]
    pub struct OpenAt {
        path: *const libc::c_char,
        ;;
        flags: i32 = 0,
        mode: libc::mode_t = 0
    }
);

impl OpenAt {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_OPENAT;
        sqe.fd = 0;
        sqe.addr = self.path as u64;
        sqe.len = self.mode;
        sqe.op_flags = self.flags as u32;
        Entry(sqe)
    }
}

opcode!(
    /// Close a descriptor.
    #[derive(Debug)]
    pub struct Close {
        fd: RawFd,
        ;;
    }
);

impl Close {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_CLOSE;
        sqe.fd = self.fd;
        Entry(sqe)
    }
}

opcode!(
    /// `send(2)` on a connected socket.
    #[derive(Debug)]
    pub struct Send {
        fd: RawFd,
        buf: *const u8,
        len: u32,
        ;;
        flags: i32 = 0
    }
);

impl Send {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_SEND;
        sqe.fd = self.fd;
        sqe.addr = self.buf as u64;
        sqe.len = self.len;
        sqe.op_flags = self.flags as u32;
        Entry(sqe)
    }
}

opcode!(
    /// `recv(2)` on a connected socket. Arms poll first instead of
    /// attempting the receive eagerly.
    #[derive(Debug)]
    pub struct Recv {
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        ;;
        flags: i32 = 0
    }
);

impl Recv {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_RECV;
        sqe.fd = self.fd;
        sqe.addr = self.buf as u64;
        sqe.len = self.len;
        sqe.op_flags = self.flags as u32;
        sqe.ioprio = sys::IORING_RECVSEND_POLL_FIRST;
        Entry(sqe)
    }
}

opcode!(
    /// Positional read, like `pread(2)`.
    #[derive(Debug)]
    pub struct Read {
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        ;;
        offset: u64 = 0
    }
);

impl Read {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_READ;
        sqe.fd = self.fd;
        sqe.addr = self.buf as u64;
        sqe.len = self.len;
        sqe.off = self.offset;
        Entry(sqe)
    }
}

opcode!(
    /// Positional write, like `pwrite(2)`.
    #[derive(Debug)]
    pub struct Write {
        fd: RawFd,
        buf: *const u8,
        len: u32,
        ;;
        offset: u64 = 0
    }
);

impl Write {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_WRITE;
        sqe.fd = self.fd;
        sqe.addr = self.buf as u64;
        sqe.len = self.len;
        sqe.off = self.offset;
        Entry(sqe)
    }
}

opcode!(
    /// `statx(2)` by absolute path into a caller-owned output buffer.
    #[derive(Debug)]
    pub struct Statx {
        path: *const libc::c_char,
        statxbuf: *mut libc::statx,
        ;;
        flags: i32 = 0,
        mask: u32 = 0
    }
);

impl Statx {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_STATX;
        sqe.fd = 0;
        sqe.addr = self.path as u64;
        sqe.off = self.statxbuf as u64;
        sqe.len = self.mask;
        sqe.op_flags = self.flags as u32;
        Entry(sqe)
    }
}

opcode!(
    /// Cancel the in-flight submission whose user data matches.
    ///
    /// The cancelled operation completes with `-ECANCELED`; this entry
    /// completes with 0 on success or `-ENOENT` when nothing matched.
    #[derive(Debug)]
    pub struct AsyncCancel {
        user_data: u64,
        ;;
    }
);

impl AsyncCancel {
    pub fn build(self) -> Entry {
        let mut sqe = sys::io_uring_sqe::default();
        sqe.opcode = sys::IORING_OP_ASYNC_CANCEL;
        sqe.fd = -1;
        sqe.addr = self.user_data;
        Entry(sqe)
    }
}
