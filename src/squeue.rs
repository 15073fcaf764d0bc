//! Submission queue: decoded pointers into the shared ring mapping.
//!
//! Single-issuer discipline. Only the reaper thread stages and publishes
//! entries; the local tail is read with a plain load and published with a
//! release store the kernel's submission side acquires.

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{self, AtomicU32, Ordering};

use crate::sys;
use crate::util::{unsync_load, Mmap};

bitflags::bitflags! {
    /// Per-submission sqe flags.
    pub struct Flags: u8 {
        /// Drain the queue before this entry runs.
        const IO_DRAIN = sys::IOSQE_IO_DRAIN;

        /// Chain the next entry to this one.
        const IO_LINK = sys::IOSQE_IO_LINK;

        /// Always issue from async context.
        const ASYNC = sys::IOSQE_ASYNC;
    }
}

pub(crate) struct SubmissionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    ring_mask: u32,
    ring_entries: u32,
    flags: *const AtomicU32,
    array: *mut u32,
    sqes: *mut sys::io_uring_sqe,
}

unsafe impl Send for SubmissionQueue {}
unsafe impl Sync for SubmissionQueue {}

impl SubmissionQueue {
    #[rustfmt::skip]
    pub(crate) unsafe fn new(
        sq_mmap: &Mmap,
        sqe_mmap: &Mmap,
        p: &sys::io_uring_params,
    ) -> SubmissionQueue {
        let head         = sq_mmap.offset(p.sq_off.head        ) as *const AtomicU32;
        let tail         = sq_mmap.offset(p.sq_off.tail        ) as *const AtomicU32;
        let ring_mask    = sq_mmap.offset(p.sq_off.ring_mask   ).cast::<u32>().read();
        let ring_entries = sq_mmap.offset(p.sq_off.ring_entries).cast::<u32>().read();
        let flags        = sq_mmap.offset(p.sq_off.flags       ) as *const AtomicU32;
        let array        = sq_mmap.offset(p.sq_off.array       ) as *mut u32;

        let sqes = sqe_mmap.as_mut_ptr() as *mut sys::io_uring_sqe;

        SubmissionQueue {
            head,
            tail,
            ring_mask,
            ring_entries,
            flags,
            array,
            sqes,
        }
    }

    /// Whether the kernel submission thread has gone to sleep and needs an
    /// `IORING_ENTER_SQ_WAKEUP` nudge.
    #[inline]
    pub(crate) fn need_wakeup(&self) -> bool {
        atomic::fence(Ordering::SeqCst);
        unsafe {
            (*self.flags).load(Ordering::Relaxed) & sys::IORING_SQ_NEED_WAKEUP != 0
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.ring_entries as usize
    }

    /// Entries staged but not yet consumed by the kernel.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        unsafe {
            let head = (*self.head).load(Ordering::Acquire);
            unsync_load(self.tail).wrapping_sub(head) as usize
        }
    }

    /// The issuer's view of the tail cursor.
    #[inline]
    pub(crate) unsafe fn local_tail(&self) -> u32 {
        unsync_load(self.tail)
    }

    /// Write `entry` into the sqe slot for `tail` and record its index in
    /// the dispatch array. Not visible to the kernel until published.
    pub(crate) unsafe fn stage(&self, tail: u32, entry: &Entry) {
        let slot = tail & self.ring_mask;
        *self.sqes.add(slot as usize) = entry.0;
        *self.array.add(slot as usize) = slot;
    }

    /// Publish every staged entry up to (excluding) `tail`.
    #[inline]
    pub(crate) unsafe fn publish(&self, tail: u32) {
        (*self.tail).store(tail, Ordering::Release);
    }
}

/// A prepared 64-byte submission queue entry.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Entry(pub(crate) sys::io_uring_sqe);

impl Entry {
    /// Set the submission's [flags](Flags).
    #[inline]
    pub fn flags(mut self, flags: Flags) -> Entry {
        self.0.flags |= flags.bits();
        self
    }

    /// Set the user data passed through to the matching completion.
    #[inline]
    pub fn user_data(mut self, user_data: u64) -> Entry {
        self.0.user_data = user_data;
        self
    }
}

impl Debug for Entry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("op_code", &self.0.opcode)
            .field("flags", &self.0.flags)
            .field("user_data", &self.0.user_data)
            .finish()
    }
}
