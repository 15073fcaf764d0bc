//! Completion queue: decoded pointers into the shared ring mapping.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::sys;
use crate::util::{unsync_load, Mmap};

pub(crate) struct CompletionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    ring_mask: u32,
    ring_entries: u32,
    overflow: *const AtomicU32,
    cqes: *const sys::io_uring_cqe,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    #[rustfmt::skip]
    pub(crate) unsafe fn new(cq_mmap: &Mmap, p: &sys::io_uring_params) -> CompletionQueue {
        let head         = cq_mmap.offset(p.cq_off.head        ) as *const AtomicU32;
        let tail         = cq_mmap.offset(p.cq_off.tail        ) as *const AtomicU32;
        let ring_mask    = cq_mmap.offset(p.cq_off.ring_mask   ).cast::<u32>().read();
        let ring_entries = cq_mmap.offset(p.cq_off.ring_entries).cast::<u32>().read();
        let overflow     = cq_mmap.offset(p.cq_off.overflow    ) as *const AtomicU32;
        let cqes         = cq_mmap.offset(p.cq_off.cqes        ) as *const sys::io_uring_cqe;

        CompletionQueue {
            head,
            tail,
            ring_mask,
            ring_entries,
            overflow,
            cqes,
        }
    }

    /// Completion events the kernel dropped on CQ overflow.
    pub(crate) fn overflow(&self) -> u32 {
        unsafe { (*self.overflow).load(Ordering::Acquire) }
    }

    #[allow(dead_code)]
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.ring_entries as usize
    }

    /// Pop the next completion, if any. Single-issuer: the head cursor is
    /// only ever advanced from here.
    pub(crate) unsafe fn next(&self) -> Option<Entry> {
        let head = unsync_load(self.head);
        let tail = (*self.tail).load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let cqe = *self.cqes.add((head & self.ring_mask) as usize);
        (*self.head).store(head.wrapping_add(1), Ordering::Release);
        Some(Entry(cqe))
    }
}

/// An entry in the completion queue.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Entry(pub(crate) sys::io_uring_cqe);

impl Entry {
    /// The operation-specific result code; negative values carry an
    /// errno.
    #[inline]
    pub fn result(&self) -> i32 {
        self.0.res
    }

    /// The user data set on the matching submission.
    #[inline]
    pub fn user_data(&self) -> u64 {
        self.0.user_data
    }

    /// Completion metadata flags.
    #[allow(dead_code)]
    #[inline]
    pub fn flags(&self) -> u32 {
        self.0.flags
    }

    /// Whether more completions from the same multi-shot submission are
    /// expected.
    #[inline]
    pub fn more(&self) -> bool {
        self.0.flags & sys::IORING_CQE_F_MORE != 0
    }
}
