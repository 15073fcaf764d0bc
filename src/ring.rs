//! Bounded lock-free rings for cross-thread handoff.
//!
//! Three producer/consumer disciplines over one storage layout: a fixed
//! power-of-two array of machine-word slots plus two `u32` cursors. A slot
//! value of 0 means empty; any non-zero value is a live payload, in
//! practice the address of a heap record. The cursors only exist to cut
//! down linear probing - the slot itself is the synchronization point, and
//! cursor updates are advisory hints that may lag or overshoot.
//!
//! None of the variants preserve FIFO order under contention. Callers that
//! need ordering enforce it at a higher layer.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

struct Slots<const N: usize> {
    cells: [AtomicUsize; N],
    head: AtomicU32,
    tail: AtomicU32,
}

impl<const N: usize> Slots<N> {
    const MASK: u32 = (N - 1) as u32;

    const VALID: () = assert!(
        N.is_power_of_two() && N <= (u32::MAX as usize),
        "ring capacity must be a power of two"
    );

    fn new() -> Slots<N> {
        #[allow(clippy::let_unit_value)]
        let _ = Self::VALID;

        Slots {
            cells: std::array::from_fn(|_| AtomicUsize::new(0)),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    #[inline]
    fn cell(&self, cursor: u32) -> (u32, &AtomicUsize) {
        let slot = cursor & Self::MASK;
        (slot, &self.cells[slot as usize])
    }

    #[inline]
    fn advance(cursor: &AtomicU32, seen: u32) {
        // Best effort; a lost race means somebody else already moved it.
        let _ = cursor.compare_exchange(
            seen,
            seen.wrapping_add(1),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Multi-producer publish: claim the first empty slot at or after the
    /// head hint with a CAS from 0.
    fn push_mp(&self, entry: usize) -> Option<u32> {
        debug_assert_ne!(entry, 0, "0 is the empty sentinel");

        let mut probed = 0;
        while probed < N {
            let head = self.head.load(Ordering::Relaxed);
            let (slot, cell) = self.cell(head);
            match cell.compare_exchange(0, entry, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => {
                    Self::advance(&self.head, head);
                    return Some(slot);
                }
                Err(_) => {
                    probed += 1;
                    Self::advance(&self.head, head);
                }
            }
        }

        None
    }

    /// Single-producer publish: plain load/store, no CAS.
    ///
    /// # Safety
    ///
    /// At most one thread may push concurrently.
    unsafe fn push_sp(&self, entry: usize) -> Option<u32> {
        debug_assert_ne!(entry, 0, "0 is the empty sentinel");

        let mut head = self.head.load(Ordering::Relaxed);
        for _ in 0..N {
            let (slot, cell) = self.cell(head);
            if cell.load(Ordering::Relaxed) == 0 {
                cell.store(entry, Ordering::Release);
                self.head.store(head.wrapping_add(1), Ordering::Relaxed);
                return Some(slot);
            }
            head = head.wrapping_add(1);
        }

        None
    }

    /// Multi-consumer extraction, two steps per slot: observe a non-zero
    /// value (a CAS of 0 over 0 whose failure reveals it), then claim it
    /// with a CAS back to 0. Losing step two means a racing consumer took
    /// the entry; that is forward progress, so the give-up counter resets
    /// and only consecutive empty probes count toward it.
    fn pop_mc(&self) -> Option<(u32, usize)> {
        let mut empty_probes = 0;
        while empty_probes < N {
            let tail = self.tail.load(Ordering::Relaxed);
            let (slot, cell) = self.cell(tail);
            match cell.compare_exchange(0, 0, Ordering::Acquire, Ordering::Acquire) {
                Ok(_) => {
                    empty_probes += 1;
                    Self::advance(&self.tail, tail);
                }
                Err(value) => {
                    if cell
                        .compare_exchange(value, 0, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        Self::advance(&self.tail, tail);
                        return Some((slot, value));
                    }
                    empty_probes = 0;
                    Self::advance(&self.tail, tail);
                }
            }
        }

        None
    }

    /// Single-consumer extraction: plain load/store, no CAS.
    ///
    /// # Safety
    ///
    /// At most one thread may pop concurrently.
    unsafe fn pop_sc(&self) -> Option<(u32, usize)> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        for _ in 0..N {
            let (slot, cell) = self.cell(tail);
            let value = cell.load(Ordering::Acquire);
            if value != 0 {
                cell.store(0, Ordering::Release);
                self.tail.store(tail.wrapping_add(1), Ordering::Relaxed);
                return Some((slot, value));
            }
            tail = tail.wrapping_add(1);
        }

        None
    }
}

/// Single-producer multi-consumer ring.
pub struct Spmc<const N: usize>(Slots<N>);

/// Multi-producer single-consumer ring.
pub struct Mpsc<const N: usize>(Slots<N>);

/// Multi-producer multi-consumer ring.
pub struct Mpmc<const N: usize>(Slots<N>);

impl<const N: usize> Spmc<N> {
    pub fn new() -> Spmc<N> {
        Spmc(Slots::new())
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Attempt to place `entry` in the next empty slot. Returns the chosen
    /// slot index, or `None` when the ring is full.
    ///
    /// # Safety
    ///
    /// Single-producer side: at most one thread may call `push` at a time.
    pub unsafe fn push(&self, entry: usize) -> Option<u32> {
        self.0.push_sp(entry)
    }

    /// Attempt to extract an entry. Returns `(slot, payload)`, or `None`
    /// when the ring is empty.
    pub fn pop(&self) -> Option<(u32, usize)> {
        self.0.pop_mc()
    }
}

impl<const N: usize> Mpsc<N> {
    pub fn new() -> Mpsc<N> {
        Mpsc(Slots::new())
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Attempt to place `entry` in the next empty slot. Returns the chosen
    /// slot index, or `None` when the ring is full.
    pub fn push(&self, entry: usize) -> Option<u32> {
        self.0.push_mp(entry)
    }

    /// Attempt to extract an entry. Returns `(slot, payload)`, or `None`
    /// when the ring is empty.
    ///
    /// # Safety
    ///
    /// Single-consumer side: at most one thread may call `pop` at a time.
    pub unsafe fn pop(&self) -> Option<(u32, usize)> {
        self.0.pop_sc()
    }
}

impl<const N: usize> Mpmc<N> {
    pub fn new() -> Mpmc<N> {
        Mpmc(Slots::new())
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Attempt to place `entry` in the next empty slot. Returns the chosen
    /// slot index, or `None` when the ring is full.
    pub fn push(&self, entry: usize) -> Option<u32> {
        self.0.push_mp(entry)
    }

    /// Attempt to extract an entry. Returns `(slot, payload)`, or `None`
    /// when the ring is empty.
    pub fn pop(&self) -> Option<(u32, usize)> {
        self.0.pop_mc()
    }
}

impl<const N: usize> Default for Spmc<N> {
    fn default() -> Spmc<N> {
        Spmc::new()
    }
}

impl<const N: usize> Default for Mpsc<N> {
    fn default() -> Mpsc<N> {
        Mpsc::new()
    }
}

impl<const N: usize> Default for Mpmc<N> {
    fn default() -> Mpmc<N> {
        Mpmc::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_then_drain() {
        let ring = Mpmc::<8>::new();

        for i in 1..=8usize {
            assert!(ring.push(i).is_some());
        }
        assert_eq!(ring.push(9), None, "full ring must refuse");

        let mut seen = Vec::new();
        while let Some((_, v)) = ring.pop() {
            seen.push(v);
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=8).collect::<Vec<_>>());
        assert_eq!(ring.pop(), None, "empty ring must refuse");
    }

    #[test]
    fn balanced_ops_leave_empty_slots() {
        let ring = Mpmc::<4>::new();

        for round in 0..16usize {
            for i in 0..4 {
                ring.push(round * 4 + i + 1).unwrap();
            }
            for _ in 0..4 {
                ring.pop().unwrap();
            }
        }

        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn spsc_disciplines() {
        let ring = Mpsc::<4>::new();
        assert_eq!(ring.push(7), Some(0));
        unsafe {
            assert_eq!(ring.pop(), Some((0, 7)));
            assert_eq!(ring.pop(), None);
        }

        let ring = Spmc::<4>::new();
        unsafe {
            assert_eq!(ring.push(7), Some(0));
        }
        assert_eq!(ring.pop(), Some((0, 7)));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn wrapping_reuse() {
        let ring = Mpsc::<2>::new();

        for i in 1..=100usize {
            assert!(ring.push(i).is_some());
            let (_, v) = unsafe { ring.pop() }.unwrap();
            assert_eq!(v, i);
        }
    }
}
