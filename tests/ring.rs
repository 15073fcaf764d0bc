//! Concurrency invariants of the three ring variants: nothing popped that
//! was not pushed, nothing popped twice, bounded capacity respected.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use riptide::ring::{Mpmc, Mpsc, Spmc};

const PER_PRODUCER: usize = 10_000;

/// Push with retry; overflow just means the consumers are behind.
fn push_all<F: Fn(usize) -> Option<u32>>(push: F, values: std::ops::Range<usize>) {
    for v in values {
        loop {
            if push(v).is_some() {
                break;
            }
            thread::yield_now();
        }
    }
}

#[test]
fn mpmc_no_duplication_no_invention() {
    let ring = Arc::new(Mpmc::<1024>::new());
    let popped = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let producers = 4;
    let consumers = 4;
    let total = producers * PER_PRODUCER;

    let mut handles = Vec::new();
    for p in 0..producers {
        let ring = Arc::clone(&ring);
        handles.push(thread::spawn(move || {
            // Disjoint value ranges so duplicates are detectable.
            let base = p * PER_PRODUCER + 1;
            push_all(|v| ring.push(v), base..base + PER_PRODUCER);
        }));
    }

    let mut takers = Vec::new();
    for _ in 0..consumers {
        let ring = Arc::clone(&ring);
        let popped = Arc::clone(&popped);
        let done = Arc::clone(&done);
        takers.push(thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                match ring.pop() {
                    Some((_, v)) => {
                        seen.push(v);
                        popped.fetch_add(1, Ordering::AcqRel);
                    }
                    None => {
                        if done.load(Ordering::Acquire) && popped.load(Ordering::Acquire) >= total
                        {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }
            seen
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let mut all = Vec::new();
    for t in takers {
        all.extend(t.join().unwrap());
    }

    assert_eq!(all.len(), total, "every push must be popped exactly once");
    let unique: HashSet<usize> = all.iter().copied().collect();
    assert_eq!(unique.len(), total, "a payload was popped twice");
    assert!(unique.iter().all(|&v| (1..=total).contains(&v)));
    assert_eq!(ring.pop(), None, "ring must end empty");
}

#[test]
fn mpsc_single_consumer_sees_everything() {
    let ring = Arc::new(Mpsc::<256>::new());
    let producers = 4;
    let total = producers * PER_PRODUCER;

    let mut handles = Vec::new();
    for p in 0..producers {
        let ring = Arc::clone(&ring);
        handles.push(thread::spawn(move || {
            let base = p * PER_PRODUCER + 1;
            push_all(|v| ring.push(v), base..base + PER_PRODUCER);
        }));
    }

    let mut seen = HashSet::new();
    while seen.len() < total {
        // Sole consumer on this thread.
        match unsafe { ring.pop() } {
            Some((_, v)) => {
                assert!(seen.insert(v), "duplicate payload {}", v);
            }
            None => thread::yield_now(),
        }
    }

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(unsafe { ring.pop() }, None);
}

#[test]
fn spmc_consumers_split_the_stream() {
    let ring = Arc::new(Spmc::<256>::new());
    let popped = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let total = 2 * PER_PRODUCER;

    let mut takers = Vec::new();
    for _ in 0..3 {
        let ring = Arc::clone(&ring);
        let popped = Arc::clone(&popped);
        let done = Arc::clone(&done);
        takers.push(thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                match ring.pop() {
                    Some((_, v)) => {
                        seen.push(v);
                        popped.fetch_add(1, Ordering::AcqRel);
                    }
                    None => {
                        if done.load(Ordering::Acquire) && popped.load(Ordering::Acquire) >= total
                        {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }
            seen
        }));
    }

    // Sole producer on this thread.
    push_all(|v| unsafe { ring.push(v) }, 1..total + 1);
    done.store(true, Ordering::Release);

    let mut all = Vec::new();
    for t in takers {
        all.extend(t.join().unwrap());
    }

    let unique: HashSet<usize> = all.iter().copied().collect();
    assert_eq!(all.len(), total);
    assert_eq!(unique.len(), total);
    assert_eq!(ring.pop(), None);
}

#[test]
fn bounded_capacity() {
    let ring = Mpmc::<16>::new();

    // With no concurrent pops, N pushes all land.
    for v in 1..=16usize {
        assert!(ring.push(v).is_some(), "push {} of 16 failed", v);
    }
    assert_eq!(ring.push(17), None);

    // One slot freed, one push admitted again.
    assert!(ring.pop().is_some());
    assert!(ring.push(17).is_some());
    assert_eq!(ring.push(18), None);
}
