//! Ready-queue policies.
//!
//! The switching core only needs "take this ready thread" and "which ready thread runs next";
//! the answer to the second question lives behind [`Scheduler`].

use alloc::collections::{BinaryHeap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::{Ordering, Reverse};

use super::thread::{Thread, thread_print};

pub trait Scheduler: Send {
    /// Take a thread whose status is already `Ready`.
    fn enqueue(&mut self, thread: Arc<Thread>);

    /// Remove and return the thread that should run next, if any.
    fn next(&mut self) -> Option<Arc<Thread>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dump the queued thread names to the console.
    fn print(&self);
}

/// First come, first served.
#[derive(Default)]
pub struct FifoScheduler {
    ready: VecDeque<Arc<Thread>>,
}

impl FifoScheduler {
    pub const fn new() -> Self {
        Self {
            ready: VecDeque::new(),
        }
    }
}

impl Scheduler for FifoScheduler {
    fn enqueue(&mut self, thread: Arc<Thread>) {
        self.ready.push_back(thread);
    }

    fn next(&mut self) -> Option<Arc<Thread>> {
        self.ready.pop_front()
    }

    fn len(&self) -> usize {
        self.ready.len()
    }

    fn print(&self) {
        crate::kprint!("Ready list contents:\n");
        self.ready.iter().for_each(|t| thread_print(t));
        crate::kprintln!();
    }
}

/// Most urgent priority number first; ties keep arrival order.
#[derive(Default)]
pub struct PriorityScheduler {
    ready: BinaryHeap<Reverse<Queued>>,
    arrivals: u64,
}

/// Ordered by (priority, arrival) only; the thread rides along.
struct Queued {
    priority: i32,
    arrival: u64,
    thread: Arc<Thread>,
}

impl Queued {
    fn key(&self) -> (i32, u64) {
        (self.priority, self.arrival)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PriorityScheduler {
    pub const fn new() -> Self {
        Self {
            ready: BinaryHeap::new(),
            arrivals: 0,
        }
    }
}

impl Scheduler for PriorityScheduler {
    fn enqueue(&mut self, thread: Arc<Thread>) {
        let arrival = self.arrivals;
        self.arrivals += 1;

        self.ready.push(Reverse(Queued {
            priority: thread.priority(),
            arrival,
            thread,
        }));
    }

    fn next(&mut self) -> Option<Arc<Thread>> {
        self.ready.pop().map(|Reverse(queued)| queued.thread)
    }

    fn len(&self) -> usize {
        self.ready.len()
    }

    fn print(&self) {
        let mut queued: Vec<&Queued> = self.ready.iter().map(|Reverse(q)| q).collect();
        queued.sort();

        crate::kprint!("Ready list contents:\n");
        queued.iter().for_each(|q| thread_print(&q.thread));
        crate::kprintln!();
    }
}
