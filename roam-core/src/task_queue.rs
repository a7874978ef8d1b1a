//
// task_queue.rs - Cooperative task queue adapter (§4.6, §5, design notes)
//
// Purpose:
//   Models the deferred-work contract the design notes describe as a min-heap of
//   (deadline, payload): the IP Manager posts seek-chain ticks here with a delay instead of
//   blocking, and the owning event loop drains whatever is due on each iteration. Each
//   scheduled chain also carries a `CancellationToken` so a client/entry deletion can drop
//   it eagerly instead of waiting for its next self-check.
//

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::Ipv6Addr;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekKind {
    /// Local neighbor discovery chain (`ns_task`).
    Ns,
    /// Peer intercom discovery chain (`seek_task`).
    Peer,
}

struct Scheduled {
    deadline: Instant,
    addr: Ipv6Addr,
    kind: SeekKind,
    token: CancellationToken,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we want the earliest deadline on top.
        other.deadline.cmp(&self.deadline)
    }
}

#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Scheduled>,
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue::default()
    }

    pub fn schedule(&mut self, deadline: Instant, addr: Ipv6Addr, kind: SeekKind, token: CancellationToken) {
        self.heap.push(Scheduled { deadline, addr, kind, token });
    }

    /// Earliest pending deadline, for the owning loop to `sleep_until`.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|s| s.deadline)
    }

    /// Pops every task whose deadline has passed. Cancelled tasks are popped (and dropped)
    /// too rather than re-surfacing on a later call.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(Ipv6Addr, SeekKind, CancellationToken)> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let s = self.heap.pop().unwrap();
            due.push((s.addr, s.kind, s.token));
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
