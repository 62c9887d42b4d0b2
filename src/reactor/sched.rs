//! Fair-share scheduling of ready descriptors.
//!
//! The schedule is a pair of intrusive lists over a preallocated,
//! fd-indexed link arena: producers append to the *secondary* list, the
//! single consumer pops from the *primary* and swaps the two when the
//! primary runs dry. A descriptor that re-schedules itself therefore
//! lands behind everything already waiting and cannot starve its peers,
//! and producer/consumer contention is bounded to two short critical
//! sections per tick.

use std::os::fd::RawFd;
use std::sync::Mutex;

const NIL: i32 = -1;

/// Per-descriptor scheduling cell.
///
/// `in_list` tracks physical membership of either list; `scheduled` is
/// the logical flag the consumer honors. Descheduling only clears the
/// logical flag, so a descriptor descheduled while queued is skipped
/// when popped instead of being unlinked from the middle of the list.
#[derive(Clone, Copy)]
struct Link {
    next: i32,
    prev: i32,
    in_list: bool,
    scheduled: bool,
}

#[derive(Clone, Copy)]
struct List {
    head: i32,
    tail: i32,
}

impl List {
    const EMPTY: List = List {
        head: NIL,
        tail: NIL,
    };
}

struct Inner {
    links: Box<[Link]>,
    lists: [List; 2],
    /// Index of the primary list; `1 - primary` is the secondary.
    primary: usize,
}

impl Inner {
    fn push_back(&mut self, list: usize, fd: usize) {
        let tail = self.lists[list].tail;

        self.links[fd].prev = tail;
        self.links[fd].next = NIL;

        if tail == NIL {
            self.lists[list].head = fd as i32;
        } else {
            self.links[tail as usize].next = fd as i32;
        }

        self.lists[list].tail = fd as i32;
        self.links[fd].in_list = true;
    }

    fn pop_front(&mut self, list: usize) -> Option<usize> {
        let head = self.lists[list].head;
        if head == NIL {
            return None;
        }

        let fd = head as usize;
        let next = self.links[fd].next;

        self.lists[list].head = next;
        if next == NIL {
            self.lists[list].tail = NIL;
        } else {
            self.links[next as usize].prev = NIL;
        }

        self.links[fd].next = NIL;
        self.links[fd].prev = NIL;
        self.links[fd].in_list = false;

        Some(fd)
    }
}

/// The two-list round-robin scheduler.
pub(crate) struct Scheduler {
    inner: Mutex<Inner>,
}

impl Scheduler {
    /// Creates a scheduler able to carry descriptors `0..size`.
    pub(crate) fn new(size: usize) -> Scheduler {
        let links = vec![
            Link {
                next: NIL,
                prev: NIL,
                in_list: false,
                scheduled: false,
            };
            size
        ]
        .into_boxed_slice();

        Scheduler {
            inner: Mutex::new(Inner {
                links,
                lists: [List::EMPTY, List::EMPTY],
                primary: 0,
            }),
        }
    }

    /// Enqueues a descriptor for running.
    ///
    /// Idempotent: a descriptor already queued stays where it is (but is
    /// re-marked runnable if it had been descheduled while queued).
    pub(crate) fn push(&self, fd: RawFd) {
        let mut inner = self.inner.lock().unwrap();
        let fd = fd as usize;

        inner.links[fd].scheduled = true;

        if inner.links[fd].in_list {
            return;
        }

        let secondary = 1 - inner.primary;
        inner.push_back(secondary, fd);
    }

    /// Marks a descriptor as no longer runnable.
    ///
    /// The descriptor may still be popped once, but the pop discards it.
    pub(crate) fn deschedule(&self, fd: RawFd) {
        let mut inner = self.inner.lock().unwrap();
        inner.links[fd as usize].scheduled = false;
    }

    /// Pops the next runnable descriptor.
    ///
    /// The descriptor's scheduled flag is cleared before it is returned,
    /// so the callback about to run is free to re-schedule it. Entries
    /// descheduled while queued are dropped on the way.
    pub(crate) fn pop(&self) -> Option<RawFd> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            let primary = inner.primary;

            let fd = match inner.pop_front(primary) {
                Some(fd) => fd,
                None => {
                    // Primary dry: swap and retry once.
                    inner.primary = 1 - primary;
                    inner.pop_front(1 - primary)?
                }
            };

            if !inner.links[fd].scheduled {
                continue;
            }

            inner.links[fd].scheduled = false;
            return Some(fd as RawFd);
        }
    }

    /// True when no descriptor is queued in either list.
    pub(crate) fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.lists[0].head == NIL && inner.lists[1].head == NIL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_fifo_order() {
        let sched = Scheduler::new(16);

        sched.push(3);
        sched.push(7);
        sched.push(1);

        assert_eq!(sched.pop(), Some(3));
        assert_eq!(sched.pop(), Some(7));
        assert_eq!(sched.pop(), Some(1));
        assert_eq!(sched.pop(), None);
        assert!(sched.is_empty());
    }

    #[test]
    fn push_is_idempotent() {
        let sched = Scheduler::new(16);

        sched.push(5);
        sched.push(5);

        assert_eq!(sched.pop(), Some(5));
        assert_eq!(sched.pop(), None);
    }

    #[test]
    fn self_reschedule_queues_behind_waiters() {
        let sched = Scheduler::new(16);

        sched.push(2);
        sched.push(4);

        // Descriptor 2 runs and re-schedules itself; 4 must still run
        // before 2 comes around again.
        assert_eq!(sched.pop(), Some(2));
        sched.push(2);

        assert_eq!(sched.pop(), Some(4));
        assert_eq!(sched.pop(), Some(2));
        assert_eq!(sched.pop(), None);
    }

    #[test]
    fn descheduled_entry_is_skipped() {
        let sched = Scheduler::new(16);

        sched.push(8);
        sched.push(9);
        sched.deschedule(8);

        assert_eq!(sched.pop(), Some(9));
        assert_eq!(sched.pop(), None);
    }

    #[test]
    fn reschedule_after_deschedule_while_queued() {
        let sched = Scheduler::new(16);

        sched.push(6);
        sched.deschedule(6);
        sched.push(6);

        assert_eq!(sched.pop(), Some(6));
        assert_eq!(sched.pop(), None);
    }
}
