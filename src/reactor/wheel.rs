//! Idle-timeout tracking.
//!
//! A coarse wheel of one-second buckets: a descriptor with TIMEOUT
//! interest is filed under the second its deadline falls in, and each
//! reactor tick drains every bucket between the last processed second
//! and "now". The wheel stores the exact deadline per descriptor, so a
//! bucket reached a full lap early only expires the entries whose time
//! has truly passed.
//!
//! Membership is intrusive over an fd-indexed link arena; insertion,
//! removal and expiry are O(1) per descriptor and allocation-free.

use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Instant;

const NIL: i32 = -1;

/// One second per bucket, one hour around the wheel.
pub(crate) const WHEEL_SECONDS: usize = 3600;

#[derive(Clone, Copy)]
struct Link {
    next: i32,
    prev: i32,
    /// Bucket index, or `NIL` when not in the wheel.
    bucket: i32,
    deadline: Instant,
}

#[derive(Clone, Copy)]
struct Bucket {
    head: i32,
}

struct Inner {
    links: Box<[Link]>,
    buckets: Box<[Bucket]>,
    /// Wheel origin; bucket indices are seconds since `t0` mod the size.
    t0: Instant,
    /// Last absolute second (since `t0`) whose bucket was drained.
    last_processed: u64,
    len: usize,
}

impl Inner {
    fn unlink(&mut self, fd: usize) {
        let link = self.links[fd];

        if link.prev == NIL {
            self.buckets[link.bucket as usize].head = link.next;
        } else {
            self.links[link.prev as usize].next = link.next;
        }

        if link.next != NIL {
            self.links[link.next as usize].prev = link.prev;
        }

        self.links[fd].next = NIL;
        self.links[fd].prev = NIL;
        self.links[fd].bucket = NIL;
        self.len -= 1;
    }
}

/// The timeout wheel. Guarded by its own lock, distinct from the
/// scheduler's; callbacks never run under either.
pub(crate) struct Wheel {
    inner: Mutex<Inner>,
}

impl Wheel {
    pub(crate) fn new(size: usize, t0: Instant) -> Wheel {
        let links = vec![
            Link {
                next: NIL,
                prev: NIL,
                bucket: NIL,
                deadline: t0,
            };
            size
        ]
        .into_boxed_slice();

        let buckets = vec![Bucket { head: NIL }; WHEEL_SECONDS].into_boxed_slice();

        Wheel {
            inner: Mutex::new(Inner {
                links,
                buckets,
                t0,
                last_processed: 0,
                len: 0,
            }),
        }
    }

    /// Files a descriptor under its deadline's bucket.
    ///
    /// A descriptor already in the wheel keeps its earlier deadline; the
    /// caller removes first when it wants a refresh.
    pub(crate) fn add(&self, fd: RawFd, deadline: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let fd = fd as usize;

        if inner.links[fd].bucket != NIL {
            return;
        }

        // File under the ceiling second: when that bucket is drained,
        // "now" has necessarily passed the deadline, so the entry cannot
        // slip through its own bucket and wait out a full lap.
        let since = deadline.saturating_duration_since(inner.t0);
        let mut seconds = since.as_secs();
        if since.subsec_nanos() != 0 {
            seconds += 1;
        }
        let bucket = (seconds % WHEEL_SECONDS as u64) as usize;

        let head = inner.buckets[bucket].head;
        inner.links[fd] = Link {
            next: head,
            prev: NIL,
            bucket: bucket as i32,
            deadline,
        };
        if head != NIL {
            inner.links[head as usize].prev = fd as i32;
        }
        inner.buckets[bucket].head = fd as i32;
        inner.len += 1;
    }

    /// Takes a descriptor out of the wheel. A no-op when it is not in it.
    pub(crate) fn remove(&self, fd: RawFd) {
        let mut inner = self.inner.lock().unwrap();
        if inner.links[fd as usize].bucket != NIL {
            inner.unlink(fd as usize);
        }
    }

    /// Drains every bucket between the last processed second and `now`,
    /// appending the descriptors whose deadline has passed to `expired`.
    pub(crate) fn drain(&self, now: Instant, expired: &mut Vec<RawFd>) {
        let mut inner = self.inner.lock().unwrap();

        let current = now.saturating_duration_since(inner.t0).as_secs();
        if current <= inner.last_processed {
            return;
        }

        // A stalled loop may owe more than a full lap; one pass over the
        // wheel covers every bucket there is.
        let first = if current - inner.last_processed >= WHEEL_SECONDS as u64 {
            current - WHEEL_SECONDS as u64 + 1
        } else {
            inner.last_processed + 1
        };

        for second in first..=current {
            let bucket = (second % WHEEL_SECONDS as u64) as usize;

            let mut at = inner.buckets[bucket].head;
            while at != NIL {
                let fd = at as usize;
                let next = inner.links[fd].next;

                if inner.links[fd].deadline <= now {
                    inner.unlink(fd);
                    expired.push(fd as RawFd);
                }

                at = next;
            }
        }

        inner.last_processed = current;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expires_at_the_deadline_second() {
        let t0 = Instant::now();
        let wheel = Wheel::new(32, t0);

        wheel.add(5, t0 + Duration::from_secs(3));

        let mut expired = Vec::new();
        wheel.drain(t0 + Duration::from_secs(2), &mut expired);
        assert!(expired.is_empty());

        wheel.drain(t0 + Duration::from_secs(3), &mut expired);
        assert_eq!(expired, vec![5]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn removed_entry_does_not_expire() {
        let t0 = Instant::now();
        let wheel = Wheel::new(32, t0);

        wheel.add(4, t0 + Duration::from_secs(1));
        wheel.remove(4);

        let mut expired = Vec::new();
        wheel.drain(t0 + Duration::from_secs(5), &mut expired);
        assert!(expired.is_empty());
    }

    #[test]
    fn add_keeps_the_earlier_deadline() {
        let t0 = Instant::now();
        let wheel = Wheel::new(32, t0);

        wheel.add(7, t0 + Duration::from_secs(2));
        wheel.add(7, t0 + Duration::from_secs(3000));

        let mut expired = Vec::new();
        wheel.drain(t0 + Duration::from_secs(2), &mut expired);
        assert_eq!(expired, vec![7]);
    }

    #[test]
    fn a_lapped_bucket_keeps_later_deadlines() {
        let t0 = Instant::now();
        let wheel = Wheel::new(32, t0);

        // Both land in bucket 10, one lap apart.
        wheel.add(1, t0 + Duration::from_secs(10));
        wheel.add(2, t0 + Duration::from_secs(10 + WHEEL_SECONDS as u64));

        let mut expired = Vec::new();
        wheel.drain(t0 + Duration::from_secs(10), &mut expired);
        assert_eq!(expired, vec![1]);

        expired.clear();
        wheel.drain(t0 + Duration::from_secs(10 + WHEEL_SECONDS as u64), &mut expired);
        assert_eq!(expired, vec![2]);
    }

    #[test]
    fn several_entries_in_one_bucket() {
        let t0 = Instant::now();
        let wheel = Wheel::new(32, t0);

        wheel.add(1, t0 + Duration::from_secs(5));
        wheel.add(2, t0 + Duration::from_secs(5));
        wheel.add(3, t0 + Duration::from_secs(5));
        wheel.remove(2);

        let mut expired = Vec::new();
        wheel.drain(t0 + Duration::from_secs(6), &mut expired);
        expired.sort();
        assert_eq!(expired, vec![1, 3]);
    }
}
