use crate::error::{Error, Result};
use crate::reactor::entry::{
    pack_token, unpack_token, Completion, Entry, EntryState, EventHandler, EventMask,
};
use crate::reactor::poller::unix::sys_close;
use crate::reactor::poller::{Poller, DEFAULT_POLL_EVENTS_SIZE};
use crate::reactor::sched::Scheduler;
use crate::reactor::wheel::{Wheel, WHEEL_SECONDS};

use libc::epoll_event;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The number of queued descriptors run between readiness waits. A
/// higher number means fewer system calls, but a higher potential
/// latency for fresh events.
const DEFAULT_EVENT_HANDLE_COUNT: usize = 16;

/// Idle timeout granted to descriptors carrying TIMEOUT interest.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Scratch space of the update tick. Single consumer; the lock is never
/// contended and exists so `update` can take `&self`.
struct Tick {
    buffer: Vec<epoll_event>,
    ready: Vec<(u64, EventMask)>,
    expired: Vec<RawFd>,
}

/// The descriptor reactor.
///
/// Owns the edge-triggered readiness primitive and a dense table mapping
/// each file descriptor number to its registration: interest mask,
/// delivered-but-unconsumed events, event handler and timeout deadline.
/// The table is sized to the process soft fd limit at construction, so
/// per-descriptor lookup is an index and steady-state event handling
/// allocates nothing.
///
/// One thread drives [`Reactor::update`]; handlers run on that thread
/// only, serialized per descriptor. Any thread may call [`add`],
/// [`modify`], [`remove`] and [`close`]; entry state transitions go
/// through compare-and-swap and a per-entry lock, and a generation
/// counter invalidates events still in flight for a recycled descriptor
/// number.
///
/// [`add`]: Reactor::add
/// [`modify`]: Reactor::modify
/// [`remove`]: Reactor::remove
/// [`close`]: Reactor::close
pub struct Reactor {
    poller: Poller,
    table: Box<[Entry]>,
    sched: Scheduler,
    wheel: Wheel,
    idle_timeout: Duration,
    tick: Mutex<Tick>,
}

impl Reactor {
    /// Creates a reactor with the default 30-second idle timeout.
    pub fn new() -> Result<Reactor> {
        Reactor::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    /// Creates a reactor whose TIMEOUT-interested descriptors idle out
    /// after `idle_timeout`.
    ///
    /// The table is sized to the soft `RLIMIT_NOFILE` limit read at this
    /// point; descriptors at or above that number are rejected with
    /// [`Error::OutOfTable`].
    pub fn with_idle_timeout(idle_timeout: Duration) -> Result<Reactor> {
        let size = crate::reactor::poller::unix::sys_fd_limit()?;
        let table = (0..size).map(|_| Entry::new()).collect::<Vec<_>>();

        Ok(Reactor {
            poller: Poller::new()?,
            table: table.into_boxed_slice(),
            sched: Scheduler::new(size),
            wheel: Wheel::new(size, Instant::now()),
            idle_timeout,
            tick: Mutex::new(Tick {
                buffer: Vec::with_capacity(DEFAULT_POLL_EVENTS_SIZE),
                ready: Vec::with_capacity(DEFAULT_POLL_EVENTS_SIZE),
                expired: Vec::with_capacity(DEFAULT_POLL_EVENTS_SIZE),
            }),
        })
    }

    /// Number of descriptors the table can carry.
    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    /// The idle timeout applied to TIMEOUT-interested descriptors.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn entry(&self, fd: RawFd) -> Result<&Entry> {
        if fd < 0 {
            return Err(Error::OutOfTable(fd));
        }

        self.table.get(fd as usize).ok_or(Error::OutOfTable(fd))
    }

    /// Registers a descriptor with its interest mask and event handler.
    ///
    /// The kernel registration is made once, edge-triggered, for read and
    /// write simultaneously; delivery is gated by the stored interest, so
    /// later [`modify`](Reactor::modify) calls cost no syscall. Fails
    /// with [`Error::AlreadyRegistered`] when the entry is not empty.
    pub fn add(
        &self,
        fd: RawFd,
        interest: EventMask,
        handler: Box<dyn EventHandler>,
    ) -> Result<()> {
        let entry = self.entry(fd)?;

        if !entry.transition(EntryState::Empty, EntryState::Adding) {
            return Err(Error::AlreadyRegistered(fd));
        }

        {
            let mut slot = entry.slot.lock().unwrap();
            slot.interest = interest;
            slot.active = EventMask::NONE;
            slot.handler = Some(handler);
        }

        if interest.contains(EventMask::TIMEOUT) {
            self.wheel.add(fd, Instant::now() + self.idle_timeout);
        }

        let token = pack_token(entry.generation(), fd);
        entry.publish(EntryState::Active);

        if let Err(err) = self.poller.register(fd, token) {
            // Roll the registration back so the entry is reusable.
            {
                let mut slot = entry.slot.lock().unwrap();
                slot.interest = EventMask::NONE;
                slot.active = EventMask::NONE;
                slot.handler = None;
            }
            self.wheel.remove(fd);
            entry.bump_generation();
            entry.publish(EntryState::Empty);
            return Err(err.into());
        }

        tracing::debug!(fd, ?interest, "descriptor registered");
        Ok(())
    }

    /// Updates a descriptor's interest mask.
    ///
    /// Purely a table update. When the new interest intersects events
    /// already delivered, the entry is scheduled and the loop woken.
    /// Fails with [`Error::NotActive`] when the entry is not active.
    pub fn modify(&self, fd: RawFd, interest: EventMask) -> Result<()> {
        let entry = self.entry(fd)?;

        if !entry.transition(EntryState::Active, EntryState::Modifying) {
            return Err(Error::NotActive(fd));
        }

        let hit = {
            let mut slot = entry.slot.lock().unwrap();
            slot.interest = interest;
            slot.interest.intersects(slot.active)
        };

        if interest.contains(EventMask::TIMEOUT) {
            self.wheel.add(fd, Instant::now() + self.idle_timeout);
        } else {
            self.wheel.remove(fd);
        }

        entry.publish(EntryState::Active);

        if hit {
            self.wheel.remove(fd);
            self.sched.push(fd);
            self.poller.wake();
        }

        Ok(())
    }

    /// Injects synthetic readiness into a descriptor's active set.
    ///
    /// Used by collaborators that learn out-of-band that a descriptor is
    /// ready — under edge-triggered delivery the kernel will not repeat
    /// an edge that was reported before the caller started caring.
    pub fn arm(&self, fd: RawFd, events: EventMask) -> Result<()> {
        let entry = self.entry(fd)?;

        if entry.state() != EntryState::Active {
            return Err(Error::NotActive(fd));
        }

        let hit = {
            let mut slot = entry.slot.lock().unwrap();
            slot.active |= events;
            slot.interest.intersects(slot.active)
        };

        if hit {
            self.wheel.remove(fd);
            self.sched.push(fd);
            self.poller.wake();
        }

        Ok(())
    }

    /// Detaches a descriptor from the reactor.
    ///
    /// The entry returns to empty, its generation is bumped so queued
    /// events for the old registration are discarded, and the kernel
    /// registration is dropped. Fails with [`Error::NotActive`] when the
    /// entry is not active.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        let entry = self.entry(fd)?;

        if !entry.transition(EntryState::Active, EntryState::Modifying) {
            return Err(Error::NotActive(fd));
        }

        {
            let mut slot = entry.slot.lock().unwrap();
            slot.interest = EventMask::NONE;
            slot.active = EventMask::NONE;
            slot.handler = None;
        }

        self.wheel.remove(fd);
        self.sched.deschedule(fd);
        entry.bump_generation();
        entry.publish(EntryState::Empty);

        self.poller.deregister(fd)?;

        tracing::debug!(fd, "descriptor removed");
        Ok(())
    }

    /// Detaches a descriptor and closes it.
    pub fn close(&self, fd: RawFd) -> Result<()> {
        self.remove(fd)?;
        sys_close(fd);

        tracing::debug!(fd, "descriptor closed");
        Ok(())
    }

    /// Runs one reactor tick.
    ///
    /// Waits for readiness (with a zero timeout when the scheduler still
    /// has work, and at most one second while the timeout wheel is
    /// non-empty), folds delivered events into the entries' active sets,
    /// drains expired idle timeouts, and runs up to a bounded number of
    /// queued handlers. Returns `true` when the wait expired without
    /// delivering any event.
    pub fn update(&self, timeout_ms: i32) -> Result<bool> {
        let mut tick = self.tick.lock().unwrap();
        let Tick {
            buffer,
            ready,
            expired,
        } = &mut *tick;
        ready.clear();
        expired.clear();

        let mut timeout = timeout_ms;
        if !self.sched.is_empty() {
            timeout = 0;
        } else if !self.wheel.is_empty() && !(0..=1000).contains(&timeout) {
            timeout = 1000;
        }

        let timed_out = self.poller.wait(buffer, ready, timeout)?;

        for (token, events) in ready.drain(..) {
            let (generation, fd) = unpack_token(token);

            let Ok(entry) = self.entry(fd) else { continue };
            if entry.generation() != generation || entry.state() != EntryState::Active {
                // Stale event for a recycled descriptor number.
                continue;
            }

            let hit = {
                let mut slot = entry.slot.lock().unwrap();
                slot.active |= events;
                slot.interest.intersects(slot.active)
            };

            if hit {
                self.wheel.remove(fd);
                self.sched.push(fd);
            }
        }

        self.wheel.drain(Instant::now(), expired);
        for fd in expired.drain(..) {
            let Ok(entry) = self.entry(fd) else { continue };
            if entry.state() != EntryState::Active {
                continue;
            }

            let hit = {
                let mut slot = entry.slot.lock().unwrap();
                slot.active |= EventMask::TIMEOUT;
                slot.interest.intersects(slot.active)
            };

            if hit {
                self.sched.push(fd);
            }
        }

        for _ in 0..DEFAULT_EVENT_HANDLE_COUNT {
            let Some(fd) = self.sched.pop() else { break };
            self.run_entry(fd)?;
        }

        Ok(timed_out)
    }

    /// Invokes the handler of one scheduled descriptor and applies its
    /// completion.
    fn run_entry(&self, fd: RawFd) -> Result<()> {
        let entry = self.entry(fd)?;

        if entry.state() != EntryState::Active {
            return Ok(());
        }

        let generation = entry.generation();

        let (mut handler, events) = {
            let mut slot = entry.slot.lock().unwrap();

            if !slot.interest.intersects(slot.active) {
                // Interest changed while queued; nothing to run. Hand the
                // entry back to the wheel when it still tracks idleness.
                let timeout = slot.interest.contains(EventMask::TIMEOUT);
                drop(slot);
                if timeout {
                    self.wheel.add(fd, Instant::now() + self.idle_timeout);
                }
                return Ok(());
            }

            match slot.handler.take() {
                Some(handler) => (handler, slot.active),
                None => return Ok(()),
            }
        };

        let result = handler.on_event(self, fd, events)?;

        self.complete(fd, generation, handler, result)
    }

    /// Applies a handler's completion mask.
    ///
    /// Exactly the bits whose draining was signaled are cleared from the
    /// active set (the consumed TIMEOUT bit always is); the entry is
    /// re-queued while interest still intersects what remains, and
    /// otherwise handed back to the timeout wheel with a fresh deadline.
    fn complete(
        &self,
        fd: RawFd,
        generation: u32,
        handler: Box<dyn EventHandler>,
        result: Completion,
    ) -> Result<()> {
        let entry = self.entry(fd)?;

        if entry.generation() != generation || entry.state() != EntryState::Active {
            // The handler detached its own descriptor; nothing to restore.
            drop(handler);
            return Ok(());
        }

        if result.is_close() {
            drop(handler);
            self.remove(fd)?;
            sys_close(fd);
            tracing::debug!(fd, "descriptor closed by handler");
            return Ok(());
        }

        if result.is_remove() {
            drop(handler);
            self.remove(fd)?;
            return Ok(());
        }

        let (pending, timeout) = {
            let mut slot = entry.slot.lock().unwrap();

            slot.active = slot.active.without(EventMask::TIMEOUT);
            if result.read_done() {
                slot.active = slot.active.without(EventMask::IN);
            }
            if result.write_done() {
                slot.active = slot.active.without(EventMask::OUT);
            }

            if slot.handler.is_none() {
                slot.handler = Some(handler);
            }

            (
                slot.interest.intersects(slot.active),
                slot.interest.contains(EventMask::TIMEOUT),
            )
        };

        if pending {
            // A mid-callback modify may have re-filed the entry in the
            // wheel; it belongs to the queue now.
            self.wheel.remove(fd);
            self.sched.push(fd);
        } else if timeout {
            // Refresh the deadline rather than keeping a stale one.
            self.wheel.remove(fd);
            self.wheel.add(fd, Instant::now() + self.idle_timeout);
        }

        Ok(())
    }

    /// Interrupts a blocked [`Reactor::update`] wait.
    pub fn wake(&self) {
        self.poller.wake();
    }
}

// The wheel covers one hour; deadlines beyond it would alias into an
// earlier bucket. The per-entry deadline check keeps that correct, but
// the default must stay well inside a lap.
const _: () = assert!(DEFAULT_IDLE_TIMEOUT.as_secs() < WHEEL_SECONDS as u64);
