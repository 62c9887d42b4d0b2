use crate::error::Result;
use crate::reactor::Reactor;

use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::Mutex;

/// Readiness and interest bits.
///
/// These are crate-level logical bits, deliberately disjoint from the
/// kernel's `EPOLL*` values; the poller owns the translation. In
/// particular [`EventMask::TIMEOUT`] is a first-class bit of its own and
/// never aliases a kernel flag.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u32);

impl EventMask {
    /// No events.
    pub const NONE: EventMask = EventMask(0);

    /// A read call would not block.
    pub const IN: EventMask = EventMask(1 << 0);

    /// A write call would not block.
    pub const OUT: EventMask = EventMask(1 << 1);

    /// Priority data is available.
    pub const PRI: EventMask = EventMask(1 << 2);

    /// An error condition on the descriptor.
    pub const ERR: EventMask = EventMask(1 << 3);

    /// The peer closed its writing side.
    pub const RDHUP: EventMask = EventMask(1 << 4);

    /// The peer hung up.
    pub const HUP: EventMask = EventMask(1 << 5);

    /// The descriptor's idle timeout expired.
    pub const TIMEOUT: EventMask = EventMask(1 << 6);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when `self` and `other` share at least one bit.
    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns `self` with the bits of `other` cleared.
    pub fn without(self, other: EventMask) -> EventMask {
        EventMask(self.0 & !other.0)
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = EventMask;

    fn bitand(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 & rhs.0)
    }
}

impl std::fmt::Debug for EventMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        let names = [
            (EventMask::IN, "IN"),
            (EventMask::OUT, "OUT"),
            (EventMask::PRI, "PRI"),
            (EventMask::ERR, "ERR"),
            (EventMask::RDHUP, "RDHUP"),
            (EventMask::HUP, "HUP"),
            (EventMask::TIMEOUT, "TIMEOUT"),
        ];

        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }

        if first {
            write!(f, "NONE")?;
        }

        Ok(())
    }
}

/// The value an event handler returns to report what it finished.
///
/// Handlers run under edge-triggered delivery and must drain their
/// descriptor until the underlying call reports "would block"; the
/// completion tells the reactor which readiness bits were fully drained
/// so it can clear exactly those from the entry's active set.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Completion(u8);

impl Completion {
    /// More work is pending; leave all active bits set and run again.
    pub const NONE: Completion = Completion(0);

    /// Reading was drained to `EAGAIN`; clear the IN bit.
    pub const READ: Completion = Completion(1);

    /// Writing was drained to `EAGAIN`; clear the OUT bit.
    pub const WRITE: Completion = Completion(2);

    /// Detach the descriptor from the reactor.
    pub const REMOVE: Completion = Completion(127);

    /// Detach the descriptor and close it.
    pub const CLOSE: Completion = Completion(255);

    pub fn is_remove(self) -> bool {
        self == Completion::REMOVE
    }

    pub fn is_close(self) -> bool {
        self == Completion::CLOSE
    }

    pub fn read_done(self) -> bool {
        self.0 & Completion::READ.0 != 0
    }

    pub fn write_done(self) -> bool {
        self.0 & Completion::WRITE.0 != 0
    }
}

impl BitOr for Completion {
    type Output = Completion;

    fn bitor(self, rhs: Completion) -> Completion {
        Completion(self.0 | rhs.0)
    }
}

/// A registered descriptor's event callback.
///
/// Implementations are the connection state machines of the crate: the
/// reactor stores one boxed handler per registered descriptor and invokes
/// it whenever the descriptor's interest intersects its delivered events.
///
/// The contract is edge-triggered: the handler must keep issuing its I/O
/// call until it returns `EAGAIN` and then signal the matching completion
/// bit. Returning [`Completion::NONE`] while readiness remains keeps the
/// entry scheduled; fairness is preserved because re-scheduled entries
/// queue behind everything already waiting.
///
/// Handlers run on the reactor thread only. They may freely call
/// [`Reactor::add`], [`Reactor::modify`], [`Reactor::remove`] and
/// [`Reactor::close`] for any descriptor, including their own; a handler
/// that removes its own descriptor is dropped after it returns.
pub trait EventHandler: Send {
    fn on_event(&mut self, reactor: &Reactor, fd: RawFd, events: EventMask)
        -> Result<Completion>;
}

/// Registration states of a table entry.
///
/// Transitions go through compare-and-swap so concurrent `add`/`modify`/
/// `remove` calls for the same descriptor cannot tear the slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum EntryState {
    Empty = 0,
    Adding = 1,
    Active = 2,
    Modifying = 3,
}

impl EntryState {
    fn from_u8(value: u8) -> EntryState {
        match value {
            0 => EntryState::Empty,
            1 => EntryState::Adding,
            2 => EntryState::Active,
            _ => EntryState::Modifying,
        }
    }
}

/// The mutable part of a table entry, guarded by the entry lock.
pub(crate) struct Slot {
    /// Events the registration wants delivered.
    pub(crate) interest: EventMask,

    /// Events delivered and not yet consumed.
    pub(crate) active: EventMask,

    /// The descriptor's event handler. `None` while the handler is out
    /// being run, and for empty entries.
    pub(crate) handler: Option<Box<dyn EventHandler>>,
}

/// One cell of the fd-indexed reactor table.
///
/// The state word serializes registration transitions; the generation
/// counter invalidates stale references (queued scheduler entries, kernel
/// events in flight) after a descriptor is removed and its number reused.
pub(crate) struct Entry {
    state: AtomicU8,
    generation: AtomicU32,
    pub(crate) slot: Mutex<Slot>,
}

impl Entry {
    pub(crate) fn new() -> Entry {
        Entry {
            state: AtomicU8::new(EntryState::Empty as u8),
            generation: AtomicU32::new(0),
            slot: Mutex::new(Slot {
                interest: EventMask::NONE,
                active: EventMask::NONE,
                handler: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempts the `from` → `to` state transition.
    pub(crate) fn transition(&self, from: EntryState, to: EntryState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally publishes a new state.
    ///
    /// Only valid while the caller owns the intermediate Adding/Modifying
    /// state.
    pub(crate) fn publish(&self, state: EntryState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidates every outstanding reference to this entry.
    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// Packs a descriptor and its generation into an epoll token.
pub(crate) fn pack_token(generation: u32, fd: RawFd) -> u64 {
    ((generation as u64) << 32) | (fd as u32 as u64)
}

/// Splits an epoll token back into `(generation, fd)`.
pub(crate) fn unpack_token(token: u64) -> (u32, RawFd) {
    ((token >> 32) as u32, token as u32 as RawFd)
}
