//! Linux `epoll`-based poller.
//!
//! This is the readiness primitive underneath the reactor. It is
//! deliberately edge-triggered: every descriptor is registered exactly
//! once with `EPOLLIN | EPOLLOUT | EPOLLET`, and interest changes are a
//! pure table update in the reactor with no kernel round-trip. The
//! reactor gates delivery against the stored interest mask.
//!
//! Responsibilities:
//! - Register file descriptors with their `(generation, fd)` token
//! - Block waiting for I/O readiness with SIGPIPE masked out
//! - Translate kernel event bits into crate-level [`EventMask`] values
//! - Wake the wait when another thread schedules work

use crate::reactor::entry::EventMask;
use crate::reactor::poller::unix::sys_sigpipe_set;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_pwait, sigset_t, EPOLLERR, EPOLLET, EPOLLHUP,
    EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL,
};
use std::io;
use std::os::unix::io::RawFd;

/// Reserved token used internally for the wake-up event.
///
/// This value can never collide with real tokens: descriptor numbers are
/// bounded by the fd limit, far below `u32::MAX` in the low word.
const WAKE_TOKEN: u64 = u64::MAX;

/// The size of the event buffer handed to each `epoll_pwait` call.
pub(crate) const DEFAULT_POLL_EVENTS_SIZE: usize = 128;

/// Wakes a blocked [`Poller::wait`] from another thread.
///
/// Wraps an `eventfd`; writing its counter makes the wait return
/// immediately. The poller drains the counter when the wake event is
/// delivered.
pub(crate) struct Waker(RawFd);

impl Waker {
    pub(crate) fn wake(&self) {
        let buf: u64 = 1;
        unsafe {
            libc::write(self.0, &buf as *const _ as *const _, 8);
        }
    }
}

/// Linux `epoll` poller.
///
/// Owns the epoll instance, the internal wake `eventfd` and the signal
/// mask applied for the duration of each wait. Registration and waiting
/// may happen from different threads; the kernel serializes `epoll_ctl`
/// against `epoll_pwait`, so no lock is needed here.
pub(crate) struct Poller {
    /// Epoll file descriptor.
    epoll: RawFd,

    /// Wake-up eventfd.
    waker: Waker,

    /// Signals blocked while waiting (SIGPIPE).
    sigmask: sigset_t,
}

impl Poller {
    /// Creates the epoll instance and registers the wake eventfd as a
    /// persistent wake source.
    pub(crate) fn new() -> io::Result<Poller> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if eventfd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll) };
            return Err(err);
        }

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        let rc = unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, eventfd, &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(eventfd);
                libc::close(epoll);
            }
            return Err(err);
        }

        Ok(Poller {
            epoll,
            waker: Waker(eventfd),
            sigmask: sys_sigpipe_set(),
        })
    }

    /// Interrupts a blocked [`Poller::wait`].
    pub(crate) fn wake(&self) {
        self.waker.wake();
    }

    /// Registers a file descriptor.
    ///
    /// Interest is installed for read and write simultaneously in
    /// edge-triggered mode; later interest changes are reactor-side only.
    pub(crate) fn register(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = epoll_event {
            events: (EPOLLIN | EPOLLOUT | EPOLLRDHUP | EPOLLET) as u32,
            u64: token,
        };

        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Removes a file descriptor.
    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Waits for readiness events.
    ///
    /// Appends `(token, events)` pairs to `out` and returns `true` when
    /// the wait expired without any event. SIGPIPE is blocked for the
    /// duration of the wait; `EINTR` counts as an empty, non-timed-out
    /// wait so the caller re-evaluates its predicates.
    pub(crate) fn wait(
        &self,
        buffer: &mut Vec<epoll_event>,
        out: &mut Vec<(u64, EventMask)>,
        timeout_ms: i32,
    ) -> io::Result<bool> {
        unsafe {
            buffer.set_len(0);
        }

        let n = unsafe {
            epoll_pwait(
                self.epoll,
                buffer.as_mut_ptr(),
                buffer.capacity() as i32,
                timeout_ms,
                &self.sigmask,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        unsafe {
            buffer.set_len(n as usize);
        }

        for ev in buffer.iter() {
            if ev.u64 == WAKE_TOKEN {
                let mut drained = 0u64;
                unsafe {
                    libc::read(self.waker.0, &mut drained as *mut _ as *mut _, 8);
                }
                continue;
            }

            out.push((ev.u64, translate(ev.events)));
        }

        Ok(n == 0)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.waker.0);
            libc::close(self.epoll);
        }
    }
}

/// Translates kernel event bits into the crate-level mask.
fn translate(events: u32) -> EventMask {
    let mut mask = EventMask::NONE;

    if events & EPOLLIN as u32 != 0 {
        mask |= EventMask::IN;
    }
    if events & EPOLLOUT as u32 != 0 {
        mask |= EventMask::OUT;
    }
    if events & EPOLLPRI as u32 != 0 {
        mask |= EventMask::PRI;
    }
    if events & EPOLLERR as u32 != 0 {
        mask |= EventMask::ERR;
    }
    if events & EPOLLRDHUP as u32 != 0 {
        mask |= EventMask::RDHUP;
    }
    if events & EPOLLHUP as u32 != 0 {
        mask |= EventMask::HUP;
    }

    mask
}
