use crate::error::{Error, Result};
use crate::reactor::poller::unix::{sys_close, sys_read, sys_socketpair, sys_write};
use crate::reactor::{Completion, EventHandler, EventMask, Reactor};

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Control words carried over the signal pipe, one machine word each.
pub(crate) const SIGNAL_WAKE: usize = 0;
pub(crate) const SIGNAL_STOP: usize = 1;

const WORD: usize = mem::size_of::<usize>();

/// Loop state shared between the runtime handle and the signal reader.
pub(crate) struct LoopState {
    pub(crate) running: AtomicBool,
    pub(crate) exit_code: AtomicI32,
}

impl LoopState {
    pub(crate) fn new() -> Arc<LoopState> {
        Arc::new(LoopState {
            running: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
        })
    }
}

/// A connected non-blocking socket pair used to steer the loop from
/// other threads.
///
/// The read end stays registered with the reactor for the runtime's
/// lifetime; writers enqueue one control word per signal.
pub(crate) struct SignalPair {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SignalPair {
    pub(crate) fn new() -> Result<SignalPair> {
        let (read_fd, write_fd) = sys_socketpair()?;
        Ok(SignalPair { read_fd, write_fd })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Enqueues one control word.
    pub(crate) fn signal(&self, word: usize) -> Result<()> {
        let n = sys_write(self.write_fd, &word.to_ne_bytes())?;

        if n != WORD {
            // A torn control word cannot be repaired by the reader.
            return Err(Error::SignalPipe);
        }

        Ok(())
    }
}

impl Drop for SignalPair {
    fn drop(&mut self) {
        sys_close(self.read_fd);
        sys_close(self.write_fd);
    }
}

/// Event handler of the signal pipe's read end.
///
/// Accumulates bytes until a full control word is available, then
/// dispatches it. A word may arrive split across reads; the partial
/// word is kept between invocations.
pub(crate) struct SignalReader {
    state: Arc<LoopState>,
    pending: [u8; WORD],
    filled: usize,
}

impl SignalReader {
    pub(crate) fn new(state: Arc<LoopState>) -> SignalReader {
        SignalReader {
            state,
            pending: [0; WORD],
            filled: 0,
        }
    }

    fn dispatch(&self, word: usize) {
        match word {
            SIGNAL_WAKE => {
                // Nothing to do; the wait already returned, which is the
                // entire point of the wake signal.
            }
            SIGNAL_STOP => {
                self.state.running.store(false, Ordering::Release);
            }
            other => {
                tracing::warn!(signal = other, "unknown control signal ignored");
            }
        }
    }
}

impl EventHandler for SignalReader {
    fn on_event(
        &mut self,
        _reactor: &Reactor,
        fd: RawFd,
        _events: EventMask,
    ) -> Result<Completion> {
        loop {
            match sys_read(fd, &mut self.pending[self.filled..]) {
                // Peer end closed underneath us; any partial word is lost.
                Ok(0) => return Err(Error::SignalPipe),

                Ok(n) => {
                    self.filled += n;
                    if self.filled == WORD {
                        self.dispatch(usize::from_ne_bytes(self.pending));
                        self.filled = 0;
                    }
                }

                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Completion::READ);
                }

                Err(err) => return Err(err.into()),
            }
        }
    }
}
