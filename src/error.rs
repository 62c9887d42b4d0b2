use std::io;
use std::os::fd::RawFd;

/// Errors surfaced by the reactor and runtime.
///
/// Recoverable per-event conditions (`EAGAIN`, partial reads, peer
/// hang-ups) never appear here; they travel as [`Completion`] masks from
/// the event handlers. This type carries the unrecoverable ones: state
/// machine violations that indicate a bug in the caller, and operating
/// system errors the loop cannot absorb.
///
/// [`Completion`]: crate::reactor::Completion
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `add` was called for a descriptor that already has a registration.
    #[error("file descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    /// `modify`, `remove` or `close` was called for a descriptor without
    /// an active registration.
    #[error("file descriptor {0} is not active")]
    NotActive(RawFd),

    /// The descriptor number does not fit the reactor table.
    #[error("file descriptor {0} is outside the reactor table")]
    OutOfTable(RawFd),

    /// The signal pipe delivered a short read that cannot be resumed.
    #[error("signal pipe corrupted: short unresumable read")]
    SignalPipe,

    /// An operating system error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
