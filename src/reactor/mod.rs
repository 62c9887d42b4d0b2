//! The file-descriptor reactor.
//!
//! A dense, fd-indexed registration table over an edge-triggered
//! readiness primitive, a two-list fair-share scheduler and a coarse
//! timeout wheel. See [`Reactor`] for the threading and completion
//! contracts.

mod core;
mod entry;
mod sched;
mod wheel;

pub(crate) mod poller;

pub use self::core::Reactor;
pub use self::entry::{Completion, EventHandler, EventMask};
