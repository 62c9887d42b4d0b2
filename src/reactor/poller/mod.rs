//! The readiness primitive underneath the reactor.
//!
//! Only Linux edge-triggered `epoll` is provided; the zero-copy file
//! path depends on `splice(2)`, which pins the crate to Linux anyway.
//! The `sys_*` wrappers in [`unix`] are the crate's single point of
//! contact with libc.

mod epoll;

pub(crate) mod unix;

pub(crate) use epoll::{Poller, DEFAULT_POLL_EVENTS_SIZE};
