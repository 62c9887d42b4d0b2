//! # Ostium
//!
//! **Ostium** is a lean HTTP/1.1 serving runtime built on a
//! single-threaded, edge-triggered I/O reactor.
//!
//! Unlike general-purpose async runtimes, Ostium keeps the whole engine
//! in one cooperative loop: a file-descriptor-indexed reactor over
//! epoll, a fair-share scheduler with bounded per-descriptor work, a
//! coarse timeout wheel for idle connections, and an HTTP connection
//! state machine that streams file responses zero-copy through an
//! intermediate pipe.
//!
//! The crate offers:
//!
//! - A **reactor** ([`reactor::Reactor`]) with O(1), allocation-free
//!   per-descriptor dispatch and an edge-triggered completion contract
//! - A **runtime** ([`Runtime`]) owning the loop, steered from other
//!   threads over a typed signal pipe
//! - An **HTTP engine** ([`http::HttpServer`]) with keep-alive,
//!   in-place header parsing and `splice(2)` file responses
//! - A stock **filesystem handler** ([`http::FileSystemHandler`]) for
//!   serving a directory tree
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ostium::http::{FileSystemHandler, HttpServer};
//! use ostium::{Application, Runtime};
//!
//! struct App;
//!
//! impl Application for App {
//!     fn create(&mut self, runtime: &Runtime) -> ostium::Result<()> {
//!         HttpServer::bind(
//!             runtime.reactor(),
//!             "0.0.0.0:8080",
//!             Box::new(FileSystemHandler::new(".")),
//!         )?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> ostium::Result<()> {
//!     let runtime = Runtime::new()?;
//!     let code = runtime.run(&mut App)?;
//!     std::process::exit(code);
//! }
//! ```
//!
//! ## Contracts worth reading twice
//!
//! Event delivery is **edge-triggered**: a handler must drain its
//! descriptor until the syscall reports "would block" and signal the
//! matching completion bit, or readiness is lost until the next edge.
//! Handlers run on the loop thread only and must never block; the one
//! blocking point of the whole process is the readiness wait inside the
//! reactor tick.
//!
//! Linux-only by design: the readiness primitive is edge-triggered
//! epoll and file responses ride on `splice(2)`.

mod error;

pub mod http;
pub mod reactor;
pub mod runtime;

pub use error::{Error, Result};
pub use runtime::{Application, Runtime};
