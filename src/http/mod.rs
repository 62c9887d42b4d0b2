//! The HTTP/1.1 connection engine.
//!
//! A per-connection state machine over the reactor: accept → read
//! header → parse → dispatch → send (static bytes or a file spliced
//! through an intermediate pipe) → keep-alive reset or close. The
//! engine parses request lines and headers only; it never emits error
//! responses of its own — malformed input closes the connection, and
//! well-formed requests are answered by the installed
//! [`HttpRequestHandler`].

mod conn;
mod fs;
mod handler;
mod parse;
mod request;
mod response;
mod server;

pub use fs::FileSystemHandler;
pub use handler::{HttpRequestHandler, Responder};
pub use parse::ParseError;
pub use request::{Disposition, HttpRequest, Method, Version};
pub use server::HttpServer;
