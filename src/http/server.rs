use crate::error::Result;
use crate::http::conn::HttpConnection;
use crate::http::handler::HttpRequestHandler;
use crate::reactor::poller::unix::{sys_accept, sys_close, sys_listener_socket};
use crate::reactor::{Completion, EventHandler, EventMask, Reactor};

use libc::{EMFILE, ENFILE, ENOBUFS, ENOMEM};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Connections accepted per listener invocation before yielding back to
/// the scheduler.
const DEFAULT_ACCEPTS_PER_EVENT: usize = 16;

/// State shared between the listener and every connection it spawns.
pub(crate) struct ServerShared {
    pub(crate) handler: Box<dyn HttpRequestHandler>,
}

/// The HTTP server: a listening socket registered with the reactor.
///
/// Accepting, header parsing and response transmission all run as
/// reactor event handlers; the server itself is only the bind-time
/// wiring and stays valid as long as the reactor does.
pub struct HttpServer {
    fd: RawFd,
    local_addr: SocketAddr,
}

impl HttpServer {
    /// Binds `address` and registers the listener with the reactor.
    ///
    /// `address` is anything `SocketAddr` parses, e.g. `"0.0.0.0:8080"`
    /// or `"[::]:8080"`; port 0 picks an ephemeral port, readable back
    /// through [`local_addr`](HttpServer::local_addr).
    pub fn bind(
        reactor: &Reactor,
        address: &str,
        handler: Box<dyn HttpRequestHandler>,
    ) -> Result<HttpServer> {
        let (fd, local_addr) = sys_listener_socket(address)?;

        let shared = Arc::new(ServerShared { handler });

        if let Err(err) = reactor.add(fd, EventMask::IN, Box::new(Listener { shared })) {
            sys_close(fd);
            return Err(err);
        }

        tracing::info!(%local_addr, "http server listening");

        Ok(HttpServer { fd, local_addr })
    }

    /// The bound address, with the concrete port when 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The listening descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

/// Listening-socket handler: accepts a bounded batch per invocation.
struct Listener {
    shared: Arc<ServerShared>,
}

impl EventHandler for Listener {
    fn on_event(
        &mut self,
        reactor: &Reactor,
        fd: RawFd,
        _events: EventMask,
    ) -> Result<Completion> {
        for _ in 0..DEFAULT_ACCEPTS_PER_EVENT {
            let client = match sys_accept(fd) {
                Ok(client) => client,
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        // Backlog drained.
                        return Ok(Completion::READ);
                    }

                    return match err.raw_os_error() {
                        Some(EMFILE) | Some(ENFILE) | Some(ENOBUFS) | Some(ENOMEM) => {
                            // Resource pressure: yield without closing the
                            // listener and retry after other work ran.
                            tracing::warn!(error = %err, "accept under resource pressure");
                            Ok(Completion::NONE)
                        }
                        _ => Err(err.into()),
                    };
                }
            };

            if client as usize >= reactor.capacity() {
                tracing::warn!(fd = client, "descriptor beyond reactor table, dropping");
                sys_close(client);
                continue;
            }

            reactor.add(
                client,
                EventMask::IN | EventMask::TIMEOUT,
                Box::new(HttpConnection::new(self.shared.clone())),
            )?;

            tracing::debug!(fd = client, "connection accepted");
        }

        // Batch exhausted with the backlog possibly non-empty; keep the
        // IN bit active so the next tick continues accepting.
        Ok(Completion::NONE)
    }
}
