use crate::http::conn::DEFAULT_PIPE_BUFFER_SIZE;
use crate::http::request::HttpRequest;
use crate::reactor::poller::unix::{sys_close, sys_file_size, sys_open_readonly, sys_pipe};

use std::io;
use std::os::fd::RawFd;
use std::path::Path;

/// The application-side dispatch seam.
///
/// Called once per parsed request, on the reactor thread. The handler
/// must respond synchronously: before returning it registers exactly one
/// of the three response operations on the [`Responder`]. Returning
/// without responding closes the connection.
pub trait HttpRequestHandler: Send + Sync {
    fn request(&self, responder: &mut Responder, request: &HttpRequest<'_>);
}

/// The response chosen by the handler, applied by the connection after
/// dispatch returns.
pub(crate) enum ResponseAction {
    Static(&'static [u8]),
    File {
        file_fd: RawFd,
        pipe_read: RawFd,
        pipe_write: RawFd,
        size: u64,
    },
    Drop,
}

impl ResponseAction {
    /// Releases descriptors held by an action that will not be applied.
    fn discard(self) {
        if let ResponseAction::File {
            file_fd,
            pipe_read,
            pipe_write,
            ..
        } = self
        {
            sys_close(file_fd);
            sys_close(pipe_read);
            sys_close(pipe_write);
        }
    }
}

/// Collects the handler's one response operation for a request.
pub struct Responder {
    action: Option<ResponseAction>,
}

impl Responder {
    pub(crate) fn new() -> Responder {
        Responder { action: None }
    }

    /// Responds with a retained byte buffer, sent verbatim.
    ///
    /// The bytes are the complete response, status line included.
    pub fn respond_with_static(&mut self, _request: &HttpRequest<'_>, bytes: &'static [u8]) {
        self.set(ResponseAction::Static(bytes));
    }

    /// Responds with the contents of a file, streamed zero-copy through
    /// an intermediate pipe.
    ///
    /// The file is opened and sized here so the handler can fall back to
    /// a static response when that fails; on `Err` no response operation
    /// has been registered yet.
    pub fn respond_with_file(
        &mut self,
        _request: &HttpRequest<'_>,
        path: impl AsRef<Path>,
    ) -> io::Result<()> {
        let file_fd = sys_open_readonly(path.as_ref())?;

        let size = match sys_file_size(file_fd) {
            Ok(size) => size,
            Err(err) => {
                sys_close(file_fd);
                return Err(err);
            }
        };

        let (pipe_read, pipe_write) = match sys_pipe(DEFAULT_PIPE_BUFFER_SIZE) {
            Ok(fds) => fds,
            Err(err) => {
                sys_close(file_fd);
                return Err(err);
            }
        };

        self.set(ResponseAction::File {
            file_fd,
            pipe_read,
            pipe_write,
            size,
        });
        Ok(())
    }

    /// Drops the request; the connection is closed without a response.
    pub fn drop_request(&mut self, _request: &HttpRequest<'_>) {
        self.set(ResponseAction::Drop);
    }

    fn set(&mut self, action: ResponseAction) {
        if self.action.is_some() {
            tracing::warn!("second response operation for one request ignored");
            action.discard();
            return;
        }

        self.action = Some(action);
    }

    pub(crate) fn take(&mut self) -> Option<ResponseAction> {
        self.action.take()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action.discard();
        }
    }
}
