use crate::error::{Error, Result};
use crate::http::handler::{ResponseAction, Responder};
use crate::http::parse::{find_header_end, parse_request};
use crate::http::request::{Disposition, HttpRequest, ParsedRequest};
use crate::http::response::ResponseHeaders;
use crate::http::server::ServerShared;
use crate::reactor::poller::unix::{
    sys_close, sys_poll_writable, sys_read, sys_set_cork, sys_splice, sys_write,
};
use crate::reactor::{Completion, EventHandler, EventMask, Reactor};

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Maximum header size in bytes; a request whose headers do not fit is
/// rejected by closing the connection.
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Slack behind the header buffer so the 32-bit token scans may read a
/// whole word at the very end.
const BUFFER_PAD: usize = 4;

/// Splices issued per callback invocation before yielding back to the
/// scheduler.
const DEFAULT_SPLICE_COUNT: usize = 8;

/// Bytes requested per splice call.
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Pipe buffer size requested for file streaming.
pub(crate) const DEFAULT_PIPE_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection states, in the order a request travels through them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnState {
    Accepted,
    ReadingHeader,
    HeaderReceived,
    SendingResponse,
    StreamingFile,
}

/// What the send cursor points at.
#[derive(Clone, Copy)]
enum SendSource {
    None,
    /// Bytes retained from the handler; sent verbatim.
    Static(&'static [u8]),
    /// The first `len` bytes of the connection scratch buffer
    /// (generated response headers).
    Scratch { len: usize },
}

/// Per-connection state machine.
///
/// One instance lives in the reactor entry of each client socket and is
/// driven through accept → read header → parse → dispatch → send →
/// keep-alive reset or close. File responses borrow two more
/// descriptors, the ends of an intermediate pipe, with their own
/// handlers ([`PipeFill`], [`DrainWatch`]).
pub(crate) struct HttpConnection {
    shared: Arc<ServerShared>,
    state: ConnState,

    buffer: Box<[u8]>,
    fill: usize,

    request: Option<ParsedRequest>,

    send_source: SendSource,
    send_position: usize,

    /// Read end of the streaming pipe, -1 outside of file responses.
    source_fd: RawFd,
    content_length: u64,
    streamed: u64,
    corked: bool,
}

impl HttpConnection {
    pub(crate) fn new(shared: Arc<ServerShared>) -> HttpConnection {
        HttpConnection {
            shared,
            state: ConnState::Accepted,
            buffer: vec![0u8; DEFAULT_BUFFER_SIZE + BUFFER_PAD].into_boxed_slice(),
            fill: 0,
            request: None,
            send_source: SendSource::None,
            send_position: 0,
            source_fd: -1,
            content_length: 0,
            streamed: 0,
            corked: false,
        }
    }

    /// Erases per-request state so the next request parses like the
    /// first one on a fresh socket.
    fn reset(&mut self) {
        self.state = ConnState::Accepted;
        self.fill = 0;
        self.request = None;
        self.send_source = SendSource::None;
        self.send_position = 0;
        self.content_length = 0;
        self.streamed = 0;
    }

    /// Drains the socket into the header buffer and hunts for the
    /// end-of-header marker after every read.
    fn read_header(&mut self, reactor: &Reactor, fd: RawFd) -> Result<Completion> {
        loop {
            if self.fill >= DEFAULT_BUFFER_SIZE {
                tracing::debug!(fd, "header exceeds buffer, closing");
                return Ok(Completion::CLOSE);
            }

            let n = match sys_read(fd, &mut self.buffer[self.fill..DEFAULT_BUFFER_SIZE]) {
                // Peer closed before completing a header block.
                Ok(0) => return Ok(Completion::CLOSE),
                Ok(n) => n,
                Err(err) => {
                    return match err.kind() {
                        io::ErrorKind::WouldBlock => Ok(Completion::READ),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                            Ok(Completion::CLOSE)
                        }
                        _ => Err(err.into()),
                    }
                }
            };

            let old_fill = self.fill;
            self.fill += n;
            self.state = ConnState::ReadingHeader;

            // Resume four bytes back so a marker split across reads is
            // still seen.
            let from = old_fill.saturating_sub(4);
            if let Some(end) = find_header_end(&self.buffer[..self.fill], from) {
                self.state = ConnState::HeaderReceived;
                return self.process_request(reactor, fd, end);
            }

            if self.fill == DEFAULT_BUFFER_SIZE {
                tracing::debug!(fd, "no end-of-header within buffer, closing");
                return Ok(Completion::CLOSE);
            }
        }
    }

    /// Parses the completed header block and dispatches the request.
    fn process_request(
        &mut self,
        reactor: &Reactor,
        fd: RawFd,
        header_end: usize,
    ) -> Result<Completion> {
        let parsed = match parse_request(&mut self.buffer[..header_end]) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(fd, error = %err, "request rejected");
                return Ok(Completion::CLOSE);
            }
        };

        let action = {
            let request = HttpRequest::new(fd, &parsed, &self.buffer[..header_end]);
            let mut responder = Responder::new();
            self.shared.handler.request(&mut responder, &request);
            responder.take()
        };

        self.request = Some(parsed);

        match action {
            None => {
                tracing::warn!(fd, "request handler produced no response, closing");
                Ok(Completion::CLOSE)
            }

            Some(ResponseAction::Drop) => Ok(Completion::CLOSE),

            Some(ResponseAction::Static(bytes)) => {
                self.send_source = SendSource::Static(bytes);
                self.send_position = 0;
                self.state = ConnState::SendingResponse;

                reactor.modify(fd, EventMask::OUT | EventMask::TIMEOUT)?;
                Ok(Completion::READ)
            }

            Some(ResponseAction::File {
                file_fd,
                pipe_read,
                pipe_write,
                size,
            }) => self.start_file(reactor, fd, file_fd, pipe_read, pipe_write, size),
        }
    }

    /// Arms the two flows of a file response: headers over the socket,
    /// file contents through the intermediate pipe.
    fn start_file(
        &mut self,
        reactor: &Reactor,
        fd: RawFd,
        file_fd: RawFd,
        pipe_read: RawFd,
        pipe_write: RawFd,
        size: u64,
    ) -> Result<Completion> {
        // The request has been consumed; its buffer becomes the header
        // scratch space.
        let header_len = {
            let build = (|| {
                let mut headers = ResponseHeaders::new(&mut self.buffer[..], 200, "Okay")?;
                headers.field("Content-Length", size)?;
                headers.field("Connection", "keep-alive")?;
                headers.finish()
            })();

            match build {
                Ok(len) => len,
                Err(err) => {
                    sys_close(file_fd);
                    sys_close(pipe_read);
                    sys_close(pipe_write);
                    return Err(err.into());
                }
            }
        };

        self.send_source = SendSource::Scratch { len: header_len };
        self.send_position = 0;
        self.content_length = size;
        self.streamed = 0;
        self.source_fd = pipe_read;

        sys_set_cork(fd, true);
        self.corked = true;

        if let Err(err) = reactor.add(
            pipe_write,
            EventMask::OUT | EventMask::ERR,
            Box::new(PipeFill::new(file_fd)),
        ) {
            tracing::warn!(fd, error = %err, "failed to arm file stream, closing");
            sys_close(file_fd);
            sys_close(pipe_write);
            self.abort_stream(reactor, fd)?;
            return Ok(Completion::CLOSE);
        }

        self.state = ConnState::SendingResponse;
        reactor.modify(fd, EventMask::OUT | EventMask::TIMEOUT)?;

        Ok(Completion::READ)
    }

    /// Writes the pending send cursor (static bytes or generated
    /// headers) until done or blocked.
    fn write_response(&mut self, reactor: &Reactor, fd: RawFd) -> Result<Completion> {
        loop {
            let result = match self.send_source {
                SendSource::None => {
                    // No cursor armed; nothing sensible left to do.
                    return Ok(Completion::CLOSE);
                }

                SendSource::Static(bytes) => {
                    if self.send_position == bytes.len() {
                        break;
                    }
                    sys_write(fd, &bytes[self.send_position..])
                }

                SendSource::Scratch { len } => {
                    if self.send_position == len {
                        break;
                    }
                    sys_write(fd, &self.buffer[self.send_position..len])
                }
            };

            match result {
                Ok(0) => {
                    self.abort_stream(reactor, fd)?;
                    return Ok(Completion::CLOSE);
                }
                Ok(n) => self.send_position += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Completion::WRITE);
                }
                Err(_) => {
                    // Peer-initiated termination and anything else alike
                    // end the connection.
                    self.abort_stream(reactor, fd)?;
                    return Ok(Completion::CLOSE);
                }
            }
        }

        if self.source_fd >= 0 {
            // Headers are out; switch the socket over to splicing from
            // the pipe once the filler has produced data.
            self.state = ConnState::StreamingFile;

            if let Err(err) = reactor.add(
                self.source_fd,
                EventMask::IN | EventMask::HUP | EventMask::ERR,
                Box::new(DrainWatch::new(fd)),
            ) {
                tracing::warn!(fd, error = %err, "failed to watch stream pipe, closing");
                self.abort_stream(reactor, fd)?;
                return Ok(Completion::CLOSE);
            }
            reactor.modify(fd, EventMask::TIMEOUT)?;

            return Ok(Completion::WRITE);
        }

        self.finish_request(reactor, fd)
    }

    /// Splices file bytes from the pipe into the socket.
    fn splice_out(&mut self, reactor: &Reactor, fd: RawFd) -> Result<Completion> {
        for _ in 0..DEFAULT_SPLICE_COUNT {
            let remaining = self.content_length - self.streamed;
            if remaining == 0 {
                return self.finish_stream(reactor, fd);
            }

            let len = remaining.min(DEFAULT_CHUNK_SIZE as u64) as usize;

            match sys_splice(self.source_fd, fd, len, true) {
                Ok(0) => {
                    // EOF short of the declared length: the source shrank
                    // underneath the transfer.
                    tracing::warn!(
                        fd,
                        streamed = self.streamed,
                        expected = self.content_length,
                        "file stream truncated"
                    );
                    self.abort_stream(reactor, fd)?;
                    return Ok(Completion::CLOSE);
                }

                Ok(n) => self.streamed += n as u64,

                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return if !sys_poll_writable(fd)? {
                        // Socket buffer is full; its OUT edge resumes
                        // the transfer.
                        Ok(Completion::WRITE)
                    } else {
                        // Pipe ran empty; park the socket until the
                        // filler catches up.
                        if let Err(err) = reactor.add(
                            self.source_fd,
                            EventMask::IN | EventMask::HUP | EventMask::ERR,
                            Box::new(DrainWatch::new(fd)),
                        ) {
                            tracing::warn!(fd, error = %err, "failed to watch stream pipe");
                            self.abort_stream(reactor, fd)?;
                            return Ok(Completion::CLOSE);
                        }
                        reactor.modify(fd, EventMask::TIMEOUT)?;
                        Ok(Completion::WRITE)
                    };
                }

                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    self.abort_stream(reactor, fd)?;
                    return Ok(Completion::CLOSE);
                }

                Err(err) => return Err(err.into()),
            }
        }

        if self.streamed >= self.content_length {
            self.finish_stream(reactor, fd)
        } else {
            Ok(Completion::NONE)
        }
    }

    /// Completes a file transfer: uncork, release the pipe, then the
    /// usual keep-alive decision.
    fn finish_stream(&mut self, reactor: &Reactor, fd: RawFd) -> Result<Completion> {
        sys_set_cork(fd, false);
        self.corked = false;

        sys_close(self.source_fd);
        self.source_fd = -1;

        self.finish_request(reactor, fd)
    }

    /// Keep-alive reset or close, once the full response is out.
    fn finish_request(&mut self, reactor: &Reactor, fd: RawFd) -> Result<Completion> {
        let keep_alive = self
            .request
            .as_ref()
            .map(|request| request.connection == Disposition::KeepAlive)
            .unwrap_or(false);

        if keep_alive {
            self.reset();
            reactor.modify(fd, EventMask::IN | EventMask::TIMEOUT)?;
            tracing::debug!(fd, "connection reset for keep-alive");
            return Ok(Completion::WRITE);
        }

        Ok(Completion::CLOSE)
    }

    /// Releases streaming resources on the way to closing the socket.
    ///
    /// The pipe read end may still carry a [`DrainWatch`] registration;
    /// it is detached before the descriptor is closed so the entry does
    /// not go stale.
    fn abort_stream(&mut self, reactor: &Reactor, fd: RawFd) -> Result<()> {
        if self.corked {
            sys_set_cork(fd, false);
            self.corked = false;
        }

        if self.source_fd >= 0 {
            match reactor.remove(self.source_fd) {
                Ok(()) | Err(Error::NotActive(_)) => {}
                Err(err) => return Err(err),
            }
            sys_close(self.source_fd);
            self.source_fd = -1;
        }

        Ok(())
    }
}

impl EventHandler for HttpConnection {
    fn on_event(
        &mut self,
        reactor: &Reactor,
        fd: RawFd,
        events: EventMask,
    ) -> Result<Completion> {
        if events.contains(EventMask::TIMEOUT) {
            tracing::debug!(fd, state = ?self.state, "connection idle timeout");
            self.abort_stream(reactor, fd)?;
            return Ok(Completion::CLOSE);
        }

        match self.state {
            ConnState::Accepted | ConnState::ReadingHeader | ConnState::HeaderReceived => {
                self.read_header(reactor, fd)
            }
            ConnState::SendingResponse => self.write_response(reactor, fd),
            ConnState::StreamingFile => self.splice_out(reactor, fd),
        }
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        if self.source_fd >= 0 {
            sys_close(self.source_fd);
        }
    }
}

/// Pipe-write-end handler: splices file contents into the pipe.
///
/// Registered for the lifetime of one file response. EOF on the file or
/// a vanished reader both end it; closing the write end is what lets the
/// drain side observe a truncated source.
pub(crate) struct PipeFill {
    file_fd: RawFd,
}

impl PipeFill {
    pub(crate) fn new(file_fd: RawFd) -> PipeFill {
        PipeFill { file_fd }
    }
}

impl EventHandler for PipeFill {
    fn on_event(
        &mut self,
        _reactor: &Reactor,
        fd: RawFd,
        _events: EventMask,
    ) -> Result<Completion> {
        for _ in 0..DEFAULT_SPLICE_COUNT {
            match sys_splice(self.file_fd, fd, DEFAULT_CHUNK_SIZE, false) {
                Ok(0) => {
                    // Whole file is in flight.
                    sys_close(self.file_fd);
                    self.file_fd = -1;
                    return Ok(Completion::CLOSE);
                }

                Ok(_) => {}

                // Pipe full; resume on its next OUT edge.
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Completion::WRITE);
                }

                // Reader went away mid-transfer.
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    sys_close(self.file_fd);
                    self.file_fd = -1;
                    return Ok(Completion::CLOSE);
                }

                Err(err) => return Err(err.into()),
            }
        }

        Ok(Completion::NONE)
    }
}

impl Drop for PipeFill {
    fn drop(&mut self) {
        if self.file_fd >= 0 {
            sys_close(self.file_fd);
        }
    }
}

/// Pipe-read-end watcher: re-arms a parked client socket once the pipe
/// has data to splice (or the filler hung up).
///
/// One-shot by construction — it detaches itself after firing. The
/// socket is known writable when the watch is armed, and edge-triggered
/// delivery will not repeat an old edge, so the write readiness is
/// re-injected synthetically.
pub(crate) struct DrainWatch {
    socket: RawFd,
}

impl DrainWatch {
    pub(crate) fn new(socket: RawFd) -> DrainWatch {
        DrainWatch { socket }
    }
}

impl EventHandler for DrainWatch {
    fn on_event(
        &mut self,
        reactor: &Reactor,
        _fd: RawFd,
        _events: EventMask,
    ) -> Result<Completion> {
        match reactor.modify(self.socket, EventMask::OUT | EventMask::TIMEOUT) {
            Ok(()) => {
                reactor.arm(self.socket, EventMask::OUT)?;
            }
            Err(Error::NotActive(_)) => {
                // The connection went away while parked; nothing to wake.
            }
            Err(err) => return Err(err),
        }

        Ok(Completion::REMOVE)
    }
}
