use libc::{
    accept4, bind, c_int, close, fcntl, fstat, getrlimit, getsockname, listen, open, pipe2, poll,
    pollfd, read, rlimit, setsockopt, sigaddset, sigemptyset, sigset_t, sockaddr, sockaddr_in,
    sockaddr_in6, sockaddr_storage, socket, socketpair, socklen_t, splice, stat, write, AF_INET,
    AF_INET6, AF_UNIX, EINTR, F_SETPIPE_SZ, IPPROTO_IPV6, IPPROTO_TCP, IPV6_V6ONLY, O_CLOEXEC,
    O_NONBLOCK, O_RDONLY, POLLOUT, RLIMIT_NOFILE, SIGPIPE, SIG_BLOCK, SOCK_CLOEXEC, SOCK_NONBLOCK,
    SOCK_STREAM, SOL_SOCKET, SO_REUSEADDR, SPLICE_F_MORE, SPLICE_F_MOVE, SPLICE_F_NONBLOCK,
    TCP_CORK,
};
use std::ffi::CString;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::str::FromStr;
use std::{io, mem, ptr};

// Every descriptor this crate touches is non-blocking; the wrappers
// below surface EAGAIN as `ErrorKind::WouldBlock` and the event
// handlers translate that into their completion masks.

/// Reads once into `buffer`, returning the byte count (0 is end of
/// stream).
pub(crate) fn sys_read(fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

/// Writes once from `buffer`, returning how many bytes the kernel took.
pub(crate) fn sys_write(fd: RawFd, buffer: &[u8]) -> io::Result<usize> {
    let n = unsafe { write(fd, buffer.as_ptr() as *const _, buffer.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

/// Best-effort close. The engine's teardown paths have nowhere useful
/// to report a close failure, so none is returned.
pub(crate) fn sys_close(fd: RawFd) {
    unsafe { close(fd) };
}

/// Accepts one pending connection from a listening socket.
///
/// `accept4` stamps the client non-blocking and close-on-exec in the
/// same call, so fresh sockets are loop-ready without an extra fcntl.
pub(crate) fn sys_accept(fd: RawFd) -> io::Result<RawFd> {
    let client_fd = unsafe {
        accept4(
            fd,
            ptr::null_mut(),
            ptr::null_mut(),
            SOCK_NONBLOCK | SOCK_CLOEXEC,
        )
    };

    if client_fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(client_fd)
}

/// Creates a bound, listening, non-blocking TCP socket for `address`.
///
/// `address` is anything `SocketAddr` parses. The whole setup runs
/// here: `SO_REUSEADDR`, dual-stack for v6 binds, bind, listen, and a
/// read-back of the kernel-chosen address so port 0 requests report
/// their ephemeral port. Returns the descriptor and that address.
pub(crate) fn sys_listener_socket(address: &str) -> io::Result<(RawFd, SocketAddr)> {
    let addr = SocketAddr::from_str(address)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid socket addr"))?;

    let domain = if addr.is_ipv6() { AF_INET6 } else { AF_INET };
    let fd = unsafe { socket(domain, SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let setup = (|| -> io::Result<SocketAddr> {
        set_socket_flag(fd, SOL_SOCKET, SO_REUSEADDR, 1)?;
        if addr.is_ipv6() {
            // A v6 listener answers v4 clients too.
            set_socket_flag(fd, IPPROTO_IPV6, IPV6_V6ONLY, 0)?;
        }

        let (storage, len) = sockaddr_from(&addr);
        if unsafe { bind(fd, &storage as *const _ as *const sockaddr, len) } < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { listen(fd, 128) } < 0 {
            return Err(io::Error::last_os_error());
        }

        local_addr(fd)
    })();

    match setup {
        Ok(local) => Ok((fd, local)),
        Err(err) => {
            sys_close(fd);
            Err(err)
        }
    }
}

/// Creates the connected non-blocking pair backing the signal pipe.
pub(crate) fn sys_socketpair() -> io::Result<(RawFd, RawFd)> {
    let mut fds: [c_int; 2] = [-1, -1];

    let rc = unsafe {
        socketpair(
            AF_UNIX,
            SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((fds[0], fds[1]))
}

/// Opens a file for streaming: read-only, non-blocking, close-on-exec.
pub(crate) fn sys_open_readonly(path: &Path) -> io::Result<RawFd> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;

    let fd = unsafe { open(cpath.as_ptr(), O_RDONLY | O_NONBLOCK | O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

/// Returns the size in bytes of the file behind an open descriptor;
/// this becomes the response's `Content-Length`.
pub(crate) fn sys_file_size(fd: RawFd) -> io::Result<u64> {
    let mut st: stat = unsafe { mem::zeroed() };

    let rc = unsafe { fstat(fd, &mut st) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(st.st_size as u64)
}

/// Creates the non-blocking pipe a file response streams through and
/// asks for a `buffer_size`-byte buffer on both ends.
///
/// Returns `(read_end, write_end)`. A refused `F_SETPIPE_SZ` is not an
/// error; the transfer just runs at the default pipe capacity.
pub(crate) fn sys_pipe(buffer_size: usize) -> io::Result<(RawFd, RawFd)> {
    let mut fds: [c_int; 2] = [-1, -1];

    let rc = unsafe { pipe2(fds.as_mut_ptr(), O_NONBLOCK | O_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        fcntl(fds[0], F_SETPIPE_SZ, buffer_size as c_int);
        fcntl(fds[1], F_SETPIPE_SZ, buffer_size as c_int);
    }

    Ok((fds[0], fds[1]))
}

/// Moves up to `len` bytes from `from` into `to` without copying
/// through user space. At least one side must be a pipe.
///
/// Returns the bytes moved (0 is end of source). `more` sets
/// `SPLICE_F_MORE` when further data follows, which keeps the socket
/// side coalescing segments.
pub(crate) fn sys_splice(from: RawFd, to: RawFd, len: usize, more: bool) -> io::Result<usize> {
    let mut flags = SPLICE_F_MOVE | SPLICE_F_NONBLOCK;
    if more {
        flags |= SPLICE_F_MORE;
    }

    let n = unsafe { splice(from, ptr::null_mut(), to, ptr::null_mut(), len, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

/// Sets or clears `TCP_CORK` around a header-plus-body transmission.
pub(crate) fn sys_set_cork(fd: RawFd, corked: bool) {
    let state: c_int = if corked { 1 } else { 0 };
    unsafe {
        setsockopt(
            fd,
            IPPROTO_TCP,
            TCP_CORK,
            &state as *const _ as *const _,
            mem::size_of::<c_int>() as socklen_t,
        );
    }
}

/// Distinguishes "socket would block" from "pipe would block" after an
/// ambiguous splice EAGAIN: a zero-timeout `poll(2)` for `POLLOUT` on
/// the socket. `EINTR` is retried.
pub(crate) fn sys_poll_writable(fd: RawFd) -> io::Result<bool> {
    let mut p = pollfd {
        fd,
        events: POLLOUT,
        revents: 0,
    };

    loop {
        let rc = unsafe { poll(&mut p, 1, 0) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(EINTR) {
                continue;
            }
            return Err(err);
        }
        break;
    }

    Ok(p.revents & POLLOUT != 0)
}

/// The soft `RLIMIT_NOFILE` limit, which sizes the reactor table: every
/// descriptor the process can hold has a slot from the start.
pub(crate) fn sys_fd_limit() -> io::Result<usize> {
    let mut l = rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    let rc = unsafe { getrlimit(RLIMIT_NOFILE, &mut l) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(l.rlim_cur as usize)
}

/// Builds the signal set applied during the readiness wait: just
/// SIGPIPE.
pub(crate) fn sys_sigpipe_set() -> sigset_t {
    unsafe {
        let mut set: sigset_t = mem::zeroed();
        sigemptyset(&mut set);
        sigaddset(&mut set, SIGPIPE);
        set
    }
}

/// Blocks SIGPIPE on the loop thread for the runtime's lifetime, so a
/// write to a disconnected peer comes back as `EPIPE` instead of
/// killing the process.
pub(crate) fn sys_block_sigpipe() -> io::Result<()> {
    let set = sys_sigpipe_set();

    let rc = unsafe { libc::pthread_sigmask(SIG_BLOCK, &set, ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }

    Ok(())
}

fn set_socket_flag(fd: RawFd, level: c_int, option: c_int, value: c_int) -> io::Result<()> {
    let rc = unsafe {
        setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const _,
            mem::size_of::<c_int>() as socklen_t,
        )
    };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe { getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    sockaddr_into(&storage)
}

fn sockaddr_from(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in) };
            sa.sin_family = AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();

            mem::size_of::<sockaddr_in>()
        }

        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in6) };
            sa.sin6_family = AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();

            mem::size_of::<sockaddr_in6>()
        }
    };

    (storage, len as socklen_t)
}

fn sockaddr_into(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
                u16::from_be(sa.sin_port),
            )))
        }

        AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sa.sin6_addr.s6_addr),
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }

        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}
