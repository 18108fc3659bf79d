use libc::{
    AF_INET, AF_INET6, F_GETFL, F_SETFL, IPPROTO_IPV6, IPV6_V6ONLY, O_NONBLOCK, RLIMIT_NOFILE,
    SHUT_RD, SHUT_RDWR, SHUT_WR, SO_ERROR, SO_RCVBUF, SO_REUSEADDR, SO_SNDBUF, SOCK_STREAM,
    SOL_SOCKET, accept, bind, c_int, c_void, close, connect, fcntl, getpeername, getrlimit,
    getsockname, getsockopt, listen, recv, rlimit, send, setsockopt, shutdown, sockaddr,
    sockaddr_in, sockaddr_in6, sockaddr_storage, socket, socklen_t,
};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::{io, mem};

/// Flags passed to `send(2)`.
///
/// Writing to a socket whose peer has gone away must surface as `EPIPE`,
/// never as a process-killing `SIGPIPE`.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const SEND_FLAGS: c_int = 0;

/// Upper bound applied when the descriptor limit is reported as infinite.
const DESCRIPTOR_CEILING: usize = 1 << 20;

/// Reads from a socket into the given buffer.
///
/// The descriptor **must** be non-blocking.
pub(crate) fn sys_recv(fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { recv(fd, buffer.as_mut_ptr() as *mut c_void, buffer.len(), 0) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Writes the buffer to a socket.
///
/// The descriptor **must** be non-blocking.
pub(crate) fn sys_send(fd: RawFd, buffer: &[u8]) -> io::Result<usize> {
    let n = unsafe { send(fd, buffer.as_ptr() as *const c_void, buffer.len(), SEND_FLAGS) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Closes a file descriptor.
pub(crate) fn sys_close(fd: RawFd) {
    unsafe { close(fd) };
}

/// Sets a file descriptor to non-blocking mode.
pub(crate) fn sys_set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Sets the close-on-exec flag so descriptors do not leak into children.
fn sys_set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Returns the socket domain matching an address family.
pub(crate) fn sys_domain(addr: &SocketAddr) -> c_int {
    match addr {
        SocketAddr::V4(_) => AF_INET,
        SocketAddr::V6(_) => AF_INET6,
    }
}

/// Creates a non-blocking stream socket.
pub(crate) fn sys_socket(domain: c_int) -> io::Result<RawFd> {
    let fd = unsafe { socket(domain, SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Err(e) = sys_set_nonblocking(fd).and_then(|_| sys_set_cloexec(fd)) {
        unsafe { close(fd) };
        return Err(e);
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        let yes: c_int = 1;
        unsafe {
            setsockopt(
                fd,
                SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &yes as *const _ as *const c_void,
                mem::size_of::<c_int>() as socklen_t,
            );
        }
    }

    Ok(fd)
}

/// Binds a socket to an address.
pub(crate) fn sys_bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socketaddr_to_storage(addr);

    let rc = unsafe { bind(fd, &storage as *const _ as *const sockaddr, len) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Marks a socket as a listening socket.
pub(crate) fn sys_listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    let rc = unsafe { listen(fd, backlog) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Accepts a new incoming connection.
///
/// The returned client socket is automatically set to non-blocking mode.
pub(crate) fn sys_accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let client_fd = unsafe { accept(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };

    if client_fd < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Err(e) = sys_set_nonblocking(client_fd).and_then(|_| sys_set_cloexec(client_fd)) {
        unsafe { close(client_fd) };
        return Err(e);
    }

    match sockaddr_storage_to_socketaddr(&storage) {
        Ok(addr) => Ok((client_fd, addr)),
        Err(e) => {
            unsafe { close(client_fd) };
            Err(e)
        }
    }
}

/// Returns the local address of a socket.
pub(crate) fn sys_sockname(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe { getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        sockaddr_storage_to_socketaddr(&storage)
    }
}

/// Returns the remote address of a connected socket.
pub(crate) fn sys_peername(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe { getpeername(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        sockaddr_storage_to_socketaddr(&storage)
    }
}

/// Initiates a non-blocking connection.
///
/// Returns `Ok(true)` when the connection completed immediately and
/// `Ok(false)` when it is in progress.
pub(crate) fn sys_connect(fd: RawFd, addr: &SocketAddr) -> io::Result<bool> {
    let (storage, len) = socketaddr_to_storage(addr);

    let rc = unsafe { connect(fd, &storage as *const _ as *const sockaddr, len) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EINTR) => Ok(false),
        _ => Err(err),
    }
}

/// Reads and clears the pending error of a socket (`SO_ERROR`).
///
/// Returns the errno value, `0` meaning no error is pending.
pub(crate) fn sys_socket_error(fd: RawFd) -> io::Result<c_int> {
    let mut errno: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    let rc = unsafe {
        getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut errno as *mut _ as *mut c_void,
            &mut len,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(errno)
    }
}

/// Shuts down a socket.
pub(crate) fn sys_shutdown(fd: RawFd, how: Shutdown) -> io::Result<()> {
    let how = match how {
        Shutdown::Read => SHUT_RD,
        Shutdown::Write => SHUT_WR,
        Shutdown::Both => SHUT_RDWR,
    };

    let rc = unsafe { shutdown(fd, how) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn sys_setsockopt_int(fd: RawFd, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    let rc = unsafe {
        setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Enables `SO_REUSEADDR` on a socket.
pub(crate) fn sys_set_reuseaddr(fd: RawFd) -> io::Result<()> {
    sys_setsockopt_int(fd, SOL_SOCKET, SO_REUSEADDR, 1)
}

/// Sizes the kernel send and receive queues of a socket.
pub(crate) fn sys_set_buffers(fd: RawFd, size: usize) -> io::Result<()> {
    let size = size.min(c_int::MAX as usize) as c_int;

    sys_setsockopt_int(fd, SOL_SOCKET, SO_SNDBUF, size)?;
    sys_setsockopt_int(fd, SOL_SOCKET, SO_RCVBUF, size)
}

/// Enables IPv6 dual-stack support when required.
pub(crate) fn sys_ipv6_is_necessary(fd: RawFd, domain: c_int) -> io::Result<()> {
    if domain == AF_INET6 {
        sys_setsockopt_int(fd, IPPROTO_IPV6, IPV6_V6ONLY, 0)?;
    }
    Ok(())
}

/// Returns the soft limit on open descriptors for this process.
pub(crate) fn sys_descriptor_limit() -> Option<usize> {
    let mut limit: rlimit = unsafe { mem::zeroed() };

    let rc = unsafe { getrlimit(RLIMIT_NOFILE, &mut limit) };
    if rc < 0 {
        return None;
    }

    if limit.rlim_cur == libc::RLIM_INFINITY {
        return Some(DESCRIPTOR_CEILING);
    }

    Some((limit.rlim_cur as u64).min(DESCRIPTOR_CEILING as u64) as usize)
}

/// Converts a `sockaddr_storage` to a Rust `SocketAddr`.
pub(crate) fn sockaddr_storage_to_socketaddr(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        AF_INET => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);

            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }

        AF_INET6 => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);

            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }

        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

/// Converts a `SocketAddr` to a `sockaddr_storage`.
pub(crate) fn socketaddr_to_storage(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in) };
            sa.sin_family = AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();

            (storage, mem::size_of::<sockaddr_in>() as socklen_t)
        }

        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in6) };
            sa.sin6_family = AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();

            (storage, mem::size_of::<sockaddr_in6>() as socklen_t)
        }
    }
}
