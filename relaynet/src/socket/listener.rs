use super::buffered::SocketState;
use crate::engine::poller::platform::{
    sys_accept, sys_bind, sys_close, sys_domain, sys_ipv6_is_necessary, sys_listen,
    sys_set_buffers, sys_set_reuseaddr, sys_socket, sys_sockname,
};
use crate::engine::{Engine, EventHandler, EventKind};
use crate::error::{Error, Result, SocketError};

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use tracing::{debug, info, warn};

/// Receives the connections accepted by a [`ListenSocket`].
pub trait ListenHandler {
    /// A peer connected.
    ///
    /// `fd` is a connected, non-blocking descriptor now owned by the
    /// handler, which is expected to wrap it (for example with
    /// [`BufferedSocket::from_fd`](super::BufferedSocket::from_fd)) or
    /// close it.
    ///
    /// Nothing is read from the descriptor before the next dispatch, so a
    /// byte transform installed here with
    /// [`BufferedSocket::set_hook`](super::BufferedSocket::set_hook) sees
    /// the whole connection.
    fn on_incoming_connection(&mut self, engine: &Engine, fd: RawFd, peer: SocketAddr);

    /// The listening socket failed and is about to close.
    fn on_error(&mut self, _error: SocketError) {}
}

/// A passive socket accepting stream connections.
pub struct ListenSocket<L: ListenHandler> {
    /// File descriptor of the listening socket.
    fd: RawFd,
    engine: Engine,
    handler: L,
    local: SocketAddr,
    state: SocketState,
    registered: bool,
}

impl<L> ListenSocket<L>
where
    L: ListenHandler + 'static,
{
    /// Binds a listener to `addr` and registers it with `engine`.
    ///
    /// This function:
    /// - creates a non-blocking socket,
    /// - enables `SO_REUSEADDR`,
    /// - accepts IPv4 peers too when bound to an IPv6 address,
    /// - binds and starts listening.
    ///
    /// Port `0` picks an ephemeral port, see [`ListenSocket::local_addr`].
    pub fn bind(engine: &Engine, addr: SocketAddr, handler: L) -> Result<Rc<RefCell<Self>>> {
        let domain = sys_domain(&addr);

        let fd = sys_socket(domain)
            .map_err(|e| Error::socket(SocketError::from_creation(&e), e))?;

        let local = match Self::prepare(fd, domain, &addr, engine.config().listen_backlog) {
            Ok(local) => local,
            Err(e) => {
                sys_close(fd);
                warn!(%addr, error = %e, "could not listen");
                return Err(e);
            }
        };

        let this = Rc::new(RefCell::new(Self {
            fd,
            engine: engine.clone(),
            handler,
            local,
            state: SocketState::Listening,
            registered: false,
        }));

        engine.register(&this)?;
        this.borrow_mut().registered = true;

        info!(fd, %local, "listening");
        Ok(this)
    }

    fn prepare(fd: RawFd, domain: i32, addr: &SocketAddr, backlog: i32) -> Result<SocketAddr> {
        let setup = |e: io::Error| Error::socket(SocketError::Socket, e);

        sys_set_reuseaddr(fd).map_err(setup)?;
        sys_ipv6_is_necessary(fd, domain).map_err(setup)?;
        sys_bind(fd, addr).map_err(|e| Error::socket(SocketError::Bind, e))?;
        sys_listen(fd, backlog).map_err(setup)?;

        sys_sockname(fd).map_err(setup)
    }
}

impl<L: ListenHandler> ListenSocket<L> {
    /// The bound address, with the actual port when bound to port `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn handler(&self) -> &L {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut L {
        &mut self.handler
    }

    /// Stops listening. Only the first call has an effect.
    pub fn close(&mut self) {
        if self.fd < 0 {
            return;
        }

        if self.registered {
            let _ = self.engine.unregister(self.fd);
            self.registered = false;
        }

        sys_close(self.fd);
        debug!(fd = self.fd, local = %self.local, "listener closed");

        self.fd = -1;
        if self.state != SocketState::Error {
            self.state = SocketState::Disconnected;
        }
    }

    /// Accepts pending connections, at most `accept_batch` per event.
    fn accept_pending(&mut self) {
        let batch = self.engine.config().accept_batch.max(1);
        let socket_buffer = self.engine.config().socket_buffer;

        for _ in 0..batch {
            let (fd, peer) = match sys_accept(self.fd) {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ECONNABORTED) => continue,
                Err(e) => {
                    if SocketError::from_creation(&e) == SocketError::NoMoreFds {
                        warn!(fd = self.fd, error = %e, "out of descriptors, connections stay queued");
                    } else {
                        warn!(fd = self.fd, error = %e, "accept failed");
                    }
                    break;
                }
            };

            if let Err(e) = sys_set_buffers(fd, socket_buffer) {
                debug!(fd, error = %e, "could not size socket buffers");
            }

            debug!(listener = self.fd, fd, %peer, "accepted connection");
            self.handler.on_incoming_connection(&self.engine, fd, peer);

            if self.fd < 0 {
                break;
            }
        }
    }
}

impl<L: ListenHandler> EventHandler for ListenSocket<L> {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn handle_event(&mut self, event: EventKind) {
        match event {
            EventKind::Read => self.accept_pending(),
            EventKind::Write => {}
            EventKind::Error(errno) => {
                warn!(
                    fd = self.fd,
                    local = %self.local,
                    error = %io::Error::from_raw_os_error(errno),
                    "listener failed"
                );
                self.handler.on_error(SocketError::Other);
                self.state = SocketState::Error;
                self.close();
            }
        }
    }
}

impl<L: ListenHandler> Drop for ListenSocket<L> {
    fn drop(&mut self) {
        self.close();
    }
}
