//! Managed stream sockets.
//!
//! A [`BufferedSocket`] owns a [`StreamSocket`] and drives it through
//! its connection lifecycle on behalf of a consumer implementing
//! [`SocketHandler`]:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                      |            |
//!                      +--> Error <-+
//! ```
//!
//! An outbound attempt is bounded by a deadline timer that exists exactly
//! while the socket is connecting. Whichever of "connect resolved" and
//! "deadline expired" happens first cancels the other, so a consumer
//! never sees both an error and a timeout for the same attempt.

use super::hook::IoHook;
use super::stream::{ReadOutcome, StreamSocket};
use crate::engine::poller::platform::{
    sys_bind, sys_connect, sys_domain, sys_peername, sys_set_buffers, sys_socket,
    sys_socket_error,
};
use crate::engine::{Engine, EventHandler, EventKind};
use crate::error::{Result, SocketError};
use crate::timer::TimerId;

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Deadline applied to outbound connections unless overridden.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Connected,
    Listening,
    Error,
}

/// Callbacks of a socket consumer.
///
/// Every callback receives the socket so the consumer can write replies,
/// extract lines or close the connection from inside it. A
/// [`StreamSocket::close`] issued from a callback takes effect when the
/// callback returns: `on_close` runs, then the descriptor is released.
pub trait SocketHandler {
    /// New bytes were appended to the receive buffer.
    fn on_data_ready(&mut self, socket: &mut StreamSocket);

    /// The socket failed. It is closed right after this returns.
    fn on_error(&mut self, socket: &mut StreamSocket, error: SocketError);

    /// The outbound connection is established.
    fn on_connected(&mut self, _socket: &mut StreamSocket) {}

    /// The outbound connection did not complete in time. Followed by
    /// `on_error(SocketError::Timeout)`.
    fn on_timeout(&mut self, _socket: &mut StreamSocket) {}

    /// The socket is closing; the descriptor is still open.
    fn on_close(&mut self, _socket: &mut StreamSocket) {}
}

/// Parameters of an outbound connection.
#[derive(Clone)]
pub struct ConnectOptions {
    pub dest: SocketAddr,

    /// Local address to bind before connecting. When unset, the engine's
    /// configured server bind addresses are consulted.
    pub bind: Option<IpAddr>,

    pub timeout: Duration,

    pub max_sendq: Option<usize>,

    /// Byte transform installed before the connect is issued, so it sees
    /// every byte of the connection.
    pub hook: Option<Rc<dyn IoHook>>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("dest", &self.dest)
            .field("bind", &self.bind)
            .field("timeout", &self.timeout)
            .field("max_sendq", &self.max_sendq)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl ConnectOptions {
    pub fn new(dest: SocketAddr) -> Self {
        Self {
            dest,
            bind: None,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            max_sendq: None,
            hook: None,
        }
    }

    pub fn bind(mut self, addr: IpAddr) -> Self {
        self.bind = Some(addr);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_sendq(mut self, limit: usize) -> Self {
        self.max_sendq = Some(limit);
        self
    }

    pub fn hook(mut self, hook: Rc<dyn IoHook>) -> Self {
        self.hook = Some(hook);
        self
    }
}

/// A stream socket with a connection lifecycle.
pub struct BufferedSocket<H: SocketHandler> {
    socket: StreamSocket,
    handler: H,
    state: SocketState,

    /// Pending connect deadline; set exactly while connecting.
    timeout: Option<TimerId>,

    peer: Option<SocketAddr>,
}

impl<H> BufferedSocket<H>
where
    H: SocketHandler + 'static,
{
    /// Starts an outbound connection.
    ///
    /// Failures of the OS calls (creating, binding or connecting the
    /// socket) are reported to `handler.on_error` before this returns,
    /// and the returned socket is in [`SocketState::Error`]. `Err` is only
    /// returned when the engine refuses the registration; no callback
    /// runs in that case.
    pub fn connect(engine: &Engine, handler: H, opts: ConnectOptions) -> Result<Rc<RefCell<Self>>> {
        let dest = opts.dest;

        let fd = match sys_socket(sys_domain(&dest)) {
            Ok(fd) => fd,
            Err(e) => {
                warn!(%dest, error = %e, "could not create socket");

                let mut this = Self::with_socket(StreamSocket::new(engine.clone(), -1), handler);
                this.socket.fail(SocketError::from_creation(&e), e.to_string());
                this.deliver_failure();

                return Ok(Rc::new(RefCell::new(this)));
            }
        };

        let mut this = Self::with_socket(StreamSocket::new(engine.clone(), fd), handler);
        this.peer = Some(dest);
        this.socket.set_max_sendq(opts.max_sendq);
        this.socket.set_hook(opts.hook.clone());

        if this.start_connect(&opts).is_err() {
            this.deliver_failure();
            return Ok(Rc::new(RefCell::new(this)));
        }

        this.state = SocketState::Connecting;
        this.socket.set_corked(true);

        let this = Rc::new(RefCell::new(this));
        Self::attach(engine, &this)?;

        let weak = Rc::downgrade(&this);
        let id = engine.timers().schedule_after(opts.timeout, move |_| {
            let Some(socket) = weak.upgrade() else {
                return;
            };

            match socket.try_borrow_mut() {
                Ok(mut socket) => socket.expire(),
                Err(_) => warn!("connect deadline hit a busy socket"),
            };
        });
        this.borrow_mut().timeout = Some(id);

        debug!(fd, %dest, timeout = ?opts.timeout, "connecting");
        Ok(this)
    }

    /// Wraps an already connected descriptor, typically one handed out
    /// by a [`ListenSocket`](super::ListenSocket), and registers it.
    ///
    /// On `Err` the descriptor has been closed.
    pub fn from_fd(engine: &Engine, fd: RawFd, handler: H) -> Result<Rc<RefCell<Self>>> {
        let mut this = Self::with_socket(StreamSocket::new(engine.clone(), fd), handler);
        this.state = SocketState::Connected;
        this.peer = sys_peername(fd).ok();

        let this = Rc::new(RefCell::new(this));
        Self::attach(engine, &this)?;

        Ok(this)
    }

    fn attach(engine: &Engine, this: &Rc<RefCell<Self>>) -> Result<()> {
        if let Err(e) = engine.register(this) {
            let mut socket = this.borrow_mut();
            socket.cancel_timeout();
            socket.state = SocketState::Error;
            socket.socket.release();
            return Err(e);
        }

        this.borrow_mut().socket.set_registered(true);
        Ok(())
    }
}

impl<H: SocketHandler> BufferedSocket<H> {
    fn with_socket(socket: StreamSocket, handler: H) -> Self {
        Self {
            socket,
            handler,
            state: SocketState::Disconnected,
            timeout: None,
            peer: None,
        }
    }

    /// Binds and issues the non-blocking connect.
    fn start_connect(&mut self, opts: &ConnectOptions) -> std::result::Result<(), SocketError> {
        let fd = self.socket.fd();
        let engine = self.socket.engine().clone();

        let bind = opts
            .bind
            .or_else(|| engine.outbound_bind_address(&opts.dest));

        if let Some(ip) = bind {
            if let Err(e) = sys_bind(fd, &SocketAddr::new(ip, 0)) {
                warn!(fd, %ip, error = %e, "could not bind outbound socket");
                self.socket.fail(SocketError::Bind, e.to_string());
                return Err(SocketError::Bind);
            }
        }

        if let Err(e) = sys_set_buffers(fd, engine.config().socket_buffer) {
            debug!(fd, error = %e, "could not size socket buffers");
        }

        // An immediate success still goes through the writable path so
        // the deadline exists for the whole time the socket is connecting.
        if let Err(e) = sys_connect(fd, &opts.dest) {
            info!(fd, dest = %opts.dest, error = %e, "connect failed");
            self.socket.fail(SocketError::Connect, e.to_string());
            return Err(SocketError::Connect);
        }

        Ok(())
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn socket(&self) -> &StreamSocket {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut StreamSocket {
        &mut self.socket
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn set_hook(&mut self, hook: Rc<dyn IoHook>) {
        self.socket.set_hook(Some(hook));
    }

    pub fn set_max_sendq(&mut self, limit: Option<usize>) {
        self.socket.set_max_sendq(limit);
    }

    /// Whether a connect deadline is pending.
    pub fn timeout_pending(&self) -> bool {
        self.timeout
            .is_some_and(|id| self.socket.engine().timers().is_pending(id))
    }

    /// The remote address; the destination while connecting.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Queues outbound data. While connecting, data is held until the
    /// connection is established.
    pub fn write_data(&mut self, data: &[u8]) {
        self.socket.write_data(data);
        self.deliver_failure();
    }

    /// Runs the consumer's closing step and releases the descriptor.
    ///
    /// Only the first call has an effect.
    pub fn close(&mut self) {
        self.cancel_timeout();

        if !self.socket.is_closed() {
            self.notify(|handler, socket| handler.on_close(socket));
            self.socket.release();
        }

        if self.state != SocketState::Error {
            self.state = SocketState::Disconnected;
        }
    }

    /// Runs a consumer callback. A close issued from inside it is only
    /// recorded.
    fn notify<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut H, &mut StreamSocket),
    {
        self.socket.enter_callback();
        callback(&mut self.handler, &mut self.socket);
        self.socket.leave_callback();
    }

    fn cancel_timeout(&mut self) {
        if let Some(id) = self.timeout.take() {
            self.socket.engine().timers().cancel(id);
        }
    }

    /// Connect deadline expired.
    fn expire(&mut self) {
        self.timeout = None;

        if self.state != SocketState::Connecting {
            return;
        }

        warn!(fd = self.socket.fd(), peer = ?self.peer, "connection timed out");

        self.notify(|handler, socket| handler.on_timeout(socket));
        self.socket.fail(SocketError::Timeout, "Connection timed out");
        self.deliver_failure();
    }

    fn finish_connect(&mut self) {
        let fd = self.socket.fd();

        let errno = match sys_socket_error(fd) {
            Ok(errno) => errno,
            Err(e) => e.raw_os_error().unwrap_or(libc::ECONNREFUSED),
        };

        if errno != 0 {
            let e = io::Error::from_raw_os_error(errno);
            info!(fd, peer = ?self.peer, error = %e, "connect failed");
            self.socket.fail(SocketError::Connect, e.to_string());
            return;
        }

        self.cancel_timeout();
        self.state = SocketState::Connected;
        self.socket.set_corked(false);

        if let Ok(peer) = sys_peername(fd) {
            self.peer = Some(peer);
        }

        debug!(fd, peer = ?self.peer, "connection established");

        self.notify(|handler, socket| handler.on_connected(socket));
        self.socket.flush();
    }

    /// Reports a recorded failure to the consumer, once, and tears the
    /// socket down.
    fn deliver_failure(&mut self) {
        let Some(kind) = self.socket.take_failure() else {
            return;
        };

        self.cancel_timeout();
        self.notify(|handler, socket| handler.on_error(socket, kind));
        self.state = SocketState::Error;
        self.close();
    }

    /// Carries out a close the consumer asked for during the last event.
    ///
    /// The request wins over a failure recorded in the same event: the
    /// consumer is closing the connection anyway.
    fn close_on_request(&mut self) -> bool {
        if !self.socket.take_close_request() {
            return false;
        }

        if let Some(kind) = self.socket.take_failure() {
            debug!(
                fd = self.socket.fd(),
                error = %kind,
                "closing on request, failure not reported"
            );
        }

        self.close();
        true
    }
}

impl<H: SocketHandler> EventHandler for BufferedSocket<H> {
    fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    fn wants_read(&self) -> bool {
        self.state != SocketState::Connecting
    }

    fn handle_event(&mut self, event: EventKind) {
        match event {
            EventKind::Error(errno) => {
                let kind = if self.state == SocketState::Connecting {
                    SocketError::Connect
                } else {
                    SocketError::from_errno(errno)
                };

                let e = io::Error::from_raw_os_error(errno);
                self.socket.fail(kind, e.to_string());
            }
            EventKind::Write => match self.state {
                SocketState::Connecting => self.finish_connect(),
                SocketState::Connected => {
                    self.socket.flush();
                }
                _ => {}
            },
            EventKind::Read => {
                if self.state == SocketState::Connected {
                    if let ReadOutcome::Data(_) = self.socket.do_read() {
                        self.notify(|handler, socket| handler.on_data_ready(socket));
                    }
                }
            }
        }

        if !self.close_on_request() {
            self.deliver_failure();
        }

        if self.socket.is_closed() && self.state != SocketState::Error {
            self.cancel_timeout();
            self.state = SocketState::Disconnected;
        }
    }
}

impl<H: SocketHandler> Drop for BufferedSocket<H> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    impl SocketHandler for Silent {
        fn on_data_ready(&mut self, _socket: &mut StreamSocket) {}

        fn on_error(&mut self, _socket: &mut StreamSocket, _error: SocketError) {}
    }

    #[test]
    fn test_connect_options_builder() {
        let dest: SocketAddr = "192.0.2.1:7000".parse().expect("Failed to parse address");
        let bind: IpAddr = "198.51.100.4".parse().expect("Failed to parse address");

        let opts = ConnectOptions::new(dest)
            .bind(bind)
            .timeout(Duration::from_secs(3))
            .max_sendq(4096);

        assert_eq!(opts.dest, dest);
        assert_eq!(opts.bind, Some(bind));
        assert_eq!(opts.timeout, Duration::from_secs(3));
        assert_eq!(opts.max_sendq, Some(4096));
        assert_eq!(ConnectOptions::new(dest).timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(opts.hook.is_none());
    }

    #[test]
    fn test_connecting_socket_does_not_want_reads() {
        let engine = Engine::new().expect("Failed to build engine");
        let mut socket = BufferedSocket::with_socket(StreamSocket::new(engine, -1), Silent);

        assert!(socket.wants_read());
        socket.state = SocketState::Connecting;
        assert!(!socket.wants_read());
    }

    #[test]
    fn test_close_without_descriptor_skips_consumer() {
        struct Counting(u32);

        impl SocketHandler for Counting {
            fn on_data_ready(&mut self, _socket: &mut StreamSocket) {}

            fn on_error(&mut self, _socket: &mut StreamSocket, _error: SocketError) {}

            fn on_close(&mut self, _socket: &mut StreamSocket) {
                self.0 += 1;
            }
        }

        let engine = Engine::new().expect("Failed to build engine");
        let mut socket =
            BufferedSocket::with_socket(StreamSocket::new(engine, -1), Counting(0));

        socket.close();
        assert_eq!(socket.handler().0, 0);
        assert_eq!(socket.state(), SocketState::Disconnected);
    }
}
