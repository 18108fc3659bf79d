use super::hook::{HookStatus, IoHook};
use super::queue::{Flush, RecvQueue, SendQueue};
use crate::engine::Engine;
use crate::engine::poller::platform::{
    sys_close, sys_peername, sys_recv, sys_send, sys_shutdown, sys_sockname,
};
use crate::error::SocketError;

use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::RawFd;
use std::rc::Rc;

use tracing::{debug, trace, warn};

/// Upper bound on `recv` calls per read event, so one busy peer cannot
/// starve the others.
const READS_PER_EVENT: usize = 4;

/// Result of [`StreamSocket::do_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were appended to the receive buffer.
    Data(usize),

    /// Nothing new arrived.
    Nothing,

    /// The peer closed the connection and nothing was appended.
    Closed,
}

/// One connected, non-blocking stream descriptor with its buffers.
///
/// Outbound data is queued and written in FIFO order, inbound data is
/// accumulated until the consumer extracts it. An optional [`IoHook`]
/// transforms bytes in both directions; bytes the hook is not ready for
/// yet are held back in order and offered to it again later.
///
/// Failures are recorded, never panicked on. The first recorded error
/// marks the socket dead; later errors do not overwrite it. The owning
/// [`BufferedSocket`](super::BufferedSocket) reports the failure to its
/// consumer and tears the socket down.
pub struct StreamSocket {
    fd: RawFd,
    engine: Engine,
    hook: Option<Rc<dyn IoHook>>,

    sendq: SendQueue,
    recvq: RecvQueue,

    /// Outbound bytes the write transform has not accepted yet.
    hook_out: Vec<u8>,

    /// Inbound bytes the read transform has not accepted yet.
    hook_in: Vec<u8>,

    /// Terminal error message, set once.
    error: Option<String>,

    /// Failure kind not yet reported to the consumer.
    failure: Option<SocketError>,

    max_sendq: Option<usize>,

    /// Whether the descriptor is tracked by `engine`.
    registered: bool,

    /// Holds queued writes back until the connection is established.
    corked: bool,

    /// Set while the owner runs a consumer callback.
    in_callback: bool,

    /// `close` was called from a consumer callback.
    close_requested: bool,
}

impl StreamSocket {
    /// Wraps a non-blocking descriptor. The socket owns `fd` from now on.
    pub(crate) fn new(engine: Engine, fd: RawFd) -> Self {
        Self {
            fd,
            engine,
            hook: None,
            sendq: SendQueue::new(),
            recvq: RecvQueue::new(),
            hook_out: Vec::new(),
            hook_in: Vec::new(),
            error: None,
            failure: None,
            max_sendq: None,
            registered: false,
            corked: false,
            in_callback: false,
            close_requested: false,
        }
    }

    /// The descriptor, `-1` once closed.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn is_closed(&self) -> bool {
        self.fd < 0
    }

    pub fn hook(&self) -> Option<&Rc<dyn IoHook>> {
        self.hook.as_ref()
    }

    /// Installs or removes the byte transform.
    ///
    /// Bytes already queued or buffered are not transformed again.
    pub fn set_hook(&mut self, hook: Option<Rc<dyn IoHook>>) {
        self.hook = hook;
    }

    /// Limits the number of queued outbound bytes. Exceeding the limit is
    /// a write failure.
    pub fn set_max_sendq(&mut self, limit: Option<usize>) {
        self.max_sendq = limit;
    }

    pub fn max_sendq(&self) -> Option<usize> {
        self.max_sendq
    }

    /// Number of outbound bytes waiting for the transport, including
    /// those still held back by the hook.
    pub fn sendq_len(&self) -> usize {
        self.sendq.len() + self.hook_out.len()
    }

    pub fn recvq(&self) -> &RecvQueue {
        &self.recvq
    }

    pub fn recvq_mut(&mut self) -> &mut RecvQueue {
        &mut self.recvq
    }

    pub(crate) fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    pub(crate) fn set_corked(&mut self, corked: bool) {
        self.corked = corked;
    }

    /// Queues `data` and tries to write it right away.
    ///
    /// The hook's write transform runs here. Whatever the transport does
    /// not accept stays queued and the engine is asked for a write event.
    /// Writes to a dead, closed or closing socket are dropped.
    pub fn write_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if self.is_dead() || self.is_closed() || self.close_requested {
            trace!(fd = self.fd, len = data.len(), "dropping write to dead socket");
            return;
        }

        if self.hook.is_some() || !self.hook_out.is_empty() {
            self.hook_out.extend_from_slice(data);
            if !self.encode() {
                return;
            }
        } else {
            self.sendq.push(data.to_vec());
        }

        if let Some(limit) = self.max_sendq {
            let queued = self.sendq_len();
            if queued > limit {
                warn!(fd = self.fd, queued, limit, "send queue exceeded");
                self.fail(SocketError::Write, "SendQ exceeded");
                return;
            }
        }

        if !self.corked {
            self.flush_queue();
        }
    }

    /// Passes held-back outbound bytes through the write transform into
    /// the send queue. Returns `false` if the hook failed.
    fn encode(&mut self) -> bool {
        if self.hook_out.is_empty() {
            return true;
        }

        let mut chunk = mem::take(&mut self.hook_out);

        let Some(hook) = self.hook.clone() else {
            self.sendq.push(chunk);
            return true;
        };

        match hook.on_write(self.fd, &mut chunk) {
            HookStatus::Progress => {
                self.sendq.push(chunk);
                true
            }
            HookStatus::WouldBlock => {
                trace!(fd = self.fd, held = chunk.len(), "write hook would block");
                self.hook_out = chunk;
                true
            }
            HookStatus::Fatal => {
                self.fail(SocketError::Write, "Write hook failure");
                false
            }
        }
    }

    /// Runs the read transform over `raw`, prefixed by anything it held
    /// back earlier. Returns the number of bytes appended to the receive
    /// buffer, `None` if the hook failed.
    fn decode(&mut self, hook: &dyn IoHook, raw: &[u8]) -> Option<usize> {
        let mut chunk = mem::take(&mut self.hook_in);
        chunk.extend_from_slice(raw);

        match hook.on_read(self.fd, &mut chunk) {
            HookStatus::Progress => {
                self.recvq.extend(&chunk);
                Some(chunk.len())
            }
            HookStatus::WouldBlock => {
                trace!(fd = self.fd, held = chunk.len(), "read hook would block");
                self.hook_in = chunk;
                Some(0)
            }
            HookStatus::Fatal => {
                self.fail(SocketError::Other, "Read hook failure");
                None
            }
        }
    }

    /// Writes as much of the send queue as the transport accepts.
    ///
    /// Bytes held back by the hook are offered to it again first. Returns
    /// `false` if the socket is dead.
    pub fn flush(&mut self) -> bool {
        if self.is_dead() || self.is_closed() {
            return false;
        }

        if !self.encode() {
            return false;
        }

        self.flush_queue()
    }

    fn flush_queue(&mut self) -> bool {
        let fd = self.fd;
        let blocked = match self.sendq.flush_with(|data| sys_send(fd, data)) {
            Flush::Drained => false,
            Flush::Blocked => true,
            Flush::Failed(e) => {
                self.fail(SocketError::Write, e.to_string());
                return false;
            }
        };

        if !blocked && self.hook_out.is_empty() {
            trace!(fd, "send queue drained");
            return true;
        }

        trace!(fd, queued = self.sendq_len(), "send queue blocked");

        if self.registered {
            if let Err(e) = self.engine.request_write(fd) {
                warn!(fd, error = %e, "could not request write readiness");
                self.fail(SocketError::Other, e.to_string());
                return false;
            }
        }
        true
    }

    /// Drains the descriptor into the receive buffer.
    ///
    /// End of stream and read errors are recorded as failures.
    pub fn do_read(&mut self) -> ReadOutcome {
        if self.is_dead() || self.is_closed() {
            return ReadOutcome::Nothing;
        }

        let engine = self.engine.clone();
        let mut buffer = engine.take_read_buffer();

        let mut appended = 0;
        let mut closed = false;

        for _ in 0..READS_PER_EVENT {
            let n = match sys_recv(self.fd, &mut buffer) {
                Ok(0) => {
                    self.fail(SocketError::Disconnected, "Connection closed");
                    closed = true;
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let kind = SocketError::from_errno(e.raw_os_error().unwrap_or(0));
                    self.fail(kind, e.to_string());
                    break;
                }
            };

            match self.hook.clone() {
                Some(hook) => match self.decode(hook.as_ref(), &buffer[..n]) {
                    Some(n) => appended += n,
                    None => break,
                },
                None => {
                    self.recvq.extend(&buffer[..n]);
                    appended += n;
                }
            }
        }

        engine.return_read_buffer(buffer);

        if appended > 0 {
            trace!(fd = self.fd, appended, buffered = self.recvq.len(), "read data");
            ReadOutcome::Data(appended)
        } else if closed {
            ReadOutcome::Closed
        } else {
            ReadOutcome::Nothing
        }
    }

    /// Extracts the next `delim`-terminated line, without the delimiter.
    ///
    /// Invalid UTF-8 is replaced. Returns `None` until a full line is
    /// buffered.
    pub fn next_line(&mut self, delim: u8) -> Option<String> {
        self.recvq
            .next_line(delim)
            .map(|line| String::from_utf8_lossy(&line).into_owned())
    }

    /// Records a terminal error message.
    ///
    /// Only the first message sticks. Does not by itself notify the
    /// consumer.
    pub fn set_error(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            let message = message.into();
            debug!(fd = self.fd, error = %message, "socket marked dead");
            self.error = Some(message);
        }
    }

    /// The terminal error message, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_dead(&self) -> bool {
        self.error.is_some()
    }

    /// Records a failure to be reported to the consumer. Ignored if the
    /// socket is already dead.
    pub(crate) fn fail(&mut self, kind: SocketError, message: impl Into<String>) {
        if self.error.is_some() {
            return;
        }

        let message = message.into();
        debug!(fd = self.fd, error = %kind, reason = %message, "socket failed");

        self.error = Some(message);
        self.failure = Some(kind);
    }

    pub(crate) fn take_failure(&mut self) -> Option<SocketError> {
        self.failure.take()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sys_peername(self.fd)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sys_sockname(self.fd)
    }

    pub(crate) fn enter_callback(&mut self) {
        self.in_callback = true;
    }

    pub(crate) fn leave_callback(&mut self) {
        self.in_callback = false;
    }

    /// Whether `close` was called from a consumer callback and is waiting
    /// for the callback to return.
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub(crate) fn take_close_request(&mut self) -> bool {
        mem::take(&mut self.close_requested)
    }

    /// Closes the connection.
    ///
    /// Called from a consumer callback, the close is carried out by the
    /// owning socket once the callback returns, after the consumer's
    /// `on_close`. Otherwise the descriptor is released right away. Only
    /// the first call has an effect.
    pub fn close(&mut self) {
        if self.in_callback {
            if !self.is_closed() {
                self.close_requested = true;
            }
            return;
        }

        self.release();
    }

    /// Releases the descriptor: unregisters it, runs the hook's closing
    /// step, then shuts the connection down and closes it.
    pub(crate) fn release(&mut self) {
        self.close_requested = false;

        if self.fd < 0 {
            return;
        }

        let fd = self.fd;

        if self.registered {
            if let Err(e) = self.engine.unregister(fd) {
                debug!(fd, error = %e, "descriptor was already unregistered");
            }
            self.registered = false;
        }

        if let Some(hook) = &self.hook {
            hook.on_close(fd);
        }

        let _ = sys_shutdown(fd, Shutdown::Both);
        sys_close(fd);

        self.fd = -1;
        self.sendq.clear();
        self.hook_out.clear();
        self.hook_in.clear();

        debug!(fd, "socket closed");
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        self.release();
    }
}
