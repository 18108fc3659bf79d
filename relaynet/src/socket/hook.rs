use std::os::fd::RawFd;

/// Outcome of a hook transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    /// The buffer holds bytes ready to be passed on.
    Progress,

    /// No progress right now. Whatever is left in the buffer is kept by
    /// the socket and offered again, in front of any newer bytes, on the
    /// next attempt: the next write or write event for outbound data,
    /// the next read for inbound data.
    WouldBlock,

    /// The connection cannot continue.
    Fatal,
}

/// Byte transform sitting between a socket and its transport.
///
/// Hooks are supplied by an external provider (a TLS layer, a
/// compressor) and shared with the socket as `Rc<dyn IoHook>`; the
/// socket never owns the hook's state. Per-connection state is keyed by
/// descriptor and released in [`IoHook::on_close`].
pub trait IoHook {
    /// Transforms bytes received from the transport, in place, before
    /// they reach the receive buffer.
    fn on_read(&self, fd: RawFd, data: &mut Vec<u8>) -> HookStatus;

    /// Transforms outbound bytes, in place, before they are queued for
    /// the transport.
    fn on_write(&self, fd: RawFd, data: &mut Vec<u8>) -> HookStatus;

    /// The connection is closing; the descriptor is still open.
    fn on_close(&self, _fd: RawFd) {}
}
