use std::os::fd::RawFd;

/// An event delivered to a registered handler.
///
/// Exactly one event is delivered per ready descriptor and dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The descriptor is readable, or the peer hung up.
    Read,

    /// The descriptor is writable. For a socket that is still connecting
    /// this signals completion of the connect attempt.
    Write,

    /// The OS flagged an error condition. Carries the pending `SO_ERROR`
    /// value, `0` if none could be retrieved.
    Error(i32),
}

/// A pollable object.
///
/// Handlers are registered with an [`Engine`](super::Engine) as
/// `Rc<RefCell<H>>`; the engine only keeps a weak reference and never
/// extends the handler's lifetime.
pub trait EventHandler {
    /// The descriptor this handler is registered under.
    ///
    /// Must not change while the handler is registered.
    fn fd(&self) -> RawFd;

    /// Whether the handler currently wants read readiness.
    ///
    /// A handler that does not want to read is polled for write readiness
    /// instead (a socket waiting for its connect to complete).
    fn wants_read(&self) -> bool {
        true
    }

    /// Delivers one event.
    ///
    /// The handler may unregister or drop itself, or any other handler,
    /// from inside this call.
    fn handle_event(&mut self, event: EventKind);
}
