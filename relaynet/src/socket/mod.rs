//! Sockets driven by the readiness engine.
//!
//! - [`StreamSocket`]: buffered, non-blocking stream descriptor,
//! - [`BufferedSocket`]: a stream socket with a connect lifecycle and
//!   consumer callbacks,
//! - [`ListenSocket`]: a passive socket handing accepted descriptors to
//!   a factory,
//! - [`IoHook`]: pluggable byte transform (TLS, compression).

mod buffered;
mod hook;
mod listener;
mod queue;
mod stream;

pub use buffered::{
    BufferedSocket, ConnectOptions, DEFAULT_CONNECT_TIMEOUT, SocketHandler, SocketState,
};
pub use hook::{HookStatus, IoHook};
pub use listener::{ListenHandler, ListenSocket};
pub use queue::{Flush, RecvQueue, SendQueue};
pub use stream::{ReadOutcome, StreamSocket};
