//! Platform-specific readiness poller abstraction.
//!
//! This module provides a unified interface over the polling mechanisms
//! the engine can be built on:
//! - `poll(2)`, a readiness-set scan over every tracked descriptor,
//!   available on every unix,
//! - `epoll` on Linux,
//! - `kqueue` on macOS and the BSDs.
//!
//! Every backend reports plain readiness facts ([`Readiness`]). Deciding
//! which single event a descriptor receives in a dispatch pass is the
//! engine's job, so the observable event stream is identical whichever
//! backend is selected.

pub(crate) mod unix;

pub(crate) use unix as platform;

mod poll;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;

use serde::Deserialize;

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Readiness directions a descriptor is polled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

/// Readiness reported by a backend for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// The peer hung up; a read will observe end-of-stream.
    pub hangup: bool,
    /// The OS flagged an error condition on the descriptor.
    pub error: bool,
}

impl Readiness {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            readable: false,
            writable: false,
            hangup: false,
            error: false,
        }
    }

    /// Returns `true` when nothing at all was reported.
    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.hangup || self.error)
    }
}

/// A readiness backend.
///
/// Backends only track interest and translate OS notifications; they
/// never call into handlers.
pub trait Poller {
    /// Short name of the backend, for diagnostics.
    fn name(&self) -> &'static str;

    /// Starts tracking `fd`.
    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Replaces the interest of an already tracked descriptor.
    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Stops tracking `fd`.
    fn delete(&mut self, fd: RawFd) -> io::Result<()>;

    /// Waits up to `timeout` for readiness and fills `ready`, one entry
    /// per descriptor.
    ///
    /// An interrupted wait returns `Ok(())` with no entries.
    fn poll(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The kernel queue of the platform, falling back to `poll`.
    #[default]
    Auto,
    Poll,
    Epoll,
    Kqueue,
}

impl Backend {
    /// Resolves [`Backend::Auto`] to a concrete backend.
    pub fn resolve(self) -> Backend {
        match self {
            Backend::Auto => {
                if cfg!(any(target_os = "linux", target_os = "android")) {
                    Backend::Epoll
                } else if cfg!(any(
                    target_os = "macos",
                    target_os = "ios",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "openbsd",
                    target_os = "dragonfly"
                )) {
                    Backend::Kqueue
                } else {
                    Backend::Poll
                }
            }
            other => other,
        }
    }

    /// Returns `true` if this backend can be built on the current platform.
    pub fn is_available(self) -> bool {
        match self.resolve() {
            Backend::Poll => true,
            Backend::Epoll => cfg!(any(target_os = "linux", target_os = "android")),
            Backend::Kqueue => cfg!(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            )),
            Backend::Auto => false,
        }
    }

    /// Lists every concrete backend compiled for this platform.
    pub fn available() -> Vec<Backend> {
        [Backend::Poll, Backend::Epoll, Backend::Kqueue]
            .into_iter()
            .filter(|b| b.is_available())
            .collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Auto => "auto",
            Backend::Poll => "poll",
            Backend::Epoll => "epoll",
            Backend::Kqueue => "kqueue",
        }
    }

    /// Builds the backend.
    pub(crate) fn create(self) -> io::Result<Box<dyn Poller>> {
        match self.resolve() {
            Backend::Poll => Ok(Box::new(poll::PollPoller::new())),

            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll => Ok(Box::new(epoll::EpollPoller::new()?)),

            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue => Ok(Box::new(kqueue::KqueuePoller::new()?)),

            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("the {other} backend is not available on this platform"),
            )),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts an optional timeout into poll milliseconds.
///
/// Rounds up so that a sub-millisecond remainder does not turn into a
/// busy loop; `None` blocks indefinitely.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => {
            let ms = t.as_nanos().div_ceil(1_000_000);
            ms.min(i32::MAX as u128) as i32
        }
    }
}
