//! Linux `epoll`-based poller implementation.
//!
//! Descriptors are registered level-triggered and their interest is
//! updated with `EPOLL_CTL_MOD` whenever the engine re-arms or disarms
//! write readiness. This backend is selected automatically on Linux
//! targets.

use super::{Interest, Poller, Readiness, timeout_ms};

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Smallest event buffer handed to `epoll_wait`.
const MIN_EVENTS: usize = 64;

/// Linux `epoll` poller.
///
/// This poller owns the `epoll` instance and a reusable event buffer
/// that grows with the number of tracked descriptors.
pub(crate) struct EpollPoller {
    /// Epoll file descriptor.
    epoll: RawFd,

    /// Reusable buffer for epoll events.
    events: Vec<epoll_event>,

    /// Number of descriptors currently tracked.
    tracked: usize,
}

impl EpollPoller {
    /// Create a new `EpollPoller`.
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll,
            events: vec![epoll_event { events: 0, u64: 0 }; MIN_EVENTS],
            tracked: 0,
        })
    }

    fn ctl(&self, op: i32, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut flags = EPOLLRDHUP;

        if interest.read {
            flags |= EPOLLIN;
        }
        if interest.write {
            flags |= EPOLLOUT;
        }

        let mut event = epoll_event {
            events: flags as u32,
            u64: fd as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Poller for EpollPoller {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, interest)?;
        self.tracked += 1;
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, interest)
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        self.tracked = self.tracked.saturating_sub(1);

        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn poll(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();

        let wanted = self.tracked.max(MIN_EVENTS);
        if self.events.len() < wanted {
            self.events.resize(wanted, epoll_event { events: 0, u64: 0 });
        }

        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for ev in &self.events[..n as usize] {
            let flags = ev.events;
            let fd = ev.u64 as RawFd;

            ready.push(Readiness {
                fd,
                readable: flags & (EPOLLIN as u32) != 0,
                writable: flags & (EPOLLOUT as u32) != 0,
                hangup: flags & ((EPOLLHUP | EPOLLRDHUP) as u32) != 0,
                error: flags & (EPOLLERR as u32) != 0,
            });
        }

        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll);
        }
    }
}
