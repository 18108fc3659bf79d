//! `poll(2)`-based readiness scan.
//!
//! The portable reference backend: every dispatch rebuilds the
//! readiness set from the tracked descriptors and scans the result.
//! Cost grows with the number of tracked descriptors, but the backend
//! works on every unix and keeps no kernel-side state.

use super::{Interest, Poller, Readiness, timeout_ms};

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, nfds_t, pollfd};
use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

pub(crate) struct PollPoller {
    /// Tracked descriptors, kept ordered so scans are deterministic.
    fds: BTreeMap<RawFd, Interest>,

    /// Reusable readiness set passed to `poll(2)`.
    set: Vec<pollfd>,
}

impl PollPoller {
    pub(crate) fn new() -> Self {
        Self {
            fds: BTreeMap::new(),
            set: Vec::with_capacity(64),
        }
    }
}

fn events_for(interest: Interest) -> i16 {
    let mut events = 0;
    if interest.read {
        events |= POLLIN;
    }
    if interest.write {
        events |= POLLOUT;
    }
    events
}

impl Poller for PollPoller {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.fds.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        self.fds.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.fds.get_mut(&fd) {
            Some(slot) => {
                *slot = interest;
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        match self.fds.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn poll(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();

        self.set.clear();
        self.set.extend(self.fds.iter().map(|(&fd, &interest)| pollfd {
            fd,
            events: events_for(interest),
            revents: 0,
        }));

        let rc = unsafe {
            libc::poll(
                self.set.as_mut_ptr(),
                self.set.len() as nfds_t,
                timeout_ms(timeout),
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        if rc == 0 {
            return Ok(());
        }

        for pfd in &self.set {
            let re = pfd.revents;
            if re == 0 {
                continue;
            }

            ready.push(Readiness {
                fd: pfd.fd,
                readable: re & POLLIN != 0,
                writable: re & POLLOUT != 0,
                hangup: re & POLLHUP != 0,
                error: re & (POLLERR | POLLNVAL) != 0,
            });
        }

        Ok(())
    }
}
