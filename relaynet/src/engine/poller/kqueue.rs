//! `kqueue`-based poller implementation for macOS and the BSDs.
//!
//! Read and write readiness are separate kernel filters, so interest
//! changes are expressed as filter additions and deletions. Filter
//! results for the same descriptor are merged into one [`Readiness`].

use super::{Interest, Poller, Readiness};

use libc::{EV_ADD, EV_DELETE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Smallest event buffer handed to `kevent`.
const MIN_EVENTS: usize = 64;

pub(crate) struct KqueuePoller {
    /// Kqueue file descriptor.
    kq: RawFd,

    /// Filters currently installed per descriptor.
    installed: HashMap<RawFd, Interest>,

    /// Reusable buffer for returned events.
    events: Vec<libc::kevent>,

    /// Maps a descriptor to its slot in the output of the current poll.
    merged: HashMap<RawFd, usize>,
}

fn change(fd: RawFd, filter: i32, flags: u32) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev
}

impl KqueuePoller {
    pub(crate) fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        unsafe {
            libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC);
        }

        Ok(Self {
            kq,
            installed: HashMap::new(),
            events: vec![unsafe { std::mem::zeroed() }; MIN_EVENTS],
            merged: HashMap::new(),
        })
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as _,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };

        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn diff(fd: RawFd, old: Interest, new: Interest) -> Vec<libc::kevent> {
        let mut changes = Vec::with_capacity(2);

        if old.read != new.read {
            let flags = if new.read { EV_ADD } else { EV_DELETE };
            changes.push(change(fd, EVFILT_READ as i32, flags as u32));
        }
        if old.write != new.write {
            let flags = if new.write { EV_ADD } else { EV_DELETE };
            changes.push(change(fd, EVFILT_WRITE as i32, flags as u32));
        }

        changes
    }
}

impl Poller for KqueuePoller {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.installed.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }

        self.apply(&Self::diff(fd, Interest::default(), interest))?;
        self.installed.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let old = *self
            .installed
            .get(&fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;

        self.apply(&Self::diff(fd, old, interest))?;
        self.installed.insert(fd, interest);
        Ok(())
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        let old = self
            .installed
            .remove(&fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;

        // Filters vanish on their own once the descriptor is closed.
        match self.apply(&Self::diff(fd, old, Interest::default())) {
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    fn poll(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();
        self.merged.clear();

        let wanted = (self.installed.len() * 2).max(MIN_EVENTS);
        if self.events.len() < wanted {
            self.events.resize(wanted, unsafe { std::mem::zeroed() });
        }

        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: t.subsec_nanos() as _,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);

        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as _,
                ts_ptr,
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
            let fd = ev.ident as RawFd;
            let flags = ev.flags as u32;
            let filter = ev.filter as i32;

            let slot = *self.merged.entry(fd).or_insert_with(|| {
                ready.push(Readiness::new(fd));
                ready.len() - 1
            });
            let entry = &mut ready[slot];

            if flags & (EV_ERROR as u32) != 0 {
                entry.error = true;
                continue;
            }

            if filter == EVFILT_READ as i32 {
                entry.readable = true;
            } else if filter == EVFILT_WRITE as i32 {
                entry.writable = true;
            }

            if flags & (EV_EOF as u32) != 0 {
                entry.hangup = true;
                // A pending socket error is carried in `fflags` on EOF.
                if ev.fflags != 0 {
                    entry.error = true;
                }
            }
        }

        Ok(())
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
