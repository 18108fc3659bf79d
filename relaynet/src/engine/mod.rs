//! Readiness engine.
//!
//! The engine tracks registered [`EventHandler`]s by descriptor, asks the
//! OS which descriptors are ready and delivers one [`EventKind`] per ready
//! descriptor and pass. It is strictly single-threaded: registration,
//! dispatch, handler callbacks and timer callbacks all run on the thread
//! that owns the engine.
//!
//! Handlers may register, unregister or drop handlers (including
//! themselves) while an event is being delivered. The engine snapshots
//! the ready list before invoking any callback and skips entries whose
//! registration disappeared or was replaced in the meantime.
//!
//! After servicing I/O, each dispatch consults the engine's
//! [`TimerQueue`] once.

mod handler;

pub(crate) mod poller;

pub use handler::{EventHandler, EventKind};
pub use poller::{Backend, Interest, Poller, Readiness};

use crate::config::{BindConfig, Config, EngineConfig, outbound_bind_address};
use crate::error::{Error, Result};
use crate::timer::TimerQueue;
use poller::platform::{sys_descriptor_limit, sys_socket_error};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

/// Descriptor table size used when the process limit cannot be queried.
const FALLBACK_MAX_DESCRIPTORS: usize = 1024;

/// Event counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub read_events: u64,
    pub write_events: u64,
    pub error_events: u64,
    pub dispatches: u64,
}

/// Registration record for one descriptor.
struct Slot {
    handler: Weak<RefCell<dyn EventHandler>>,

    /// Distinguishes this registration from a later one that reuses the
    /// same descriptor number.
    generation: u64,

    /// One-shot write interest, consumed by the next write event.
    write_armed: bool,

    /// Last known answer of `EventHandler::wants_read`.
    wants_read: bool,

    /// Interest currently installed in the backend.
    interest: Interest,
}

impl Slot {
    fn desired(&self) -> Interest {
        Interest {
            read: self.wants_read,
            write: self.write_armed || !self.wants_read,
        }
    }
}

/// What a ready descriptor receives in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Error,
    Write { consumes_arm: bool },
    Read,
    Skip,
}

/// Picks the single event a ready descriptor receives.
///
/// Errors win. A write-armed descriptor that is writable gets its write
/// event before any read; reads are only delivered to handlers that want
/// them, and anything else writable gets a write event.
fn select_event(ready: &Readiness, write_armed: bool, wants_read: bool) -> Delivery {
    if ready.error {
        return Delivery::Error;
    }

    if write_armed && ready.writable {
        return Delivery::Write { consumes_arm: true };
    }

    if wants_read && (ready.readable || ready.hangup) {
        return Delivery::Read;
    }

    if ready.writable || ready.hangup {
        return Delivery::Write {
            consumes_arm: write_armed,
        };
    }

    Delivery::Skip
}

enum Lookup {
    Gone,
    Dropped,
    Live {
        handler: Rc<RefCell<dyn EventHandler>>,
        write_armed: bool,
        wants_read: bool,
    },
}

struct Inner {
    poller: RefCell<Box<dyn Poller>>,
    slots: RefCell<HashMap<RawFd, Slot>>,
    ready: RefCell<Vec<Readiness>>,

    /// Scratch space shared by every socket's `recv`.
    read_buffer: RefCell<Vec<u8>>,

    timers: TimerQueue,
    config: EngineConfig,
    binds: Vec<BindConfig>,
    max_descriptors: usize,
    next_generation: Cell<u64>,
    stats: Cell<EngineStats>,
}

/// Handle to a readiness engine.
///
/// Cloning an `Engine` yields another handle to the same engine; sockets
/// keep one so they can unregister themselves. Independent engines can
/// coexist on one thread.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<Inner>,
}

impl Engine {
    /// Builds an engine with default settings and the platform's
    /// preferred backend.
    pub fn new() -> Result<Self> {
        EngineBuilder::new().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Name of the polling backend.
    pub fn name(&self) -> &'static str {
        self.inner.poller.borrow().name()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The timer schedule consulted after every dispatch.
    pub fn timers(&self) -> &TimerQueue {
        &self.inner.timers
    }

    /// Configured listening addresses.
    pub fn binds(&self) -> &[BindConfig] {
        &self.inner.binds
    }

    /// Local address an outbound connection to `dest` should bind to.
    pub fn outbound_bind_address(&self, dest: &SocketAddr) -> Option<IpAddr> {
        outbound_bind_address(&self.inner.binds, dest)
    }

    /// Size of the descriptor table, including the reserved slot.
    pub fn max_descriptors(&self) -> usize {
        self.inner.max_descriptors
    }

    /// Number of registered descriptors.
    pub fn registered(&self) -> usize {
        self.inner.slots.borrow().len()
    }

    /// Number of descriptors that can still be registered.
    pub fn remaining(&self) -> usize {
        self.inner
            .max_descriptors
            .saturating_sub(self.registered())
            .saturating_sub(1)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.inner.slots.borrow().contains_key(&fd)
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.stats.get()
    }

    /// Starts tracking a handler, polled for read readiness by default.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRegistered`] if a live handler is tracked under the
    ///   same descriptor; the existing registration is left untouched,
    /// - [`Error::CapacityExceeded`] if only the reserved slot is left,
    /// - [`Error::InvalidDescriptor`] for a negative descriptor.
    pub fn register<H>(&self, handler: &Rc<RefCell<H>>) -> Result<()>
    where
        H: EventHandler + 'static,
    {
        let (fd, wants_read) = {
            let h = handler.borrow();
            (h.fd(), h.wants_read())
        };

        if fd < 0 {
            return Err(Error::InvalidDescriptor(fd));
        }

        let mut slots = self.inner.slots.borrow_mut();

        if let Some(existing) = slots.get(&fd) {
            if existing.handler.strong_count() > 0 {
                return Err(Error::AlreadyRegistered(fd));
            }

            warn!(fd, "replacing the registration of a dropped handler");
            slots.remove(&fd);
            let _ = self.inner.poller.borrow_mut().delete(fd);
        }

        let limit = self.inner.max_descriptors;
        if limit.saturating_sub(slots.len()) <= 1 {
            warn!(fd, limit, "descriptor limit reached, refusing registration");
            return Err(Error::CapacityExceeded { limit });
        }

        let generation = self.inner.next_generation.get();
        self.inner.next_generation.set(generation + 1);

        let handler: Rc<RefCell<dyn EventHandler>> = handler.clone();
        let mut slot = Slot {
            handler: Rc::downgrade(&handler),
            generation,
            write_armed: false,
            wants_read,
            interest: Interest::default(),
        };
        slot.interest = slot.desired();

        self.inner.poller.borrow_mut().add(fd, slot.interest)?;
        slots.insert(fd, slot);

        debug!(fd, backend = self.name(), "registered descriptor");
        Ok(())
    }

    /// Asks for one write event on `fd`.
    ///
    /// The arm is consumed by the next write event delivered to the
    /// descriptor; a writer that still has data queued afterwards must
    /// arm again.
    pub fn request_write(&self, fd: RawFd) -> Result<()> {
        let mut slots = self.inner.slots.borrow_mut();
        let slot = slots.get_mut(&fd).ok_or(Error::NotRegistered(fd))?;

        slot.write_armed = true;
        self.apply_interest(fd, slot)
    }

    /// Stops tracking `fd`.
    ///
    /// Unregistering an unknown descriptor returns
    /// [`Error::NotRegistered`] and changes nothing.
    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        let removed = self.inner.slots.borrow_mut().remove(&fd);
        if removed.is_none() {
            return Err(Error::NotRegistered(fd));
        }

        if let Err(e) = self.inner.poller.borrow_mut().delete(fd) {
            debug!(fd, error = %e, "backend did not track descriptor");
        }

        debug!(fd, "unregistered descriptor");
        Ok(())
    }

    /// Re-reads the handler's read interest and updates the backend.
    ///
    /// Call after changing handler state outside of event delivery; the
    /// engine refreshes automatically after every delivered event.
    pub fn refresh(&self, fd: RawFd) -> Result<()> {
        let handler = {
            let slots = self.inner.slots.borrow();
            let slot = slots.get(&fd).ok_or(Error::NotRegistered(fd))?;
            slot.handler.upgrade()
        };

        let Some(handler) = handler else {
            self.prune(fd);
            return Ok(());
        };

        let wants_read = handler.try_borrow().map(|h| h.wants_read()).ok();
        drop(handler);

        let mut slots = self.inner.slots.borrow_mut();
        let slot = slots.get_mut(&fd).ok_or(Error::NotRegistered(fd))?;
        if let Some(wants_read) = wants_read {
            slot.wants_read = wants_read;
        }
        self.apply_interest(fd, slot)
    }

    /// Waits up to `timeout` for readiness and services every ready
    /// descriptor, then runs due timers.
    ///
    /// The wait is shortened to the earliest pending timer deadline.
    /// Returns the number of descriptors that received an event.
    pub fn dispatch(&self, timeout: Duration) -> Result<usize> {
        let wait = self
            .inner
            .timers
            .next_timeout(Instant::now())
            .map_or(timeout, |t| t.min(timeout));

        let mut ready = std::mem::take(&mut *self.inner.ready.borrow_mut());
        let polled = self.inner.poller.borrow_mut().poll(&mut ready, Some(wait));

        let batch: Vec<(Readiness, u64)> = {
            let slots = self.inner.slots.borrow();
            ready
                .iter()
                .filter(|r| !r.is_empty())
                .filter_map(|r| slots.get(&r.fd).map(|slot| (*r, slot.generation)))
                .collect()
        };
        *self.inner.ready.borrow_mut() = ready;

        polled?;

        let mut serviced = 0;
        for (readiness, generation) in batch {
            if self.deliver(readiness, generation) {
                serviced += 1;
            }
        }

        self.inner.timers.tick(Instant::now());

        let mut stats = self.inner.stats.get();
        stats.dispatches += 1;
        self.inner.stats.set(stats);

        Ok(serviced)
    }

    /// Dispatches with the configured timeout until `done` returns `true`.
    pub fn run_until<F>(&self, mut done: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        while !done() {
            self.dispatch(self.inner.config.dispatch_timeout)?;
        }
        Ok(())
    }

    /// Lends out the shared receive buffer, sized to `read_buffer`.
    ///
    /// Hand it back with [`Engine::return_read_buffer`]. A nested caller
    /// gets a fresh allocation.
    pub(crate) fn take_read_buffer(&self) -> Vec<u8> {
        let mut buffer = std::mem::take(&mut *self.inner.read_buffer.borrow_mut());
        buffer.resize(self.inner.config.read_buffer, 0);
        buffer
    }

    pub(crate) fn return_read_buffer(&self, buffer: Vec<u8>) {
        let mut slot = self.inner.read_buffer.borrow_mut();
        if slot.is_empty() {
            *slot = buffer;
        }
    }

    fn lookup(&self, fd: RawFd, generation: u64) -> Lookup {
        let slots = self.inner.slots.borrow();

        match slots.get(&fd) {
            Some(slot) if slot.generation == generation => match slot.handler.upgrade() {
                Some(handler) => Lookup::Live {
                    handler,
                    write_armed: slot.write_armed,
                    wants_read: slot.wants_read,
                },
                None => Lookup::Dropped,
            },
            _ => Lookup::Gone,
        }
    }

    fn deliver(&self, ready: Readiness, generation: u64) -> bool {
        let fd = ready.fd;

        let (handler, write_armed, cached_wants_read) = match self.lookup(fd, generation) {
            Lookup::Gone => return false,
            Lookup::Dropped => {
                self.prune(fd);
                return false;
            }
            Lookup::Live {
                handler,
                write_armed,
                wants_read,
            } => (handler, write_armed, wants_read),
        };

        let wants_read = handler
            .try_borrow()
            .map(|h| h.wants_read())
            .unwrap_or(cached_wants_read);

        let mut stats = self.inner.stats.get();
        let event = match select_event(&ready, write_armed, wants_read) {
            Delivery::Skip => return false,
            Delivery::Error => {
                stats.error_events += 1;
                let errno = sys_socket_error(fd).unwrap_or_else(|e| e.raw_os_error().unwrap_or(0));
                EventKind::Error(errno)
            }
            Delivery::Write { consumes_arm } => {
                stats.write_events += 1;
                if consumes_arm {
                    if let Some(slot) = self.inner.slots.borrow_mut().get_mut(&fd) {
                        slot.write_armed = false;
                    }
                }
                EventKind::Write
            }
            Delivery::Read => {
                stats.read_events += 1;
                EventKind::Read
            }
        };
        self.inner.stats.set(stats);

        trace!(fd, ?event, "delivering event");

        match handler.try_borrow_mut() {
            Ok(mut h) => h.handle_event(event),
            Err(_) => {
                warn!(fd, ?event, "handler is already borrowed, event dropped");
                return false;
            }
        }

        let wants_read = handler.try_borrow().map(|h| h.wants_read()).ok();
        drop(handler);

        self.settle(fd, generation, wants_read);
        true
    }

    /// Brings the backend interest of `fd` in line with its handler
    /// after an event, if the registration survived the callback.
    fn settle(&self, fd: RawFd, generation: u64, wants_read: Option<bool>) {
        let mut slots = self.inner.slots.borrow_mut();

        let Some(slot) = slots.get_mut(&fd) else {
            return;
        };
        if slot.generation != generation {
            return;
        }

        if let Some(wants_read) = wants_read {
            slot.wants_read = wants_read;
        }

        if let Err(e) = self.apply_interest(fd, slot) {
            warn!(fd, error = %e, "failed to update descriptor interest");
        }
    }

    fn apply_interest(&self, fd: RawFd, slot: &mut Slot) -> Result<()> {
        let desired = slot.desired();

        if desired != slot.interest {
            self.inner.poller.borrow_mut().modify(fd, desired)?;
            slot.interest = desired;
        }

        Ok(())
    }

    /// Drops the registration of a handler that was dropped without
    /// unregistering.
    fn prune(&self, fd: RawFd) {
        let removed = self.inner.slots.borrow_mut().remove(&fd);

        if removed.is_some() {
            warn!(fd, "pruning registration of a dropped handler");
            let _ = self.inner.poller.borrow_mut().delete(fd);
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.name())
            .field("registered", &self.registered())
            .field("max_descriptors", &self.inner.max_descriptors)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Builder for configuring and creating an [`Engine`].
///
/// # Examples
///
/// ```rust,ignore
/// let engine = Engine::builder()
///     .backend(Backend::Poll)
///     .max_descriptors(1024)
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    binds: Vec<BindConfig>,
    timers: Option<TimerQueue>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a loaded configuration document.
    pub fn from_config(config: &Config) -> Self {
        Self {
            config: config.engine.clone(),
            binds: config.bind.clone(),
            timers: None,
        }
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Sets the descriptor table size. One slot stays reserved.
    pub fn max_descriptors(mut self, n: usize) -> Self {
        self.config.max_descriptors = Some(n);
        self
    }

    pub fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.config.dispatch_timeout = timeout;
        self
    }

    /// Sets the number of bytes read per `recv` call.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn read_buffer(mut self, n: usize) -> Self {
        assert!(n > 0, "read_buffer must be > 0");

        self.config.read_buffer = n;
        self
    }

    pub fn binds(mut self, binds: Vec<BindConfig>) -> Self {
        self.binds = binds;
        self
    }

    /// Shares an existing timer schedule instead of creating one.
    pub fn timers(mut self, timers: TimerQueue) -> Self {
        self.timers = Some(timers);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let poller = self.config.backend.create()?;

        let max_descriptors = self
            .config
            .max_descriptors
            .or_else(sys_descriptor_limit)
            .unwrap_or(FALLBACK_MAX_DESCRIPTORS);

        debug!(backend = poller.name(), max_descriptors, "engine created");

        Ok(Engine {
            inner: Rc::new(Inner {
                poller: RefCell::new(poller),
                slots: RefCell::new(HashMap::new()),
                ready: RefCell::new(Vec::with_capacity(64)),
                read_buffer: RefCell::new(Vec::new()),
                timers: self.timers.unwrap_or_default(),
                config: self.config,
                binds: self.binds,
                max_descriptors,
                next_generation: Cell::new(0),
                stats: Cell::new(EngineStats::default()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(readable: bool, writable: bool, hangup: bool, error: bool) -> Readiness {
        Readiness {
            fd: 3,
            readable,
            writable,
            hangup,
            error,
        }
    }

    #[test]
    fn test_error_takes_priority() {
        let r = ready(true, true, true, true);
        assert_eq!(select_event(&r, true, true), Delivery::Error);
    }

    #[test]
    fn test_armed_write_precedes_read() {
        let r = ready(true, true, false, false);
        assert_eq!(
            select_event(&r, true, true),
            Delivery::Write { consumes_arm: true }
        );
        assert_eq!(select_event(&r, false, true), Delivery::Read);
    }

    #[test]
    fn test_armed_but_only_readable_reads_and_keeps_arm() {
        let r = ready(true, false, false, false);
        assert_eq!(select_event(&r, true, true), Delivery::Read);
    }

    #[test]
    fn test_not_read_interested_gets_write() {
        let r = ready(false, true, false, false);
        assert_eq!(
            select_event(&r, false, false),
            Delivery::Write {
                consumes_arm: false
            }
        );

        let r = ready(false, false, true, false);
        assert_eq!(
            select_event(&r, false, false),
            Delivery::Write {
                consumes_arm: false
            }
        );
    }

    #[test]
    fn test_hangup_is_delivered_as_read() {
        let r = ready(false, false, true, false);
        assert_eq!(select_event(&r, false, true), Delivery::Read);
    }

    #[test]
    fn test_nothing_reported_is_skipped() {
        let r = ready(false, false, false, false);
        assert_eq!(select_event(&r, true, true), Delivery::Skip);
    }

    #[test]
    fn test_slot_interest_follows_handler_state() {
        let mut slot = Slot {
            handler: Weak::<RefCell<Noop>>::new(),
            generation: 0,
            write_armed: false,
            wants_read: true,
            interest: Interest::default(),
        };

        assert_eq!(
            slot.desired(),
            Interest {
                read: true,
                write: false
            }
        );

        slot.write_armed = true;
        assert_eq!(
            slot.desired(),
            Interest {
                read: true,
                write: true
            }
        );

        slot.write_armed = false;
        slot.wants_read = false;
        assert_eq!(
            slot.desired(),
            Interest {
                read: false,
                write: true
            }
        );
    }

    struct Noop;

    impl EventHandler for Noop {
        fn fd(&self) -> RawFd {
            -1
        }

        fn handle_event(&mut self, _event: EventKind) {}
    }

    #[test]
    fn test_negative_descriptor_is_rejected() {
        let engine = Engine::new().expect("Failed to build engine");
        let handler = Rc::new(RefCell::new(Noop));

        assert!(matches!(
            engine.register(&handler),
            Err(Error::InvalidDescriptor(-1))
        ));
        assert_eq!(engine.registered(), 0);
    }

    #[test]
    fn test_builder_applies_descriptor_limit() {
        let engine = Engine::builder()
            .backend(Backend::Poll)
            .max_descriptors(8)
            .build()
            .expect("Failed to build engine");

        assert_eq!(engine.name(), "poll");
        assert_eq!(engine.max_descriptors(), 8);
        assert_eq!(engine.remaining(), 7);
    }

    #[test]
    fn test_read_buffer_is_shared_and_reused() {
        let engine = Engine::builder()
            .read_buffer(512)
            .build()
            .expect("Failed to build engine");

        let buffer = engine.take_read_buffer();
        assert_eq!(buffer.len(), 512);
        let ptr = buffer.as_ptr();

        let nested = engine.take_read_buffer();
        assert_eq!(nested.len(), 512);
        assert_ne!(nested.as_ptr(), ptr);

        engine.return_read_buffer(buffer);
        engine.return_read_buffer(nested);

        assert_eq!(engine.take_read_buffer().as_ptr(), ptr);
    }

    #[test]
    fn test_dispatch_with_nothing_registered_times_out() {
        let engine = Engine::new().expect("Failed to build engine");

        let serviced = engine
            .dispatch(Duration::from_millis(5))
            .expect("Dispatch failed");

        assert_eq!(serviced, 0);
        assert_eq!(engine.stats().dispatches, 1);
    }
}
