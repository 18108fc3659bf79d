mod common;

use common::{engines, pump_until, reset};
use relaynet::{Backend, Engine, Error, EventHandler, EventKind};

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Records the events delivered to one end of a socket pair.
struct Tracker {
    stream: UnixStream,
    events: Vec<EventKind>,
    wants_read: bool,
}

impl Tracker {
    fn pair() -> (Rc<RefCell<Tracker>>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().expect("Failed to create socket pair");
        ours.set_nonblocking(true)
            .expect("Failed to set non-blocking");

        let tracker = Tracker {
            stream: ours,
            events: Vec::new(),
            wants_read: true,
        };

        (Rc::new(RefCell::new(tracker)), theirs)
    }
}

impl EventHandler for Tracker {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn wants_read(&self) -> bool {
        self.wants_read
    }

    fn handle_event(&mut self, event: EventKind) {
        if event == EventKind::Read {
            let mut buffer = [0u8; 64];
            let _ = self.stream.read(&mut buffer);
        }
        self.events.push(event);
    }
}

/// A handler that only knows its descriptor.
struct Bare(RawFd);

impl EventHandler for Bare {
    fn fd(&self) -> RawFd {
        self.0
    }

    fn handle_event(&mut self, _event: EventKind) {}
}

#[test]
fn test_every_available_backend_builds() {
    let available = Backend::available();
    assert!(available.contains(&Backend::Poll));

    for backend in available {
        let engine = Engine::builder()
            .backend(backend)
            .build()
            .expect("Failed to build engine");
        assert_eq!(engine.name(), backend.as_str());
    }
}

#[test]
fn test_readable_descriptor_gets_read_event() {
    for engine in engines() {
        let (tracker, mut peer) = Tracker::pair();
        engine.register(&tracker).expect("Failed to register");

        peer.write_all(b"x").expect("Failed to write");

        let serviced = engine
            .dispatch(Duration::from_secs(1))
            .expect("Dispatch failed");

        assert_eq!(serviced, 1, "backend {}", engine.name());
        assert_eq!(tracker.borrow().events, vec![EventKind::Read]);
        assert_eq!(engine.stats().read_events, 1);
    }
}

#[test]
fn test_duplicate_registration_keeps_first_handler() {
    for engine in engines() {
        let (tracker, mut peer) = Tracker::pair();
        engine.register(&tracker).expect("Failed to register");

        let fd = tracker.borrow().fd();
        let impostor = Rc::new(RefCell::new(Bare(fd)));

        assert!(matches!(
            engine.register(&impostor),
            Err(Error::AlreadyRegistered(f)) if f == fd
        ));
        assert_eq!(engine.registered(), 1);

        peer.write_all(b"x").expect("Failed to write");
        engine
            .dispatch(Duration::from_secs(1))
            .expect("Dispatch failed");

        assert_eq!(tracker.borrow().events, vec![EventKind::Read]);
    }
}

#[test]
fn test_capacity_keeps_one_slot_in_reserve() {
    let engine = Engine::builder()
        .max_descriptors(3)
        .build()
        .expect("Failed to build engine");

    let (first, _p1) = Tracker::pair();
    let (second, _p2) = Tracker::pair();
    let (third, _p3) = Tracker::pair();

    assert_eq!(engine.remaining(), 2);
    engine.register(&first).expect("Failed to register");
    engine.register(&second).expect("Failed to register");
    assert_eq!(engine.remaining(), 0);

    assert!(matches!(
        engine.register(&third),
        Err(Error::CapacityExceeded { limit: 3 })
    ));
    assert_eq!(engine.registered(), 2);

    let fd = first.borrow().fd();
    engine.unregister(fd).expect("Failed to unregister");
    engine.register(&third).expect("Failed to register");
}

#[test]
fn test_unregister_twice_reports_not_registered() {
    let engine = Engine::new().expect("Failed to build engine");
    let (tracker, _peer) = Tracker::pair();
    let fd = tracker.borrow().fd();

    engine.register(&tracker).expect("Failed to register");
    engine.unregister(fd).expect("Failed to unregister");

    assert!(matches!(engine.unregister(fd), Err(Error::NotRegistered(f)) if f == fd));
    assert!(!engine.is_registered(fd));
    assert!(matches!(engine.request_write(fd), Err(Error::NotRegistered(_))));
}

#[test]
fn test_write_arm_is_one_shot() {
    for engine in engines() {
        let (tracker, _peer) = Tracker::pair();
        let fd = tracker.borrow().fd();

        engine.register(&tracker).expect("Failed to register");
        engine.request_write(fd).expect("Failed to arm write");

        engine
            .dispatch(Duration::from_secs(1))
            .expect("Dispatch failed");
        let serviced = engine
            .dispatch(Duration::from_millis(20))
            .expect("Dispatch failed");

        assert_eq!(serviced, 0, "backend {}", engine.name());
        assert_eq!(tracker.borrow().events, vec![EventKind::Write]);
    }
}

#[test]
fn test_armed_write_is_delivered_before_read() {
    for engine in engines() {
        let (tracker, mut peer) = Tracker::pair();
        let fd = tracker.borrow().fd();

        engine.register(&tracker).expect("Failed to register");
        peer.write_all(b"x").expect("Failed to write");
        engine.request_write(fd).expect("Failed to arm write");

        engine
            .dispatch(Duration::from_secs(1))
            .expect("Dispatch failed");
        assert_eq!(tracker.borrow().events, vec![EventKind::Write]);

        engine
            .dispatch(Duration::from_secs(1))
            .expect("Dispatch failed");
        assert_eq!(
            tracker.borrow().events,
            vec![EventKind::Write, EventKind::Read]
        );
    }
}

#[test]
fn test_handler_not_wanting_reads_is_polled_for_writes() {
    for engine in engines() {
        let (tracker, _peer) = Tracker::pair();
        tracker.borrow_mut().wants_read = false;

        engine.register(&tracker).expect("Failed to register");
        engine
            .dispatch(Duration::from_secs(1))
            .expect("Dispatch failed");

        assert_eq!(tracker.borrow().events, vec![EventKind::Write]);
    }
}

/// Unregisters every descriptor in `targets` on its first event.
struct Reaper {
    stream: UnixStream,
    engine: Engine,
    targets: Rc<RefCell<Vec<RawFd>>>,
    hits: Rc<Cell<usize>>,
}

impl EventHandler for Reaper {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn handle_event(&mut self, _event: EventKind) {
        self.hits.set(self.hits.get() + 1);

        for fd in self.targets.borrow_mut().drain(..) {
            let _ = self.engine.unregister(fd);
        }
    }
}

#[test]
fn test_handlers_may_unregister_each_other_mid_pass() {
    for engine in engines() {
        let targets = Rc::new(RefCell::new(Vec::new()));
        let hits = Rc::new(Cell::new(0));
        let mut peers = Vec::new();
        let mut reapers = Vec::new();

        for _ in 0..2 {
            let (ours, mut theirs) = UnixStream::pair().expect("Failed to create socket pair");
            ours.set_nonblocking(true)
                .expect("Failed to set non-blocking");
            theirs.write_all(b"x").expect("Failed to write");

            targets.borrow_mut().push(ours.as_raw_fd());
            reapers.push(Rc::new(RefCell::new(Reaper {
                stream: ours,
                engine: engine.clone(),
                targets: targets.clone(),
                hits: hits.clone(),
            })));
            peers.push(theirs);
        }

        for reaper in &reapers {
            engine.register(reaper).expect("Failed to register");
        }

        let serviced = engine
            .dispatch(Duration::from_secs(1))
            .expect("Dispatch failed");

        assert_eq!(serviced, 1, "backend {}", engine.name());
        assert_eq!(hits.get(), 1);
        assert_eq!(engine.registered(), 0);
    }
}

#[test]
fn test_dropped_handler_is_pruned() {
    for engine in engines() {
        let (ours, mut theirs) = UnixStream::pair().expect("Failed to create socket pair");
        ours.set_nonblocking(true)
            .expect("Failed to set non-blocking");

        let bare = Rc::new(RefCell::new(Bare(ours.as_raw_fd())));
        engine.register(&bare).expect("Failed to register");
        drop(bare);

        theirs.write_all(b"x").expect("Failed to write");
        let serviced = engine
            .dispatch(Duration::from_secs(1))
            .expect("Dispatch failed");

        assert_eq!(serviced, 0, "backend {}", engine.name());
        assert_eq!(engine.registered(), 0);
    }
}

#[test]
fn test_dropped_handler_slot_can_be_reused() {
    let engine = Engine::new().expect("Failed to build engine");
    let (tracker, _peer) = Tracker::pair();
    let fd = tracker.borrow().fd();

    let bare = Rc::new(RefCell::new(Bare(fd)));
    engine.register(&bare).expect("Failed to register");
    drop(bare);

    engine.register(&tracker).expect("Failed to re-register");
    assert_eq!(engine.registered(), 1);
}

#[test]
fn test_pending_timer_shortens_the_wait() {
    let engine = Engine::new().expect("Failed to build engine");
    let fired = Rc::new(Cell::new(false));

    let f = fired.clone();
    engine
        .timers()
        .schedule_after(Duration::from_millis(10), move |_| f.set(true));

    let started = Instant::now();
    engine.run_until(|| fired.get()).expect("Run failed");

    assert!(started.elapsed() < Duration::from_millis(900));
    assert!(engine.timers().is_empty());
    assert!(engine.stats().dispatches >= 1);
}

/// Records events without touching the descriptor.
struct Watcher {
    stream: TcpStream,
    events: Vec<EventKind>,
}

impl EventHandler for Watcher {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn handle_event(&mut self, event: EventKind) {
        self.events.push(event);
    }
}

#[test]
fn test_reset_connection_gets_error_event() {
    for engine in engines() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
        let addr = listener.local_addr().expect("Failed to get local address");

        let ours = TcpStream::connect(addr).expect("Failed to connect to listener");
        ours.set_nonblocking(true)
            .expect("Failed to set non-blocking");
        let (theirs, _) = listener.accept().expect("Failed to accept connection");

        let watcher = Rc::new(RefCell::new(Watcher {
            stream: ours,
            events: Vec::new(),
        }));
        engine.register(&watcher).expect("Failed to register");

        reset(theirs);

        pump_until(&engine, || !watcher.borrow().events.is_empty());

        let events = watcher.borrow().events.clone();
        assert!(
            matches!(events[0], EventKind::Error(errno) if errno != 0),
            "backend {} delivered {:?}",
            engine.name(),
            events
        );
        assert_eq!(engine.stats().error_events, 1);
        assert_eq!(engine.stats().read_events, 0);
    }
}
