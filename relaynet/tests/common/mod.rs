#![allow(dead_code)]

use relaynet::socket::{SocketHandler, StreamSocket};
use relaynet::{Backend, Engine, SocketError};

use std::cell::RefCell;
use std::mem;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Upper bound on how long a test waits for the network.
const PUMP_DEADLINE: Duration = Duration::from_secs(5);

/// One engine per backend compiled for this platform.
pub fn engines() -> Vec<Engine> {
    Backend::available()
        .into_iter()
        .map(|backend| {
            Engine::builder()
                .backend(backend)
                .build()
                .expect("Failed to build engine")
        })
        .collect()
}

/// Dispatches until `done` returns `true`.
///
/// # Panics
///
/// Panics if the condition is not reached within a few seconds.
pub fn pump_until<F>(engine: &Engine, mut done: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + PUMP_DEADLINE;

    while !done() {
        assert!(
            Instant::now() < deadline,
            "condition not reached on the {} backend",
            engine.name()
        );

        engine
            .dispatch(Duration::from_millis(20))
            .expect("Dispatch failed");
    }
}

/// Dispatches `n` short passes.
pub fn pump(engine: &Engine, n: usize) {
    for _ in 0..n {
        engine
            .dispatch(Duration::from_millis(5))
            .expect("Dispatch failed");
    }
}

/// Drops `stream` with a zero linger, so the peer receives a reset
/// instead of an orderly shutdown.
pub fn reset(stream: TcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };

    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0, "Failed to set SO_LINGER");

    drop(stream);
}

/// Everything a [`Client`] observed.
#[derive(Debug, Default)]
pub struct Log {
    pub connected: usize,
    pub timeouts: usize,
    pub closes: usize,

    /// Whether the descriptor was still open when `on_close` last ran.
    pub open_at_close: bool,
    pub errors: Vec<SocketError>,
    pub lines: Vec<String>,
}

/// A line-oriented consumer that records its callbacks.
pub struct Client {
    pub log: Rc<RefCell<Log>>,

    /// Echo every received line back to the peer.
    pub echo: bool,

    /// Close the connection on a `QUIT` line.
    pub quit: bool,
}

impl Client {
    pub fn new() -> (Self, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let client = Self {
            log: log.clone(),
            echo: false,
            quit: false,
        };

        (client, log)
    }

    pub fn echoing() -> (Self, Rc<RefCell<Log>>) {
        let (mut client, log) = Self::new();
        client.echo = true;
        (client, log)
    }
}

impl SocketHandler for Client {
    fn on_data_ready(&mut self, socket: &mut StreamSocket) {
        while let Some(line) = socket.next_line(b'\n') {
            if self.echo {
                socket.write_data(format!("{line}\n").as_bytes());
            }
            let quit = self.quit && line == "QUIT";
            self.log.borrow_mut().lines.push(line);

            if quit {
                socket.close();
                break;
            }
        }
    }

    fn on_error(&mut self, _socket: &mut StreamSocket, error: SocketError) {
        self.log.borrow_mut().errors.push(error);
    }

    fn on_connected(&mut self, _socket: &mut StreamSocket) {
        self.log.borrow_mut().connected += 1;
    }

    fn on_timeout(&mut self, _socket: &mut StreamSocket) {
        self.log.borrow_mut().timeouts += 1;
    }

    fn on_close(&mut self, socket: &mut StreamSocket) {
        let mut log = self.log.borrow_mut();
        log.closes += 1;
        log.open_at_close = !socket.is_closed();
    }
}
