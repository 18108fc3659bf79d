//! Line echo server.
//!
//! ```text
//! cargo run --example line_echo -- [config.toml]
//! ```
//!
//! Listens on every `clients` bind of the configuration (or
//! `127.0.0.1:6667` when none is configured) and echoes each received
//! line back to its sender.

use relaynet::config::{BindKind, Config};
use relaynet::socket::{
    BufferedSocket, ListenHandler, ListenSocket, SocketHandler, SocketState, StreamSocket,
};
use relaynet::{Engine, EngineBuilder, SocketError};

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;
use std::rc::Rc;

use tracing::{error, info};

const DEFAULT_PORT: u16 = 6667;

struct Echo {
    peer: SocketAddr,
}

impl SocketHandler for Echo {
    fn on_data_ready(&mut self, socket: &mut StreamSocket) {
        while let Some(line) = socket.next_line(b'\n') {
            let line = line.trim_end_matches('\r');
            info!(peer = %self.peer, line, "echo");
            socket.write_data(format!("{line}\r\n").as_bytes());
        }
    }

    fn on_error(&mut self, _socket: &mut StreamSocket, error: SocketError) {
        info!(peer = %self.peer, %error, "client gone");
    }
}

type Clients = Rc<RefCell<Vec<Rc<RefCell<BufferedSocket<Echo>>>>>>;

struct Acceptor {
    clients: Clients,
}

impl ListenHandler for Acceptor {
    fn on_incoming_connection(&mut self, engine: &Engine, fd: RawFd, peer: SocketAddr) {
        match BufferedSocket::from_fd(engine, fd, Echo { peer }) {
            Ok(socket) => {
                info!(%peer, "client connected");
                self.clients.borrow_mut().push(socket);
            }
            Err(e) => error!(%peer, error = %e, "could not accept client"),
        }
    }

    fn on_error(&mut self, error: SocketError) {
        error!(%error, "listener failed");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    relaynet::logging::init(&config.logging)?;

    let engine = EngineBuilder::from_config(&config).build()?;
    info!(
        backend = engine.name(),
        max_descriptors = engine.max_descriptors(),
        "engine ready"
    );

    let mut addrs: Vec<SocketAddr> = config
        .bind
        .iter()
        .filter(|b| b.kind == BindKind::Clients)
        .map(|b| {
            let ip = b.ip().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            SocketAddr::new(ip, b.port.unwrap_or(DEFAULT_PORT))
        })
        .collect();

    if addrs.is_empty() {
        addrs.push(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), DEFAULT_PORT));
    }

    let clients: Clients = Rc::default();
    let mut listeners = Vec::new();

    for addr in addrs {
        let acceptor = Acceptor {
            clients: clients.clone(),
        };
        listeners.push(ListenSocket::bind(&engine, addr, acceptor)?);
    }

    engine.run_until(|| {
        clients
            .borrow_mut()
            .retain(|c| c.borrow().state() == SocketState::Connected);

        listeners
            .iter()
            .all(|l| l.borrow().state() != SocketState::Listening)
    })?;

    info!("every listener closed, exiting");
    Ok(())
}
