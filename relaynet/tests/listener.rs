mod common;

use common::{Client, Log, engines, pump, pump_until};
use relaynet::config::{BindConfig, BindKind, Config};
use relaynet::socket::{BufferedSocket, ListenHandler, ListenSocket, SocketState};
use relaynet::{Engine, EngineBuilder, Error, SocketError};

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::RawFd;
use std::rc::Rc;

/// Wraps every accepted descriptor in an echoing client.
#[derive(Default)]
struct Acceptor {
    accepted: Vec<(RawFd, SocketAddr)>,
    sockets: Vec<Rc<RefCell<BufferedSocket<Client>>>>,
    logs: Vec<Rc<RefCell<Log>>>,
}

impl ListenHandler for Acceptor {
    fn on_incoming_connection(&mut self, engine: &Engine, fd: RawFd, peer: SocketAddr) {
        self.accepted.push((fd, peer));

        let (client, log) = Client::echoing();
        let socket = BufferedSocket::from_fd(engine, fd, client).expect("Failed to wrap peer");

        self.sockets.push(socket);
        self.logs.push(log);
    }
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().expect("Failed to parse address")
}

#[test]
fn test_one_peer_produces_one_incoming_connection() {
    for engine in engines() {
        let listener = ListenSocket::bind(&engine, loopback(), Acceptor::default())
            .expect("Failed to listen");
        let addr = listener.borrow().local_addr();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.borrow().state(), SocketState::Listening);

        let mut peer = TcpStream::connect(addr).expect("Failed to connect to listener");

        pump_until(&engine, || listener.borrow().handler().accepted.len() == 1);
        pump(&engine, 3);

        let (fd, remote) = listener.borrow().handler().accepted[0];
        assert_eq!(listener.borrow().handler().accepted.len(), 1);
        assert!(fd >= 0);

        let reparsed: SocketAddr = remote.to_string().parse().expect("Failed to parse peer");
        assert_eq!(reparsed, peer.local_addr().expect("Failed to get local address"));

        peer.write_all(b"ping\n").expect("Failed to write to stream");

        let log = listener.borrow().handler().logs[0].clone();
        pump_until(&engine, || log.borrow().lines.len() == 1);

        let mut buffer = [0u8; 5];
        peer.read_exact(&mut buffer)
            .expect("Failed to read from stream");
        assert_eq!(&buffer, b"ping\n");
    }
}

#[test]
fn test_accepted_socket_sees_disconnect() {
    let engine = Engine::new().expect("Failed to build engine");
    let listener =
        ListenSocket::bind(&engine, loopback(), Acceptor::default()).expect("Failed to listen");
    let addr = listener.borrow().local_addr();

    let peer = TcpStream::connect(addr).expect("Failed to connect to listener");
    pump_until(&engine, || listener.borrow().handler().accepted.len() == 1);
    assert_eq!(engine.registered(), 2);

    drop(peer);

    let log = listener.borrow().handler().logs[0].clone();
    pump_until(&engine, || !log.borrow().errors.is_empty());

    assert_eq!(log.borrow().errors, vec![SocketError::Disconnected]);
    assert_eq!(engine.registered(), 1);
    assert_eq!(
        listener.borrow().handler().sockets[0].borrow().state(),
        SocketState::Error
    );
}

#[test]
fn test_many_peers_are_all_accepted() {
    let engine = Engine::builder()
        .build()
        .expect("Failed to build engine");
    let listener =
        ListenSocket::bind(&engine, loopback(), Acceptor::default()).expect("Failed to listen");
    let addr = listener.borrow().local_addr();

    let peers: Vec<TcpStream> = (0..20)
        .map(|_| TcpStream::connect(addr).expect("Failed to connect to listener"))
        .collect();

    pump_until(&engine, || listener.borrow().handler().accepted.len() == peers.len());
    assert_eq!(engine.registered(), peers.len() + 1);
}

#[test]
fn test_bind_conflict_is_a_bind_error() {
    let engine = Engine::new().expect("Failed to build engine");
    let taken = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let addr = taken.local_addr().expect("Failed to get local address");

    let result = ListenSocket::bind(&engine, addr, Acceptor::default());

    assert!(matches!(
        result,
        Err(Error::Socket {
            kind: SocketError::Bind,
            ..
        })
    ));
    assert_eq!(engine.registered(), 0);
}

#[test]
fn test_close_stops_listening() {
    let engine = Engine::new().expect("Failed to build engine");
    let listener =
        ListenSocket::bind(&engine, loopback(), Acceptor::default()).expect("Failed to listen");
    assert_eq!(engine.registered(), 1);

    listener.borrow_mut().close();
    listener.borrow_mut().close();

    assert_eq!(listener.borrow().state(), SocketState::Disconnected);
    assert_eq!(engine.registered(), 0);
}

#[test]
fn test_engine_from_config_document() {
    let config = Config::from_toml(
        r#"
        [engine]
        backend = "poll"
        max_descriptors = 64
        dispatch_timeout = "50ms"
        accept_batch = 1

        [[bind]]
        address = "127.0.0.1"
        port = 6667

        [[bind]]
        address = "198.51.100.4"
        type = "servers"
        "#,
    )
    .expect("Failed to parse config");

    let engine = EngineBuilder::from_config(&config)
        .build()
        .expect("Failed to build engine");

    assert_eq!(engine.name(), "poll");
    assert_eq!(engine.max_descriptors(), 64);
    assert_eq!(engine.binds().len(), 2);
    assert_eq!(engine.binds()[1].kind, BindKind::Servers);

    let dest: SocketAddr = "203.0.113.9:7000".parse().expect("Failed to parse address");
    assert_eq!(
        engine.outbound_bind_address(&dest),
        BindConfig::new("198.51.100.4", BindKind::Servers).ip()
    );

    // One accept per readiness event still drains the backlog over
    // several passes.
    let listener =
        ListenSocket::bind(&engine, loopback(), Acceptor::default()).expect("Failed to listen");
    let addr = listener.borrow().local_addr();
    let _peers: Vec<TcpStream> = (0..3)
        .map(|_| TcpStream::connect(addr).expect("Failed to connect to listener"))
        .collect();

    pump_until(&engine, || listener.borrow().handler().accepted.len() == 3);
}
