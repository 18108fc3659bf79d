//! # Relaynet
//!
//! **Relaynet** is the non-blocking socket core of a multi-server chat
//! daemon. It owns every descriptor the daemon talks through and turns OS
//! readiness into socket-level callbacks for the protocol layer above it.
//!
//! Everything runs on one thread. A single [`Engine`] dispatch loop
//! services the network; callbacks may register, write to, close or drop
//! sockets (their own included) while events are being delivered.
//!
//! The crate provides:
//!
//! - A **readiness engine** over `poll(2)`, `epoll` or `kqueue`, with the
//!   same observable event stream whichever backend runs
//! - **Buffered stream sockets** with FIFO send queues, line extraction
//!   and pluggable byte transforms ([`socket::IoHook`])
//! - **Outbound connections** bounded by a deadline timer
//! - **Listening sockets** handing accepted peers to a factory
//! - **Configuration** from TOML and **structured logging** via `tracing`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use relaynet::socket::{BufferedSocket, ListenHandler, ListenSocket, SocketHandler, StreamSocket};
//! use relaynet::{Engine, SocketError};
//!
//! struct Echo;
//!
//! impl SocketHandler for Echo {
//!     fn on_data_ready(&mut self, socket: &mut StreamSocket) {
//!         while let Some(line) = socket.next_line(b'\n') {
//!             socket.write_data(format!("{line}\n").as_bytes());
//!         }
//!     }
//!
//!     fn on_error(&mut self, _socket: &mut StreamSocket, error: SocketError) {
//!         tracing::info!(%error, "client gone");
//!     }
//! }
//!
//! let engine = Engine::new()?;
//! let listener = ListenSocket::bind(&engine, "127.0.0.1:6667".parse()?, Acceptor::default())?;
//! engine.run_until(|| false)?;
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: readiness engine, event handlers and polling backends
//! - [`socket`]: stream, managed and listening sockets
//! - [`timer`]: deadline timers consulted by the engine
//! - [`config`]: configuration document
//! - [`logging`]: subscriber initialization

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod socket;
pub mod timer;

pub use config::Config;
pub use engine::{Backend, Engine, EngineBuilder, EngineStats, EventHandler, EventKind};
pub use error::{Error, Result, SocketError};
pub use timer::{TimerId, TimerQueue};
