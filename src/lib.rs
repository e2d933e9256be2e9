//! Connection engine for IRC clients.
//!
//! The heart of the crate is a sans-I/O protocol state machine: an
//! [`Endpoint`] owning any number of [`connection`] state machines, fed
//! with inbound bytes and timer expirations and polled for typed events
//! and I/O operations. A small mio-based reactor (one thread per process,
//! shared by every connection and owned by a [`Supervisor`]) performs the
//! actual socket work: TCP with optional TLS, line framing, the
//! flood-control pacer, idle watchdogs, capability negotiation and
//! automatic reconnect with state carryover.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::{Collaborators, Config, Event, Supervisor};
//!
//! let log = slog::Logger::root(slog::Discard, slog::o!());
//! let supervisor = Supervisor::new(log);
//! let config = Config::builder("irc.example.net", 6667)
//!     .nick("kelpie")
//!     .build()
//!     .unwrap();
//! let collab = Collaborators::with_bus(Arc::new(|event: Event| {
//!     println!("{:?}", event);
//! }));
//! let client = supervisor.connect(config, collab).unwrap();
//! client.join("#rust");
//! client.send_message("#rust", "hello");
//! client.shutdown(Some("bye"));
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod ctcp;
pub mod endpoint;
pub mod event;
pub mod frame;
pub mod message;
pub mod sink;

mod reactor;
mod tls;
mod transport;

pub use client::{Client, ConnectError, Supervisor};
pub use config::{CapPolicy, Config, ConfigBuilder, ConfigError, NickStrategy, TrustDecider};
pub use connection::{Connection, ConnectionError, State};
pub use endpoint::{ConnectionHandle, Context, Endpoint, Io, Timer};
pub use event::{Collaborators, Event, EventBus};
pub use message::{Message, Prefix};
pub use sink::{QueueSink, Sink};
