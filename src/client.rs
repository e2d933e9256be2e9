//! The control surface user code holds: a [`Supervisor`] owning the shared
//! reactor and a per-connection [`Client`] façade whose methods are callable
//! from any thread.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, unbounded};
use mio::{Poll, Waker};
use rustls_pki_types::ServerName;
use slog::{o, Logger};
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::ctcp;
use crate::endpoint::ConnectionHandle;
use crate::event::Collaborators;
use crate::reactor::{self, Command, Handle, Slot, WAKER};
use crate::tls;
use crate::transport::{SessionParams, TlsParams};

/// Errors surfaced synchronously by [`Supervisor::connect`]. TLS material
/// problems are fatal: the connection is never dialled and reconnect never
/// engages.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid server name {0}")]
    ServerName(String),
    #[error("reactor unavailable")]
    Reactor,
}

/// Process-wide registry of live connections and owner of the shared
/// reactor thread. An explicit value rather than an ambient global:
/// construct one, clone it wherever connections are opened. The reactor is
/// spawned lazily on the first connect, winds down when the last connection
/// closes without reconnect, and respawns on the next connect.
#[derive(Clone)]
pub struct Supervisor {
    log: Logger,
    shared: Arc<Mutex<Slot>>,
}

impl Supervisor {
    pub fn new(log: Logger) -> Self {
        Supervisor {
            log,
            shared: Arc::new(Mutex::new(Slot {
                generation: 0,
                handle: None,
            })),
        }
    }

    /// Whether the reactor thread is currently running.
    pub fn is_active(&self) -> bool {
        self.shared.lock().unwrap().handle.is_some()
    }

    /// Open a connection described by `config`, attaching `collab` for
    /// events and diagnostics. Heavy preparation (TLS material, DNS) runs
    /// on the calling thread so the reactor never blocks on it.
    pub fn connect(&self, config: Config, collab: Collaborators) -> Result<Client, ConnectError> {
        let tls = if config.ssl {
            let server_name = ServerName::try_from(config.server_host.clone())
                .map_err(|_| ConnectError::ServerName(config.server_host.clone()))?;
            Some(TlsParams {
                config: tls::client_config(&config)?,
                server_name,
            })
        } else {
            None
        };
        let addr = resolve(&config.server_host, config.server_port)?;
        let session = SessionParams {
            addr,
            bind: config.bind_address,
            tls,
        };
        let (done_tx, done_rx) = bounded(1);
        let command = Command::Connect {
            config: Arc::new(config),
            collab,
            session,
            done: done_tx,
        };

        let handle = {
            let mut slot = self.shared.lock().unwrap();
            match &slot.handle {
                Some(handle) => {
                    let handle = handle.clone();
                    handle.tx.send(command).map_err(|_| ConnectError::Reactor)?;
                    let _ = handle.waker.wake();
                    handle
                }
                None => {
                    let poll = Poll::new().map_err(|_| ConnectError::Reactor)?;
                    let waker = Arc::new(
                        Waker::new(poll.registry(), WAKER).map_err(|_| ConnectError::Reactor)?,
                    );
                    let (tx, rx) = unbounded();
                    slot.generation += 1;
                    let generation = slot.generation;
                    // Queued before the thread starts, so the reactor cannot
                    // find an empty queue and wind down before it has seen
                    // this connection.
                    tx.send(command).map_err(|_| ConnectError::Reactor)?;
                    reactor::spawn(
                        self.log.new(o!("reactor" => generation)),
                        self.shared.clone(),
                        generation,
                        rx,
                        poll,
                    )
                    .map_err(|_| ConnectError::Reactor)?;
                    let handle = Handle { tx, waker };
                    slot.handle = Some(handle.clone());
                    handle
                }
            }
        };
        let conn = done_rx.recv().map_err(|_| ConnectError::Reactor)?;
        Ok(Client { conn, handle })
    }
}

/// Thin façade over one connection. Cheap to clone; all methods are
/// thread-safe and translate into commands executed serially on the
/// reactor. Calls made after the connection closed for good are silently
/// dropped.
#[derive(Clone)]
pub struct Client {
    conn: ConnectionHandle,
    handle: Handle,
}

impl Client {
    fn send(&self, command: Command) {
        if self.handle.tx.send(command).is_ok() {
            let _ = self.handle.waker.wake();
        }
    }

    /// Queue a raw line behind the pacer. Lines submitted before the
    /// connection is ready are held and flushed once it is.
    pub fn send_raw_line(&self, line: &str) {
        self.send(Command::Enqueue {
            conn: self.conn,
            line: sanitize(line),
            priority: false,
        });
    }

    /// Send a raw line ahead of the pacer queue.
    pub fn send_raw_line_immediately(&self, line: &str) {
        self.send(Command::Enqueue {
            conn: self.conn,
            line: sanitize(line),
            priority: true,
        });
    }

    pub fn send_message(&self, target: &str, text: &str) {
        self.send_raw_line(&format!("PRIVMSG {} :{}", target, text));
    }

    pub fn send_notice(&self, target: &str, text: &str) {
        self.send_raw_line(&format!("NOTICE {} :{}", target, text));
    }

    /// CTCP query: the payload is quoted and wrapped in delimiters.
    pub fn send_ctcp_message(&self, target: &str, payload: &str) {
        self.send_raw_line(&format!("PRIVMSG {} :{}", target, ctcp::wrap(payload)));
    }

    /// CTCP reply, carried in a NOTICE.
    pub fn send_ctcp_reply(&self, target: &str, payload: &str) {
        self.send_raw_line(&format!("NOTICE {} :{}", target, ctcp::wrap(payload)));
    }

    /// Ask to join a channel. Membership is reflected in the engine's model
    /// once the server echoes the JOIN back.
    pub fn join(&self, channel: &str) {
        self.send_raw_line(&format!("JOIN {}", channel));
    }

    pub fn part(&self, channel: &str, reason: Option<&str>) {
        match reason {
            Some(reason) if !reason.is_empty() => {
                self.send_raw_line(&format!("PART {} :{}", channel, reason))
            }
            _ => self.send_raw_line(&format!("PART {}", channel)),
        }
    }

    /// Change the intended nick; the engine keeps trying to hold on to it.
    pub fn set_nick(&self, nick: &str) {
        self.send(Command::SetNick {
            conn: self.conn,
            nick: sanitize(nick),
        });
    }

    /// Retune the pacer. The currently scheduled flush keeps its deadline;
    /// the new period applies from the flush after it.
    pub fn set_message_delay(&self, millis: u64) {
        self.send(Command::SetMessageDelay {
            conn: self.conn,
            millis,
        });
    }

    /// QUIT with an optional reason. Pending paced lines are dropped, the
    /// socket closes once the QUIT flushes, and no reconnect is attempted.
    pub fn shutdown(&self, reason: Option<&str>) {
        self.send(Command::Shutdown {
            conn: self.conn,
            reason: reason.map(str::to_owned),
        });
    }
}

/// User data must not be able to smuggle extra protocol lines: cut at the
/// first CR or LF.
fn sanitize(line: &str) -> String {
    match line.find(['\r', '\n']) {
        Some(i) => line[..i].to_owned(),
        None => line.to_owned(),
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|source| ConnectError::Resolve {
            host: host.to_owned(),
            source,
        })?
        .next()
        .ok_or_else(|| ConnectError::Resolve {
            host: host.to_owned(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        })
}
