use std::collections::VecDeque;
use std::sync::Arc;

use fnv::FnvHashSet;
use slab::Slab;
use slog::{debug, o, Logger};

use crate::config::Config;
use crate::connection::{Connection, ConnectionError, State};
use crate::event::{Collaborators, Event};

/// The main entry point to the library.
///
/// This object performs no I/O whatsoever. Instead, it generates a stream of
/// I/O operations for a backend to perform via `poll_io`, and consumes
/// inbound bytes and timer expirations via `handle` and `timeout`. All
/// timestamps are absolute microseconds supplied by the caller, which is
/// what makes the state machine drivable from a mock clock.
pub struct Endpoint {
    log: Logger,
    pub(crate) ctx: Context,
    pub(crate) connections: Slab<Connection>,
}

/// Operation and event queues shared between the endpoint and its
/// connections.
#[derive(Default)]
pub struct Context {
    pub io: VecDeque<Io>,
    pub events: VecDeque<(ConnectionHandle, Event)>,
    pub dirty: FnvHashSet<ConnectionHandle>,
}

impl Endpoint {
    pub fn new(log: Logger) -> Self {
        Self {
            log,
            ctx: Context::default(),
            connections: Slab::new(),
        }
    }

    /// Register a new connection and ask the backend to dial it.
    pub fn connect(&mut self, config: Arc<Config>, collab: Collaborators) -> ConnectionHandle {
        let entry = self.connections.vacant_entry();
        let conn = ConnectionHandle(entry.key());
        let log = self.log.new(o!("connection" => config.name.clone()));
        debug!(log, "connecting"; "host" => %config.server_host, "port" => config.server_port);
        entry.insert(Connection::new(log, conn, config, collab));
        self.ctx.io.push_back(Io::Connect { connection: conn });
        conn
    }

    /// Get an application-facing event.
    pub fn poll(&mut self) -> Option<(ConnectionHandle, Event)> {
        self.ctx.events.pop_front()
    }

    /// Get a pending I/O operation.
    pub fn poll_io(&mut self, now: u64) -> Option<Io> {
        loop {
            if let Some(io) = self.ctx.io.pop_front() {
                return Some(io);
            }
            let &conn = self.ctx.dirty.iter().next()?;
            self.flush_pending(now, conn);
            self.ctx.dirty.remove(&conn);
        }
    }

    /// The backend established the TCP leg of a connection.
    pub fn transport_connected(&mut self, now: u64, conn: ConnectionHandle) {
        if !self.connections.contains(conn.0) {
            return;
        }
        self.connections[conn.0].on_transport_connected(now);
        self.ctx.dirty.insert(conn);
    }

    /// The backend completed the TLS handshake.
    pub fn tls_connected(&mut self, now: u64, conn: ConnectionHandle) {
        if !self.connections.contains(conn.0) {
            return;
        }
        self.connections[conn.0].on_tls_connected(now);
        self.ctx.dirty.insert(conn);
    }

    /// Process inbound bytes from the transport.
    pub fn handle(&mut self, now: u64, conn: ConnectionHandle, data: &[u8]) {
        if !self.connections.contains(conn.0) {
            return;
        }
        self.connections[conn.0].handle_data(&mut self.ctx, now, data);
        self.ctx.dirty.insert(conn);
    }

    /// The backend lost the transport, or never managed to establish it.
    pub fn connection_error(&mut self, now: u64, conn: ConnectionHandle, error: ConnectionError) {
        if !self.connections.contains(conn.0) {
            return;
        }
        self.connections[conn.0].on_transport_error(&mut self.ctx, now, error);
        self.ctx.dirty.insert(conn);
    }

    /// Handle a timer expiring.
    pub fn timeout(&mut self, now: u64, conn: ConnectionHandle, timer: Timer) {
        if !self.connections.contains(conn.0) {
            return;
        }
        if let Timer::Reconnect = timer {
            self.respawn(conn);
        } else {
            self.connections[conn.0].on_timeout(&mut self.ctx, now, timer);
        }
        self.ctx.dirty.insert(conn);
    }

    /// Submit an outbound line on behalf of user code.
    pub fn enqueue(&mut self, now: u64, conn: ConnectionHandle, line: String, priority: bool) {
        if !self.connections.contains(conn.0) {
            return;
        }
        self.connections[conn.0].enqueue(now, line, priority);
        self.ctx.dirty.insert(conn);
    }

    pub fn set_nick(&mut self, now: u64, conn: ConnectionHandle, nick: String) {
        if !self.connections.contains(conn.0) {
            return;
        }
        self.connections[conn.0].set_nick(now, nick);
        self.ctx.dirty.insert(conn);
    }

    pub fn set_message_delay(&mut self, conn: ConnectionHandle, millis: u64) {
        if !self.connections.contains(conn.0) {
            return;
        }
        self.connections[conn.0].set_message_delay(millis);
    }

    /// Voluntary teardown with no reconnect.
    pub fn shutdown(&mut self, conn: ConnectionHandle, reason: Option<&str>) {
        if !self.connections.contains(conn.0) {
            return;
        }
        self.connections[conn.0].initiate_shutdown(reason, false);
        self.ctx.dirty.insert(conn);
    }

    /// Whether every connection has closed for good.
    pub fn is_idle(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get_nick(&self, conn: ConnectionHandle) -> Option<String> {
        self.connections.get(conn.0).map(|c| c.nick().to_owned())
    }

    pub fn get_channels(&self, conn: ConnectionHandle) -> Vec<String> {
        self.connections
            .get(conn.0)
            .map(|c| c.channel_names())
            .unwrap_or_default()
    }

    pub fn get_channel_users(&self, conn: ConnectionHandle, channel: &str) -> Option<Vec<String>> {
        self.connections.get(conn.0)?.channel_users(channel)
    }

    /// Replace a closed connection's slot with its successor and redial.
    fn respawn(&mut self, conn: ConnectionHandle) {
        let successor = {
            let old = &self.connections[conn.0];
            match &old.state {
                Some(State::Closed(st)) if st.reconnect => {}
                _ => return,
            }
            old.successor()
        };
        debug!(self.log, "reconnecting"; "connection" => conn.0);
        self.connections[conn.0] = successor;
        self.ctx.io.push_back(Io::Connect { connection: conn });
    }

    fn flush_pending(&mut self, now: u64, conn: ConnectionHandle) {
        if !self.connections.contains(conn.0) {
            return;
        }
        while let Some(line) = self.connections[conn.0].next_transmit(now) {
            self.ctx.io.push_back(Io::Transmit {
                connection: conn,
                line,
            });
        }
        {
            let c = &mut self.connections[conn.0];
            if c.wants_close && c.tx.is_empty() {
                c.wants_close = false;
                self.ctx.io.push_back(Io::Close { connection: conn });
                c.finalize_close(&mut self.ctx, now);
            }
        }
        {
            let c = &mut self.connections[conn.0];
            for (setting, timer) in [
                (c.set_pace.take(), Timer::Pace),
                (c.set_read_idle.take(), Timer::ReadIdle),
                (c.set_all_idle.take(), Timer::AllIdle),
                (c.set_cap_end.take(), Timer::CapEnd),
                (c.set_nick_reclaim.take(), Timer::NickReclaim),
                (c.set_reconnect.take(), Timer::Reconnect),
            ] {
                match setting {
                    Some(Some(time)) => self.ctx.io.push_back(Io::TimerStart {
                        connection: conn,
                        timer,
                        time,
                    }),
                    Some(None) => self.ctx.io.push_back(Io::TimerStop {
                        connection: conn,
                        timer,
                    }),
                    None => {}
                }
            }
        }
        let ended = matches!(
            self.connections[conn.0].state,
            Some(State::Closed(ref st)) if !st.reconnect
        ) && !self.connections[conn.0].wants_close;
        if ended {
            debug!(self.log, "forgetting connection"; "connection" => conn.0);
            self.connections.remove(conn.0);
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

/// I/O operations to be immediately executed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Io {
    /// Dial the configured server for this connection.
    Connect { connection: ConnectionHandle },
    /// Put one line on the wire; the backend appends the terminator.
    Transmit {
        connection: ConnectionHandle,
        line: String,
    },
    /// Flush whatever is pending and close the socket.
    Close { connection: ConnectionHandle },
    /// Start or reset a timer.
    TimerStart {
        connection: ConnectionHandle,
        timer: Timer,
        /// Absolute µs.
        time: u64,
    },
    TimerStop {
        connection: ConnectionHandle,
        timer: Timer,
    },
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Timer {
    /// Pacer tick for the outbound FIFO.
    Pace,
    /// Reader-idle watchdog.
    ReadIdle,
    /// Either-direction idle watchdog driving keepalive pings.
    AllIdle,
    /// Deadline for an unanswered CAP LS.
    CapEnd,
    /// Periodic re-attempt of the intended nick.
    NickReclaim,
    /// Delay before a replacement connection is dialled.
    Reconnect,
}

impl slog::Value for Timer {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}
