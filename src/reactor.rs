//! The shared I/O reactor: one thread driving every connection's socket and
//! timers through the sans-I/O [`Endpoint`]. Control API calls arrive on a
//! command channel paired with a poll waker; events polled from the endpoint
//! are dispatched to each connection's bus from here. The thread winds
//! itself down when the last connection closes for good and is respawned by
//! the supervisor on the next connect.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use fnv::FnvHashMap;
use mio::{Events, Poll, Token, Waker};
use slog::{info, o, warn, Logger};

use crate::config::Config;
use crate::connection::ConnectionError;
use crate::endpoint::{ConnectionHandle, Endpoint, Io, Timer};
use crate::event::{Collaborators, Event, EventBus};
use crate::frame;
use crate::transport::{SessionParams, Transport, TransportEvent};

/// Token reserved for the cross-thread waker.
pub(crate) const WAKER: Token = Token(usize::MAX);

pub(crate) enum Command {
    Connect {
        config: Arc<Config>,
        collab: Collaborators,
        session: SessionParams,
        done: Sender<ConnectionHandle>,
    },
    Enqueue {
        conn: ConnectionHandle,
        line: String,
        priority: bool,
    },
    SetNick {
        conn: ConnectionHandle,
        nick: String,
    },
    SetMessageDelay {
        conn: ConnectionHandle,
        millis: u64,
    },
    Shutdown {
        conn: ConnectionHandle,
        reason: Option<String>,
    },
}

/// Cross-thread entry point to a running reactor.
#[derive(Clone)]
pub(crate) struct Handle {
    pub tx: Sender<Command>,
    pub waker: Arc<Waker>,
}

/// Supervisor-owned slot for the current reactor, if any. The generation
/// lets a winding-down reactor avoid clearing a successor's handle.
pub(crate) struct Slot {
    pub generation: u64,
    pub handle: Option<Handle>,
}

pub(crate) fn spawn(
    log: Logger,
    shared: Arc<Mutex<Slot>>,
    generation: u64,
    rx: Receiver<Command>,
    poll: Poll,
) -> io::Result<()> {
    let endpoint = Endpoint::new(log.clone());
    std::thread::Builder::new()
        .name("tether-reactor".to_owned())
        .spawn(move || {
            Reactor {
                log,
                poll,
                endpoint,
                transports: FnvHashMap::default(),
                sessions: FnvHashMap::default(),
                buses: FnvHashMap::default(),
                timers: FnvHashMap::default(),
                rx,
                shared,
                generation,
                start: Instant::now(),
            }
            .run()
        })?;
    Ok(())
}

struct Reactor {
    log: Logger,
    poll: Poll,
    endpoint: Endpoint,
    transports: FnvHashMap<usize, Transport>,
    /// Dial parameters per connection, reused on reconnect.
    sessions: FnvHashMap<usize, SessionParams>,
    buses: FnvHashMap<usize, Option<Arc<dyn EventBus>>>,
    /// Armed timers with absolute µs deadlines.
    timers: FnvHashMap<(usize, Timer), u64>,
    rx: Receiver<Command>,
    shared: Arc<Mutex<Slot>>,
    generation: u64,
    start: Instant,
}

impl Reactor {
    fn now(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        loop {
            // Commands queued before the thread started (or while it was
            // busy) are drained ahead of the first blocking poll.
            let now = self.now();
            self.drain_commands(now);
            self.fire_timers(now);
            self.pump(now);
            if self.endpoint.is_idle() && self.try_exit() {
                return;
            }
            let timeout = self.next_timeout();
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(self.log, "poll failed, reactor exiting"; "err" => %err);
                let mut slot = self.shared.lock().unwrap();
                if slot.generation == self.generation {
                    slot.handle = None;
                }
                return;
            }
            let now = self.now();
            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                self.socket_event(now, event.token().0, event.is_readable(), event.is_writable());
            }
        }
    }

    /// Next poll timeout from the nearest timer deadline.
    fn next_timeout(&self) -> Option<Duration> {
        let next = *self.timers.values().min()?;
        Some(Duration::from_micros(next.saturating_sub(self.now())))
    }

    /// Exits only while holding the supervisor lock, so a connect racing
    /// the wind-down either lands in the queue first or sees the slot
    /// empty and respawns.
    fn try_exit(&mut self) -> bool {
        let mut slot = self.shared.lock().unwrap();
        if !self.rx.is_empty() {
            return false;
        }
        if slot.generation == self.generation {
            slot.handle = None;
        }
        info!(self.log, "reactor wound down");
        true
    }

    fn socket_event(&mut self, now: u64, key: usize, readable: bool, writable: bool) {
        let mut out = Vec::new();
        match self.transports.get_mut(&key) {
            Some(transport) => {
                transport.handle_event(self.poll.registry(), readable, writable, &mut out)
            }
            None => return,
        }
        self.apply_transport_events(now, key, out);
    }

    fn apply_transport_events(&mut self, now: u64, key: usize, out: Vec<TransportEvent>) {
        let conn = ConnectionHandle(key);
        for event in out {
            match event {
                TransportEvent::TcpEstablished => self.endpoint.transport_connected(now, conn),
                TransportEvent::TlsEstablished => self.endpoint.tls_connected(now, conn),
                TransportEvent::Data(data) => self.endpoint.handle(now, conn, &data),
                TransportEvent::Closed(reason) => {
                    if let Some(transport) = self.transports.remove(&key) {
                        transport.close(self.poll.registry());
                    }
                    self.endpoint.connection_error(now, conn, reason);
                }
            }
        }
    }

    fn drain_commands(&mut self, now: u64) {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Connect {
                    config,
                    collab,
                    session,
                    done,
                } => {
                    let bus = collab.bus.clone();
                    let conn = self.endpoint.connect(config, collab);
                    self.sessions.insert(conn.0, session);
                    self.buses.insert(conn.0, bus);
                    let _ = done.send(conn);
                }
                Command::Enqueue {
                    conn,
                    line,
                    priority,
                } => self.endpoint.enqueue(now, conn, line, priority),
                Command::SetNick { conn, nick } => self.endpoint.set_nick(now, conn, nick),
                Command::SetMessageDelay { conn, millis } => {
                    self.endpoint.set_message_delay(conn, millis)
                }
                Command::Shutdown { conn, reason } => {
                    self.endpoint.shutdown(conn, reason.as_deref())
                }
            }
        }
    }

    fn fire_timers(&mut self, now: u64) {
        let mut due: Vec<(u64, usize, Timer)> = self
            .timers
            .iter()
            .filter(|&(_, &deadline)| deadline <= now)
            .map(|(&(key, timer), &deadline)| (deadline, key, timer))
            .collect();
        due.sort_unstable();
        for (_, key, timer) in due {
            if self.timers.remove(&(key, timer)).is_some() {
                self.endpoint.timeout(now, ConnectionHandle(key), timer);
            }
        }
    }

    /// Execute pending I/O operations, then dispatch polled events.
    fn pump(&mut self, now: u64) {
        while let Some(op) = self.endpoint.poll_io(now) {
            match op {
                Io::Connect { connection } => self.start_connect(connection),
                Io::Transmit { connection, line } => {
                    let key = connection.0;
                    let mut failed = None;
                    if let Some(transport) = self.transports.get_mut(&key) {
                        let mut bytes = Vec::with_capacity(line.len() + 2);
                        frame::encode(&line, &mut bytes);
                        if let Err(err) = transport.write(self.poll.registry(), &bytes) {
                            failed = Some(err);
                        }
                    }
                    if let Some(err) = failed {
                        if let Some(transport) = self.transports.remove(&key) {
                            transport.close(self.poll.registry());
                        }
                        self.endpoint.connection_error(
                            now,
                            connection,
                            ConnectionError::WriteFailed(err.to_string()),
                        );
                    }
                }
                Io::Close { connection } => {
                    if let Some(transport) = self.transports.remove(&connection.0) {
                        transport.close(self.poll.registry());
                    }
                    self.timers.retain(|&(key, _), _| key != connection.0);
                }
                Io::TimerStart {
                    connection,
                    timer,
                    time,
                } => {
                    self.timers.insert((connection.0, timer), time);
                }
                Io::TimerStop { connection, timer } => {
                    self.timers.remove(&(connection.0, timer));
                }
            }
        }
        while let Some((conn, event)) = self.endpoint.poll() {
            let permanent = matches!(&event, Event::ConnectionClosed { reconnect: false, .. });
            if let Some(Some(bus)) = self.buses.get(&conn.0) {
                bus.dispatch(event);
            }
            if permanent {
                self.sessions.remove(&conn.0);
                self.buses.remove(&conn.0);
            }
        }
    }

    fn start_connect(&mut self, conn: ConnectionHandle) {
        let key = conn.0;
        let Some(session) = self.sessions.get(&key) else {
            warn!(self.log, "no dial parameters for connection"; "connection" => key);
            return;
        };
        let log = self.log.new(o!("transport" => key));
        match Transport::connect(session, self.poll.registry(), Token(key), log) {
            Ok(transport) => {
                self.transports.insert(key, transport);
            }
            Err(err) => {
                let now = self.now();
                self.endpoint.connection_error(
                    now,
                    conn,
                    ConnectionError::ConnectFailed(err.to_string()),
                );
            }
        }
    }
}
