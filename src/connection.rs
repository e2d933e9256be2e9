use std::collections::VecDeque;
use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use slog::{debug, info, trace, warn, Logger};
use thiserror::Error;

use crate::config::Config;
use crate::ctcp;
use crate::endpoint::{Context, ConnectionHandle, Timer};
use crate::event::{Collaborators, Event};
use crate::frame::LineDecoder;
use crate::message::Message;

/// No inbound byte for this long and the connection is presumed dead. µs.
pub const READER_IDLE: u64 = 250_000_000;
/// No traffic in either direction for this long triggers a keepalive PING. µs.
pub const ALL_IDLE: u64 = 60_000_000;
/// How long an unanswered `CAP LS` may stall registration. µs.
pub const CAP_TIMEOUT: u64 = 10_000_000;
/// Delay before a replacement connection is dialled after an abnormal close. µs.
pub const RECONNECT_DELAY: u64 = 5_000_000;
/// How often the engine re-attempts the intended nick after a collision. µs.
pub const NICK_RECLAIM_PERIOD: u64 = 60_000_000;

/// Reasons why a connection might be lost.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// TCP establishment failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// TLS handshake or session failure.
    #[error("TLS failure: {0}")]
    Tls(String),
    /// A socket write failed mid-connection.
    #[error("write failed: {0}")]
    WriteFailed(String),
    /// The reader-idle watchdog fired.
    #[error("no data received for 250s")]
    IdleTimeout,
    /// The server sent ERROR and is closing the link.
    #[error("closed by server: {0}")]
    ServerClosed(String),
    /// The peer closed or reset the connection.
    #[error("connection reset")]
    Reset,
}

pub enum State {
    /// TCP dial in flight.
    Connecting,
    /// TCP up, TLS handshake in flight.
    TlsHandshaking,
    /// Transport up; the registration burst is being issued.
    Registering,
    CapNegotiating(state::CapNegotiating),
    Ready,
    /// QUIT issued, waiting for it to flush.
    ShuttingDown(state::ShuttingDown),
    Closed(state::Closed),
}

impl State {
    pub fn is_closed(&self) -> bool {
        matches!(self, State::Closed(_))
    }
}

pub mod state {
    pub struct CapNegotiating {
        /// Capability tokens advertised so far, across LS continuation lines.
        pub offered: Vec<String>,
        /// What we asked for with CAP REQ.
        pub requested: Vec<String>,
        pub phase: CapPhase,
        /// Whether 001 has been seen.
        pub registered: bool,
    }

    pub enum CapPhase {
        AwaitingLs,
        AwaitingAck,
        Done,
    }

    pub struct ShuttingDown {
        pub reconnect: bool,
    }

    pub struct Closed {
        pub reconnect: bool,
    }
}

use self::state::CapPhase;

#[derive(Default)]
pub struct Channel {
    pub users: FnvHashSet<String>,
}

/// One connection to one server: framing, pacing, watchdogs, capability
/// negotiation and the channel/user model, driven entirely through the
/// owning [`Endpoint`](crate::endpoint::Endpoint).
pub struct Connection {
    log: Logger,
    pub handle: ConnectionHandle,
    pub config: Arc<Config>,
    pub collab: Collaborators,
    pub state: Option<State>,
    framer: LineDecoder,

    /// Lines ready for the wire, drained by the endpoint into `Io::Transmit`.
    pub(crate) tx: VecDeque<String>,
    /// Paced FIFO, drained one line per pacer tick while `Ready`.
    queue: VecDeque<String>,
    /// Pacer period, µs. Retuning leaves the already-scheduled fire untouched.
    pace_period: u64,
    pace_started: bool,

    intended_nick: String,
    attempted_nick: String,
    current_nick: Option<String>,
    reclaiming: bool,

    ping_serial: u64,
    channels: FnvHashMap<String, Channel>,
    /// Channels to re-join after the next registration.
    rejoin: Vec<String>,

    /// `Io::Close` still owed to the reactor.
    pub(crate) wants_close: bool,

    // Timer adjustments pending pickup by Endpoint::flush_pending.
    // Some(Some(t)) arms the timer for absolute µs t, Some(None) stops it.
    pub(crate) set_pace: Option<Option<u64>>,
    pub(crate) set_read_idle: Option<Option<u64>>,
    pub(crate) set_all_idle: Option<Option<u64>>,
    pub(crate) set_cap_end: Option<Option<u64>>,
    pub(crate) set_nick_reclaim: Option<Option<u64>>,
    pub(crate) set_reconnect: Option<Option<u64>>,
}

impl Connection {
    pub fn new(
        log: Logger,
        handle: ConnectionHandle,
        config: Arc<Config>,
        collab: Collaborators,
    ) -> Self {
        let pace_period = config.message_delay.max(1) * 1000;
        let nick = config.nick.clone();
        Connection {
            log,
            handle,
            config,
            collab,
            state: Some(State::Connecting),
            framer: LineDecoder::new(),
            tx: VecDeque::new(),
            queue: VecDeque::new(),
            pace_period,
            pace_started: false,
            intended_nick: nick.clone(),
            attempted_nick: nick,
            current_nick: None,
            reclaiming: false,
            ping_serial: 0,
            channels: FnvHashMap::default(),
            rejoin: Vec::new(),
            wants_close: false,
            set_pace: None,
            set_read_idle: None,
            set_all_idle: None,
            set_cap_end: None,
            set_nick_reclaim: None,
            set_reconnect: None,
        }
    }

    /// Replacement connection for the same slab slot, carrying the intended
    /// nick and the channel set to re-join.
    pub fn successor(&self) -> Connection {
        let mut rejoin: Vec<String> = self.channels.keys().cloned().collect();
        for channel in &self.rejoin {
            if !rejoin.contains(channel) {
                rejoin.push(channel.clone());
            }
        }
        let mut next = Connection::new(
            self.log.clone(),
            self.handle,
            self.config.clone(),
            self.collab.clone(),
        );
        next.intended_nick = self.intended_nick.clone();
        next.attempted_nick = self.intended_nick.clone();
        next.rejoin = rejoin;
        next
    }

    /// Nick the server currently knows us by, falling back to the one we
    /// are attempting to register.
    pub fn nick(&self) -> &str {
        self.current_nick.as_deref().unwrap_or(&self.attempted_nick)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn channel_users(&self, channel: &str) -> Option<Vec<String>> {
        self.channels
            .get(channel)
            .map(|ch| ch.users.iter().cloned().collect())
    }

    fn closing(&self) -> bool {
        matches!(
            self.state,
            Some(State::ShuttingDown(_)) | Some(State::Closed(_)) | None
        )
    }

    // Outbound ----------------------------------------------------------

    /// Submit an outbound line. Priority lines go straight to the wire
    /// queue; everything else waits its turn behind the pacer.
    pub fn enqueue(&mut self, now: u64, line: String, priority: bool) {
        if self.closing() {
            return;
        }
        if priority {
            self.transmit(line);
        } else {
            self.queue.push_back(line);
            if !self.pace_started {
                self.pace_started = true;
                self.set_pace = Some(Some(now));
            }
        }
    }

    fn transmit(&mut self, line: String) {
        if matches!(self.state, Some(State::Closed(_)) | None) {
            return;
        }
        self.tx.push_back(line);
    }

    /// Next line owed to the wire, if any. Flushing counts as outbound
    /// traffic for the all-idle watchdog.
    pub(crate) fn next_transmit(&mut self, now: u64) -> Option<String> {
        let line = self.tx.pop_front()?;
        if let Some(sink) = &self.collab.output {
            sink.offer(line.clone());
        }
        trace!(self.log, "write"; "line" => %line);
        self.arm_all_idle(now);
        Some(line)
    }

    pub fn set_message_delay(&mut self, millis: u64) {
        self.pace_period = millis.max(1) * 1000;
    }

    pub fn set_nick(&mut self, now: u64, nick: String) {
        self.intended_nick = nick.clone();
        match self.state {
            Some(State::Ready) => self.enqueue(now, format!("NICK {}", nick), false),
            Some(State::CapNegotiating(_)) | Some(State::Registering) => {
                self.attempted_nick = nick.clone();
                self.transmit(format!("NICK {}", nick));
            }
            _ => self.attempted_nick = nick,
        }
    }

    // Watchdogs ---------------------------------------------------------

    fn arm_read_idle(&mut self, now: u64) {
        if !self.closing() {
            self.set_read_idle = Some(Some(now + READER_IDLE));
        }
    }

    fn arm_all_idle(&mut self, now: u64) {
        if !self.closing() {
            self.set_all_idle = Some(Some(now + ALL_IDLE));
        }
    }

    fn stop_timers(&mut self) {
        self.set_pace = Some(None);
        self.set_read_idle = Some(None);
        self.set_all_idle = Some(None);
        self.set_cap_end = Some(None);
        self.set_nick_reclaim = Some(None);
    }

    // Lifecycle ---------------------------------------------------------

    pub fn on_transport_connected(&mut self, now: u64) {
        match self.state {
            Some(State::Connecting) => {
                // Armed here so a stalled TLS handshake still times out.
                self.arm_read_idle(now);
                if self.config.ssl {
                    trace!(self.log, "tcp up, awaiting TLS");
                    self.state = Some(State::TlsHandshaking);
                } else {
                    self.begin_registration(now);
                }
            }
            _ => trace!(self.log, "spurious transport-connected"),
        }
    }

    pub fn on_tls_connected(&mut self, now: u64) {
        match self.state {
            Some(State::TlsHandshaking) => self.begin_registration(now),
            _ => trace!(self.log, "spurious tls-connected"),
        }
    }

    fn begin_registration(&mut self, now: u64) {
        self.state = Some(State::Registering);
        debug!(self.log, "registering"; "nick" => %self.attempted_nick);
        self.transmit("CAP LS".to_owned());
        if let Some(password) = &self.config.server_password {
            let line = format!("PASS {}", password);
            self.transmit(line);
        }
        self.transmit(format!("NICK {}", self.attempted_nick));
        self.transmit(format!(
            "USER {} 0 * :{}",
            self.config.user, self.config.real_name
        ));
        self.set_cap_end = Some(Some(now + CAP_TIMEOUT));
        self.arm_read_idle(now);
        self.state = Some(State::CapNegotiating(state::CapNegotiating {
            offered: Vec::new(),
            requested: Vec::new(),
            phase: CapPhase::AwaitingLs,
            registered: false,
        }));
    }

    /// Voluntary teardown: QUIT as priority, pending paced lines dropped.
    /// The reader-idle path reuses this with `reconnect = true`.
    pub fn initiate_shutdown(&mut self, reason: Option<&str>, reconnect: bool) {
        if self.closing() {
            return;
        }
        self.queue.clear();
        self.pace_started = false;
        self.stop_timers();
        let quit = match reason {
            Some(reason) if !reason.is_empty() => format!("QUIT :{}", reason),
            _ => "QUIT".to_owned(),
        };
        self.transmit(quit);
        self.wants_close = true;
        debug!(self.log, "shutting down"; "reconnect" => reconnect);
        self.state = Some(State::ShuttingDown(state::ShuttingDown { reconnect }));
    }

    /// Completes a voluntary shutdown once the QUIT has drained. No-op for
    /// connections that already closed abruptly.
    pub(crate) fn finalize_close(&mut self, ctx: &mut Context, now: u64) {
        let reconnect = match self.state.take() {
            Some(State::ShuttingDown(st)) => st.reconnect,
            other => {
                self.state = other;
                return;
            }
        };
        self.state = Some(State::Closed(state::Closed { reconnect }));
        self.stop_timers();
        info!(self.log, "closed"; "reconnect" => reconnect);
        ctx.events.push_back((
            self.handle,
            Event::ConnectionClosed {
                reconnect,
                reason: None,
            },
        ));
        if reconnect {
            self.set_reconnect = Some(Some(now + RECONNECT_DELAY));
        }
    }

    /// Abrupt loss: socket error, EOF, TLS failure, server ERROR. During a
    /// voluntary shutdown the socket dying just completes the close.
    pub(crate) fn close_abrupt(
        &mut self,
        ctx: &mut Context,
        now: u64,
        reason: ConnectionError,
        reconnect: bool,
    ) {
        let reconnect = match &self.state {
            Some(State::Closed(_)) | None => return,
            Some(State::ShuttingDown(st)) => st.reconnect,
            _ => reconnect,
        };
        if let Some(sink) = &self.collab.exceptions {
            sink.offer(reason.clone());
        }
        warn!(self.log, "connection lost"; "reason" => %reason, "reconnect" => reconnect);
        self.queue.clear();
        self.tx.clear();
        self.pace_started = false;
        self.stop_timers();
        self.wants_close = true;
        self.state = Some(State::Closed(state::Closed { reconnect }));
        ctx.events.push_back((
            self.handle,
            Event::ConnectionClosed {
                reconnect,
                reason: Some(reason),
            },
        ));
        if reconnect {
            self.set_reconnect = Some(Some(now + RECONNECT_DELAY));
        }
    }

    /// Transport-level failure observed by the reactor.
    pub fn on_transport_error(&mut self, ctx: &mut Context, now: u64, error: ConnectionError) {
        let reconnect = !matches!(error, ConnectionError::Tls(_))
            && !matches!(self.state, Some(State::TlsHandshaking));
        self.close_abrupt(ctx, now, error, reconnect);
    }

    // Timers ------------------------------------------------------------

    pub fn on_timeout(&mut self, ctx: &mut Context, now: u64, timer: Timer) {
        match timer {
            Timer::Pace => {
                if self.closing() {
                    return;
                }
                self.set_pace = Some(Some(now + self.pace_period));
                if matches!(self.state, Some(State::Ready)) {
                    if let Some(line) = self.queue.pop_front() {
                        self.transmit(line);
                    }
                }
            }
            Timer::ReadIdle => {
                if let Some(sink) = &self.collab.exceptions {
                    sink.offer(ConnectionError::IdleTimeout);
                }
                debug!(self.log, "reader idle, recycling connection");
                self.initiate_shutdown(Some("Reconnecting..."), true);
            }
            Timer::AllIdle => {
                self.ping_serial += 1;
                let line = format!("PING :{}", self.ping_serial);
                self.transmit(line);
            }
            Timer::CapEnd => match self.state.take() {
                Some(State::CapNegotiating(st)) if !matches!(st.phase, CapPhase::Done) => {
                    debug!(self.log, "capability negotiation timed out");
                    self.cap_done(ctx, now, st);
                }
                other => self.state = other,
            },
            Timer::NickReclaim => {
                if self.reclaiming && matches!(self.state, Some(State::Ready)) {
                    if self.current_nick.as_deref() == Some(self.intended_nick.as_str()) {
                        self.reclaiming = false;
                    } else {
                        let line = format!("NICK {}", self.intended_nick);
                        self.enqueue(now, line, false);
                        self.set_nick_reclaim = Some(Some(now + NICK_RECLAIM_PERIOD));
                    }
                }
            }
            // Handled by the endpoint before delegation.
            Timer::Reconnect => {}
        }
    }

    // Inbound -----------------------------------------------------------

    /// Feed raw bytes from the transport. Inbound traffic re-arms both
    /// watchdogs before any line is interpreted.
    pub fn handle_data(&mut self, ctx: &mut Context, now: u64, data: &[u8]) {
        if matches!(self.state, Some(State::Closed(_)) | None) {
            return;
        }
        self.arm_read_idle(now);
        self.arm_all_idle(now);
        self.framer.push(data);
        while let Some(line) = self.framer.next_line() {
            if let Some(sink) = &self.collab.input {
                sink.offer(line.clone());
            }
            trace!(self.log, "read"; "line" => %line);
            match Message::parse(&line) {
                Ok(msg) => self.handle_message(ctx, now, &line, msg),
                Err(err) => {
                    debug!(self.log, "unparseable line"; "reason" => %err);
                    ctx.events
                        .push_back((self.handle, Event::ProtocolError { line: line.clone() }));
                }
            }
            if matches!(self.state, Some(State::Closed(_))) {
                break;
            }
        }
    }

    fn handle_message(&mut self, ctx: &mut Context, now: u64, line: &str, msg: Message) {
        match msg.command.as_str() {
            "PING" => {
                let token = msg.trailing().to_owned();
                self.transmit(format!("PONG :{}", token));
            }
            "CAP" => self.handle_cap(ctx, now, line, msg),
            "ERROR" => {
                if matches!(self.state, Some(State::ShuttingDown(_))) {
                    trace!(self.log, "server confirmed quit");
                } else {
                    let reason = ConnectionError::ServerClosed(msg.trailing().to_owned());
                    self.close_abrupt(ctx, now, reason, true);
                }
            }
            "JOIN" => self.on_join(ctx, msg),
            "PART" => self.on_part(ctx, msg),
            "KICK" => self.on_kick(ctx, msg),
            "NICK" => self.on_nick(ctx, msg),
            "QUIT" => self.on_quit(ctx, msg),
            "PRIVMSG" => self.on_privmsg(ctx, msg),
            "NOTICE" => self.on_notice(ctx, msg),
            _ if msg.is_numeric() => self.on_numeric(ctx, now, msg),
            _ => self.dispatch(ctx, Event::ServerLine(msg)),
        }
    }

    fn dispatch(&mut self, ctx: &mut Context, event: Event) {
        ctx.events.push_back((self.handle, event));
    }

    // Registration and capabilities -------------------------------------

    fn handle_cap(&mut self, ctx: &mut Context, now: u64, line: &str, msg: Message) {
        let st = match self.state.take() {
            Some(State::CapNegotiating(st)) => st,
            other => {
                self.state = other;
                self.dispatch(ctx, Event::ServerLine(msg));
                return;
            }
        };
        let sub = msg
            .params
            .get(1)
            .map(|s| s.to_ascii_uppercase())
            .unwrap_or_default();
        match sub.as_str() {
            "LS" => self.on_cap_ls(ctx, now, msg, st),
            "ACK" => {
                if matches!(st.phase, CapPhase::Done) {
                    self.state = Some(State::CapNegotiating(st));
                    self.dispatch(
                        ctx,
                        Event::ProtocolError {
                            line: line.to_owned(),
                        },
                    );
                } else {
                    let acked: Vec<String> = msg
                        .trailing()
                        .split_whitespace()
                        .map(str::to_owned)
                        .collect();
                    info!(self.log, "capabilities acknowledged"; "caps" => acked.join(" "));
                    self.dispatch(ctx, Event::CapabilitiesAcknowledged(acked));
                    self.cap_done(ctx, now, st);
                }
            }
            "NAK" => {
                if matches!(st.phase, CapPhase::Done) {
                    self.state = Some(State::CapNegotiating(st));
                    self.dispatch(
                        ctx,
                        Event::ProtocolError {
                            line: line.to_owned(),
                        },
                    );
                } else {
                    debug!(self.log, "capabilities rejected"; "caps" => st.requested.join(" "));
                    self.dispatch(ctx, Event::CapabilitiesRejected(st.requested.clone()));
                    self.cap_done(ctx, now, st);
                }
            }
            _ => {
                self.state = Some(State::CapNegotiating(st));
                self.dispatch(ctx, Event::ServerLine(msg));
            }
        }
    }

    fn on_cap_ls(
        &mut self,
        ctx: &mut Context,
        now: u64,
        msg: Message,
        mut st: state::CapNegotiating,
    ) {
        // A multiline listing marks every line but the last with a `*`
        // parameter before the capability list.
        let more = msg.params.len() >= 4 && msg.params[msg.params.len() - 2] == "*";
        st.offered
            .extend(msg.trailing().split_whitespace().map(str::to_owned));
        if more || !matches!(st.phase, CapPhase::AwaitingLs) {
            self.state = Some(State::CapNegotiating(st));
            return;
        }
        let requested = self.config.caps.select(&st.offered);
        if requested.is_empty() {
            debug!(self.log, "no capabilities to request");
            self.cap_done(ctx, now, st);
        } else {
            debug!(self.log, "requesting capabilities"; "caps" => requested.join(" "));
            self.transmit(format!("CAP REQ :{}", requested.join(" ")));
            st.requested = requested;
            st.phase = CapPhase::AwaitingAck;
            self.state = Some(State::CapNegotiating(st));
        }
    }

    fn cap_done(&mut self, ctx: &mut Context, now: u64, mut st: state::CapNegotiating) {
        self.transmit("CAP END".to_owned());
        self.set_cap_end = Some(None);
        st.phase = CapPhase::Done;
        if st.registered {
            self.become_ready(ctx, now);
        } else {
            self.state = Some(State::CapNegotiating(st));
        }
    }

    /// An unanswered CAP LS is abandoned on the first numeric reply; the
    /// server evidently does not speak CAP.
    fn cap_fallback(&mut self, ctx: &mut Context, now: u64) {
        match self.state.take() {
            Some(State::CapNegotiating(st)) if matches!(st.phase, CapPhase::AwaitingLs) => {
                debug!(self.log, "server silent on CAP, ending negotiation");
                self.cap_done(ctx, now, st);
            }
            other => self.state = other,
        }
    }

    fn become_ready(&mut self, ctx: &mut Context, now: u64) {
        self.state = Some(State::Ready);
        let nick = self.nick().to_owned();
        info!(self.log, "registered"; "nick" => %nick);
        self.dispatch(ctx, Event::Registered { nick });
        let rejoin = std::mem::take(&mut self.rejoin);
        for channel in rejoin {
            self.enqueue(now, format!("JOIN {}", channel), false);
        }
        if self.current_nick.as_deref() != Some(self.intended_nick.as_str()) && !self.reclaiming {
            self.reclaiming = true;
            self.set_nick_reclaim = Some(Some(now + NICK_RECLAIM_PERIOD));
        }
    }

    fn on_numeric(&mut self, ctx: &mut Context, now: u64, msg: Message) {
        self.cap_fallback(ctx, now);
        match msg.command.as_str() {
            "001" => {
                if let Some(nick) = msg.params.first() {
                    self.current_nick = Some(nick.clone());
                }
                match self.state.take() {
                    Some(State::CapNegotiating(mut st)) => {
                        st.registered = true;
                        if matches!(st.phase, CapPhase::Done) {
                            self.become_ready(ctx, now);
                        } else {
                            self.state = Some(State::CapNegotiating(st));
                        }
                    }
                    other => self.state = other,
                }
            }
            "433" => self.on_nick_in_use(ctx, now, msg),
            "353" => {
                self.on_names(&msg);
                self.dispatch(ctx, Event::ServerLine(msg));
            }
            _ => self.dispatch(ctx, Event::ServerLine(msg)),
        }
    }

    fn on_nick_in_use(&mut self, ctx: &mut Context, now: u64, msg: Message) {
        let attempted = msg
            .params
            .get(1)
            .cloned()
            .unwrap_or_else(|| self.attempted_nick.clone());
        match self.state {
            Some(State::Ready) => {
                self.dispatch(ctx, Event::NickRejected { attempted });
                if !self.reclaiming {
                    self.reclaiming = true;
                    self.set_nick_reclaim = Some(Some(now + NICK_RECLAIM_PERIOD));
                }
            }
            Some(State::CapNegotiating(_)) => {
                let next = self.config.nicks.next(&self.attempted_nick);
                debug!(self.log, "nick in use"; "attempted" => %self.attempted_nick, "next" => %next);
                self.attempted_nick = next.clone();
                self.transmit(format!("NICK {}", next));
            }
            _ => self.dispatch(ctx, Event::ServerLine(msg)),
        }
    }

    // Channel and user model --------------------------------------------

    fn on_join(&mut self, ctx: &mut Context, msg: Message) {
        let (Some(prefix), Some(channel)) = (msg.prefix.clone(), msg.params.first().cloned())
        else {
            self.dispatch(ctx, Event::ServerLine(msg));
            return;
        };
        let user = prefix.name;
        if user == self.nick() {
            info!(self.log, "joined channel"; "channel" => %channel);
            self.channels
                .entry(channel.clone())
                .or_default()
                .users
                .insert(user.clone());
        } else if let Some(ch) = self.channels.get_mut(&channel) {
            ch.users.insert(user.clone());
        }
        self.dispatch(ctx, Event::Join { channel, user });
    }

    fn on_part(&mut self, ctx: &mut Context, msg: Message) {
        let (Some(prefix), Some(channel)) = (msg.prefix.clone(), msg.params.first().cloned())
        else {
            self.dispatch(ctx, Event::ServerLine(msg));
            return;
        };
        let user = prefix.name;
        let reason = msg.params.get(1).cloned();
        if user == self.nick() {
            info!(self.log, "left channel"; "channel" => %channel);
            self.channels.remove(&channel);
        } else if let Some(ch) = self.channels.get_mut(&channel) {
            ch.users.remove(&user);
        }
        self.dispatch(
            ctx,
            Event::Part {
                channel,
                user,
                reason,
            },
        );
    }

    fn on_kick(&mut self, ctx: &mut Context, msg: Message) {
        let (Some(prefix), Some(channel), Some(target)) = (
            msg.prefix.clone(),
            msg.params.first().cloned(),
            msg.params.get(1).cloned(),
        ) else {
            self.dispatch(ctx, Event::ServerLine(msg));
            return;
        };
        let by = prefix.name;
        let reason = msg.params.get(2).cloned();
        if target == self.nick() {
            warn!(self.log, "kicked from channel"; "channel" => %channel, "by" => %by);
            self.channels.remove(&channel);
        } else if let Some(ch) = self.channels.get_mut(&channel) {
            ch.users.remove(&target);
        }
        self.dispatch(
            ctx,
            Event::Kick {
                channel,
                by,
                target,
                reason,
            },
        );
    }

    fn on_nick(&mut self, ctx: &mut Context, msg: Message) {
        let (Some(prefix), Some(new)) = (msg.prefix.clone(), msg.params.first().cloned()) else {
            self.dispatch(ctx, Event::ServerLine(msg));
            return;
        };
        let old = prefix.name;
        if old == self.nick() {
            self.current_nick = Some(new.clone());
            if self.reclaiming && new == self.intended_nick {
                self.reclaiming = false;
                self.set_nick_reclaim = Some(None);
            }
        }
        for ch in self.channels.values_mut() {
            if ch.users.remove(&old) {
                ch.users.insert(new.clone());
            }
        }
        self.dispatch(ctx, Event::NickChange { old, new });
    }

    fn on_quit(&mut self, ctx: &mut Context, msg: Message) {
        let Some(prefix) = msg.prefix.clone() else {
            self.dispatch(ctx, Event::ServerLine(msg));
            return;
        };
        let user = prefix.name;
        let reason = msg.params.first().cloned();
        for ch in self.channels.values_mut() {
            ch.users.remove(&user);
        }
        self.dispatch(ctx, Event::Quit { user, reason });
    }

    /// RPL_NAMREPLY seeds a channel's user list; status sigils are stripped
    /// (several per name under multi-prefix).
    fn on_names(&mut self, msg: &Message) {
        let Some(channel) = msg.params.get(2) else {
            return;
        };
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        for name in msg.trailing().split_whitespace() {
            let name = name.trim_start_matches(['@', '+', '%', '&', '~']);
            if !name.is_empty() {
                ch.users.insert(name.to_owned());
            }
        }
    }

    // Messages ----------------------------------------------------------

    fn on_privmsg(&mut self, ctx: &mut Context, msg: Message) {
        let (Some(source), Some(target)) = (msg.prefix.clone(), msg.params.first().cloned()) else {
            self.dispatch(ctx, Event::ServerLine(msg));
            return;
        };
        let text = msg.params.get(1).cloned().unwrap_or_default();
        let event = match ctcp::extract(&text) {
            Some(payload) => Event::CtcpQuery {
                source,
                target,
                payload,
            },
            None => Event::Privmsg {
                source,
                target,
                text,
            },
        };
        self.dispatch(ctx, event);
    }

    fn on_notice(&mut self, ctx: &mut Context, msg: Message) {
        let Some(target) = msg.params.first().cloned() else {
            self.dispatch(ctx, Event::ServerLine(msg));
            return;
        };
        let source = msg.prefix.clone();
        let text = msg.params.get(1).cloned().unwrap_or_default();
        let event = match (source.clone(), ctcp::extract(&text)) {
            (Some(source), Some(payload)) => Event::CtcpReply {
                source,
                target,
                payload,
            },
            _ => Event::Notice {
                source,
                target,
                text,
            },
        };
        self.dispatch(ctx, event);
    }
}
