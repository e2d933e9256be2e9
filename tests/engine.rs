//! Drives the sans-I/O endpoint with a mock clock and a miniature timer
//! table; no sockets anywhere.

use std::collections::HashMap;
use std::sync::Arc;

use assert_matches::assert_matches;
use slog::o;

use tether::connection::{
    ALL_IDLE, CAP_TIMEOUT, NICK_RECLAIM_PERIOD, READER_IDLE, RECONNECT_DELAY,
};
use tether::{
    Collaborators, Config, ConnectionError, ConnectionHandle, Endpoint, Event, Io, Timer,
};

const DELAY_US: u64 = 1_200_000;

fn logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}

fn config() -> Config {
    Config::builder("irc.test", 6667)
        .nick("kelpie")
        .user("kel")
        .real_name("Kelpie")
        .build()
        .unwrap()
}

struct Harness {
    ep: Endpoint,
    conn: ConnectionHandle,
    now: u64,
    timers: HashMap<(usize, Timer), u64>,
    /// (flush time, line) per Io::Transmit.
    transmits: Vec<(u64, String)>,
    closes: usize,
    connects: usize,
}

impl Harness {
    fn connect(config: Config) -> Self {
        let mut ep = Endpoint::new(logger());
        let conn = ep.connect(Arc::new(config), Collaborators::default());
        let mut h = Harness {
            ep,
            conn,
            now: 0,
            timers: HashMap::new(),
            transmits: Vec::new(),
            closes: 0,
            connects: 0,
        };
        h.pump();
        assert_eq!(h.connects, 1);
        h
    }

    /// Drain pending I/O operations into the fixtures.
    fn pump(&mut self) {
        while let Some(op) = self.ep.poll_io(self.now) {
            match op {
                Io::Connect { .. } => self.connects += 1,
                Io::Transmit { line, .. } => self.transmits.push((self.now, line)),
                Io::Close { connection } => {
                    self.closes += 1;
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
    }

    fn establish(&mut self) {
        self.ep.transport_connected(self.now, self.conn);
        self.pump();
    }

    fn line(&mut self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        self.ep.handle(self.now, self.conn, &bytes);
        self.pump();
    }

    /// Advance the mock clock, firing due timers in deadline order.
    fn advance_to(&mut self, deadline: u64) {
        loop {
            let due = self
                .timers
                .iter()
                .filter(|&(_, &time)| time <= deadline)
                .map(|(&key, &time)| (time, key))
                .min();
            match due {
                Some((time, (key, timer))) => {
                    self.timers.remove(&(key, timer));
                    self.now = self.now.max(time);
                    self.ep.timeout(self.now, ConnectionHandle(key), timer);
                    self.pump();
                }
                None => break,
            }
        }
        self.now = self.now.max(deadline);
    }

    fn advance(&mut self, delta: u64) {
        self.advance_to(self.now + delta);
    }

    fn events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some((_, event)) = self.ep.poll() {
            out.push(event);
        }
        out
    }

    fn lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.transmits)
            .into_iter()
            .map(|(_, line)| line)
            .collect()
    }

    fn flushes(&mut self) -> Vec<(u64, String)> {
        std::mem::take(&mut self.transmits)
    }

    /// Establish and register against a CAP-less server.
    fn ready(config: Config) -> Self {
        let mut h = Harness::connect(config);
        h.establish();
        h.line(":irc.test 001 kelpie :Welcome");
        let events = h.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Registered { .. })));
        h.transmits.clear();
        h
    }
}

#[test]
fn plain_registration() {
    let mut h = Harness::connect(config());
    h.establish();
    assert_eq!(h.lines(), vec!["CAP LS", "NICK kelpie", "USER kel 0 * :Kelpie"]);

    // Non-numeric chatter does not terminate CAP negotiation.
    h.line("NOTICE AUTH :*** looking up your hostname");
    assert!(h.lines().is_empty());
    assert_matches!(h.events().as_slice(), [Event::Notice { .. }]);

    // The first non-CAP numeric does.
    h.line(":irc.test 001 kelpie :Welcome");
    assert_eq!(h.lines(), vec!["CAP END"]);
    assert_matches!(
        h.events().as_slice(),
        [Event::Registered { nick }] if nick == "kelpie"
    );
}

#[test]
fn registration_sends_pass_when_configured() {
    let config = Config::builder("irc.test", 6667)
        .nick("kelpie")
        .user("kel")
        .server_password("hunter2")
        .build()
        .unwrap();
    let mut h = Harness::connect(config);
    h.establish();
    let lines = h.lines();
    assert_eq!(lines[0], "CAP LS");
    assert_eq!(lines[1], "PASS hunter2");
    assert_eq!(lines[2], "NICK kelpie");
}

#[test]
fn cap_ls_timeout_falls_back() {
    let mut h = Harness::connect(config());
    h.establish();
    h.transmits.clear();
    h.advance(CAP_TIMEOUT);
    assert_eq!(h.lines(), vec!["CAP END"]);
    h.line(":irc.test 001 kelpie :Welcome");
    assert!(h
        .events()
        .iter()
        .any(|e| matches!(e, Event::Registered { .. })));
}

#[test]
fn cap_negotiation_ack() {
    let mut h = Harness::connect(config());
    h.establish();
    h.transmits.clear();

    h.line(":s CAP * LS :multi-prefix sasl");
    assert_eq!(h.lines(), vec!["CAP REQ :multi-prefix"]);

    h.line(":s CAP * ACK :multi-prefix");
    assert_eq!(h.lines(), vec!["CAP END"]);
    assert_matches!(
        h.events().as_slice(),
        [Event::CapabilitiesAcknowledged(caps)] if caps == &["multi-prefix"]
    );

    h.line(":irc.test 001 kelpie :Welcome");
    assert_matches!(h.events().as_slice(), [Event::Registered { .. }]);
}

#[test]
fn cap_negotiation_nak_reports_full_request() {
    let mut h = Harness::connect(config());
    h.establish();
    h.transmits.clear();

    h.line(":s CAP * LS :multi-prefix away-notify");
    assert_eq!(h.lines(), vec!["CAP REQ :multi-prefix away-notify"]);

    h.line(":s CAP * NAK :multi-prefix");
    assert_eq!(h.lines(), vec!["CAP END"]);
    assert_matches!(
        h.events().as_slice(),
        [Event::CapabilitiesRejected(caps)] if caps == &["multi-prefix", "away-notify"]
    );
}

#[test]
fn cap_ls_multiline_accumulates() {
    let mut h = Harness::connect(config());
    h.establish();
    h.transmits.clear();

    h.line(":s CAP * LS * :away-notify");
    assert!(h.lines().is_empty());
    h.line(":s CAP * LS :multi-prefix");
    assert_eq!(h.lines(), vec!["CAP REQ :away-notify multi-prefix"]);
}

#[test]
fn cap_without_offerings_ends_immediately() {
    let mut h = Harness::connect(config());
    h.establish();
    h.transmits.clear();
    h.line(":s CAP * LS :sasl");
    assert_eq!(h.lines(), vec!["CAP END"]);
}

#[test]
fn pacing_releases_one_line_per_period() {
    let mut h = Harness::ready(config());
    let t0 = h.now;
    for i in 0..3 {
        h.ep
            .enqueue(h.now, h.conn, format!("PRIVMSG #a :{}", i), false);
    }
    h.pump();
    assert!(h.transmits.is_empty());

    h.advance(3 * DELAY_US);
    let flushes = h.flushes();
    let times: Vec<u64> = flushes.iter().map(|(t, _)| *t).collect();
    assert_eq!(times, vec![t0, t0 + DELAY_US, t0 + 2 * DELAY_US]);
    let lines: Vec<&str> = flushes.iter().map(|(_, l)| l.as_str()).collect();
    assert_eq!(lines, vec!["PRIVMSG #a :0", "PRIVMSG #a :1", "PRIVMSG #a :2"]);
}

#[test]
fn priority_lines_bypass_the_pacer() {
    let mut h = Harness::ready(config());
    h.ep
        .enqueue(h.now, h.conn, "PRIVMSG #a :queued".to_owned(), false);
    h.ep
        .enqueue(h.now, h.conn, "PONG :urgent".to_owned(), true);
    h.pump();
    assert_eq!(h.lines(), vec!["PONG :urgent"]);
    h.advance(DELAY_US);
    assert_eq!(h.lines(), vec!["PRIVMSG #a :queued"]);
}

#[test]
fn queued_lines_wait_for_ready() {
    let mut h = Harness::connect(config());
    h.establish();
    h.ep
        .enqueue(h.now, h.conn, "PRIVMSG #a :early".to_owned(), false);
    h.pump();
    h.advance(5 * DELAY_US);
    assert!(!h.lines().iter().any(|l| l.contains("early")));

    h.line(":irc.test 001 kelpie :Welcome");
    h.advance(2 * DELAY_US);
    assert!(h.lines().iter().any(|l| l == "PRIVMSG #a :early"));
}

#[test]
fn retuning_preserves_the_scheduled_flush() {
    let mut h = Harness::ready(config());
    let t0 = h.now;
    h.ep
        .enqueue(h.now, h.conn, "PRIVMSG #a :1".to_owned(), false);
    h.ep
        .enqueue(h.now, h.conn, "PRIVMSG #a :2".to_owned(), false);
    h.pump();
    h.advance_to(t0);
    assert_eq!(h.flushes().len(), 1);

    // Dropping the delay to 1 ms must not pull the already-scheduled
    // flush earlier.
    h.ep.set_message_delay(h.conn, 1);
    h.advance_to(t0 + DELAY_US - 1);
    assert!(h.flushes().is_empty());
    h.advance_to(t0 + DELAY_US);
    let flushes = h.flushes();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].0, t0 + DELAY_US);
}

#[test]
fn pacing_gap_invariant_generative() {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let delay_ms: u64 = rng.gen_range(1..=2000);
        let config = Config::builder("irc.test", 6667)
            .nick("kelpie")
            .message_delay(delay_ms)
            .build()
            .unwrap();
        let mut h = Harness::ready(config);
        let mut submitted = 0u32;
        for _ in 0..10 {
            for _ in 0..rng.gen_range(0..3) {
                h.ep
                    .enqueue(h.now, h.conn, format!("PRIVMSG #a :{}", submitted), false);
                submitted += 1;
            }
            h.pump();
            h.advance(rng.gen_range(0..2 * delay_ms * 1000 + 1));
        }
        h.advance((u64::from(submitted) + 2) * delay_ms * 1000);
        let flushes = h.flushes();
        let paced: Vec<u64> = flushes
            .iter()
            .filter(|(_, l)| l.starts_with("PRIVMSG"))
            .map(|(t, _)| *t)
            .collect();
        assert_eq!(paced.len() as u32, submitted);
        for pair in paced.windows(2) {
            assert!(
                pair[1] - pair[0] >= delay_ms * 1000,
                "flushes {} and {} closer than {}ms",
                pair[0],
                pair[1],
                delay_ms
            );
        }
    }
}

#[test]
fn server_ping_answered_immediately() {
    let mut h = Harness::ready(config());
    h.line("PING :abc123");
    assert_eq!(h.lines(), vec!["PONG :abc123"]);
    h.line("PING xyz");
    assert_eq!(h.lines(), vec!["PONG :xyz"]);
}

#[test]
fn keepalive_ping_once_per_idle_cycle() {
    let mut h = Harness::ready(config());
    h.advance(ALL_IDLE);
    assert_eq!(h.lines(), vec!["PING :1"]);
    // Quiet until the next full idle window elapses.
    h.advance(ALL_IDLE / 2);
    assert!(h.lines().is_empty());
    h.advance(ALL_IDLE / 2);
    assert_eq!(h.lines(), vec!["PING :2"]);
    // Inbound traffic restarts the cycle.
    h.line(":irc.test PONG irc.test :2");
    h.transmits.clear();
    h.advance(ALL_IDLE - 1);
    assert!(h.lines().is_empty());
}

#[test]
fn reader_idle_recycles_the_connection() {
    let mut h = Harness::ready(config());
    let start = h.now;
    h.advance(READER_IDLE);
    let lines = h.lines();
    assert_eq!(lines.last().map(String::as_str), Some("QUIT :Reconnecting..."));
    assert_eq!(h.closes, 1);
    let events = h.events();
    assert_matches!(
        events.last(),
        Some(Event::ConnectionClosed {
            reconnect: true,
            ..
        })
    );

    // Replacement dial five seconds later.
    assert_eq!(h.connects, 1);
    h.advance(RECONNECT_DELAY);
    assert_eq!(h.connects, 2);
    assert_eq!(h.now, start + READER_IDLE + RECONNECT_DELAY);

    // The successor registers from scratch.
    h.establish();
    let lines = h.lines();
    assert_eq!(lines[0], "CAP LS");
    assert_eq!(lines[1], "NICK kelpie");
}

#[test]
fn reconnect_rejoins_channels() {
    let mut h = Harness::ready(config());
    h.line(":kelpie!k@h JOIN #rust");
    assert_eq!(h.ep.get_channels(h.conn), vec!["#rust"]);

    h.ep
        .connection_error(h.now, h.conn, ConnectionError::Reset);
    h.pump();
    assert_matches!(
        h.events().last(),
        Some(Event::ConnectionClosed {
            reconnect: true,
            ..
        })
    );
    h.advance(RECONNECT_DELAY);
    assert_eq!(h.connects, 2);
    h.transmits.clear();
    h.establish();
    h.line(":irc.test 001 kelpie :Welcome back");
    h.advance(DELAY_US);
    assert!(h.lines().iter().any(|l| l == "JOIN #rust"));
}

#[test]
fn nick_collision_during_registration_mangles() {
    let mut h = Harness::connect(config());
    h.establish();
    h.transmits.clear();
    h.line(":irc.test 433 * kelpie :Nickname is already in use");
    // The numeric also abandons the unanswered CAP LS.
    assert_eq!(h.lines(), vec!["CAP END", "NICK kelpie_"]);

    h.line(":irc.test 001 kelpie_ :Welcome");
    assert_matches!(
        h.events().last(),
        Some(Event::Registered { nick }) if nick == "kelpie_"
    );

    // Periodic reclaim of the intended nick.
    h.advance(NICK_RECLAIM_PERIOD + DELAY_US);
    assert!(h.lines().iter().any(|l| l == "NICK kelpie"));
    h.line(":kelpie_!k@h NICK kelpie");
    assert_matches!(
        h.events().last(),
        Some(Event::NickChange { old, new }) if old == "kelpie_" && new == "kelpie"
    );
    assert_eq!(h.ep.get_nick(h.conn).as_deref(), Some("kelpie"));
}

#[test]
fn nick_rejection_while_ready_is_dispatched() {
    let mut h = Harness::ready(config());
    h.line(":irc.test 433 kelpie wanted :Nickname is already in use");
    assert_matches!(
        h.events().last(),
        Some(Event::NickRejected { attempted }) if attempted == "wanted"
    );
}

#[test]
fn graceful_shutdown_drops_queued_lines() {
    let mut h = Harness::ready(config());
    for i in 0..3 {
        h.ep
            .enqueue(h.now, h.conn, format!("PRIVMSG #a :{}", i), false);
    }
    h.pump();
    h.transmits.clear();
    h.ep.shutdown(h.conn, Some("bye"));
    h.pump();

    assert_eq!(h.lines(), vec!["QUIT :bye"]);
    assert_eq!(h.closes, 1);
    assert_matches!(
        h.events().last(),
        Some(Event::ConnectionClosed {
            reconnect: false,
            reason: None,
        })
    );
    assert!(h.ep.is_idle());
    assert!(h.timers.is_empty());

    // Nothing more flows afterwards.
    h.ep
        .enqueue(h.now, h.conn, "PRIVMSG #a :late".to_owned(), false);
    h.pump();
    assert!(h.lines().is_empty());
}

#[test]
fn shutdown_without_reason_sends_bare_quit() {
    let mut h = Harness::ready(config());
    h.ep.shutdown(h.conn, None);
    h.pump();
    assert_eq!(h.lines(), vec!["QUIT"]);
}

#[test]
fn server_error_closes_with_reconnect() {
    let mut h = Harness::ready(config());
    h.line("ERROR :Closing Link: kelpie (K-lined)");
    assert_eq!(h.closes, 1);
    assert_matches!(
        h.events().last(),
        Some(Event::ConnectionClosed {
            reconnect: true,
            reason: Some(ConnectionError::ServerClosed(_)),
        })
    );
    assert!(h.timers.contains_key(&(h.conn.0, Timer::Reconnect)));
}

#[test]
fn tls_failure_disables_reconnect() {
    let config = Config::builder("irc.test", 6697)
        .nick("kelpie")
        .ssl(true)
        .build()
        .unwrap();
    let mut h = Harness::connect(config);
    h.establish();
    // TLS leg pending: no registration burst yet.
    assert!(h.lines().is_empty());
    h.ep.connection_error(
        h.now,
        h.conn,
        ConnectionError::Tls("handshake failed".to_owned()),
    );
    h.pump();
    assert_matches!(
        h.events().last(),
        Some(Event::ConnectionClosed {
            reconnect: false,
            ..
        })
    );
    assert!(h.ep.is_idle());
}

#[test]
fn tls_connection_registers_after_handshake() {
    let config = Config::builder("irc.test", 6697)
        .nick("kelpie")
        .ssl(true)
        .build()
        .unwrap();
    let mut h = Harness::connect(config);
    h.establish();
    assert!(h.lines().is_empty());
    h.ep.tls_connected(h.now, h.conn);
    h.pump();
    assert_eq!(h.lines()[0], "CAP LS");
}

#[test]
fn channel_model_tracks_membership() {
    let mut h = Harness::ready(config());
    h.line(":kelpie!k@h JOIN #rust");
    h.line(":irc.test 353 kelpie = #rust :@oper +voiced kelpie plain");
    h.line(":dan!d@h JOIN #rust");

    let mut users = h.ep.get_channel_users(h.conn, "#rust").unwrap();
    users.sort();
    assert_eq!(users, vec!["dan", "kelpie", "oper", "plain", "voiced"]);

    h.line(":dan!d@h NICK danny");
    h.line(":voiced!v@h PART #rust :gone");
    h.line(":oper!o@h KICK #rust plain :bye");
    h.line(":danny!d@h QUIT :netsplit");

    let mut users = h.ep.get_channel_users(h.conn, "#rust").unwrap();
    users.sort();
    assert_eq!(users, vec!["kelpie"]);

    // Kicked ourselves: the channel is gone entirely.
    h.line(":oper!o@h KICK #rust kelpie :enough");
    assert!(h.ep.get_channel_users(h.conn, "#rust").is_none());
    assert!(h.ep.get_channels(h.conn).is_empty());
}

#[test]
fn typed_events_for_messages_and_ctcp() {
    let mut h = Harness::ready(config());
    h.line(":dan!d@h PRIVMSG kelpie :hello there");
    h.line(":dan!d@h PRIVMSG kelpie :\u{1}VERSION\u{1}");
    h.line(":dan!d@h NOTICE kelpie :\u{1}VERSION tether\u{1}");
    h.line(":irc.test 372 kelpie :- motd line");

    let events = h.events();
    assert_matches!(&events[0], Event::Privmsg { source, text, .. }
        if source.name == "dan" && text == "hello there");
    assert_matches!(&events[1], Event::CtcpQuery { payload, .. } if payload == "VERSION");
    assert_matches!(&events[2], Event::CtcpReply { payload, .. } if payload == "VERSION tether");
    assert_matches!(&events[3], Event::ServerLine(msg) if msg.command == "372");
}

#[test]
fn unparseable_line_is_a_protocol_error() {
    let mut h = Harness::ready(config());
    h.line(":prefixonly");
    assert_matches!(
        h.events().as_slice(),
        [Event::ProtocolError { line }] if line == ":prefixonly"
    );
    // The connection keeps going.
    h.line("PING :still-alive");
    assert_eq!(h.lines(), vec!["PONG :still-alive"]);
}
