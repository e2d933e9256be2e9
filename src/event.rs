use std::sync::Arc;

use crate::connection::ConnectionError;
use crate::message::{Message, Prefix};
use crate::sink::Sink;

/// Events of interest to user code, dispatched in the order the lines that
/// produced them arrived on the socket.
#[derive(Debug, Clone)]
pub enum Event {
    /// Registration and capability negotiation finished; the connection is
    /// ready for traffic.
    Registered { nick: String },
    Privmsg {
        source: Prefix,
        target: String,
        text: String,
    },
    Notice {
        source: Option<Prefix>,
        target: String,
        text: String,
    },
    /// CTCP query carried in a PRIVMSG body, payload unescaped.
    CtcpQuery {
        source: Prefix,
        target: String,
        payload: String,
    },
    /// CTCP reply carried in a NOTICE body, payload unescaped.
    CtcpReply {
        source: Prefix,
        target: String,
        payload: String,
    },
    Join { channel: String, user: String },
    Part {
        channel: String,
        user: String,
        reason: Option<String>,
    },
    Kick {
        channel: String,
        by: String,
        target: String,
        reason: Option<String>,
    },
    NickChange { old: String, new: String },
    /// The server rejected a nick while the connection was already ready;
    /// the engine keeps trying to reclaim the intended one.
    NickRejected { attempted: String },
    Quit {
        user: String,
        reason: Option<String>,
    },
    /// Capabilities the server acknowledged from our request.
    CapabilitiesAcknowledged(Vec<String>),
    /// The full request list the server rejected.
    CapabilitiesRejected(Vec<String>),
    /// A line that could not be tokenized, or a CAP exchange that violated
    /// negotiation state. The connection continues.
    ProtocolError { line: String },
    ConnectionClosed {
        reconnect: bool,
        reason: Option<ConnectionError>,
    },
    /// Any recognized-but-untyped line, numerics included.
    ServerLine(Message),
}

impl Event {
    /// Channel the event concerns, when it is channel-scoped.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Event::Join { channel, .. }
            | Event::Part { channel, .. }
            | Event::Kick { channel, .. } => Some(channel),
            Event::Privmsg { target, .. }
            | Event::Notice { target, .. }
            | Event::CtcpQuery { target, .. }
            | Event::CtcpReply { target, .. }
                if target.starts_with(['#', '&']) =>
            {
                Some(target)
            }
            _ => None,
        }
    }

    /// Actor that caused the event, when one is attributable.
    pub fn actor(&self) -> Option<&str> {
        match self {
            Event::Privmsg { source, .. }
            | Event::CtcpQuery { source, .. }
            | Event::CtcpReply { source, .. } => Some(&source.name),
            Event::Notice { source, .. } => source.as_ref().map(|p| p.name.as_str()),
            Event::Join { user, .. } | Event::Part { user, .. } | Event::Quit { user, .. } => {
                Some(user)
            }
            Event::Kick { by, .. } => Some(by),
            Event::NickChange { old, .. } => Some(old),
            _ => None,
        }
    }

    /// Whether the event changes some channel's user list.
    pub fn is_user_list_change(&self) -> bool {
        matches!(
            self,
            Event::Join { .. }
                | Event::Part { .. }
                | Event::Kick { .. }
                | Event::Quit { .. }
                | Event::NickChange { .. }
        )
    }
}

/// The pub/sub registry the engine hands events to. Fan-out is the
/// implementor's concern; `dispatch` runs on the reactor thread and must
/// hand off rather than block.
pub trait EventBus: Send + Sync {
    fn dispatch(&self, event: Event);
}

impl<F> EventBus for F
where
    F: Fn(Event) + Send + Sync,
{
    fn dispatch(&self, event: Event) {
        self(event)
    }
}

/// External collaborators attached to one connection. All optional; an
/// absent collaborator simply drops what it would have observed.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub bus: Option<Arc<dyn EventBus>>,
    /// Observes every decoded inbound line.
    pub input: Option<Arc<dyn Sink<String>>>,
    /// Observes every outbound line at flush time.
    pub output: Option<Arc<dyn Sink<String>>>,
    /// Observes connection errors.
    pub exceptions: Option<Arc<dyn Sink<ConnectionError>>>,
}

impl Collaborators {
    pub fn with_bus(bus: Arc<dyn EventBus>) -> Self {
        Collaborators {
            bus: Some(bus),
            ..Default::default()
        }
    }
}
