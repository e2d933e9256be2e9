//! Tokenizing a frame into prefix, command and parameters. Anything beyond
//! this split — numeric semantics, channel modes, CTCP — is someone else's
//! business.

use thiserror::Error;

/// Parameter count ceiling fixed by the wire format; the 15th parameter
/// swallows whatever follows.
pub const MAX_PARAMS: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing command")]
    MissingCommand,
}

/// Origin of a message: `name[!user][@host]`, where `name` is a nick or a
/// server name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    pub name: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Prefix {
    fn parse(raw: &str) -> Self {
        let (rest, host) = match raw.split_once('@') {
            Some((rest, host)) => (rest, Some(host.to_owned())),
            None => (raw, None),
        };
        let (name, user) = match rest.split_once('!') {
            Some((name, user)) => (name, Some(user.to_owned())),
            None => (rest, None),
        };
        Prefix {
            name: name.to_owned(),
            user,
            host,
        }
    }
}

/// One tokenized protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub prefix: Option<Prefix>,
    /// Upper-cased command word, or a 3-digit numeric left as-is.
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn parse(line: &str) -> Result<Message, ParseError> {
        let mut rest = line.trim_start_matches(' ');
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }
        let mut prefix = None;
        if let Some(tail) = rest.strip_prefix(':') {
            let (raw, tail) = tail.split_once(' ').ok_or(ParseError::MissingCommand)?;
            prefix = Some(Prefix::parse(raw));
            rest = tail.trim_start_matches(' ');
        }
        let (command, tail) = match rest.split_once(' ') {
            Some((command, tail)) => (command, tail),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }
        let mut params = Vec::new();
        rest = tail;
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            if params.len() == MAX_PARAMS - 1 {
                params.push(rest.to_owned());
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    params.push(param.to_owned());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_owned());
                    rest = "";
                }
            }
        }
        Ok(Message {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit())
    }

    /// Last parameter, where most commands carry their text. Empty when the
    /// message has no parameters at all.
    pub fn trailing(&self) -> &str {
        self.params.last().map(String::as_str).unwrap_or("")
    }
}
