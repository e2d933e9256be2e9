//! CTCP delimiter handling and low-level quoting.
//!
//! A CTCP payload travels inside a PRIVMSG or NOTICE body wrapped in 0x01
//! delimiter bytes. Within the payload NUL, CR, LF and the quote byte itself
//! are escaped with 0x10; a stray delimiter byte cannot be represented and is
//! dropped.

/// Byte that brackets a CTCP payload inside a message body.
pub const DELIM: char = '\u{1}';

const QUOTE: char = '\u{10}';

/// Apply low-level quoting to a payload about to be wrapped.
pub fn escape(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    for c in payload.chars() {
        match c {
            '\u{0}' => {
                out.push(QUOTE);
                out.push('0');
            }
            '\n' => {
                out.push(QUOTE);
                out.push('n');
            }
            '\r' => {
                out.push(QUOTE);
                out.push('r');
            }
            QUOTE => {
                out.push(QUOTE);
                out.push(QUOTE);
            }
            DELIM => {}
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape`]. An unknown quote pair decodes to its second character;
/// a trailing lone quote byte is dropped.
pub fn unescape(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    let mut chars = payload.chars();
    while let Some(c) = chars.next() {
        if c != QUOTE {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('\u{0}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Escape a payload and bracket it in delimiters, ready to be sent as a
/// message body.
pub fn wrap(payload: &str) -> String {
    format!("{}{}{}", DELIM, escape(payload), DELIM)
}

/// If `body` is a CTCP-delimited message body, return the unescaped payload.
/// Tolerates a missing closing delimiter, which some clients omit.
pub fn extract(body: &str) -> Option<String> {
    let inner = body.strip_prefix(DELIM)?;
    let inner = inner.strip_suffix(DELIM).unwrap_or(inner);
    Some(unescape(inner))
}
