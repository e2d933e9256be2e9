use bytes::{Buf, BytesMut};

/// Maximum size of a frame on the wire, terminator included.
pub const MAX_FRAME: usize = 512;
/// Maximum payload a frame may carry once the CRLF terminator is accounted for.
pub const MAX_PAYLOAD: usize = MAX_FRAME - 2;

/// Incremental splitter for the inbound byte stream.
///
/// Frames terminate on CR, LF, or CRLF; empty frames are dropped, so the LF
/// of a CRLF pair costs nothing to handle. A run longer than `MAX_PAYLOAD`
/// bytes with no terminator in sight yields exactly one truncated frame and
/// the remainder is discarded up to the next terminator. Payloads are decoded
/// as UTF-8 with invalid sequences replaced by U+FFFD.
pub struct LineDecoder {
    buf: BytesMut,
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(2 * MAX_FRAME),
            discarding: false,
        }
    }

    /// Feed raw bytes from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, if the buffer holds one.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            if self.discarding {
                match self.buf.iter().position(|&b| b == b'\r' || b == b'\n') {
                    Some(i) => {
                        self.buf.advance(i + 1);
                        self.discarding = false;
                    }
                    None => {
                        self.buf.clear();
                        return None;
                    }
                }
                continue;
            }
            match self.buf.iter().position(|&b| b == b'\r' || b == b'\n') {
                Some(i) => {
                    let frame = self.buf.split_to(i);
                    self.buf.advance(1);
                    if frame.is_empty() {
                        continue;
                    }
                    let frame = &frame[..frame.len().min(MAX_PAYLOAD)];
                    return Some(String::from_utf8_lossy(frame).into_owned());
                }
                None => {
                    if self.buf.len() > MAX_PAYLOAD {
                        let frame = self.buf.split_to(MAX_PAYLOAD);
                        self.discarding = true;
                        return Some(String::from_utf8_lossy(&frame).into_owned());
                    }
                    return None;
                }
            }
        }
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode an outbound line, truncating oversized payloads at a UTF-8
/// boundary and appending CRLF.
pub fn encode(line: &str, out: &mut Vec<u8>) {
    let payload = truncate_to_boundary(line, MAX_PAYLOAD);
    out.extend_from_slice(payload.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a
/// character.
pub fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
