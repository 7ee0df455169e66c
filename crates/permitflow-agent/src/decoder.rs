//! Byte-stream to line decoder.
//!
//! Network chunks may cut a multi-byte character or a line anywhere. The
//! decoder carries the incomplete UTF-8 tail and the unterminated line
//! between calls so the emitted lines do not depend on chunk boundaries.

#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every line it completed, without the
    /// terminator. A trailing `\r` is stripped so CRLF streams decode the same.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let text = self.take_decodable();
        self.buffer.push_str(&text);
        self.drain_lines()
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).to_string();
            self.buffer.push_str(&tail);
            self.pending.clear();
        }
        let rest = std::mem::take(&mut self.buffer);
        (!rest.is_empty()).then(|| strip_cr(rest))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.buffer.is_empty()
    }

    /// Decode the longest valid prefix of `pending`, replacing invalid
    /// sequences with U+FFFD and keeping an incomplete tail for later.
    fn take_decodable(&mut self) -> String {
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&rest[..valid_len]) {
                        out.push_str(valid);
                    }
                    match err.error_len() {
                        Some(bad_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid_len + bad_len..];
                        }
                        None => {
                            rest = &rest[valid_len..];
                            break;
                        }
                    }
                }
            }
        }
        let carry = rest.to_vec();
        self.pending = carry;
        out
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let Some(last_break) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let tail = self.buffer.split_off(last_break + 1);
        let complete = std::mem::replace(&mut self.buffer, tail);
        complete[..last_break]
            .split('\n')
            .map(|line| strip_cr(line.to_string()))
            .collect()
    }
}

fn strip_cr(mut line: String) -> String {
    if line.ends_with('\r') {
        line.pop();
    }
    line
}
