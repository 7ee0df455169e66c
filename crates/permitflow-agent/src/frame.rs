use crate::decoder::FrameDecoder;
use serde_json::Value;

pub const DATA_PREFIX: &str = "data: ";

/// One decoded `data:` event from the agent stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    /// One-based line number within the stream.
    pub line_no: usize,
    pub data: Option<Value>,
    pub parts: Vec<FramePart>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePart {
    pub text: Option<String>,
}

impl EventFrame {
    /// Pick out the fields extraction cares about; anything else stays in `raw`.
    pub fn from_payload(line_no: usize, raw: Value) -> Self {
        let data = raw.get("data").filter(|value| !value.is_null()).cloned();
        let parts = raw
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .map(|part| FramePart {
                        text: part.get("text").and_then(Value::as_str).map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            line_no,
            data,
            parts,
            raw,
        }
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| part.text.as_deref())
    }

    pub fn author(&self) -> Option<&str> {
        self.raw.get("author").and_then(Value::as_str)
    }
}

/// A `data:` line whose payload is not valid JSON. The stream keeps going.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("frame on line {line_no} is not valid JSON: {message}")]
pub struct FrameDecodeError {
    pub line_no: usize,
    pub message: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameLine {
    Frame(EventFrame),
    Ignored,
    Malformed(FrameDecodeError),
}

pub fn parse_frame_line(line_no: usize, line: &str) -> FrameLine {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return FrameLine::Ignored;
    };
    if payload.trim().is_empty() {
        return FrameLine::Ignored;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(raw) => FrameLine::Frame(EventFrame::from_payload(line_no, raw)),
        Err(err) => FrameLine::Malformed(FrameDecodeError {
            line_no,
            message: err.to_string(),
            excerpt: payload.chars().take(120).collect(),
        }),
    }
}

/// Accumulates frames and diagnostics from raw stream chunks.
#[derive(Debug, Default)]
pub struct FrameReader {
    decoder: FrameDecoder,
    lines_seen: usize,
    frames: Vec<EventFrame>,
    diagnostics: Vec<FrameDecodeError>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns how many frames it completed. The new frames
    /// are the tail of [`FrameReader::frames`].
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        let before = self.frames.len();
        for line in self.decoder.push(chunk) {
            self.accept_line(&line);
        }
        self.frames.len() - before
    }

    pub fn finish(&mut self) -> usize {
        let before = self.frames.len();
        if let Some(line) = self.decoder.finish() {
            self.accept_line(&line);
        }
        self.frames.len() - before
    }

    pub fn frames(&self) -> &[EventFrame] {
        &self.frames
    }

    pub fn diagnostics(&self) -> &[FrameDecodeError] {
        &self.diagnostics
    }

    pub fn into_parts(self) -> (Vec<EventFrame>, Vec<FrameDecodeError>) {
        (self.frames, self.diagnostics)
    }

    fn accept_line(&mut self, line: &str) {
        self.lines_seen += 1;
        match parse_frame_line(self.lines_seen, line) {
            FrameLine::Frame(frame) => self.frames.push(frame),
            FrameLine::Malformed(diagnostic) => self.diagnostics.push(diagnostic),
            FrameLine::Ignored => {}
        }
    }
}

/// Parse a complete stream body held in memory.
pub fn read_frames(body: &[u8]) -> (Vec<EventFrame>, Vec<FrameDecodeError>) {
    let mut reader = FrameReader::new();
    reader.push(body);
    reader.finish();
    reader.into_parts()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_data_and_empty_lines_are_ignored() {
        assert_eq!(parse_frame_line(1, ""), FrameLine::Ignored);
        assert_eq!(parse_frame_line(2, "event: message"), FrameLine::Ignored);
        assert_eq!(parse_frame_line(3, ": keep-alive"), FrameLine::Ignored);
        assert_eq!(parse_frame_line(4, "data: "), FrameLine::Ignored);
        assert_eq!(parse_frame_line(5, "data:{\"a\":1}"), FrameLine::Ignored);
    }

    #[test]
    fn malformed_payload_is_reported_with_line_number() {
        let FrameLine::Malformed(diag) = parse_frame_line(7, "data: {not json") else {
            panic!("expected malformed frame");
        };
        assert_eq!(diag.line_no, 7);
        assert_eq!(diag.excerpt, "{not json");
        assert!(diag.to_string().starts_with("frame on line 7 is not valid JSON"));
    }

    #[test]
    fn frame_exposes_data_and_part_texts() {
        let FrameLine::Frame(frame) = parse_frame_line(
            1,
            r#"data: {"author":"a","data":{"k":1},"content":{"parts":[{"text":"hi"},{"functionCall":{}}]}}"#,
        ) else {
            panic!("expected frame");
        };
        assert_eq!(frame.data, Some(json!({"k": 1})));
        assert_eq!(frame.parts.len(), 2);
        assert_eq!(frame.texts().collect::<Vec<_>>(), vec!["hi"]);
        assert_eq!(frame.author(), Some("a"));
    }

    #[test]
    fn reader_keeps_going_after_bad_frames() {
        let body = b"data: {\"n\":1}\n\ndata: {broken\n\ndata: {\"n\":2}";
        let (frames, diagnostics) = read_frames(body);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].raw, json!({"n": 2}));
        assert_eq!(frames[1].line_no, 5);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].line_no, 3);
    }
}
