//! Client for the permit agent: session handling, the streaming run call,
//! event-stream decoding and structured-result extraction.

pub mod client;
pub mod decoder;
pub mod error;
pub mod extract;
pub mod frame;
pub mod stream;

pub use client::{AgentBackend, AgentClient, AgentRun, RunRequest, run_instruction};
pub use decoder::FrameDecoder;
pub use error::AgentError;
pub use extract::{
    ExtractOptions, Extraction, ExtractionStage, STAGES, extract_structured_result,
    normalize_result,
};
pub use frame::{EventFrame, FrameDecodeError, FramePart, FrameReader, read_frames};
pub use stream::{FrameCallback, ingest_stream};

/// Outcome of parsing a captured stream body offline.
#[derive(Debug, Clone)]
pub struct ParsedStream {
    pub frames: Vec<EventFrame>,
    pub diagnostics: Vec<FrameDecodeError>,
    pub extraction: Result<Extraction, String>,
}

/// Decode and extract a complete event-stream body, e.g. one saved to disk.
pub fn parse_sse_body(body: &[u8], opts: &ExtractOptions) -> ParsedStream {
    let (frames, diagnostics) = read_frames(body);
    let extraction = extract_structured_result(&frames, opts).map_err(|err| err.to_string());
    ParsedStream {
        frames,
        diagnostics,
        extraction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sse_body_reports_frames_diagnostics_and_result() {
        let body = concat!(
            "data: {\"content\":{\"parts\":[{\"text\":\"working\"}]}}\n\n",
            "data: {nope\n\n",
            "data: {\"data\":{\"hazards\":[{\"name\":\"Fall\",\"confidence\":0.4}]}}\n",
        );
        let parsed = parse_sse_body(body.as_bytes(), &ExtractOptions::default());
        assert_eq!(parsed.frames.len(), 2);
        assert_eq!(parsed.diagnostics.len(), 1);
        let extraction = parsed.extraction.expect("extraction");
        assert_eq!(extraction.stage, ExtractionStage::FrameData);
        assert_eq!(extraction.result.hazards[0].name, "Fall");
    }

    #[test]
    fn parse_sse_body_keeps_error_message_when_nothing_matches() {
        let parsed = parse_sse_body(b": ping\n\n", &ExtractOptions::default());
        assert!(parsed.frames.is_empty());
        assert_eq!(
            parsed.extraction.expect_err("no result"),
            "could not parse agent response"
        );
    }
}
