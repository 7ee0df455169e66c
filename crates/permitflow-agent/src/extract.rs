//! Structured-result extraction over a finished frame sequence.
//!
//! Agents report their answer either as a native `data` field on one event or
//! as JSON text inside a model message. Each stage below is a pure function
//! that lists recognized candidates in stream order; stages run in table
//! order and the first recognized candidate wins.

use crate::error::AgentError;
use crate::frame::EventFrame;
use permitflow_core::{DEFAULT_POLICY_VERSION, RunMeta, StructuredResult};
use serde::Serialize;
use serde::de::{Deserialize, DeserializeOwned};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionStage {
    FrameData,
    PartText,
    FinalFrameText,
}

impl ExtractionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStage::FrameData => "frame-data",
            ExtractionStage::PartText => "part-text",
            ExtractionStage::FinalFrameText => "final-frame-text",
        }
    }
}

impl std::fmt::Display for ExtractionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Stage = fn(&[EventFrame]) -> Vec<Value>;

pub const STAGES: &[(ExtractionStage, Stage)] = &[
    (ExtractionStage::FrameData, frame_data_candidates),
    (ExtractionStage::PartText, part_text_candidates),
    (ExtractionStage::FinalFrameText, final_frame_text_candidates),
];

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub fallback_policy_version: String,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            fallback_policy_version: DEFAULT_POLICY_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub stage: ExtractionStage,
    pub result: StructuredResult,
    /// Entries of the winning candidate that could not be decoded.
    pub dropped: Vec<String>,
}

/// The first recognized candidate wins, even when some of its entries are
/// unusable; later candidates and stages are never consulted.
pub fn extract_structured_result(
    frames: &[EventFrame],
    opts: &ExtractOptions,
) -> Result<Extraction, AgentError> {
    for (stage, candidates) in STAGES {
        if let Some(candidate) = candidates(frames).into_iter().next() {
            let (result, dropped) = normalize_result(&candidate, opts);
            return Ok(Extraction {
                stage: *stage,
                result,
                dropped,
            });
        }
    }
    Err(AgentError::NoStructuredResult)
}

/// An object carrying `hazards` or `permits`.
pub fn is_recognized(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| obj.contains_key("hazards") || obj.contains_key("permits"))
}

pub fn frame_data_candidates(frames: &[EventFrame]) -> Vec<Value> {
    frames
        .iter()
        .filter_map(|frame| frame.data.as_ref())
        .filter(|data| is_recognized(data))
        .cloned()
        .collect()
}

pub fn part_text_candidates(frames: &[EventFrame]) -> Vec<Value> {
    frames
        .iter()
        .flat_map(EventFrame::texts)
        .filter_map(parse_text_candidate)
        .collect()
}

pub fn final_frame_text_candidates(frames: &[EventFrame]) -> Vec<Value> {
    frames
        .last()
        .map(|frame| frame.texts().filter_map(parse_text_candidate).collect())
        .unwrap_or_default()
}

/// Parse free text as a recognized object, falling back to the body of a
/// fenced code block when the text as a whole is not JSON.
pub fn parse_text_candidate(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = serde_json::from_str::<Value>(trimmed)
        .ok()
        .or_else(|| fenced_body(trimmed).and_then(|body| serde_json::from_str(body).ok()))?;
    is_recognized(&parsed).then_some(parsed)
}

fn fenced_body(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    // skip the language tag on the opening fence line
    let body_start = after_open.find('\n').map(|idx| idx + 1)?;
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// Decode a recognized object entry by entry. Missing collections are empty,
/// entries that do not decode are left out and described in the returned
/// list, and a missing `runMeta` is replaced by the fallback.
pub fn normalize_result(
    value: &Value,
    opts: &ExtractOptions,
) -> (StructuredResult, Vec<String>) {
    let empty = Map::new();
    let obj = value.as_object().unwrap_or(&empty);
    let mut dropped = Vec::new();
    let pdf_links: Vec<String> = decode_entries::<Value>(obj, "pdfLinks", &mut dropped)
        .into_iter()
        .enumerate()
        .filter_map(|(idx, link)| match link {
            Value::String(link) => Some(link),
            other => {
                dropped.push(format!("pdfLinks[{idx}]: expected a string, got {other}"));
                None
            }
        })
        .collect();
    let result = StructuredResult {
        work_order_id: obj
            .get("workOrderId")
            .and_then(Value::as_str)
            .map(str::to_string),
        hazards: decode_entries(obj, "hazards", &mut dropped),
        permits: decode_entries(obj, "permits", &mut dropped),
        validations: decode_entries(obj, "validations", &mut dropped),
        pdf_links,
        run_meta: run_meta(obj.get("runMeta"), opts),
    };
    (result, dropped)
}

fn decode_entries<T: DeserializeOwned>(
    obj: &Map<String, Value>,
    key: &str,
    dropped: &mut Vec<String>,
) -> Vec<T> {
    match obj.get(key) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| match T::deserialize(item) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    dropped.push(format!("{key}[{idx}]: {err}"));
                    None
                }
            })
            .collect(),
        Some(_) => {
            dropped.push(format!("{key}: expected an array"));
            Vec::new()
        }
    }
}

fn run_meta(raw: Option<&Value>, opts: &ExtractOptions) -> RunMeta {
    let fallback = RunMeta::fallback(&opts.fallback_policy_version);
    let Some(raw) = raw.and_then(Value::as_object) else {
        return fallback;
    };
    let field = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);
    RunMeta {
        policy_version: field("policyVersion").unwrap_or(fallback.policy_version),
        rag_snapshot: field("ragSnapshot").unwrap_or(fallback.rag_snapshot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_frames;
    use permitflow_core::PermitStatus;
    use serde_json::json;

    fn frames_from(lines: &[&str]) -> Vec<EventFrame> {
        let body: String = lines.iter().map(|line| format!("{line}\n")).collect();
        read_frames(body.as_bytes()).0
    }

    fn text_line(text: &str) -> String {
        format!(
            "data: {}",
            json!({"content": {"parts": [{"text": text}]}})
        )
    }

    #[test]
    fn example_stream_yields_single_draft_permit_with_defaults() {
        let frames = frames_from(&[
            r#"data: {"data":{"other":1}}"#,
            r#"data: {"content":{"parts":[{"text":"{\"permits\":[{\"permitId\":\"P1\",\"type\":\"Hot Work\"}]}"}]}}"#,
        ]);
        let extraction =
            extract_structured_result(&frames, &ExtractOptions::default()).expect("extract");
        assert_eq!(extraction.stage, ExtractionStage::PartText);
        let result = extraction.result;
        assert_eq!(result.permits.len(), 1);
        assert_eq!(result.permits[0].permit_id, "P1");
        assert_eq!(result.permits[0].permit_type, "Hot Work");
        assert_eq!(result.permits[0].status, PermitStatus::Draft);
        assert!(result.hazards.is_empty());
        assert!(result.validations.is_empty());
        assert!(result.pdf_links.is_empty());
        assert_eq!(result.run_meta.policy_version, DEFAULT_POLICY_VERSION);
    }

    #[test]
    fn frame_data_wins_over_later_text() {
        let frames = frames_from(&[
            r#"data: {"data":{"hazards":[{"name":"from data","confidence":0.5}]}}"#,
            r#"data: {"content":{"parts":[{"text":"thinking"}]}}"#,
            &text_line(r#"{"hazards":[{"name":"from text","confidence":0.9}]}"#),
        ]);
        let extraction =
            extract_structured_result(&frames, &ExtractOptions::default()).expect("extract");
        assert_eq!(extraction.stage, ExtractionStage::FrameData);
        assert_eq!(extraction.result.hazards[0].name, "from data");
    }

    #[test]
    fn malformed_frame_does_not_stop_the_scan() {
        let frames = frames_from(&[
            "data: {bad json",
            &text_line(r#"{"permits":[{"permitId":"P2","type":"Confined Space"}]}"#),
        ]);
        let extraction =
            extract_structured_result(&frames, &ExtractOptions::default()).expect("extract");
        assert_eq!(extraction.result.permits[0].permit_id, "P2");
    }

    #[test]
    fn unrecognized_streams_have_no_result() {
        let frames = frames_from(&[
            "event: message",
            r#"data: {"data":{"other":1}}"#,
            &text_line("plain words"),
            &text_line(r#"{"summary":"no arrays"}"#),
        ]);
        let err = extract_structured_result(&frames, &ExtractOptions::default())
            .expect_err("no result");
        assert!(matches!(err, AgentError::NoStructuredResult));
        assert!(
            extract_structured_result(&[], &ExtractOptions::default()).is_err(),
            "empty stream"
        );
    }

    #[test]
    fn first_recognized_candidate_wins_even_with_bad_entries() {
        let frames = frames_from(&[
            r#"data: {"data":{"permits":[{"type":"Hot Work"},{"permitId":"P4","type":"Hot Work"}]}}"#,
            &text_line(r#"{"permits":[{"permitId":"P3","type":"Hot Work","status":"Pending"}]}"#),
        ]);
        let extraction =
            extract_structured_result(&frames, &ExtractOptions::default()).expect("extract");
        assert_eq!(extraction.stage, ExtractionStage::FrameData);
        assert_eq!(extraction.result.permits.len(), 1);
        assert_eq!(extraction.result.permits[0].permit_id, "P4");
        assert_eq!(extraction.dropped.len(), 1);
        assert!(extraction.dropped[0].starts_with("permits[0]"));
    }

    #[test]
    fn fractional_validity_in_frame_data_beats_later_text() {
        let frames = frames_from(&[
            r#"data: {"data":{"permits":[{"permitId":"FROM-DATA","type":"Hot Work","validityHours":12.5}]}}"#,
            &text_line(r#"{"permits":[{"permitId":"FROM-TEXT","type":"Hot Work","validityHours":8}]}"#),
        ]);
        let extraction =
            extract_structured_result(&frames, &ExtractOptions::default()).expect("extract");
        assert_eq!(extraction.stage, ExtractionStage::FrameData);
        assert_eq!(extraction.result.permits[0].permit_id, "FROM-DATA");
        assert_eq!(extraction.result.permits[0].validity_hours, 13);
        assert!(extraction.dropped.is_empty());
    }

    #[test]
    fn lone_hazard_with_word_confidence_is_kept() {
        let frames = frames_from(&[
            r#"data: {"data":{"hazards":[{"name":"Hot surfaces","confidence":"high"}],"permits":[]}}"#,
        ]);
        let extraction =
            extract_structured_result(&frames, &ExtractOptions::default()).expect("extract");
        assert_eq!(extraction.result.hazards.len(), 1);
        assert_eq!(extraction.result.hazards[0].name, "Hot surfaces");
        assert_eq!(extraction.result.hazards[0].confidence, 0.0);
        assert!(extraction.result.permits.is_empty());
    }

    #[test]
    fn odd_shapes_are_dropped_not_fatal() {
        let frames = frames_from(&[&text_line(
            r#"{"hazards":{"name":"not a list"},"permits":[{"permitId":"P5","type":"Lifting","status":"Awaiting sign-off"}],"pdfLinks":["a.pdf",3],"runMeta":{"policyVersion":2},"workOrderId":17}"#,
        )]);
        let opts = ExtractOptions {
            fallback_policy_version: "v9".to_string(),
        };
        let extraction = extract_structured_result(&frames, &opts).expect("extract");
        let result = extraction.result;
        assert!(result.hazards.is_empty());
        assert_eq!(result.permits[0].status, PermitStatus::Draft);
        assert_eq!(result.pdf_links, vec!["a.pdf".to_string()]);
        assert_eq!(result.run_meta.policy_version, "v9");
        assert!(result.work_order_id.is_none());
        assert_eq!(
            extraction.dropped,
            vec![
                "pdfLinks[1]: expected a string, got 3".to_string(),
                "hazards: expected an array".to_string(),
            ]
        );
    }

    #[test]
    fn fenced_json_in_final_message_is_parsed() {
        let text = "Here is the plan:\n```json\n{\"hazards\":[],\"permits\":[]}\n```\nDone.";
        let parsed = parse_text_candidate(text).expect("fenced");
        assert!(is_recognized(&parsed));
        assert!(parse_text_candidate("```\nnot json\n```").is_none());
    }

    #[test]
    fn supplied_run_meta_and_fallback_version_are_respected() {
        let opts = ExtractOptions {
            fallback_policy_version: "v7".to_string(),
        };
        let (defaulted, dropped) = normalize_result(&json!({"hazards": null}), &opts);
        assert_eq!(defaulted.run_meta.policy_version, "v7");
        assert!(dropped.is_empty());

        let (given, _) = normalize_result(
            &json!({"permits": [], "runMeta": {"policyVersion": "v2", "ragSnapshot": "s1"}}),
            &opts,
        );
        assert_eq!(given.run_meta.policy_version, "v2");
        assert_eq!(given.run_meta.rag_snapshot, "s1");
    }

    #[test]
    fn one_chunk_and_many_chunks_extract_the_same_result() {
        let body = format!(
            "data: {}\r\n\r\n{}\r\n\r\n",
            json!({"content": {"parts": [{"text": "Évaluation en cours…"}]}}),
            text_line(
                r#"{"hazards":[{"name":"Échafaudage","confidence":0.7}],"runMeta":{"policyVersion":"v1.0","ragSnapshot":"fixed"}}"#
            )
        );
        let (whole, _) = read_frames(body.as_bytes());
        let mut reader = crate::frame::FrameReader::new();
        for byte in body.as_bytes() {
            reader.push(std::slice::from_ref(byte));
        }
        reader.finish();
        let (pieces, _) = reader.into_parts();

        let opts = ExtractOptions::default();
        let a = extract_structured_result(&whole, &opts).expect("whole");
        let b = extract_structured_result(&pieces, &opts).expect("pieces");
        assert_eq!(a.result, b.result);
        assert_eq!(a.result.hazards[0].name, "Échafaudage");
    }
}
