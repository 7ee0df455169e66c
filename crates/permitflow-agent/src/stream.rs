use crate::error::{AgentError, stream_read_error};
use crate::frame::{EventFrame, FrameReader};
use permitflow_core::CancelToken;
use std::io::{ErrorKind, Read};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Live per-frame notification. Errors and panics are logged and swallowed.
pub type FrameCallback = Arc<dyn Fn(&EventFrame) -> anyhow::Result<()> + Send + Sync>;

/// Read `body` to exhaustion, decoding frames as chunks arrive.
///
/// The token is checked before every read; once it fires the partial frames
/// are dropped and `Cancelled` is returned. `warn` receives malformed-frame
/// diagnostics and observer failures.
pub fn ingest_stream<R: Read>(
    mut body: R,
    chunk_bytes: usize,
    on_frame: Option<&FrameCallback>,
    cancel: &CancelToken,
    warn: &dyn Fn(&str),
) -> Result<FrameReader, AgentError> {
    let mut reader = FrameReader::new();
    let mut buf = vec![0_u8; chunk_bytes.max(1)];
    loop {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let read = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(stream_read_error(&err)),
        };
        let seen_diagnostics = reader.diagnostics().len();
        let added = reader.push(&buf[..read]);
        report(&reader, added, seen_diagnostics, on_frame, warn);
    }
    let seen_diagnostics = reader.diagnostics().len();
    let added = reader.finish();
    report(&reader, added, seen_diagnostics, on_frame, warn);
    Ok(reader)
}

fn report(
    reader: &FrameReader,
    added: usize,
    seen_diagnostics: usize,
    on_frame: Option<&FrameCallback>,
    warn: &dyn Fn(&str),
) {
    for diagnostic in &reader.diagnostics()[seen_diagnostics..] {
        warn(&diagnostic.to_string());
    }
    let Some(callback) = on_frame else {
        return;
    };
    let frames = reader.frames();
    for frame in &frames[frames.len() - added..] {
        if let Some(failure) = notify(callback, frame) {
            warn(&failure);
        }
    }
}

fn notify(callback: &FrameCallback, frame: &EventFrame) -> Option<String> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(frame))) {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!(
            "frame observer failed on line {}: {err}",
            frame.line_no
        )),
        Err(_) => Some(format!("frame observer panicked on line {}", frame.line_no)),
    }
}
