use anyhow::Result;
use permitflow_agent::{AgentClient, EventFrame, FrameCallback};
use permitflow_core::CancelToken;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::GenerateArgs;
use crate::context::AppContext;
use crate::output::*;
use crate::workflow::generate_permits;

const FRAME_PREVIEW_CHARS: usize = 120;

pub(crate) fn run_generate(
    cwd: &Path,
    args: GenerateArgs,
    json_mode: bool,
    verbose: bool,
) -> Result<()> {
    let mut ctx = AppContext::load(cwd, verbose)?;
    let wo = ctx.work_order(&args.work_order_id)?;
    let client = AgentClient::new(ctx.cfg.agent.clone())?.with_observer(Arc::clone(&ctx.observer));
    ctx.observer
        .verbose_log(&format!("agent endpoint {}", client.base_url()));

    let cancel = CancelToken::new();
    if let Some(secs) = args.deadline_secs {
        let timer = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            timer.cancel();
        });
    }

    let on_frame = frame_printer(json_mode, Arc::clone(&ctx.observer));
    if !json_mode {
        println!("Generating permits for {}...", wo.work_order_id);
    }
    let outcome = generate_permits(&ctx.store, &ctx.observer, &client, &wo, on_frame, &cancel)?;

    if json_mode {
        print_json(&outcome)?;
        return Ok(());
    }
    println!(
        "{} is {}: {} hazard(s), {} permit(s), {} validation(s) [{} frames, {} malformed, via {}]",
        outcome.work_order_id,
        outcome.status,
        outcome.result.hazards.len(),
        outcome.result.permits.len(),
        outcome.result.validations.len(),
        outcome.frames,
        outcome.malformed_frames,
        outcome.stage
    );
    for permit in &outcome.result.permits {
        println!(
            "  {} {} [{}] valid {}h",
            permit.permit_id, permit.permit_type, permit.status, permit.validity_hours
        );
    }
    for validation in &outcome.result.validations {
        println!(
            "  validation {}: {}",
            validation.permit_id,
            validation.validation_status.as_str()
        );
    }
    Ok(())
}

/// Live progress: frame previews on stdout, or on stderr in verbose JSON mode.
fn frame_printer(
    json_mode: bool,
    observer: Arc<permitflow_observe::Observer>,
) -> Option<FrameCallback> {
    if json_mode && !observer.is_verbose() {
        return None;
    }
    Some(Arc::new(move |frame: &EventFrame| -> Result<()> {
        let text = frame.texts().collect::<Vec<_>>().join(" ");
        let line = format!(
            "[frame {}] {}: {}",
            frame.line_no,
            frame.author().unwrap_or("agent"),
            if text.is_empty() {
                "(data)".to_string()
            } else {
                preview(&text, FRAME_PREVIEW_CHARS)
            }
        );
        if json_mode {
            observer.verbose_log(&line);
        } else {
            println!("  {line}");
        }
        Ok(())
    }))
}
