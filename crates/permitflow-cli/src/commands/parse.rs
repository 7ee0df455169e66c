use anyhow::{Context, Result};
use permitflow_agent::{ExtractOptions, parse_sse_body};
use permitflow_core::AppConfig;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;

use crate::ParseArgs;
use crate::output::*;

pub(crate) fn run_parse(cwd: &Path, args: ParseArgs, json_mode: bool) -> Result<()> {
    let cfg = AppConfig::load(cwd)?;
    let path = if args.file.is_absolute() {
        args.file.clone()
    } else {
        cwd.join(&args.file)
    };
    let body = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let opts = ExtractOptions {
        fallback_policy_version: cfg.agent.fallback_policy_version,
    };
    let parsed = parse_sse_body(&body, &opts);

    if json_mode {
        let malformed: Vec<Value> = parsed
            .diagnostics
            .iter()
            .map(|d| json!({ "line": d.line_no, "message": d.message, "excerpt": d.excerpt }))
            .collect();
        let mut payload = json!({
            "frames": parsed.frames.len(),
            "malformed": malformed,
        });
        match &parsed.extraction {
            Ok(extraction) => {
                payload["stage"] = json!(extraction.stage);
                payload["dropped"] = json!(extraction.dropped);
                payload["result"] = json!(extraction.result);
            }
            Err(message) => payload["error"] = json!(message),
        }
        if args.frames {
            payload["events"] = parsed
                .frames
                .iter()
                .map(|frame| json!({ "line": frame.line_no, "payload": frame.raw }))
                .collect();
        }
        return print_json(&payload);
    }

    println!(
        "{}: {} frame(s), {} malformed",
        path.display(),
        parsed.frames.len(),
        parsed.diagnostics.len()
    );
    for diagnostic in &parsed.diagnostics {
        println!("  {diagnostic} near `{}`", diagnostic.excerpt);
    }
    if args.frames {
        for frame in &parsed.frames {
            println!("  line {:>4}: {}", frame.line_no, preview(&frame.raw.to_string(), 160));
        }
    }
    match &parsed.extraction {
        Ok(extraction) => {
            for dropped in &extraction.dropped {
                println!("  dropped entry: {dropped}");
            }
            println!("extracted via {}:", extraction.stage);
            println!("{}", serde_json::to_string_pretty(&extraction.result)?);
        }
        Err(message) => println!("no result: {message}"),
    }
    Ok(())
}
