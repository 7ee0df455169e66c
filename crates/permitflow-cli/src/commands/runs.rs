use anyhow::Result;
use permitflow_store::Store;
use serde_json::json;
use std::path::Path;

use crate::RunsArgs;
use crate::output::*;

pub(crate) fn run_runs(cwd: &Path, args: RunsArgs, json_mode: bool) -> Result<()> {
    let store = Store::new(cwd)?;
    let history = store.list_run_history(&args.work_order_id)?;
    if json_mode {
        return print_json(&json!({
            "workOrderId": args.work_order_id,
            "runs": history,
        }));
    }
    if history.is_empty() {
        println!("No runs recorded for {}.", args.work_order_id);
        return Ok(());
    }
    for run in &history {
        match &run.error {
            Some(error) => println!("{} {} failed: {}", run.at, run.run_id, preview(error, 100)),
            None => println!(
                "{} {} {} via {} ({} frames, {} malformed)",
                run.at,
                run.run_id,
                run.outcome,
                run.stage.as_deref().unwrap_or("-"),
                run.frames,
                run.malformed_frames
            ),
        }
    }
    Ok(())
}
