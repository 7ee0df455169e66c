use anyhow::Result;
use permitflow_core::{ITEMS_PER_PAGE, WorkOrderFilter, WorkOrderStatus, paginate};
use serde_json::json;
use std::path::Path;

use crate::WorkOrdersCmd;
use crate::context::AppContext;
use crate::output::*;

pub(crate) fn run_work_orders(
    cwd: &Path,
    cmd: WorkOrdersCmd,
    json_mode: bool,
    verbose: bool,
) -> Result<()> {
    let mut ctx = AppContext::load(cwd, verbose)?;
    match cmd {
        WorkOrdersCmd::List(args) => {
            let filter = WorkOrderFilter {
                search: args.search,
                status: args
                    .status
                    .as_deref()
                    .map(str::parse::<WorkOrderStatus>)
                    .transpose()?,
            };
            let matching: Vec<_> = ctx
                .work_orders()?
                .into_iter()
                .filter(|wo| filter.matches(wo))
                .collect();
            let page = args.page.max(1);
            let items = paginate(&matching, page);
            let pages = matching.len().div_ceil(ITEMS_PER_PAGE).max(1);
            if json_mode {
                print_json(&json!({
                    "page": page,
                    "pages": pages,
                    "total": matching.len(),
                    "items": items,
                }))?;
            } else if items.is_empty() {
                println!("No work orders match.");
            } else {
                for wo in items {
                    println!(
                        "{:<12} {:<12} {:<20} {}",
                        wo.work_order_id,
                        wo.status,
                        preview(&wo.location, 20),
                        wo.title.as_deref().unwrap_or_default()
                    );
                }
                println!("page {page}/{pages} ({} work orders)", matching.len());
            }
        }
        WorkOrdersCmd::Show(args) => {
            let wo = ctx.work_order(&args.work_order_id)?;
            let permits = ctx.store.get_permits(&wo.work_order_id)?;
            let hazards = ctx.store.get_hazards(&wo.work_order_id)?;
            let run = ctx.store.get_run_record(&wo.work_order_id)?;
            if json_mode {
                print_json(&json!({
                    "workOrder": wo,
                    "hazards": hazards,
                    "permits": permits,
                    "lastRun": run,
                }))?;
            } else {
                println!("{} [{}]", wo.work_order_id, wo.status);
                println!("  {}", wo.description);
                println!("  equipment: {}", wo.equipment);
                println!(
                    "  location:  {} ({:.5}, {:.5})",
                    wo.location, wo.latitude, wo.longitude
                );
                println!("  assigned:  {}", wo.assigned_to);
                println!("  crew:      {}", join_or_dash(&wo.crew));
                println!("  hazards:   {}", hazards.len());
                for permit in &permits {
                    println!(
                        "  permit {} {} [{}]",
                        permit.permit_id, permit.permit_type, permit.status
                    );
                }
                if let Some(run) = run {
                    println!(
                        "  last run:  {} policy {} snapshot {}",
                        run.completed_at, run.run_meta.policy_version, run.run_meta.rag_snapshot
                    );
                    for link in &run.pdf_links {
                        println!("  pdf:       {link}");
                    }
                }
            }
        }
    }
    Ok(())
}
