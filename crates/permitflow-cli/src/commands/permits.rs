use anyhow::Result;
use permitflow_core::{Permit, PermitStatus, ValidationStatus};
use permitflow_errors::errors;
use serde_json::json;
use std::path::Path;

use crate::PermitsCmd;
use crate::context::AppContext;
use crate::output::*;
use crate::workflow::{PermitEdit, approve_permit, edit_permit, reopen_permit, submit_permit};

pub(crate) fn run_permits(
    cwd: &Path,
    cmd: PermitsCmd,
    json_mode: bool,
    verbose: bool,
) -> Result<()> {
    let mut ctx = AppContext::load(cwd, verbose)?;
    match cmd {
        PermitsCmd::List(args) => {
            let wo = ctx.work_order(&args.work_order_id)?;
            let status = args
                .status
                .as_deref()
                .map(str::parse::<PermitStatus>)
                .transpose()?;
            let validation = args
                .validation
                .as_deref()
                .map(str::parse::<ValidationStatus>)
                .transpose()?;
            let type_term = args.permit_type.map(|t| t.to_lowercase());

            let mut rows = Vec::new();
            for permit in ctx.store.get_permits(&wo.work_order_id)? {
                let stored_validation = ctx.store.get_validation(&permit.permit_id)?;
                let validation_status = stored_validation.map(|v| v.validation_status);
                let keep = type_term
                    .as_deref()
                    .is_none_or(|term| permit.permit_type.to_lowercase().contains(term))
                    && status.is_none_or(|s| permit.status == s)
                    && validation.is_none_or(|v| validation_status == Some(v));
                if keep {
                    rows.push((permit, validation_status));
                }
            }

            if json_mode {
                let items: Vec<_> = rows
                    .iter()
                    .map(|(permit, validation_status)| {
                        json!({ "permit": permit, "validationStatus": validation_status })
                    })
                    .collect();
                print_json(&json!({
                    "workOrderId": wo.work_order_id,
                    "items": items,
                }))?;
            } else if rows.is_empty() {
                println!("No permits for {}.", wo.work_order_id);
            } else {
                for (permit, validation_status) in &rows {
                    println!(
                        "{:<16} {:<24} {:<9} {}",
                        permit.permit_id,
                        preview(&permit.permit_type, 24),
                        permit.status,
                        validation_status.map_or("-", |v| v.as_str())
                    );
                }
            }
        }
        PermitsCmd::Show(args) => {
            let Some((work_order_id, permit)) = ctx.store.get_permit(&args.permit_id)? else {
                return Err(errors::permit_not_found(&args.permit_id).into_error());
            };
            let validation = ctx.store.get_validation(&permit.permit_id)?;
            if json_mode {
                print_json(&json!({
                    "workOrderId": work_order_id,
                    "permit": permit,
                    "validation": validation,
                }))?;
            } else {
                print_permit(&permit);
                if let Some(validation) = validation {
                    println!("  validation:  {}", validation.validation_status.as_str());
                    for error in &validation.errors {
                        println!("    error:   {error}");
                    }
                    for warning in &validation.warnings {
                        println!("    warning: {warning}");
                    }
                    for check in &validation.checks {
                        println!(
                            "    check:   {} {} {}",
                            check.check,
                            check.result.as_str(),
                            check.details
                        );
                    }
                    for recommendation in &validation.recommendations {
                        println!("    recommend: {recommendation}");
                    }
                }
            }
        }
        PermitsCmd::Edit(args) => {
            let edit = PermitEdit {
                controls: args.controls,
                ppe: args.ppe,
                sign_off_roles: args.sign_off_roles,
                attachments_required: args.attachments,
                validity_hours: args.validity_hours,
            };
            if edit.is_empty() {
                return Err(anyhow::anyhow!(
                    "nothing to edit: pass --control, --ppe, --sign-off-role, --attachment or --validity-hours"
                ));
            }
            let permit = edit_permit(&ctx.store, &args.permit_id, edit)?;
            report_permit(&permit, "updated", json_mode)?;
        }
        PermitsCmd::Submit(args) => {
            let permit = submit_permit(&ctx.store, &args.permit_id)?;
            report_permit(&permit, "submitted", json_mode)?;
        }
        PermitsCmd::Approve(args) => {
            let permit = approve_permit(&ctx.store, &args.permit_id)?;
            report_permit(&permit, "approved", json_mode)?;
        }
        PermitsCmd::Reopen(args) => {
            let permit = reopen_permit(&ctx.store, &args.permit_id)?;
            report_permit(&permit, "reopened", json_mode)?;
        }
    }
    Ok(())
}

fn report_permit(permit: &Permit, action: &str, json_mode: bool) -> Result<()> {
    if json_mode {
        print_json(&json!({ "action": action, "permit": permit }))
    } else {
        println!("Permit {} {action} ({}).", permit.permit_id, permit.status);
        Ok(())
    }
}

fn print_permit(permit: &Permit) {
    println!("{} {} [{}]", permit.permit_id, permit.permit_type, permit.status);
    println!("  work order:  {}", permit.work_order_id);
    println!("  valid for:   {}h", permit.validity_hours);
    println!("  controls:    {}", join_or_dash(&permit.controls));
    println!("  ppe:         {}", join_or_dash(&permit.ppe));
    println!("  sign-off:    {}", join_or_dash(&permit.sign_off_roles));
    println!("  attachments: {}", join_or_dash(&permit.attachments_required));
    println!("  hazards:     {}", join_or_dash(&permit.hazards_linked));
}
