//! Work-order and permit state changes shared by the commands.
//!
//! Generation drives an [`AgentBackend`] and writes its result into the store;
//! the permit actions enforce the Draft -> Pending -> Approved lifecycle.

use anyhow::{Result, anyhow};
use permitflow_agent::{AgentBackend, AgentError, ExtractionStage, FrameCallback, RunRequest};
use permitflow_core::{
    CancelToken, Permit, PermitStatus, StructuredResult, TransitionError, ValidationStatus,
    WorkOrder, WorkOrderStatus, is_valid_permit_transition,
};
use permitflow_errors::{ErrorType, errors};
use permitflow_observe::Observer;
use permitflow_store::{RunHistoryRecord, Store};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct GenerationOutcome {
    pub work_order_id: String,
    pub status: WorkOrderStatus,
    pub stage: ExtractionStage,
    pub frames: usize,
    pub malformed_frames: usize,
    pub session_created: bool,
    pub result: StructuredResult,
}

/// Run the agent for a `New` work order and persist what it returns.
///
/// The work order is `In-Progress` while the agent streams. On success it
/// becomes `Completed`; on any failure the stored status is put back.
pub(crate) fn generate_permits(
    store: &Store,
    observer: &Observer,
    backend: &dyn AgentBackend,
    wo: &WorkOrder,
    on_frame: Option<FrameCallback>,
    cancel: &CancelToken,
) -> Result<GenerationOutcome> {
    let id = wo.work_order_id.as_str();
    if wo.status != WorkOrderStatus::New {
        return Err(anyhow!(
            "only New work orders can be generated; {id} is {}",
            wo.status
        ));
    }

    let previous = store.get_status(id)?;
    store.set_status(id, WorkOrderStatus::InProgress)?;
    let req = RunRequest {
        user_id: store.user_id()?,
        session_id: store.agent_session_id(id)?,
        work_order_id: id.to_string(),
    };
    observer.verbose_log(&format!(
        "generating {id} as {} in session {}",
        req.user_id, req.session_id
    ));

    let run = match backend.run_work_order(&req, on_frame, cancel) {
        Ok(run) => run,
        Err(err) => {
            let message = err.to_string();
            store.set_status(id, previous)?;
            store.append_run_history(&RunHistoryRecord::failed(id, &message))?;
            if let Err(log_err) = observer.record_failure(id, &message) {
                observer.warn_log(&format!("failed to record run failure: {log_err}"));
            }
            let failure = errors::agent_failed(id, &message, err.status(), agent_error_type(&err));
            return Err(failure.into_error());
        }
    };

    if let Err(err) = store.apply_result(id, &run.result) {
        store.set_status(id, previous)?;
        return Err(err.context(format!("failed to store result for {id}")));
    }
    store.set_status(id, WorkOrderStatus::Completed)?;
    store.append_run_history(&RunHistoryRecord::completed(
        id,
        run.stage.as_str(),
        run.frames,
        run.malformed_frames,
    ))?;
    let recorded = observer.record_run(id, run.stage.as_str(), run.frames, run.malformed_frames);
    if let Err(log_err) = recorded {
        observer.warn_log(&format!("failed to record run: {log_err}"));
    }

    Ok(GenerationOutcome {
        work_order_id: id.to_string(),
        status: WorkOrderStatus::Completed,
        stage: run.stage,
        frames: run.frames,
        malformed_frames: run.malformed_frames,
        session_created: run.session_created,
        result: run.result,
    })
}

fn agent_error_type(err: &AgentError) -> ErrorType {
    match err {
        AgentError::Transport { .. } => ErrorType::Network,
        AgentError::NoStructuredResult => ErrorType::Agent,
        AgentError::Cancelled => ErrorType::Cancelled,
        AgentError::Config(_) => ErrorType::Configuration,
    }
}

/// Field replacements for a permit; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub(crate) struct PermitEdit {
    pub controls: Option<Vec<String>>,
    pub ppe: Option<Vec<String>>,
    pub sign_off_roles: Option<Vec<String>>,
    pub attachments_required: Option<Vec<String>>,
    pub validity_hours: Option<u32>,
}

impl PermitEdit {
    pub fn is_empty(&self) -> bool {
        self.controls.is_none()
            && self.ppe.is_none()
            && self.sign_off_roles.is_none()
            && self.attachments_required.is_none()
            && self.validity_hours.is_none()
    }

    fn apply(self, permit: &mut Permit) {
        if let Some(controls) = self.controls {
            permit.controls = controls;
        }
        if let Some(ppe) = self.ppe {
            permit.ppe = ppe;
        }
        if let Some(roles) = self.sign_off_roles {
            permit.sign_off_roles = roles;
        }
        if let Some(attachments) = self.attachments_required {
            permit.attachments_required = attachments;
        }
        if let Some(hours) = self.validity_hours {
            permit.validity_hours = hours;
        }
    }
}

pub(crate) fn edit_permit(store: &Store, permit_id: &str, edit: PermitEdit) -> Result<Permit> {
    ensure_permit_exists(store, permit_id)?;
    store.update_permit(permit_id, |permit| {
        if permit.status == PermitStatus::Approved {
            return Err(anyhow!(
                "permit {permit_id} is Approved and can no longer be edited"
            ));
        }
        edit.apply(permit);
        Ok(())
    })
}

/// Draft -> Pending.
pub(crate) fn submit_permit(store: &Store, permit_id: &str) -> Result<Permit> {
    move_permit(store, permit_id, PermitStatus::Draft, PermitStatus::Pending)
}

/// Pending -> Approved, refused while the stored validation is `Fail`.
pub(crate) fn approve_permit(store: &Store, permit_id: &str) -> Result<Permit> {
    ensure_permit_exists(store, permit_id)?;
    let failed = store
        .get_validation(permit_id)?
        .is_some_and(|v| v.validation_status == ValidationStatus::Fail);
    if failed {
        return Err(TransitionError::FailedValidation {
            permit_id: permit_id.to_string(),
        }
        .into());
    }
    move_permit(store, permit_id, PermitStatus::Pending, PermitStatus::Approved)
}

/// Pending -> Draft, so a submitted permit can be reworked.
pub(crate) fn reopen_permit(store: &Store, permit_id: &str) -> Result<Permit> {
    move_permit(store, permit_id, PermitStatus::Pending, PermitStatus::Draft)
}

fn move_permit(
    store: &Store,
    permit_id: &str,
    expected: PermitStatus,
    to: PermitStatus,
) -> Result<Permit> {
    ensure_permit_exists(store, permit_id)?;
    store.update_permit(permit_id, |permit| {
        if permit.status != expected || !is_valid_permit_transition(permit.status, to) {
            return Err(TransitionError::Permit {
                permit_id: permit_id.to_string(),
                from: permit.status,
                to,
            }
            .into());
        }
        permit.status = to;
        Ok(())
    })
}

fn ensure_permit_exists(store: &Store, permit_id: &str) -> Result<()> {
    if store.get_permit(permit_id)?.is_none() {
        return Err(errors::permit_not_found(permit_id).into_error());
    }
    Ok(())
}
