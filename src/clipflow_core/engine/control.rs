//! Cooperative control surface: pause/cancel/resume/moderation approval,
//! and the inter-step flag check the executor calls between steps.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use super::PipelineEngine;
use crate::clipflow_core::domain::{
    NewStepResult, PAUSE_REASON_MODERATION, STEP_INDEX_CONTROL, StepStatus,
};

/// Result of the inter-step control check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    Paused,
    Canceled,
}

impl PipelineEngine {
    /// Observe pause/cancel requests between steps. Cancel wins over pause
    /// when both are set. Transitions the task and writes the CONTROL
    /// sentinel row before reporting.
    pub(crate) async fn check_control_flags(&self, task_id: i64) -> Result<ControlFlow> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .with_context(|| format!("task {task_id} vanished during control check"))?;
        let now = Utc::now();

        if task.cancel_requested_at.is_some() {
            let reason = task.cancel_reason.as_deref().unwrap_or("no reason");
            self.store.set_task_canceled(task_id).await?;
            self.store
                .insert_step_result(NewStepResult {
                    task_id,
                    step_index: STEP_INDEX_CONTROL,
                    tool_id: "CONTROL".into(),
                    step_name: "Canceled by user".into(),
                    status: StepStatus::Canceled,
                    started_at: now,
                    completed_at: Some(now),
                    input: None,
                    output: None,
                    error_message: Some(format!("Canceled by user: {reason}")),
                })
                .await?;
            info!(task_id, reason, "task canceled");
            return Ok(ControlFlow::Canceled);
        }

        if task.pause_requested_at.is_some() {
            let reason = task.pause_reason.as_deref().unwrap_or("no reason");
            self.store.set_task_paused(task_id, None).await?;
            self.store
                .insert_step_result(NewStepResult {
                    task_id,
                    step_index: STEP_INDEX_CONTROL,
                    tool_id: "CONTROL".into(),
                    step_name: "Paused by user".into(),
                    status: StepStatus::Paused,
                    started_at: now,
                    completed_at: Some(now),
                    input: None,
                    output: None,
                    error_message: Some(format!("Paused by user: {reason}")),
                })
                .await?;
            info!(task_id, reason, "task paused");
            return Ok(ControlFlow::Paused);
        }

        Ok(ControlFlow::Continue)
    }

    /// Pause the task before the moderation-gated step and record why.
    pub(crate) async fn pause_for_moderation(&self, task_id: i64, step_index: i32) -> Result<()> {
        let now = Utc::now();
        self.store
            .set_task_paused(task_id, Some(PAUSE_REASON_MODERATION))
            .await?;
        self.store
            .insert_step_result(NewStepResult {
                task_id,
                step_index: STEP_INDEX_CONTROL,
                tool_id: "CONTROL".into(),
                step_name: "Awaiting moderation".into(),
                status: StepStatus::Paused,
                started_at: now,
                completed_at: Some(now),
                input: None,
                output: None,
                error_message: Some(format!(
                    "step {step_index} requires moderation approval"
                )),
            })
            .await?;
        info!(task_id, step_index, "task paused awaiting moderation");
        Ok(())
    }

    /// Idempotent pause request; observed at the next inter-step check.
    pub async fn request_pause(&self, task_id: i64, reason: &str) -> Result<bool> {
        let accepted = self.store.request_pause(task_id, reason).await?;
        if accepted {
            info!(task_id, reason, "pause requested");
        }
        Ok(accepted)
    }

    /// Idempotent cancel request. Long-running steps are not aborted
    /// mid-call; the cancel takes effect at the next inter-step checkpoint.
    pub async fn request_cancel(&self, task_id: i64, reason: &str) -> Result<bool> {
        let accepted = self.store.request_cancel(task_id, reason).await?;
        if accepted {
            info!(task_id, reason, "cancel requested");
        }
        Ok(accepted)
    }

    /// Re-enqueue a paused or errored task with its original priority.
    pub async fn resume(&self, task_id: i64) -> Result<bool> {
        let resumed = self.store.resume_task(task_id).await?;
        if resumed {
            info!(task_id, "task resumed");
        }
        Ok(resumed)
    }

    /// Approve moderation up to and including `through_step`; if the task is
    /// currently parked on the moderation gate it goes straight back to the
    /// queue.
    pub async fn approve_moderation(&self, task_id: i64, through_step: i32) -> Result<bool> {
        let approved = self.store.approve_moderation(task_id, through_step).await?;
        if !approved {
            return Ok(false);
        }
        info!(task_id, through_step, "moderation approved");
        if let Some(task) = self.store.get_task(task_id).await? {
            if task.awaiting_moderation() {
                self.store.resume_task(task_id).await?;
                info!(task_id, "moderation pause lifted");
            }
        }
        Ok(true)
    }
}
