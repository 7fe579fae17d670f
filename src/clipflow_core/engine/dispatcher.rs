//! Dispatcher policy: map executor outcomes onto retries, terminal
//! statuses and alerts. At-least-once delivery with exponential backoff;
//! crash recovery rides on the queue, not on in-process loops.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use super::PipelineEngine;
use super::executor::ExecOutcome;
use crate::clipflow_core::domain::{
    NewStepResult, PublishTask, STEP_INDEX_RETRY_FENCE, STEP_INDEX_WORKER, StepStatus,
    truncate_error_message,
};

/// Retries per task beyond the first attempt.
pub const MAX_RETRIES: i32 = 3;
const RETRY_BACKOFF_BASE_SECS: i64 = 60;
const RETRY_BACKOFF_MULTIPLIER: i64 = 4;

/// Backoff before retry `attempt` (1-based): 1 min, 4 min, 16 min.
pub fn retry_backoff(attempt: i32) -> ChronoDuration {
    let exponent = (attempt - 1).clamp(0, 8) as u32;
    ChronoDuration::seconds(RETRY_BACKOFF_BASE_SECS * RETRY_BACKOFF_MULTIPLIER.pow(exponent))
}

impl PipelineEngine {
    /// Run a claimed task under the hard wall-clock limit and settle its
    /// terminal state for this attempt.
    pub async fn run_claimed_task(&self, task: &PublishTask) -> Result<()> {
        let hard_limit = self.settings.hard_attempt_limit();
        let outcome = match tokio::time::timeout(hard_limit, self.execute_task(task.id)).await {
            Err(_) => {
                let message = format!(
                    "hard wall-clock limit exceeded ({}s)",
                    hard_limit.as_secs()
                );
                warn!(task_id = task.id, message = %message, "attempt timed out");
                return self.retry_or_fail(task, &message).await;
            }
            Ok(Err(infra)) => {
                let message = format!("worker error: {infra:#}");
                warn!(task_id = task.id, message = %message, "executor failed");
                return self.retry_or_fail(task, &message).await;
            }
            Ok(Ok(outcome)) => outcome,
        };

        match outcome {
            ExecOutcome::Published => {
                info!(task_id = task.id, "attempt finished: published");
            }
            ExecOutcome::Paused => info!(task_id = task.id, "attempt finished: paused"),
            ExecOutcome::AwaitingModeration => {
                info!(task_id = task.id, "attempt finished: awaiting moderation");
            }
            ExecOutcome::Canceled => info!(task_id = task.id, "attempt finished: canceled"),
            ExecOutcome::Aborted => {
                warn!(task_id = task.id, "attempt aborted on step fence");
            }
            ExecOutcome::SoftDeadline => {
                // Graceful checkpoint: back on the queue without consuming a
                // retry; the next attempt resumes from the last ok step.
                self.store.requeue_task(task.id, task.attempt, None).await?;
                info!(task_id = task.id, "attempt checkpointed at soft limit");
            }
            ExecOutcome::Failed { transient: true, message } => {
                self.retry_or_fail(task, &message).await?;
            }
            ExecOutcome::Failed { transient: false, message } => {
                self.notifier.error(
                    &format!("Task {} failed permanently", task.id),
                    Some(&message),
                );
            }
        }
        Ok(())
    }

    /// Transient failure: re-enqueue with backoff while retries remain,
    /// otherwise write the WORKER sentinel, mark the task errored and alert.
    async fn retry_or_fail(&self, task: &PublishTask, message: &str) -> Result<()> {
        let now = Utc::now();
        if task.attempt < MAX_RETRIES {
            let next_attempt = task.attempt + 1;
            let retry_at = now + retry_backoff(next_attempt);
            self.store
                .insert_step_result(NewStepResult {
                    task_id: task.id,
                    step_index: STEP_INDEX_RETRY_FENCE,
                    tool_id: "WORKER".into(),
                    step_name: format!("Retry scheduled (attempt {next_attempt})"),
                    status: StepStatus::Retrying,
                    started_at: now,
                    completed_at: Some(now),
                    input: None,
                    output: None,
                    error_message: Some(truncate_error_message(message)),
                })
                .await?;
            self.store
                .requeue_task(task.id, next_attempt, Some(retry_at))
                .await?;
            info!(
                task_id = task.id,
                next_attempt,
                retry_at = %retry_at,
                "transient failure, re-enqueued"
            );
        } else {
            self.store
                .insert_step_result(NewStepResult {
                    task_id: task.id,
                    step_index: STEP_INDEX_WORKER,
                    tool_id: "WORKER".into(),
                    step_name: "Worker retries exhausted".into(),
                    status: StepStatus::Error,
                    started_at: now,
                    completed_at: Some(now),
                    input: None,
                    output: None,
                    error_message: Some(truncate_error_message(message)),
                })
                .await?;
            self.store
                .set_task_error(task.id, &truncate_error_message(message))
                .await?;
            self.notifier.error(
                &format!("Task {} failed after {} retries", task.id, MAX_RETRIES),
                Some(message),
            );
            warn!(task_id = task.id, "retries exhausted, task errored");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(retry_backoff(1).num_seconds(), 60);
        assert_eq!(retry_backoff(2).num_seconds(), 240);
        assert_eq!(retry_backoff(3).num_seconds(), 960);
    }

    #[test]
    fn backoff_exponent_is_clamped() {
        // Degenerate attempt numbers must not overflow.
        assert!(retry_backoff(0).num_seconds() >= 60);
        assert!(retry_backoff(100).num_seconds() > 0);
    }
}
