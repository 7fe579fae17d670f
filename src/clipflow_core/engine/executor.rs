//! Step-wise pipeline executor: advances one task from its first pending
//! step to a terminal status. Control flags are observed between steps,
//! every step's input/output is persisted, and semaphore leases are
//! released on all paths.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::PipelineEngine;
use super::control::ControlFlow;
use crate::clipflow_core::domain::{
    ArtifactMap, ArtifactValue, NewStepResult, PresetStep, PublishTask, STEP_INDEX_TERMINAL,
    StepStatus, artifact_kind, truncate_error_message,
};
use crate::clipflow_core::error::{SemaphoreError, ToolError};
use crate::clipflow_core::registry::{ToolInvocation, ToolRegistry};
use crate::clipflow_core::store::CommitStepError;

/// Terminal outcome of one executor attempt, returned to the dispatcher
/// instead of unwinding through the call tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Published,
    Paused,
    AwaitingModeration,
    Canceled,
    /// The soft attempt limit expired at a step boundary; re-enqueue
    /// without consuming a retry.
    SoftDeadline,
    Failed {
        transient: bool,
        message: String,
    },
    /// Another worker committed this step first (lease fence). This worker
    /// aborts and leaves the task to the owner.
    Aborted,
}

impl PipelineEngine {
    /// Run the task from its first pending step. Uses one store handle, no
    /// transaction held across tool invocations or semaphore waits.
    pub async fn execute_task(&self, task_id: i64) -> Result<ExecOutcome> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;
        let preset = self
            .store
            .get_preset(task.preset_id)
            .await?
            .with_context(|| format!("preset {} not found", task.preset_id))?;
        let steps: Vec<PresetStep> = preset.ordered_steps().into_iter().cloned().collect();

        // Resume point: the smallest step index with no ok result yet.
        let ok_indexes = self.store.ok_step_indexes(task_id).await?;
        let first_pending = (0..steps.len() as i32)
            .find(|i| !ok_indexes.contains(i))
            .unwrap_or(steps.len() as i32) as usize;

        let attempt_started = Instant::now();
        let attempt = task.attempt;

        for index in first_pending..steps.len() {
            match self.check_control_flags(task_id).await? {
                ControlFlow::Continue => {}
                ControlFlow::Paused => return Ok(ExecOutcome::Paused),
                ControlFlow::Canceled => return Ok(ExecOutcome::Canceled),
            }

            if attempt_started.elapsed() >= self.settings.soft_attempt_limit() {
                info!(task_id, index, "soft attempt limit reached, checkpointing");
                return Ok(ExecOutcome::SoftDeadline);
            }

            // Reload: control checks and prior steps may have touched the row.
            let task = self
                .store
                .get_task(task_id)
                .await?
                .with_context(|| format!("task {task_id} vanished mid-run"))?;
            let step = &steps[index];

            if step.requires_moderation && task.moderation_approved_through < index as i32 {
                self.pause_for_moderation(task_id, index as i32).await?;
                return Ok(ExecOutcome::AwaitingModeration);
            }

            match self.run_step(&task, step, index, attempt).await? {
                StepRun::Ok => {}
                StepRun::Outcome(outcome) => return Ok(outcome),
            }
        }

        self.finish_published(task_id).await
    }

    /// All preset steps are ok; the terminal artifacts decide the status.
    async fn finish_published(&self, task_id: i64) -> Result<ExecOutcome> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .with_context(|| format!("task {task_id} vanished at completion"))?;

        let url = artifact_string(&task.artifacts, artifact_kind::PUBLISHED_URL);
        let external_id = artifact_string(&task.artifacts, artifact_kind::PUBLISHED_EXTERNAL_ID);
        let (Some(url), Some(external_id)) = (url, external_id) else {
            let message = "preset completed without publish outputs".to_string();
            self.store.set_task_error(task_id, &message).await?;
            return Ok(ExecOutcome::Failed {
                transient: false,
                message,
            });
        };

        self.store
            .set_task_published(task_id, &url, &external_id)
            .await?;

        // The terminal marker is an ok row, so it goes through the same
        // fence-respecting commit as ordinary steps. A fence hit means a
        // prior attempt already recorded completion; replaying a fully-ok
        // task is a no-op, not an error.
        let now = Utc::now();
        let commit = self
            .store
            .commit_step(
                task_id,
                &serde_json::to_value(&task.artifacts)?,
                &task.dag_debug,
                NewStepResult {
                    task_id,
                    step_index: STEP_INDEX_TERMINAL,
                    tool_id: "WORKER".into(),
                    step_name: "Pipeline completed".into(),
                    status: StepStatus::Ok,
                    started_at: now,
                    completed_at: Some(now),
                    input: None,
                    output: Some(
                        json!({"published_url": &url, "published_external_id": &external_id}),
                    ),
                    error_message: None,
                },
            )
            .await;
        match commit {
            Ok(()) => {}
            Err(CommitStepError::Fence) => {
                info!(task_id, "terminal marker already recorded, replay is a no-op");
            }
            Err(CommitStepError::Other(e)) => return Err(e),
        }
        info!(task_id, url = %url, "task published");
        Ok(ExecOutcome::Published)
    }

    async fn run_step(
        &self,
        task: &PublishTask,
        step: &PresetStep,
        index: usize,
        attempt: i32,
    ) -> Result<StepRun> {
        let task_id = task.id;
        let Some(entry) = self.registry.get(&step.tool_id) else {
            let message = format!("unknown tool '{}' at step {index}", step.tool_id);
            self.fail_step_permanent(task, index, &step.tool_id, &message, None)
                .await?;
            return Ok(StepRun::Outcome(ExecOutcome::Failed {
                transient: false,
                message,
            }));
        };
        let spec = entry.spec.clone();

        let params = ToolRegistry::merged_params(&spec, &step.params);
        let inputs = match ToolRegistry::input_projection(&spec, &task.artifacts) {
            Ok(projection) => projection,
            Err(e) => {
                let message = e.to_string();
                self.fail_step_permanent(task, index, spec.tool_id, &message, None)
                    .await?;
                return Ok(StepRun::Outcome(ExecOutcome::Failed {
                    transient: false,
                    message,
                }));
            }
        };

        // Prior values of the declared outputs, preserved in the input
        // snapshot before last-writer-wins overwrites them.
        let prior_outputs: ArtifactMap = spec
            .outputs
            .iter()
            .filter_map(|kind| {
                task.artifacts
                    .get(*kind)
                    .map(|v| ((*kind).to_string(), v.clone()))
            })
            .collect();
        let input_snapshot = json!({
            "inputs": inputs,
            "params": params,
            "priorOutputs": prior_outputs,
        });

        let started_at = Utc::now();
        let lease = match self.acquire_step_lease(&spec).await {
            Ok(lease) => lease,
            Err(e) => {
                // Semaphore starvation is not the step's fault: record a
                // retrying row and hand the retry decision to the dispatcher.
                let message = e.to_string();
                self.store
                    .insert_step_result(NewStepResult {
                        task_id,
                        step_index: index as i32,
                        tool_id: spec.tool_id.to_string(),
                        step_name: spec.name.to_string(),
                        status: StepStatus::Retrying,
                        started_at,
                        completed_at: Some(Utc::now()),
                        input: Some(input_snapshot.clone()),
                        output: None,
                        error_message: Some(truncate_error_message(&message)),
                    })
                    .await?;
                return Ok(StepRun::Outcome(ExecOutcome::Failed {
                    transient: true,
                    message,
                }));
            }
        };

        info!(task_id, index, tool = spec.tool_id, "running step");
        let invocation = ToolInvocation {
            task: task.clone(),
            inputs,
            params,
            preview: false,
        };
        let handler_result = AssertUnwindSafe(entry.handler.handle(&self.tool_ctx, invocation))
            .catch_unwind()
            .await;

        if let Some((name, token)) = lease {
            self.semaphore.release(name, &token).await;
        }

        let tool_error = match handler_result {
            Ok(Ok(outputs)) => {
                match ToolRegistry::validate_outputs(&spec, &outputs) {
                    Ok(()) => {
                        return self
                            .commit_ok_step(task, &spec, index, started_at, input_snapshot, outputs)
                            .await;
                    }
                    Err(e) => e,
                }
            }
            Ok(Err(e)) => e,
            Err(panic) => {
                // Unknown failure: transient on the first attempt, permanent
                // afterwards.
                let message = format!("handler panicked: {}", panic_message(&*panic));
                warn!(task_id, index, tool = spec.tool_id, message = %message, "step panicked");
                if attempt == 0 {
                    ToolError::transient(message)
                } else {
                    ToolError::permanent(message)
                }
            }
        };

        let message = tool_error.to_string();
        let transient = tool_error.is_transient();
        self.store
            .insert_step_result(NewStepResult {
                task_id,
                step_index: index as i32,
                tool_id: spec.tool_id.to_string(),
                step_name: spec.name.to_string(),
                status: StepStatus::Error,
                started_at,
                completed_at: Some(Utc::now()),
                input: Some(input_snapshot),
                output: None,
                error_message: Some(truncate_error_message(&message)),
            })
            .await?;

        if !transient {
            if spec.tool_id == "P01_PUBLISH" {
                self.store
                    .set_task_publish_error(task_id, &truncate_error_message(&message))
                    .await?;
            }
            self.store
                .set_task_error(task_id, &truncate_error_message(&message))
                .await?;
        }
        Ok(StepRun::Outcome(ExecOutcome::Failed { transient, message }))
    }

    async fn commit_ok_step(
        &self,
        task: &PublishTask,
        spec: &crate::clipflow_core::registry::ToolSpec,
        index: usize,
        started_at: chrono::DateTime<Utc>,
        input_snapshot: Value,
        outputs: ArtifactMap,
    ) -> Result<StepRun> {
        let completed_at = Utc::now();
        let output_snapshot = serde_json::to_value(&outputs)?;

        // Merge outputs, last-writer-wins; reload first so artifacts written
        // by the handler's own side channel are not clobbered.
        let mut merged = self
            .store
            .get_task(task.id)
            .await?
            .with_context(|| format!("task {} vanished before commit", task.id))?;
        for (kind, value) in outputs {
            merged.artifacts.insert(kind, value);
        }

        let mut dag_debug = merged.dag_debug.clone();
        record_step_debug(&mut dag_debug, index, spec.tool_id, started_at, completed_at);

        let commit = self
            .store
            .commit_step(
                task.id,
                &serde_json::to_value(&merged.artifacts)?,
                &dag_debug,
                NewStepResult {
                    task_id: task.id,
                    step_index: index as i32,
                    tool_id: spec.tool_id.to_string(),
                    step_name: spec.name.to_string(),
                    status: StepStatus::Ok,
                    started_at,
                    completed_at: Some(completed_at),
                    input: Some(input_snapshot),
                    output: Some(output_snapshot),
                    error_message: None,
                },
            )
            .await;

        match commit {
            Ok(()) => Ok(StepRun::Ok),
            Err(CommitStepError::Fence) => {
                warn!(
                    task_id = task.id,
                    index, "step fence hit: another worker owns this task, aborting"
                );
                Ok(StepRun::Outcome(ExecOutcome::Aborted))
            }
            Err(CommitStepError::Other(e)) => Err(e),
        }
    }

    async fn acquire_step_lease(
        &self,
        spec: &crate::clipflow_core::registry::ToolSpec,
    ) -> Result<Option<(&'static str, String)>, SemaphoreError> {
        let Some(name) = spec.resource_class.semaphore_name() else {
            return Ok(None);
        };
        let token = self
            .semaphore
            .acquire(
                name,
                self.settings.semaphore_limit(name),
                self.settings.semaphore_ttl(),
                self.settings.semaphore_wait_timeout(),
            )
            .await?;
        Ok(Some((name, token)))
    }

    async fn fail_step_permanent(
        &self,
        task: &PublishTask,
        index: usize,
        tool_id: &str,
        message: &str,
        input: Option<Value>,
    ) -> Result<()> {
        let now = Utc::now();
        self.store
            .insert_step_result(NewStepResult {
                task_id: task.id,
                step_index: index as i32,
                tool_id: tool_id.to_string(),
                step_name: tool_id.to_string(),
                status: StepStatus::Error,
                started_at: now,
                completed_at: Some(now),
                input,
                output: None,
                error_message: Some(truncate_error_message(message)),
            })
            .await?;
        self.store
            .set_task_error(task.id, &truncate_error_message(message))
            .await?;
        Ok(())
    }

    /// Run one `supports_preview` step into the `preview/<kind>` side
    /// channel. The canonical artifact map and the step index stay put.
    pub async fn run_preview(&self, task_id: i64, step_index: usize) -> Result<ArtifactMap> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;
        let preset = self
            .store
            .get_preset(task.preset_id)
            .await?
            .with_context(|| format!("preset {} not found", task.preset_id))?;
        let steps = preset.ordered_steps();
        let step = steps
            .get(step_index)
            .with_context(|| format!("preset has no step {step_index}"))?;
        let entry = self
            .registry
            .get(&step.tool_id)
            .with_context(|| format!("unknown tool '{}'", step.tool_id))?;
        if !entry.spec.supports_preview {
            anyhow::bail!("tool '{}' does not support preview", step.tool_id);
        }

        let params = ToolRegistry::merged_params(&entry.spec, &step.params);
        let inputs = ToolRegistry::input_projection(&entry.spec, &task.artifacts)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let lease = self
            .acquire_step_lease(&entry.spec)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let result = entry
            .handler
            .handle(
                &self.tool_ctx,
                ToolInvocation {
                    task: task.clone(),
                    inputs,
                    params,
                    preview: true,
                },
            )
            .await;
        if let Some((name, token)) = lease {
            self.semaphore.release(name, &token).await;
        }
        let outputs = result.map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let mut merged = task.artifacts.clone();
        for (kind, value) in &outputs {
            merged.insert(
                format!("{}{kind}", artifact_kind::PREVIEW_PREFIX),
                value.clone(),
            );
        }
        self.store
            .save_task_artifacts(
                task_id,
                &serde_json::to_value(&merged)?,
                &task.dag_debug,
            )
            .await?;
        Ok(outputs)
    }
}

enum StepRun {
    Ok,
    Outcome(ExecOutcome),
}

fn artifact_string(artifacts: &ArtifactMap, kind: &str) -> Option<String> {
    match artifacts.get(kind)? {
        ArtifactValue::Text(s) if !s.is_empty() => Some(s.clone()),
        ArtifactValue::Scalar(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn record_step_debug(
    dag_debug: &mut Value,
    index: usize,
    tool_id: &str,
    started_at: chrono::DateTime<Utc>,
    completed_at: chrono::DateTime<Utc>,
) {
    if !dag_debug.is_object() {
        *dag_debug = Value::Object(serde_json::Map::new());
    }
    let map = dag_debug.as_object_mut().expect("dag_debug is an object");
    let steps = map
        .entry("steps")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Some(steps) = steps.as_object_mut() {
        steps.insert(
            index.to_string(),
            json!({
                "tool": tool_id,
                "startedAt": started_at.to_rfc3339(),
                "completedAt": completed_at.to_rfc3339(),
                "ms": (completed_at - started_at).num_milliseconds(),
            }),
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}
