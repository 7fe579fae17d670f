//! Watchdog: periodic scan for tasks stuck beyond their bounded-time
//! contracts, plus the health overview backing `get_health`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use super::PipelineEngine;
use super::dispatcher::MAX_RETRIES;
use crate::clipflow_core::domain::{
    NewStepResult, STEP_INDEX_WORKER, StepStatus, truncate_error_message,
};

/// Extra slack, in minutes, on top of the hard attempt limit before a
/// processing task counts as stuck.
const STUCK_GRACE_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogAction {
    Requeued,
    Errored,
    QueueSlaWarned,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogFinding {
    pub task_id: i64,
    pub action: WatchdogAction,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogReport {
    pub dry_run: bool,
    pub scanned_processing: usize,
    pub scanned_queued: usize,
    pub findings: Vec<WatchdogFinding>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status_counts: BTreeMap<String, i64>,
    pub oldest_queued_age_secs: Option<i64>,
    pub stuck_processing: usize,
}

impl PipelineEngine {
    /// One watchdog sweep. Idempotent; with `dry_run` the report carries
    /// the would-be actions and nothing is mutated.
    pub async fn run_watchdog(&self, dry_run: bool) -> Result<WatchdogReport> {
        let now = Utc::now();
        let hard = ChronoDuration::seconds(self.settings.hard_attempt_limit_secs as i64);
        let stale_step = ChronoDuration::seconds(self.settings.stale_step_threshold_secs as i64);
        let queue_sla = ChronoDuration::seconds(self.settings.queue_sla_secs as i64);

        let mut findings = Vec::new();

        let processing = self
            .store
            .processing_tasks_started_before(now - (hard + ChronoDuration::minutes(STUCK_GRACE_MINUTES)))
            .await?;
        let scanned_processing = processing.len();
        for task in processing {
            let last_progress = self
                .store
                .last_step_result_at(task.id)
                .await?
                .or(task.processing_started_at)
                .unwrap_or(task.created_at);
            if now - last_progress < stale_step {
                continue;
            }

            let detail = format!(
                "processing since {}, no step result for {}m",
                task.processing_started_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".into()),
                (now - last_progress).num_minutes()
            );
            let action = if task.attempt < MAX_RETRIES {
                WatchdogAction::Requeued
            } else {
                WatchdogAction::Errored
            };
            warn!(task_id = task.id, ?action, detail = %detail, "stuck task detected");

            if !dry_run {
                self.store
                    .insert_step_result(NewStepResult {
                        task_id: task.id,
                        step_index: STEP_INDEX_WORKER,
                        tool_id: "WORKER".into(),
                        step_name: "Stuck task reconciled".into(),
                        status: StepStatus::Error,
                        started_at: now,
                        completed_at: Some(now),
                        input: None,
                        output: None,
                        error_message: Some(truncate_error_message(&detail)),
                    })
                    .await?;
                match action {
                    WatchdogAction::Requeued => {
                        // The worker lease is stale; reclaim by putting the
                        // task back on the queue. The executor resumes from
                        // the last ok step.
                        self.store
                            .requeue_task(task.id, task.attempt + 1, None)
                            .await?;
                        self.notifier.warn(
                            &format!("Task {} reclaimed from stale worker", task.id),
                            Some(&detail),
                        );
                    }
                    WatchdogAction::Errored => {
                        self.store
                            .set_task_error(task.id, &truncate_error_message(&detail))
                            .await?;
                        self.notifier.error(
                            &format!("Task {} stuck and out of retries", task.id),
                            Some(&detail),
                        );
                    }
                    WatchdogAction::QueueSlaWarned => unreachable!(),
                }
            }
            findings.push(WatchdogFinding {
                task_id: task.id,
                action,
                detail,
            });
        }

        let stale_queued = self
            .store
            .queued_tasks_created_before(now - queue_sla)
            .await?;
        let scanned_queued = stale_queued.len();
        for task in stale_queued {
            let detail = format!(
                "queued since {} with no worker claim",
                task.created_at.to_rfc3339()
            );
            if !dry_run {
                self.notifier
                    .warn(&format!("Task {} exceeds queue SLA", task.id), Some(&detail));
            }
            findings.push(WatchdogFinding {
                task_id: task.id,
                action: WatchdogAction::QueueSlaWarned,
                detail,
            });
        }

        info!(
            dry_run,
            scanned_processing,
            scanned_queued,
            findings = findings.len(),
            "watchdog sweep complete"
        );
        Ok(WatchdogReport {
            dry_run,
            scanned_processing,
            scanned_queued,
            findings,
        })
    }

    /// Periodic watchdog driver; one sweep per interval until shutdown.
    pub async fn run_watchdog_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.settings.watchdog_interval_secs);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_watchdog(false).await {
                warn!(error = %format!("{e:#}"), "watchdog sweep failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Status counts, queue age and stuck totals for the admin surface.
    pub async fn get_health(&self) -> Result<HealthReport> {
        let now = Utc::now();
        let counts = self.store.task_status_counts().await?;
        let status_counts: BTreeMap<String, i64> = counts
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();
        let oldest_queued_age_secs = self
            .store
            .oldest_queued_created_at()
            .await?
            .map(|at| (now - at).num_seconds());
        let stuck = self.run_watchdog(true).await?;
        Ok(HealthReport {
            status_counts,
            oldest_queued_age_secs,
            stuck_processing: stuck
                .findings
                .iter()
                .filter(|f| f.action != WatchdogAction::QueueSlaWarned)
                .count(),
        })
    }
}
