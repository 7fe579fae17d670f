//! Durable store seam. The executor, dispatcher, control surface and
//! watchdog talk to this trait only; the Postgres implementation is the
//! production backend and the in-memory one mirrors its semantics (lease
//! behavior, step-index fence) for hermetic tests and single-process runs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::domain::{
    Candidate, CandidateStatus, ExportProfile, MetricsSnapshot, NewStepResult, Platform, Preset,
    PresetStep, Project, PublishTask, PublishedVideoMetric, StepResult, TaskFilter, TaskStatus,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Fields for a new candidate row; everything else starts NULL/NEW.
#[derive(Debug, Clone)]
pub struct NewCandidate {
    pub project_id: i64,
    pub platform: Platform,
    pub platform_video_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub caption: Option<String>,
    pub meta: Value,
}

#[derive(Debug, Clone)]
pub struct NewPublishTask {
    pub project_id: i64,
    pub candidate_id: i64,
    pub preset_id: i64,
    pub target_platform: Platform,
    pub priority: i32,
}

/// Outcome of the transactional step commit. The fence variant surfaces the
/// step-index uniqueness violation used to detect two workers running the
/// same task; the caller aborts instead of retrying.
#[derive(Debug, Error)]
pub enum CommitStepError {
    #[error("step-index fence: an ok result for this step already exists")]
    Fence,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- projects -----------------------------------------------------------

    async fn create_project(&self, name: &str, policy: Value, feed_settings: Value)
    -> Result<Project>;
    async fn get_project(&self, id: i64) -> Result<Option<Project>>;

    // -- candidates ---------------------------------------------------------

    async fn insert_candidate(&self, new: NewCandidate) -> Result<Candidate>;
    async fn get_candidate(&self, id: i64) -> Result<Option<Candidate>>;
    async fn update_candidate_meta(&self, id: i64, meta: Value) -> Result<()>;
    /// Enforces the monotonic NEW→APPROVED→USED / →REJECTED advance.
    async fn set_candidate_status(&self, id: i64, status: CandidateStatus) -> Result<()>;
    /// A candidate in the project with the same content signature that is
    /// already APPROVED or USED, excluding `exclude_id`.
    async fn find_duplicate_candidate(
        &self,
        project_id: i64,
        content_signature: &str,
        exclude_id: Option<i64>,
    ) -> Result<Option<Candidate>>;

    // -- presets & export profiles -----------------------------------------

    async fn create_preset(&self, name: &str, steps: Vec<PresetStep>) -> Result<Preset>;
    async fn get_preset(&self, id: i64) -> Result<Option<Preset>>;
    async fn get_export_profile(&self, platform: Platform) -> Result<Option<ExportProfile>>;

    // -- tasks --------------------------------------------------------------

    async fn create_task(&self, new: NewPublishTask) -> Result<PublishTask>;
    async fn get_task(&self, id: i64) -> Result<Option<PublishTask>>;
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<PublishTask>>;

    /// Atomically claim the next eligible queued task: highest priority
    /// first, FIFO within a priority, skipping rows another worker holds.
    /// Sets lease, status=processing and processing_started_at.
    async fn claim_next_task(&self, lease_id: Uuid) -> Result<Option<PublishTask>>;

    /// Put a task back on the queue (retry or graceful checkpoint): clears
    /// the lease, sets status=queued, stores the attempt counter and the
    /// earliest claimable instant.
    async fn requeue_task(
        &self,
        id: i64,
        attempt: i32,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn set_task_published(&self, id: i64, url: &str, external_id: &str) -> Result<()>;
    async fn set_task_error(&self, id: i64, error_message: &str) -> Result<()>;
    async fn set_task_publish_error(&self, id: i64, publish_error: &str) -> Result<()>;
    async fn set_task_canceled(&self, id: i64) -> Result<()>;
    async fn set_task_paused(&self, id: i64, reason: Option<&str>) -> Result<()>;

    // -- control flags ------------------------------------------------------

    /// Idempotent; false when the task does not exist or is already terminal
    /// beyond pausing (published/canceled).
    async fn request_pause(&self, id: i64, reason: &str) -> Result<bool>;
    async fn request_cancel(&self, id: i64, reason: &str) -> Result<bool>;
    /// paused/error → queued; clears pause bookkeeping and retry_at.
    async fn resume_task(&self, id: i64) -> Result<bool>;
    async fn approve_moderation(&self, id: i64, through_step: i32) -> Result<bool>;

    // -- artifacts & step results ------------------------------------------

    /// Persist the artifact map + diagnostics without writing a StepResult
    /// (preview side channel).
    async fn save_task_artifacts(&self, id: i64, artifacts: &Value, dag_debug: &Value)
    -> Result<()>;

    /// Transactionally merge the artifact map and append the step result.
    /// The partial uniqueness fence on `(task_id, step_index)` for `ok`
    /// rows maps to [`CommitStepError::Fence`].
    async fn commit_step(
        &self,
        task_id: i64,
        artifacts: &Value,
        dag_debug: &Value,
        step: NewStepResult,
    ) -> Result<(), CommitStepError>;

    /// Append a step result outside a step commit (sentinels, interim rows).
    async fn insert_step_result(&self, step: NewStepResult) -> Result<StepResult>;

    async fn step_results(&self, task_id: i64) -> Result<Vec<StepResult>>;
    /// Completion instants drive the watchdog's stale-step detection.
    async fn last_step_result_at(&self, task_id: i64) -> Result<Option<DateTime<Utc>>>;
    /// Indexes of non-sentinel `ok` rows; resume starts at the smallest
    /// index missing from this set.
    async fn ok_step_indexes(&self, task_id: i64) -> Result<Vec<i32>>;

    // -- published metrics --------------------------------------------------

    /// Append a metrics snapshot and refresh the task's denormalized
    /// last-* columns.
    async fn record_metrics(
        &self,
        task_id: i64,
        snapshot: MetricsSnapshot,
    ) -> Result<PublishedVideoMetric>;

    // -- topic guard & watchdog queries ------------------------------------

    /// Topic signatures of the most recent published tasks for a project +
    /// destination, newest first, bounded by count and age.
    async fn recent_published_topic_signatures(
        &self,
        project_id: i64,
        platform: Platform,
        window: usize,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    async fn processing_tasks_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PublishTask>>;
    async fn queued_tasks_created_before(&self, cutoff: DateTime<Utc>)
    -> Result<Vec<PublishTask>>;
    async fn task_status_counts(&self) -> Result<Vec<(TaskStatus, i64)>>;
    async fn oldest_queued_created_at(&self) -> Result<Option<DateTime<Utc>>>;
}
