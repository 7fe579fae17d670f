//! Postgres-backed store. Claims use `FOR UPDATE SKIP LOCKED` over the
//! `(status, priority, created_at)` index; step commits are transactional
//! and rely on the partial unique index `uq_step_results_ok` as the
//! concurrent-worker fence.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::{CommitStepError, NewCandidate, NewPublishTask, Store};
use crate::clipflow_core::domain::{
    Candidate, CandidateStatus, ExportProfile, MetricsSnapshot, NewStepResult, Platform, Preset,
    Project, PublishTask, PublishedVideoMetric, StepResult, TaskFilter, TaskStatus,
};
use crate::clipflow_core::domain::PresetStep;

const OK_FENCE_INDEX: &str = "uq_step_results_ok";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .context("connecting to database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse::<T>().map_err(|e| anyhow!(e))
}

fn map_project(row: &PgRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        policy: row.try_get("policy")?,
        feed_settings: row.try_get("feed_settings")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_candidate(row: &PgRow) -> Result<Candidate> {
    Ok(Candidate {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        platform: parse(row.try_get::<&str, _>("platform")?)?,
        platform_video_id: row.try_get("platform_video_id")?,
        url: row.try_get("url")?,
        author: row.try_get("author")?,
        title: row.try_get("title")?,
        caption: row.try_get("caption")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        source_published_at: row.try_get("source_published_at")?,
        views: row.try_get("views")?,
        likes: row.try_get("likes")?,
        comments: row.try_get("comments")?,
        shares: row.try_get("shares")?,
        subscribers: row.try_get("subscribers")?,
        virality_score: row.try_get("virality_score")?,
        virality_factors: row.try_get("virality_factors")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        manual_rating: row.try_get("manual_rating")?,
        notes: row.try_get("notes")?,
        reviewed_at: row.try_get("reviewed_at")?,
        linked_publish_task_id: row.try_get("linked_publish_task_id")?,
        meta: row.try_get("meta")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_preset(row: &PgRow) -> Result<Preset> {
    let steps: Value = row.try_get("steps")?;
    Ok(Preset {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        steps: serde_json::from_value(steps).context("decoding preset steps")?,
    })
}

fn map_export_profile(row: &PgRow) -> Result<ExportProfile> {
    let safe_area: Option<Value> = row.try_get("safe_area")?;
    Ok(ExportProfile {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        target_platform: parse(row.try_get::<&str, _>("target_platform")?)?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        fps: row.try_get("fps")?,
        video_codec: row.try_get("video_codec")?,
        video_bitrate_kbps: row.try_get("video_bitrate_kbps")?,
        audio_codec: row.try_get("audio_codec")?,
        audio_bitrate_kbps: row.try_get("audio_bitrate_kbps")?,
        pix_fmt: row.try_get("pix_fmt")?,
        safe_area: safe_area
            .map(serde_json::from_value)
            .transpose()
            .context("decoding safe area")?,
        max_duration_sec: row.try_get("max_duration_sec")?,
        recommended_duration_sec: row.try_get("recommended_duration_sec")?,
        is_builtin: row.try_get("is_builtin")?,
    })
}

fn map_task(row: &PgRow) -> Result<PublishTask> {
    let artifacts: Value = row.try_get("artifacts")?;
    Ok(PublishTask {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        candidate_id: row.try_get("candidate_id")?,
        preset_id: row.try_get("preset_id")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        target_platform: parse(row.try_get::<&str, _>("target_platform")?)?,
        priority: row.try_get("priority")?,
        attempt: row.try_get("attempt")?,
        artifacts: serde_json::from_value(artifacts).context("decoding artifact map")?,
        dag_debug: row.try_get("dag_debug")?,
        error_message: row.try_get("error_message")?,
        publish_error: row.try_get("publish_error")?,
        pause_requested_at: row.try_get("pause_requested_at")?,
        pause_reason: row.try_get("pause_reason")?,
        cancel_requested_at: row.try_get("cancel_requested_at")?,
        cancel_reason: row.try_get("cancel_reason")?,
        paused_at: row.try_get("paused_at")?,
        canceled_at: row.try_get("canceled_at")?,
        lease_id: row.try_get("lease_id")?,
        processing_started_at: row.try_get("processing_started_at")?,
        processing_finished_at: row.try_get("processing_finished_at")?,
        retry_at: row.try_get("retry_at")?,
        moderation_approved_through: row.try_get("moderation_approved_through")?,
        published_url: row.try_get("published_url")?,
        published_external_id: row.try_get("published_external_id")?,
        published_at: row.try_get("published_at")?,
        last_views: row.try_get("last_views")?,
        last_likes: row.try_get("last_likes")?,
        last_comments: row.try_get("last_comments")?,
        last_shares: row.try_get("last_shares")?,
        last_metrics_at: row.try_get("last_metrics_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_step_result(row: &PgRow) -> Result<StepResult> {
    Ok(StepResult {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        step_index: row.try_get("step_index")?,
        tool_id: row.try_get("tool_id")?,
        step_name: row.try_get("step_name")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        error_message: row.try_get("error_message")?,
    })
}

fn map_metric(row: &PgRow) -> Result<PublishedVideoMetric> {
    Ok(PublishedVideoMetric {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        candidate_id: row.try_get("candidate_id")?,
        platform: parse(row.try_get::<&str, _>("platform")?)?,
        external_id: row.try_get("external_id")?,
        views: row.try_get("views")?,
        likes: row.try_get("likes")?,
        comments: row.try_get("comments")?,
        shares: row.try_get("shares")?,
        snapshot_at: row.try_get("snapshot_at")?,
        hours_since_publish: row.try_get("hours_since_publish")?,
        raw_data: row.try_get("raw_data")?,
    })
}

async fn insert_step_result_tx(
    tx: &mut Transaction<'_, Postgres>,
    step: &NewStepResult,
) -> Result<StepResult, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO step_results
             (task_id, step_index, tool_id, step_name, status, started_at,
              completed_at, input, output, error_message)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         RETURNING *",
    )
    .bind(step.task_id)
    .bind(step.step_index)
    .bind(&step.tool_id)
    .bind(&step.step_name)
    .bind(step.status.as_str())
    .bind(step.started_at)
    .bind(step.completed_at)
    .bind(&step.input)
    .bind(&step.output)
    .bind(&step.error_message)
    .fetch_one(&mut **tx)
    .await?;
    map_step_result(&row).map_err(|e| sqlx::Error::Decode(e.into()))
}

fn is_ok_fence_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.constraint() == Some(OK_FENCE_INDEX),
        _ => false,
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_project(
        &self,
        name: &str,
        policy: Value,
        feed_settings: Value,
    ) -> Result<Project> {
        let row = sqlx::query(
            "INSERT INTO projects (name, policy, feed_settings)
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(name)
        .bind(policy)
        .bind(feed_settings)
        .fetch_one(&self.pool)
        .await?;
        map_project(&row)
    }

    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_project).transpose()
    }

    async fn insert_candidate(&self, new: NewCandidate) -> Result<Candidate> {
        let row = sqlx::query(
            "INSERT INTO candidates
                 (project_id, platform, platform_video_id, url, title, caption, meta)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(new.project_id)
        .bind(new.platform.as_str())
        .bind(&new.platform_video_id)
        .bind(&new.url)
        .bind(&new.title)
        .bind(&new.caption)
        .bind(&new.meta)
        .fetch_one(&self.pool)
        .await
        .context("inserting candidate")?;
        map_candidate(&row)
    }

    async fn get_candidate(&self, id: i64) -> Result<Option<Candidate>> {
        let row = sqlx::query("SELECT * FROM candidates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_candidate).transpose()
    }

    async fn update_candidate_meta(&self, id: i64, meta: Value) -> Result<()> {
        let result = sqlx::query(
            "UPDATE candidates SET meta = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(meta)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("candidate {id} not found"));
        }
        Ok(())
    }

    async fn set_candidate_status(&self, id: i64, status: CandidateStatus) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status FROM candidates WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("candidate {id} not found"))?;
        let current: CandidateStatus = parse(row.try_get::<&str, _>("status")?)?;
        if !current.can_advance_to(status) {
            return Err(anyhow!(
                "candidate {id}: illegal status transition {} -> {}",
                current.as_str(),
                status.as_str()
            ));
        }
        sqlx::query("UPDATE candidates SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_duplicate_candidate(
        &self,
        project_id: i64,
        content_signature: &str,
        exclude_id: Option<i64>,
    ) -> Result<Option<Candidate>> {
        if content_signature.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(
            "SELECT * FROM candidates
             WHERE project_id = $1
               AND status IN ('APPROVED', 'USED')
               AND meta->>'content_signature' = $2
               AND ($3::bigint IS NULL OR id <> $3)
             LIMIT 1",
        )
        .bind(project_id)
        .bind(content_signature)
        .bind(exclude_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_candidate).transpose()
    }

    async fn create_preset(&self, name: &str, steps: Vec<PresetStep>) -> Result<Preset> {
        let row = sqlx::query(
            "INSERT INTO presets (name, steps) VALUES ($1, $2) RETURNING *",
        )
        .bind(name)
        .bind(serde_json::to_value(&steps)?)
        .fetch_one(&self.pool)
        .await?;
        map_preset(&row)
    }

    async fn get_preset(&self, id: i64) -> Result<Option<Preset>> {
        let row = sqlx::query("SELECT * FROM presets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_preset).transpose()
    }

    async fn get_export_profile(&self, platform: Platform) -> Result<Option<ExportProfile>> {
        let row = sqlx::query(
            "SELECT * FROM export_profiles WHERE target_platform = $1
             ORDER BY is_builtin DESC, id ASC LIMIT 1",
        )
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_export_profile).transpose()
    }

    async fn create_task(&self, new: NewPublishTask) -> Result<PublishTask> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO publish_tasks
                 (project_id, candidate_id, preset_id, target_platform, priority)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING *",
        )
        .bind(new.project_id)
        .bind(new.candidate_id)
        .bind(new.preset_id)
        .bind(new.target_platform.as_str())
        .bind(new.priority)
        .fetch_one(&mut *tx)
        .await
        .context("inserting publish task")?;
        let task = map_task(&row)?;
        sqlx::query(
            "UPDATE candidates SET linked_publish_task_id = $2, updated_at = now()
             WHERE id = $1",
        )
        .bind(new.candidate_id)
        .bind(task.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn get_task(&self, id: i64) -> Result<Option<PublishTask>> {
        let row = sqlx::query("SELECT * FROM publish_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_task).transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<PublishTask>> {
        let rows = sqlx::query(
            "SELECT * FROM publish_tasks
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::bigint IS NULL OR project_id = $2)
             ORDER BY created_at DESC, id DESC
             LIMIT $3",
        )
        .bind(filter.status.map(TaskStatus::as_str))
        .bind(filter.project_id)
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_task).collect()
    }

    async fn claim_next_task(&self, lease_id: Uuid) -> Result<Option<PublishTask>> {
        let row = sqlx::query(
            "WITH next AS (
                 SELECT id FROM publish_tasks
                 WHERE status = 'queued'
                   AND (retry_at IS NULL OR retry_at <= now())
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE publish_tasks t
             SET status = 'processing',
                 lease_id = $1,
                 processing_started_at = now(),
                 updated_at = now()
             FROM next
             WHERE t.id = next.id
             RETURNING t.*",
        )
        .bind(lease_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_task).transpose()
    }

    async fn requeue_task(
        &self,
        id: i64,
        attempt: i32,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE publish_tasks
             SET status = 'queued', lease_id = NULL, attempt = $2, retry_at = $3,
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(attempt)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_task_published(&self, id: i64, url: &str, external_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE publish_tasks
             SET status = 'published', published_url = $2, published_external_id = $3,
                 published_at = now(), processing_finished_at = now(),
                 lease_id = NULL, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(url)
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_task_error(&self, id: i64, error_message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE publish_tasks
             SET status = 'error',
                 error_message = COALESCE(error_message, $2),
                 processing_finished_at = now(), lease_id = NULL, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_task_publish_error(&self, id: i64, publish_error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE publish_tasks SET publish_error = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(publish_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_task_canceled(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE publish_tasks
             SET status = 'canceled', canceled_at = now(),
                 processing_finished_at = now(), lease_id = NULL, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_task_paused(&self, id: i64, reason: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE publish_tasks
             SET status = 'paused', paused_at = now(),
                 pause_reason = COALESCE($2, pause_reason),
                 lease_id = NULL, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_pause(&self, id: i64, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE publish_tasks
             SET pause_requested_at = COALESCE(pause_requested_at, now()),
                 pause_reason = COALESCE(pause_reason, $2),
                 updated_at = now()
             WHERE id = $1 AND status NOT IN ('published', 'canceled')",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn request_cancel(&self, id: i64, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE publish_tasks
             SET cancel_requested_at = COALESCE(cancel_requested_at, now()),
                 cancel_reason = COALESCE(cancel_reason, $2),
                 updated_at = now()
             WHERE id = $1 AND status NOT IN ('published', 'canceled')",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn resume_task(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE publish_tasks
             SET status = 'queued', pause_requested_at = NULL, pause_reason = NULL,
                 paused_at = NULL, retry_at = NULL, lease_id = NULL, updated_at = now()
             WHERE id = $1 AND status IN ('paused', 'error')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn approve_moderation(&self, id: i64, through_step: i32) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE publish_tasks
             SET moderation_approved_through = GREATEST(moderation_approved_through, $2),
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(through_step)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_task_artifacts(
        &self,
        id: i64,
        artifacts: &Value,
        dag_debug: &Value,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE publish_tasks SET artifacts = $2, dag_debug = $3, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(artifacts)
        .bind(dag_debug)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("task {id} not found"));
        }
        Ok(())
    }

    async fn commit_step(
        &self,
        task_id: i64,
        artifacts: &Value,
        dag_debug: &Value,
        step: NewStepResult,
    ) -> Result<(), CommitStepError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("opening step-commit transaction")?;

        sqlx::query(
            "UPDATE publish_tasks SET artifacts = $2, dag_debug = $3, updated_at = now()
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(artifacts)
        .bind(dag_debug)
        .execute(&mut *tx)
        .await
        .context("persisting artifact map")?;

        match insert_step_result_tx(&mut tx, &step).await {
            Ok(_) => {}
            Err(e) if is_ok_fence_violation(&e) => return Err(CommitStepError::Fence),
            Err(e) => return Err(CommitStepError::Other(e.into())),
        }

        tx.commit().await.context("committing step")?;
        Ok(())
    }

    async fn insert_step_result(&self, step: NewStepResult) -> Result<StepResult> {
        let mut tx = self.pool.begin().await?;
        let row = insert_step_result_tx(&mut tx, &step)
            .await
            .context("inserting step result")?;
        tx.commit().await?;
        Ok(row)
    }

    async fn step_results(&self, task_id: i64) -> Result<Vec<StepResult>> {
        let rows = sqlx::query(
            "SELECT * FROM step_results WHERE task_id = $1 ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_step_result).collect()
    }

    async fn last_step_result_at(&self, task_id: i64) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MAX(COALESCE(completed_at, started_at)) AS last_at
             FROM step_results WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("last_at")?)
    }

    async fn ok_step_indexes(&self, task_id: i64) -> Result<Vec<i32>> {
        let rows = sqlx::query(
            "SELECT DISTINCT step_index FROM step_results
             WHERE task_id = $1 AND status = 'ok' AND step_index < 9996
             ORDER BY step_index ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i32, _>("step_index").map_err(Into::into))
            .collect()
    }

    async fn record_metrics(
        &self,
        task_id: i64,
        snapshot: MetricsSnapshot,
    ) -> Result<PublishedVideoMetric> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO published_video_metrics
                 (task_id, candidate_id, platform, external_id,
                  views, likes, comments, shares, hours_since_publish, raw_data)
             SELECT t.id, t.candidate_id, t.target_platform, t.published_external_id,
                    $2, $3, $4, $5,
                    CASE WHEN t.published_at IS NOT NULL
                         THEN (EXTRACT(EPOCH FROM (now() - t.published_at)) / 3600)::int
                    END,
                    $6
             FROM publish_tasks t WHERE t.id = $1
             RETURNING *",
        )
        .bind(task_id)
        .bind(snapshot.views)
        .bind(snapshot.likes)
        .bind(snapshot.comments)
        .bind(snapshot.shares)
        .bind(&snapshot.raw_data)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| anyhow!("task {task_id} not found"))?;
        let metric = map_metric(&row)?;

        sqlx::query(
            "UPDATE publish_tasks
             SET last_views = $2, last_likes = $3, last_comments = $4, last_shares = $5,
                 last_metrics_at = now(), updated_at = now()
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(snapshot.views)
        .bind(snapshot.likes)
        .bind(snapshot.comments)
        .bind(snapshot.shares)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(metric)
    }

    async fn recent_published_topic_signatures(
        &self,
        project_id: i64,
        platform: Platform,
        window: usize,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT c.meta->>'topic_signature' AS signature
             FROM publish_tasks t
             JOIN candidates c ON c.id = t.candidate_id
             WHERE t.project_id = $1 AND t.target_platform = $2
               AND t.status = 'published' AND t.published_at >= $3
             ORDER BY t.published_at DESC
             LIMIT $4",
        )
        .bind(project_id)
        .bind(platform.as_str())
        .bind(since)
        .bind(window as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<Option<String>, _>("signature").ok().flatten())
            .filter(|s| !s.is_empty())
            .collect())
    }

    async fn processing_tasks_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PublishTask>> {
        let rows = sqlx::query(
            "SELECT * FROM publish_tasks
             WHERE status = 'processing' AND processing_started_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_task).collect()
    }

    async fn queued_tasks_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PublishTask>> {
        let rows = sqlx::query(
            "SELECT * FROM publish_tasks
             WHERE status = 'queued' AND lease_id IS NULL AND created_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_task).collect()
    }

    async fn task_status_counts(&self) -> Result<Vec<(TaskStatus, i64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM publish_tasks GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: TaskStatus = parse(row.try_get::<&str, _>("status")?)?;
                let count: i64 = row.try_get("count")?;
                Ok((status, count))
            })
            .collect()
    }

    async fn oldest_queued_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MIN(created_at) AS oldest FROM publish_tasks WHERE status = 'queued'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("oldest")?)
    }
}
