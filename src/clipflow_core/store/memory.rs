//! In-memory store with the same observable semantics as the Postgres
//! backend. Backs hermetic tests and single-process trial runs.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{CommitStepError, NewCandidate, NewPublishTask, Store};
use crate::clipflow_core::domain::{
    ArtifactMap, Candidate, CandidateStatus, ExportProfile, MetricsSnapshot, NewStepResult,
    Platform, Preset, PresetStep, Project, PublishTask, PublishedVideoMetric, StepResult,
    TaskFilter, TaskStatus, is_sentinel_step_index,
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    projects: HashMap<i64, Project>,
    candidates: HashMap<i64, Candidate>,
    presets: HashMap<i64, Preset>,
    export_profiles: Vec<ExportProfile>,
    tasks: HashMap<i64, PublishTask>,
    step_results: Vec<StepResult>,
    metrics: Vec<PublishedVideoMetric>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an export profile (the Postgres backend ships these as data).
    pub fn add_export_profile(&self, profile: ExportProfile) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.export_profiles.push(profile);
    }

    /// Test support: backdate a processing task so watchdog cutoffs apply.
    pub fn backdate_processing_for_tests(&self, id: i64, started_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.processing_started_at = Some(started_at);
        }
    }

    /// Test support: backdate a published task out of an anti-repeat window.
    pub fn backdate_published_for_tests(&self, id: i64, published_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.published_at = Some(published_at);
        }
    }
}

fn lock(store: &MemoryStore) -> std::sync::MutexGuard<'_, Inner> {
    store.inner.lock().expect("memory store poisoned")
}

/// Mirror of the Postgres partial unique index `uq_step_results_ok`: at
/// most one ok row per `(task_id, step_index)`, sentinel indexes included.
fn violates_ok_fence(inner: &Inner, step: &NewStepResult) -> bool {
    use crate::clipflow_core::domain::StepStatus;

    step.status == StepStatus::Ok
        && inner.step_results.iter().any(|r| {
            r.task_id == step.task_id
                && r.step_index == step.step_index
                && r.status == StepStatus::Ok
        })
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_project(
        &self,
        name: &str,
        policy: Value,
        feed_settings: Value,
    ) -> Result<Project> {
        let mut inner = lock(self);
        let id = inner.next_id();
        let project = Project {
            id,
            name: name.to_string(),
            policy,
            feed_settings,
            created_at: Utc::now(),
        };
        inner.projects.insert(id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        Ok(lock(self).projects.get(&id).cloned())
    }

    async fn insert_candidate(&self, new: NewCandidate) -> Result<Candidate> {
        let mut inner = lock(self);
        let duplicate = inner.candidates.values().any(|c| {
            c.project_id == new.project_id
                && c.platform == new.platform
                && c.platform_video_id == new.platform_video_id
        });
        if duplicate {
            bail!(
                "candidate already exists for ({}, {}, {})",
                new.project_id,
                new.platform,
                new.platform_video_id
            );
        }
        let id = inner.next_id();
        let now = Utc::now();
        let candidate = Candidate {
            id,
            project_id: new.project_id,
            platform: new.platform,
            platform_video_id: new.platform_video_id,
            url: new.url,
            author: None,
            title: new.title,
            caption: new.caption,
            thumbnail_url: None,
            source_published_at: None,
            views: None,
            likes: None,
            comments: None,
            shares: None,
            subscribers: None,
            virality_score: None,
            virality_factors: None,
            status: CandidateStatus::New,
            manual_rating: None,
            notes: None,
            reviewed_at: None,
            linked_publish_task_id: None,
            meta: new.meta,
            created_at: now,
            updated_at: now,
        };
        inner.candidates.insert(id, candidate.clone());
        Ok(candidate)
    }

    async fn get_candidate(&self, id: i64) -> Result<Option<Candidate>> {
        Ok(lock(self).candidates.get(&id).cloned())
    }

    async fn update_candidate_meta(&self, id: i64, meta: Value) -> Result<()> {
        let mut inner = lock(self);
        let candidate = inner
            .candidates
            .get_mut(&id)
            .ok_or_else(|| anyhow!("candidate {id} not found"))?;
        candidate.meta = meta;
        candidate.updated_at = Utc::now();
        Ok(())
    }

    async fn set_candidate_status(&self, id: i64, status: CandidateStatus) -> Result<()> {
        let mut inner = lock(self);
        let candidate = inner
            .candidates
            .get_mut(&id)
            .ok_or_else(|| anyhow!("candidate {id} not found"))?;
        if !candidate.status.can_advance_to(status) {
            bail!(
                "candidate {id}: illegal status transition {} -> {}",
                candidate.status.as_str(),
                status.as_str()
            );
        }
        candidate.status = status;
        candidate.updated_at = Utc::now();
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
        let inner = lock(self);
        Ok(inner
            .candidates
            .values()
            .filter(|c| c.project_id == project_id)
            .filter(|c| Some(c.id) != exclude_id)
            .filter(|c| {
                matches!(c.status, CandidateStatus::Approved | CandidateStatus::Used)
            })
            .find(|c| c.content_signature() == Some(content_signature))
            .cloned())
    }

    async fn create_preset(&self, name: &str, steps: Vec<PresetStep>) -> Result<Preset> {
        let mut inner = lock(self);
        let id = inner.next_id();
        let preset = Preset {
            id,
            name: name.to_string(),
            steps,
        };
        inner.presets.insert(id, preset.clone());
        Ok(preset)
    }

    async fn get_preset(&self, id: i64) -> Result<Option<Preset>> {
        Ok(lock(self).presets.get(&id).cloned())
    }

    async fn get_export_profile(&self, platform: Platform) -> Result<Option<ExportProfile>> {
        Ok(lock(self)
            .export_profiles
            .iter()
            .find(|p| p.target_platform == platform)
            .cloned())
    }

    async fn create_task(&self, new: NewPublishTask) -> Result<PublishTask> {
        let mut inner = lock(self);
        if !inner.candidates.contains_key(&new.candidate_id) {
            bail!("candidate {} not found", new.candidate_id);
        }
        if !inner.presets.contains_key(&new.preset_id) {
            bail!("preset {} not found", new.preset_id);
        }
        let id = inner.next_id();
        let now = Utc::now();
        let task = PublishTask {
            id,
            project_id: new.project_id,
            candidate_id: new.candidate_id,
            preset_id: new.preset_id,
            status: TaskStatus::Queued,
            target_platform: new.target_platform,
            priority: new.priority,
            attempt: 0,
            artifacts: ArtifactMap::new(),
            dag_debug: Value::Object(serde_json::Map::new()),
            error_message: None,
            publish_error: None,
            pause_requested_at: None,
            pause_reason: None,
            cancel_requested_at: None,
            cancel_reason: None,
            paused_at: None,
            canceled_at: None,
            lease_id: None,
            processing_started_at: None,
            processing_finished_at: None,
            retry_at: None,
            moderation_approved_through: -1,
            published_url: None,
            published_external_id: None,
            published_at: None,
            last_views: None,
            last_likes: None,
            last_comments: None,
            last_shares: None,
            last_metrics_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.tasks.insert(id, task.clone());
        if let Some(candidate) = inner.candidates.get_mut(&new.candidate_id) {
            candidate.linked_publish_task_id = Some(id);
        }
        Ok(task)
    }

    async fn get_task(&self, id: i64) -> Result<Option<PublishTask>> {
        Ok(lock(self).tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<PublishTask>> {
        let inner = lock(self);
        let mut tasks: Vec<PublishTask> = inner
            .tasks
            .values()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| filter.project_id.is_none_or(|p| t.project_id == p))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit.max(0) as usize);
        }
        Ok(tasks)
    }

    async fn claim_next_task(&self, lease_id: Uuid) -> Result<Option<PublishTask>> {
        let now = Utc::now();
        let mut inner = lock(self);
        let next_id = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && t.lease_id.is_none())
            .filter(|t| t.retry_at.is_none_or(|at| at <= now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|t| t.id);
        let Some(id) = next_id else {
            return Ok(None);
        };
        let task = inner.tasks.get_mut(&id).expect("claimed task vanished");
        task.status = TaskStatus::Processing;
        task.lease_id = Some(lease_id);
        task.processing_started_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn requeue_task(
        &self,
        id: i64,
        attempt: i32,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = lock(self);
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        task.status = TaskStatus::Queued;
        task.lease_id = None;
        task.attempt = attempt;
        task.retry_at = retry_at;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_task_published(&self, id: i64, url: &str, external_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut inner = lock(self);
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        task.status = TaskStatus::Published;
        task.published_url = Some(url.to_string());
        task.published_external_id = Some(external_id.to_string());
        task.published_at = Some(now);
        task.processing_finished_at = Some(now);
        task.lease_id = None;
        task.updated_at = now;
        Ok(())
    }

    async fn set_task_error(&self, id: i64, error_message: &str) -> Result<()> {
        let now = Utc::now();
        let mut inner = lock(self);
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        task.status = TaskStatus::Error;
        if task.error_message.is_none() {
            task.error_message = Some(error_message.to_string());
        }
        task.processing_finished_at = Some(now);
        task.lease_id = None;
        task.updated_at = now;
        Ok(())
    }

    async fn set_task_publish_error(&self, id: i64, publish_error: &str) -> Result<()> {
        let mut inner = lock(self);
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        task.publish_error = Some(publish_error.to_string());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_task_canceled(&self, id: i64) -> Result<()> {
        let now = Utc::now();
        let mut inner = lock(self);
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        task.status = TaskStatus::Canceled;
        task.canceled_at = Some(now);
        task.processing_finished_at = Some(now);
        task.lease_id = None;
        task.updated_at = now;
        Ok(())
    }

    async fn set_task_paused(&self, id: i64, reason: Option<&str>) -> Result<()> {
        let now = Utc::now();
        let mut inner = lock(self);
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        task.status = TaskStatus::Paused;
        task.paused_at = Some(now);
        if let Some(reason) = reason {
            task.pause_reason = Some(reason.to_string());
        }
        task.lease_id = None;
        task.updated_at = now;
        Ok(())
    }

    async fn request_pause(&self, id: i64, reason: &str) -> Result<bool> {
        let mut inner = lock(self);
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if matches!(task.status, TaskStatus::Published | TaskStatus::Canceled) {
            return Ok(false);
        }
        if task.pause_requested_at.is_none() {
            task.pause_requested_at = Some(Utc::now());
            task.pause_reason = Some(reason.to_string());
            task.updated_at = Utc::now();
        }
        Ok(true)
    }

    async fn request_cancel(&self, id: i64, reason: &str) -> Result<bool> {
        let mut inner = lock(self);
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if matches!(task.status, TaskStatus::Published | TaskStatus::Canceled) {
            return Ok(false);
        }
        if task.cancel_requested_at.is_none() {
            task.cancel_requested_at = Some(Utc::now());
            task.cancel_reason = Some(reason.to_string());
            task.updated_at = Utc::now();
        }
        Ok(true)
    }

    async fn resume_task(&self, id: i64) -> Result<bool> {
        let mut inner = lock(self);
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if !task.status.is_resumable() {
            return Ok(false);
        }
        task.status = TaskStatus::Queued;
        task.pause_requested_at = None;
        task.pause_reason = None;
        task.paused_at = None;
        task.retry_at = None;
        task.lease_id = None;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn approve_moderation(&self, id: i64, through_step: i32) -> Result<bool> {
        let mut inner = lock(self);
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        task.moderation_approved_through = task.moderation_approved_through.max(through_step);
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn save_task_artifacts(
        &self,
        id: i64,
        artifacts: &Value,
        dag_debug: &Value,
    ) -> Result<()> {
        let mut inner = lock(self);
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        task.artifacts = serde_json::from_value(artifacts.clone())?;
        task.dag_debug = dag_debug.clone();
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn commit_step(
        &self,
        task_id: i64,
        artifacts: &Value,
        dag_debug: &Value,
        step: NewStepResult,
    ) -> Result<(), CommitStepError> {
        let mut inner = lock(self);
        if violates_ok_fence(&inner, &step) {
            return Err(CommitStepError::Fence);
        }
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| CommitStepError::Other(anyhow!("task {task_id} not found")))?;
        task.artifacts = serde_json::from_value(artifacts.clone())
            .map_err(|e| CommitStepError::Other(e.into()))?;
        task.dag_debug = dag_debug.clone();
        task.updated_at = Utc::now();

        let id = inner.next_id();
        inner.step_results.push(StepResult {
            id,
            task_id: step.task_id,
            step_index: step.step_index,
            tool_id: step.tool_id,
            step_name: step.step_name,
            status: step.status,
            started_at: step.started_at,
            completed_at: step.completed_at,
            input: step.input,
            output: step.output,
            error_message: step.error_message,
        });
        Ok(())
    }

    async fn insert_step_result(&self, step: NewStepResult) -> Result<StepResult> {
        let mut inner = lock(self);
        if violates_ok_fence(&inner, &step) {
            bail!(
                "duplicate ok step result for task {} at index {}",
                step.task_id,
                step.step_index
            );
        }
        let id = inner.next_id();
        let row = StepResult {
            id,
            task_id: step.task_id,
            step_index: step.step_index,
            tool_id: step.tool_id,
            step_name: step.step_name,
            status: step.status,
            started_at: step.started_at,
            completed_at: step.completed_at,
            input: step.input,
            output: step.output,
            error_message: step.error_message,
        };
        inner.step_results.push(row.clone());
        Ok(row)
    }

    async fn step_results(&self, task_id: i64) -> Result<Vec<StepResult>> {
        let inner = lock(self);
        let mut rows: Vec<StepResult> = inner
            .step_results
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn last_step_result_at(&self, task_id: i64) -> Result<Option<DateTime<Utc>>> {
        let inner = lock(self);
        Ok(inner
            .step_results
            .iter()
            .filter(|r| r.task_id == task_id)
            .map(|r| r.completed_at.unwrap_or(r.started_at))
            .max())
    }

    async fn ok_step_indexes(&self, task_id: i64) -> Result<Vec<i32>> {
        use crate::clipflow_core::domain::StepStatus;

        let inner = lock(self);
        let mut indexes: Vec<i32> = inner
            .step_results
            .iter()
            .filter(|r| {
                r.task_id == task_id
                    && r.status == StepStatus::Ok
                    && !is_sentinel_step_index(r.step_index)
            })
            .map(|r| r.step_index)
            .collect();
        indexes.sort_unstable();
        indexes.dedup();
        Ok(indexes)
    }

    async fn record_metrics(
        &self,
        task_id: i64,
        snapshot: MetricsSnapshot,
    ) -> Result<PublishedVideoMetric> {
        let now = Utc::now();
        let mut inner = lock(self);
        let task = inner
            .tasks
            .get(&task_id)
            .ok_or_else(|| anyhow!("task {task_id} not found"))?
            .clone();
        let hours_since_publish = task
            .published_at
            .map(|at| ((now - at).num_seconds() / 3600) as i32);

        let id = inner.next_id();
        let metric = PublishedVideoMetric {
            id,
            task_id,
            candidate_id: Some(task.candidate_id),
            platform: task.target_platform,
            external_id: task.published_external_id.clone(),
            views: snapshot.views,
            likes: snapshot.likes,
            comments: snapshot.comments,
            shares: snapshot.shares,
            snapshot_at: now,
            hours_since_publish,
            raw_data: snapshot.raw_data,
        };
        inner.metrics.push(metric.clone());

        let task = inner.tasks.get_mut(&task_id).expect("task vanished");
        task.last_views = metric.views;
        task.last_likes = metric.likes;
        task.last_comments = metric.comments;
        task.last_shares = metric.shares;
        task.last_metrics_at = Some(now);
        task.updated_at = now;
        Ok(metric)
    }

    async fn recent_published_topic_signatures(
        &self,
        project_id: i64,
        platform: Platform,
        window: usize,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let inner = lock(self);
        let mut published: Vec<&PublishTask> = inner
            .tasks
            .values()
            .filter(|t| t.project_id == project_id && t.target_platform == platform)
            .filter(|t| t.status == TaskStatus::Published)
            .filter(|t| t.published_at.is_some_and(|at| at >= since))
            .collect();
        published.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        Ok(published
            .into_iter()
            .take(window)
            .filter_map(|t| inner.candidates.get(&t.candidate_id))
            .filter_map(|c| c.topic_signature().map(str::to_string))
            .collect())
    }

    async fn processing_tasks_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PublishTask>> {
        let inner = lock(self);
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .filter(|t| t.processing_started_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn queued_tasks_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PublishTask>> {
        let inner = lock(self);
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && t.lease_id.is_none())
            .filter(|t| t.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn task_status_counts(&self) -> Result<Vec<(TaskStatus, i64)>> {
        let inner = lock(self);
        let mut counts: HashMap<TaskStatus, i64> = HashMap::new();
        for task in inner.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        let mut counts: Vec<(TaskStatus, i64)> = counts.into_iter().collect();
        counts.sort_by_key(|(status, _)| status.as_str());
        Ok(counts)
    }

    async fn oldest_queued_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        let inner = lock(self);
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .map(|t| t.created_at)
            .min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipflow_core::domain::StepStatus;

    async fn seeded_task(store: &MemoryStore) -> PublishTask {
        let project = store
            .create_project("p", Value::Object(Default::default()), Value::Object(Default::default()))
            .await
            .unwrap();
        let candidate = store
            .insert_candidate(NewCandidate {
                project_id: project.id,
                platform: Platform::Tiktok,
                platform_video_id: "v1".into(),
                url: None,
                title: Some("t".into()),
                caption: None,
                meta: serde_json::json!({}),
            })
            .await
            .unwrap();
        let preset = store.create_preset("preset", vec![]).await.unwrap();
        store
            .create_task(NewPublishTask {
                project_id: project.id,
                candidate_id: candidate.id,
                preset_id: preset.id,
                target_platform: Platform::Tiktok,
                priority: 0,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_fifo() {
        let store = MemoryStore::new();
        let first = seeded_task(&store).await;
        let project_id = first.project_id;
        let preset_id = first.preset_id;

        let candidate2 = store
            .insert_candidate(NewCandidate {
                project_id,
                platform: Platform::Tiktok,
                platform_video_id: "v2".into(),
                url: None,
                title: Some("t2".into()),
                caption: None,
                meta: serde_json::json!({}),
            })
            .await
            .unwrap();
        let urgent = store
            .create_task(NewPublishTask {
                project_id,
                candidate_id: candidate2.id,
                preset_id,
                target_platform: Platform::Tiktok,
                priority: 10,
            })
            .await
            .unwrap();

        let worker = Uuid::new_v4();
        let claimed = store.claim_next_task(worker).await.unwrap().unwrap();
        assert_eq!(claimed.id, urgent.id);
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.lease_id, Some(worker));

        let second = store.claim_next_task(worker).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert!(store.claim_next_task(worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_at_gates_claims() {
        let store = MemoryStore::new();
        let task = seeded_task(&store).await;
        store
            .requeue_task(task.id, 1, Some(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert!(store.claim_next_task(Uuid::new_v4()).await.unwrap().is_none());

        store.requeue_task(task.id, 1, None).await.unwrap();
        assert!(store.claim_next_task(Uuid::new_v4()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ok_fence_rejects_double_commit() {
        let store = MemoryStore::new();
        let task = seeded_task(&store).await;
        let step = NewStepResult {
            task_id: task.id,
            step_index: 0,
            tool_id: "T01_INGEST".into(),
            step_name: "ingest".into(),
            status: StepStatus::Ok,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            input: None,
            output: None,
            error_message: None,
        };
        let artifacts = serde_json::json!({});
        let debug = serde_json::json!({});
        store
            .commit_step(task.id, &artifacts, &debug, step.clone())
            .await
            .unwrap();
        let second = store.commit_step(task.id, &artifacts, &debug, step).await;
        assert!(matches!(second, Err(CommitStepError::Fence)));
    }

    #[tokio::test]
    async fn error_rows_do_not_trip_the_fence() {
        let store = MemoryStore::new();
        let task = seeded_task(&store).await;
        let mut step = NewStepResult {
            task_id: task.id,
            step_index: 3,
            tool_id: "G01_SCRIPT".into(),
            step_name: "generate".into(),
            status: StepStatus::Error,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            input: None,
            output: None,
            error_message: Some("transient".into()),
        };
        let artifacts = serde_json::json!({});
        let debug = serde_json::json!({});
        store
            .commit_step(task.id, &artifacts, &debug, step.clone())
            .await
            .unwrap();
        step.status = StepStatus::Ok;
        step.error_message = None;
        store
            .commit_step(task.id, &artifacts, &debug, step)
            .await
            .unwrap();
        let rows = store.step_results(task.id).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn insert_step_result_enforces_ok_fence_like_the_schema() {
        use crate::clipflow_core::domain::STEP_INDEX_TERMINAL;

        let store = MemoryStore::new();
        let task = seeded_task(&store).await;
        let terminal = NewStepResult {
            task_id: task.id,
            step_index: STEP_INDEX_TERMINAL,
            tool_id: "WORKER".into(),
            step_name: "Pipeline completed".into(),
            status: StepStatus::Ok,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            input: None,
            output: None,
            error_message: None,
        };
        store.insert_step_result(terminal.clone()).await.unwrap();
        // The partial unique index applies to sentinel rows too.
        assert!(store.insert_step_result(terminal.clone()).await.is_err());

        // Non-ok rows at the same index stay unconstrained.
        let mut retrying = terminal;
        retrying.status = StepStatus::Retrying;
        store.insert_step_result(retrying.clone()).await.unwrap();
        store.insert_step_result(retrying).await.unwrap();
    }

    #[tokio::test]
    async fn candidate_status_transition_is_enforced() {
        let store = MemoryStore::new();
        let task = seeded_task(&store).await;
        store
            .set_candidate_status(task.candidate_id, CandidateStatus::Approved)
            .await
            .unwrap();
        store
            .set_candidate_status(task.candidate_id, CandidateStatus::Used)
            .await
            .unwrap();
        assert!(
            store
                .set_candidate_status(task.candidate_id, CandidateStatus::Approved)
                .await
                .is_err()
        );
    }
}
