//! Enqueue path: dedup and topic-repeat guards run here, before any task
//! row exists. Rejections never happen inside a running task.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::info;

use super::PipelineEngine;
use crate::clipflow_core::dedupe::compute_candidate_signature;
use crate::clipflow_core::domain::{CandidateStatus, Platform, PublishTask};
use crate::clipflow_core::error::EnqueueError;
use crate::clipflow_core::store::NewPublishTask;
use crate::clipflow_core::topic_guard::{RepeatPolicy, ensure_candidate_topic_meta};

impl PipelineEngine {
    /// Create a publish task for an approved candidate, enforcing the
    /// duplicate-content and topic-anti-repeat guards.
    pub async fn enqueue(
        &self,
        candidate_id: i64,
        preset_id: i64,
        target_platform: Platform,
        priority: i32,
    ) -> Result<PublishTask, EnqueueError> {
        let mut candidate = self
            .store
            .get_candidate(candidate_id)
            .await?
            .ok_or_else(|| EnqueueError::Store(anyhow::anyhow!("candidate {candidate_id} not found")))?;

        if candidate.status != CandidateStatus::Approved {
            return Err(EnqueueError::CandidateNotApproved {
                candidate_id,
                status: candidate.status.as_str().to_string(),
            });
        }

        // Content signature: keep one computed earlier in the pipeline
        // (a transcript-based one is stronger), otherwise derive it from
        // the candidate's own text now.
        let signature = match candidate.content_signature() {
            Some(existing) => existing.to_string(),
            None => {
                let (signature, source) = compute_candidate_signature(&candidate, None);
                candidate.set_meta("content_signature", Value::from(signature.clone()));
                candidate.set_meta("content_signature_source", Value::from(source.as_str()));
                signature
            }
        };

        if !signature.is_empty() {
            if let Some(duplicate) = self
                .store
                .find_duplicate_candidate(candidate.project_id, &signature, Some(candidate.id))
                .await?
            {
                return Err(EnqueueError::DuplicateContent {
                    duplicate_of: duplicate.id,
                    signature,
                });
            }
        }

        let (_tags, topic_signature) = ensure_candidate_topic_meta(&mut candidate);
        self.store
            .update_candidate_meta(candidate.id, candidate.meta.clone())
            .await?;

        if !topic_signature.is_empty() {
            let policy = match self.store.get_project(candidate.project_id).await? {
                Some(project) => RepeatPolicy::from_project_policy(&project.policy),
                None => RepeatPolicy::default(),
            };
            let since = Utc::now() - ChronoDuration::days(policy.days);
            let recent = self
                .store
                .recent_published_topic_signatures(
                    candidate.project_id,
                    target_platform,
                    policy.window,
                    since,
                )
                .await?;
            if recent.iter().any(|s| s == &topic_signature) {
                return Err(EnqueueError::TopicRepeat {
                    signature: topic_signature,
                });
            }
        }

        let task = self
            .store
            .create_task(NewPublishTask {
                project_id: candidate.project_id,
                candidate_id: candidate.id,
                preset_id,
                target_platform,
                priority,
            })
            .await?;
        info!(
            task_id = task.id,
            candidate_id,
            preset_id,
            platform = %target_platform,
            priority,
            "task enqueued"
        );
        Ok(task)
    }
}
