//! P01_PUBLISH — upload the final video through the publisher adapter and
//! record the receipt. Advances the candidate to USED. Recommended as the
//! last preset step, after T18_QC.

use async_trait::async_trait;

use super::load_candidate;
use crate::clipflow_core::domain::{
    ArtifactMap, ArtifactValue, CandidateStatus, artifact_kind,
};
use crate::clipflow_core::error::ToolError;
use crate::clipflow_core::publisher::PublishRequest;
use crate::clipflow_core::registry::{
    ResourceClass, ToolContext, ToolHandler, ToolInvocation, ToolSpec,
};

pub fn spec() -> ToolSpec {
    ToolSpec {
        tool_id: "P01_PUBLISH",
        name: "Publish to platform",
        resource_class: ResourceClass::None,
        inputs: &[artifact_kind::BURNED_VIDEO],
        outputs: &[
            artifact_kind::PUBLISHED_URL,
            artifact_kind::PUBLISHED_EXTERNAL_ID,
        ],
        default_params: serde_json::json!({"auto_publish": true}),
        param_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "auto_publish": {"type": "boolean", "default": true}
            }
        }),
        supports_preview: false,
        supports_retry: true,
        supports_manual_edit: false,
    }
}

pub struct Publish;

#[async_trait]
impl ToolHandler for Publish {
    async fn handle(
        &self,
        ctx: &ToolContext,
        invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        let video = invocation
            .inputs
            .get(artifact_kind::BURNED_VIDEO)
            .and_then(ArtifactValue::as_blob)
            .cloned()
            .ok_or_else(|| ToolError::permanent("burned_video must be a blob artifact"))?;

        let candidate = load_candidate(ctx, invocation.task.candidate_id).await?;
        let receipt = ctx
            .publisher
            .publish(&PublishRequest {
                platform: invocation.task.target_platform,
                video,
                title: candidate.title.clone(),
                captions: candidate.caption.clone(),
            })
            .await?;

        // The candidate is consumed by a successful publish. Tolerate a
        // replayed step that already advanced it.
        if candidate.status == CandidateStatus::Approved {
            ctx.store
                .set_candidate_status(candidate.id, CandidateStatus::Used)
                .await
                .map_err(|e| ToolError::transient(format!("marking candidate used: {e:#}")))?;
        }

        let mut outputs = ArtifactMap::new();
        outputs.insert(
            artifact_kind::PUBLISHED_URL.to_string(),
            ArtifactValue::Text(receipt.url),
        );
        outputs.insert(
            artifact_kind::PUBLISHED_EXTERNAL_ID.to_string(),
            ArtifactValue::Text(receipt.external_id),
        );
        Ok(outputs)
    }
}
