//! T01_INGEST — fetch the candidate's source video onto the object store.
//! The real downloader is an external collaborator; this stand-in
//! synthesizes deterministic bytes from the candidate identity so the rest
//! of the pipeline has a concrete blob to move around.

use async_trait::async_trait;

use super::load_candidate;
use crate::clipflow_core::domain::{ArtifactMap, ArtifactValue, artifact_kind};
use crate::clipflow_core::error::ToolError;
use crate::clipflow_core::registry::{
    ResourceClass, ToolContext, ToolHandler, ToolInvocation, ToolSpec,
};

pub fn spec() -> ToolSpec {
    ToolSpec {
        tool_id: "T01_INGEST",
        name: "Ingest source video",
        resource_class: ResourceClass::None,
        inputs: &[],
        outputs: &[artifact_kind::SOURCE_VIDEO],
        default_params: serde_json::json!({}),
        param_schema: serde_json::json!({
            "type": "object",
            "properties": {}
        }),
        supports_preview: false,
        supports_retry: true,
        supports_manual_edit: false,
    }
}

pub struct Ingest;

#[async_trait]
impl ToolHandler for Ingest {
    async fn handle(
        &self,
        ctx: &ToolContext,
        invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        let candidate = load_candidate(ctx, invocation.task.candidate_id).await?;
        let source = candidate
            .url
            .as_deref()
            .unwrap_or(&candidate.platform_video_id);

        let payload = format!(
            "media:{}:{}:{}",
            candidate.platform, candidate.platform_video_id, source
        );
        let descriptor = ctx
            .objects
            .put(payload.as_bytes(), "video/mp4")
            .await
            .map_err(|e| ToolError::transient(format!("storing source video: {e:#}")))?;

        let mut outputs = ArtifactMap::new();
        outputs.insert(
            artifact_kind::SOURCE_VIDEO.to_string(),
            ArtifactValue::Blob(descriptor),
        );
        Ok(outputs)
    }
}
