//! E01_BURN — burn captions into the video and cut a thumbnail. Gated by
//! the `ffmpeg` resource class. The encoder itself is an external
//! collaborator; the stand-in concatenates deterministic bytes so the
//! output blob is stable for a given input pair.

use async_trait::async_trait;

use super::artifact_text;
use crate::clipflow_core::domain::{ArtifactMap, ArtifactValue, artifact_kind};
use crate::clipflow_core::error::ToolError;
use crate::clipflow_core::registry::{
    ResourceClass, ToolContext, ToolHandler, ToolInvocation, ToolSpec,
};

pub fn spec() -> ToolSpec {
    ToolSpec {
        tool_id: "E01_BURN",
        name: "Burn subtitles",
        resource_class: ResourceClass::Ffmpeg,
        inputs: &[artifact_kind::SOURCE_VIDEO, artifact_kind::CAPTIONS_DRAFT],
        outputs: &[artifact_kind::BURNED_VIDEO, artifact_kind::THUMBNAIL],
        default_params: serde_json::json!({"font_size": 42}),
        param_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "font_size": {"type": "integer", "default": 42}
            }
        }),
        supports_preview: true,
        supports_retry: true,
        supports_manual_edit: false,
    }
}

pub struct BurnSubtitles;

#[async_trait]
impl ToolHandler for BurnSubtitles {
    async fn handle(
        &self,
        ctx: &ToolContext,
        invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        let source = invocation
            .inputs
            .get(artifact_kind::SOURCE_VIDEO)
            .and_then(ArtifactValue::as_blob)
            .ok_or_else(|| ToolError::permanent("source_video must be a blob artifact"))?;
        let captions_value = invocation
            .inputs
            .get(artifact_kind::CAPTIONS_DRAFT)
            .ok_or_else(|| ToolError::permanent("captions_draft input missing"))?;
        let captions = artifact_text(ctx, captions_value).await?;

        let source_bytes = ctx
            .objects
            .get(source)
            .await
            .map_err(|e| ToolError::transient(format!("reading source video: {e:#}")))?;

        let mut burned = source_bytes.clone();
        burned.extend_from_slice(b"\n--burned-captions--\n");
        burned.extend_from_slice(captions.as_bytes());
        let burned_descriptor = ctx
            .objects
            .put(&burned, "video/mp4")
            .await
            .map_err(|e| ToolError::transient(format!("storing burned video: {e:#}")))?;

        let thumbnail_bytes = format!("thumb:{}", source.sha256);
        let thumbnail_descriptor = ctx
            .objects
            .put(thumbnail_bytes.as_bytes(), "image/jpeg")
            .await
            .map_err(|e| ToolError::transient(format!("storing thumbnail: {e:#}")))?;

        let mut outputs = ArtifactMap::new();
        outputs.insert(
            artifact_kind::BURNED_VIDEO.to_string(),
            ArtifactValue::Blob(burned_descriptor),
        );
        outputs.insert(
            artifact_kind::THUMBNAIL.to_string(),
            ArtifactValue::Blob(thumbnail_descriptor),
        );
        Ok(outputs)
    }
}
