//! T18_QC — final quality gate before publishing: the burned video must be
//! a non-empty video blob and the destination's export profile must exist.

use async_trait::async_trait;
use serde_json::json;

use crate::clipflow_core::domain::{ArtifactMap, ArtifactValue, artifact_kind};
use crate::clipflow_core::error::ToolError;
use crate::clipflow_core::registry::{
    ResourceClass, ToolContext, ToolHandler, ToolInvocation, ToolSpec,
};

pub fn spec() -> ToolSpec {
    ToolSpec {
        tool_id: "T18_QC",
        name: "Quality check",
        resource_class: ResourceClass::None,
        inputs: &[artifact_kind::BURNED_VIDEO],
        outputs: &[artifact_kind::QC_REPORT],
        default_params: serde_json::json!({}),
        param_schema: serde_json::json!({"type": "object", "properties": {}}),
        supports_preview: false,
        supports_retry: false,
        supports_manual_edit: false,
    }
}

pub struct QualityCheck;

#[async_trait]
impl ToolHandler for QualityCheck {
    async fn handle(
        &self,
        ctx: &ToolContext,
        invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        let video = invocation
            .inputs
            .get(artifact_kind::BURNED_VIDEO)
            .and_then(ArtifactValue::as_blob)
            .ok_or_else(|| ToolError::permanent("burned_video must be a blob artifact"))?;

        if video.bytes == 0 {
            return Err(ToolError::permanent("burned video is empty"));
        }
        if !video.mime.starts_with("video/") {
            return Err(ToolError::permanent(format!(
                "burned video has non-video mime '{}'",
                video.mime
            )));
        }

        let profile = ctx
            .store
            .get_export_profile(invocation.task.target_platform)
            .await
            .map_err(|e| ToolError::transient(format!("loading export profile: {e:#}")))?
            .ok_or_else(|| {
                ToolError::permanent(format!(
                    "no export profile for destination {}",
                    invocation.task.target_platform
                ))
            })?;

        let report = json!({
            "passed": true,
            "profile": profile.name,
            "max_duration_sec": profile.max_duration_sec,
            "checks": [
                {"name": "video_nonempty", "passed": true},
                {"name": "mime_is_video", "passed": true},
                {"name": "export_profile_present", "passed": true},
            ],
        });

        let mut outputs = ArtifactMap::new();
        outputs.insert(
            artifact_kind::QC_REPORT.to_string(),
            ArtifactValue::Scalar(report),
        );
        Ok(outputs)
    }
}
