//! G01_SCRIPT — generate the publish script and captions draft from the
//! script analysis via the injected LLM provider.

use async_trait::async_trait;
use serde_json::Value;

use super::load_candidate;
use crate::clipflow_core::domain::{ArtifactMap, ArtifactValue, artifact_kind};
use crate::clipflow_core::error::ToolError;
use crate::clipflow_core::llm::GenerationRequest;
use crate::clipflow_core::registry::{
    ResourceClass, ToolContext, ToolHandler, ToolInvocation, ToolSpec,
};

pub fn spec() -> ToolSpec {
    ToolSpec {
        tool_id: "G01_SCRIPT",
        name: "Generate script",
        resource_class: ResourceClass::Llm,
        inputs: &[artifact_kind::SCRIPT_ANALYSIS],
        outputs: &[artifact_kind::SCRIPT, artifact_kind::CAPTIONS_DRAFT],
        default_params: serde_json::json!({"style": null, "tone": null, "language": "en"}),
        param_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "style": {"type": ["string", "null"]},
                "tone": {"type": ["string", "null"]},
                "language": {"type": "string", "default": "en"}
            }
        }),
        supports_preview: true,
        supports_retry: true,
        supports_manual_edit: true,
    }
}

pub struct GenerateScript;

#[async_trait]
impl ToolHandler for GenerateScript {
    async fn handle(
        &self,
        ctx: &ToolContext,
        invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        let candidate = load_candidate(ctx, invocation.task.candidate_id).await?;

        let analysis = invocation
            .inputs
            .get(artifact_kind::SCRIPT_ANALYSIS)
            .and_then(|v| match v {
                ArtifactValue::Scalar(value) => Some(value.clone()),
                _ => None,
            })
            .unwrap_or(Value::Null);
        let topic = analysis
            .get("theses")
            .and_then(Value::as_array)
            .and_then(|t| t.first())
            .and_then(Value::as_str)
            .map(str::to_string);

        let profile = ctx
            .store
            .get_export_profile(invocation.task.target_platform)
            .await
            .map_err(|e| ToolError::transient(format!("loading export profile: {e:#}")))?;

        let request = GenerationRequest {
            title: candidate.title.clone().unwrap_or_default(),
            topic,
            description: candidate.caption.clone(),
            style: param_str(&invocation.params, "style"),
            tone: param_str(&invocation.params, "tone"),
            language: param_str(&invocation.params, "language"),
            target_platform: Some(invocation.task.target_platform.as_str().to_string()),
            target_duration_sec: profile.map(|p| p.recommended_duration_sec as u32),
        };
        let generated = ctx.llm.generate(&request).await?;

        let script = ctx
            .objects
            .store_text(&generated.script, ctx.settings.inline_text_cap_bytes)
            .await
            .map_err(|e| ToolError::transient(format!("storing script: {e:#}")))?;

        let mut outputs = ArtifactMap::new();
        outputs.insert(artifact_kind::SCRIPT.to_string(), script);
        outputs.insert(
            artifact_kind::CAPTIONS_DRAFT.to_string(),
            ArtifactValue::Text(generated.captions_draft),
        );
        Ok(outputs)
    }
}

fn param_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
