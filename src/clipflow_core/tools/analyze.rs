//! A01_SCRIPT_ANALYSIS — extract reusable script patterns (hook, theses,
//! CTA) for G01_SCRIPT and the topic guard. Works straight off the
//! ingested video: the analysed text is the candidate's own title/caption
//! (the stand-in for a model looking at the footage), so presets without a
//! transcription step still analyse. The result is mirrored into the
//! candidate's meta.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::load_candidate;
use crate::clipflow_core::domain::{ArtifactMap, ArtifactValue, artifact_kind};
use crate::clipflow_core::error::ToolError;
use crate::clipflow_core::registry::{
    ResourceClass, ToolContext, ToolHandler, ToolInvocation, ToolSpec,
};

pub fn spec() -> ToolSpec {
    ToolSpec {
        tool_id: "A01_SCRIPT_ANALYSIS",
        name: "Script analysis",
        resource_class: ResourceClass::Llm,
        inputs: &[artifact_kind::SOURCE_VIDEO],
        outputs: &[artifact_kind::SCRIPT_ANALYSIS],
        default_params: serde_json::json!({"max_theses": 5}),
        param_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "max_theses": {
                    "type": "integer",
                    "default": 5,
                    "description": "Maximum number of key theses to extract"
                }
            }
        }),
        supports_preview: false,
        supports_retry: true,
        supports_manual_edit: false,
    }
}

pub struct ScriptAnalysis;

#[async_trait]
impl ToolHandler for ScriptAnalysis {
    async fn handle(
        &self,
        ctx: &ToolContext,
        invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        let mut candidate = load_candidate(ctx, invocation.task.candidate_id).await?;

        let mut parts: Vec<&str> = Vec::new();
        if let Some(title) = candidate.title.as_deref() {
            parts.push(title);
        }
        if let Some(caption) = candidate.caption.as_deref() {
            if Some(caption) != candidate.title.as_deref() {
                parts.push(caption);
            }
        }
        let text = parts.join(". ");

        let max_theses = invocation
            .params
            .get("max_theses")
            .and_then(Value::as_u64)
            .unwrap_or(5) as usize;

        let sentences: Vec<&str> = text
            .split(['.', '!', '?'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        let theses: Vec<&str> = sentences.iter().copied().take(max_theses).collect();
        let analysis = json!({
            "hook": sentences.first().copied().unwrap_or(""),
            "theses": theses,
            "cta": sentences.last().copied().unwrap_or(""),
            "sentence_count": sentences.len(),
        });

        if !invocation.preview {
            candidate.set_meta("script_analysis", analysis.clone());
            ctx.store
                .update_candidate_meta(candidate.id, candidate.meta.clone())
                .await
                .map_err(|e| ToolError::transient(format!("updating candidate meta: {e:#}")))?;
        }

        let mut outputs = ArtifactMap::new();
        outputs.insert(
            artifact_kind::SCRIPT_ANALYSIS.to_string(),
            ArtifactValue::Scalar(analysis),
        );
        Ok(outputs)
    }
}
