//! T08_SPEECH_TO_TEXT — transcribe the source video. Gated by the
//! `whisper` resource class. As a side effect the content signature is
//! computed from the transcript and written back to the candidate, so
//! dedup strengthens once real speech text exists.

use async_trait::async_trait;
use serde_json::Value;

use super::load_candidate;
use crate::clipflow_core::dedupe::compute_candidate_signature;
use crate::clipflow_core::domain::{ArtifactMap, artifact_kind};
use crate::clipflow_core::error::ToolError;
use crate::clipflow_core::registry::{
    ResourceClass, ToolContext, ToolHandler, ToolInvocation, ToolSpec,
};

pub fn spec() -> ToolSpec {
    ToolSpec {
        tool_id: "T08_SPEECH_TO_TEXT",
        name: "Speech to text",
        resource_class: ResourceClass::Whisper,
        inputs: &[artifact_kind::SOURCE_VIDEO],
        outputs: &[artifact_kind::TRANSCRIPT],
        default_params: serde_json::json!({"language": "auto"}),
        param_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "language": {"type": "string", "default": "auto"}
            }
        }),
        supports_preview: false,
        supports_retry: true,
        supports_manual_edit: true,
    }
}

pub struct Transcribe;

#[async_trait]
impl ToolHandler for Transcribe {
    async fn handle(
        &self,
        ctx: &ToolContext,
        invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        let mut candidate = load_candidate(ctx, invocation.task.candidate_id).await?;

        // Stand-in for the speech model: derive the transcript from the
        // candidate's own text so replays are byte-identical.
        let mut parts: Vec<&str> = Vec::new();
        if let Some(title) = candidate.title.as_deref() {
            parts.push(title);
        }
        if let Some(caption) = candidate.caption.as_deref() {
            if Some(caption) != candidate.title.as_deref() {
                parts.push(caption);
            }
        }
        let transcript = parts.join(". ");

        let stored = ctx
            .objects
            .store_text(&transcript, ctx.settings.inline_text_cap_bytes)
            .await
            .map_err(|e| ToolError::transient(format!("storing transcript: {e:#}")))?;

        if !invocation.preview {
            let (signature, source) = compute_candidate_signature(&candidate, Some(&transcript));
            candidate.set_meta("content_signature", Value::from(signature));
            candidate.set_meta("content_signature_source", Value::from(source.as_str()));
            ctx.store
                .update_candidate_meta(candidate.id, candidate.meta.clone())
                .await
                .map_err(|e| ToolError::transient(format!("updating candidate meta: {e:#}")))?;
        }

        let mut outputs = ArtifactMap::new();
        outputs.insert(artifact_kind::TRANSCRIPT.to_string(), stored);
        Ok(outputs)
    }
}
