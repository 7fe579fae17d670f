//! Built-in tools. Each submodule pairs a [`ToolSpec`] contract with a
//! handler; the heavy implementations (real transcription, encoding, model
//! calls, platform uploads) are external collaborators, so the handlers
//! here are deterministic stand-ins that exercise the full artifact
//! plumbing.

use std::sync::Arc;

use crate::clipflow_core::domain::{ArtifactValue, Candidate};
use crate::clipflow_core::error::ToolError;
use crate::clipflow_core::registry::{ToolContext, ToolHandler, ToolSpec};

mod analyze;
mod burn;
mod generate;
mod ingest;
mod publish;
mod qc;
mod transcribe;

pub fn builtin_tools() -> Vec<(ToolSpec, Arc<dyn ToolHandler>)> {
    vec![
        (ingest::spec(), Arc::new(ingest::Ingest) as Arc<dyn ToolHandler>),
        (transcribe::spec(), Arc::new(transcribe::Transcribe)),
        (analyze::spec(), Arc::new(analyze::ScriptAnalysis)),
        (generate::spec(), Arc::new(generate::GenerateScript)),
        (burn::spec(), Arc::new(burn::BurnSubtitles)),
        (qc::spec(), Arc::new(qc::QualityCheck)),
        (publish::spec(), Arc::new(publish::Publish)),
    ]
}

/// Resolve a text artifact regardless of whether it was stored inline or
/// spilled to the object store.
pub(crate) async fn artifact_text(
    ctx: &ToolContext,
    value: &ArtifactValue,
) -> Result<String, ToolError> {
    match value {
        ArtifactValue::Text(text) => Ok(text.clone()),
        ArtifactValue::Blob(descriptor) => {
            let bytes = ctx
                .objects
                .get(descriptor)
                .await
                .map_err(|e| ToolError::transient(format!("object store read failed: {e:#}")))?;
            String::from_utf8(bytes)
                .map_err(|_| ToolError::permanent("text artifact is not valid UTF-8"))
        }
        ArtifactValue::Scalar(value) => Ok(value.to_string()),
    }
}

/// Load the task's candidate; its absence is a contract violation.
pub(crate) async fn load_candidate(
    ctx: &ToolContext,
    candidate_id: i64,
) -> Result<Candidate, ToolError> {
    ctx.store
        .get_candidate(candidate_id)
        .await
        .map_err(|e| ToolError::transient(format!("loading candidate: {e:#}")))?
        .ok_or_else(|| ToolError::permanent(format!("candidate {candidate_id} not found")))
}
