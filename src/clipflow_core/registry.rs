//! Static tool catalogue. Each entry pairs a handler with its declared
//! contract (inputs, outputs, resource class, capability flags); the
//! executor stays tool-agnostic and consults the registry before each step.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::artifacts::ObjectStore;
use super::domain::{ArtifactMap, PublishTask};
use super::error::ToolError;
use super::llm::LlmProvider;
use super::publisher::PublisherAdapter;
use super::settings::Settings;
use super::store::Store;

/// Semaphore-gated resource classes for expensive steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    Whisper,
    Ffmpeg,
    Llm,
    None,
}

impl ResourceClass {
    /// Semaphore name, or `None` when the class is not gated.
    pub fn semaphore_name(self) -> Option<&'static str> {
        match self {
            ResourceClass::Whisper => Some("whisper"),
            ResourceClass::Ffmpeg => Some("ffmpeg"),
            ResourceClass::Llm => Some("llm"),
            ResourceClass::None => None,
        }
    }
}

/// Declared contract of a tool. Static data lives here, not on the handler
/// type, which keeps the registry a plain data structure.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub tool_id: &'static str,
    pub name: &'static str,
    pub resource_class: ResourceClass,
    pub inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
    pub default_params: Value,
    pub param_schema: Value,
    pub supports_preview: bool,
    pub supports_retry: bool,
    pub supports_manual_edit: bool,
}

/// Dependencies injected into every handler invocation. Built once at
/// startup and shared by all workers in the process.
pub struct ToolContext {
    pub store: Arc<dyn Store>,
    pub objects: ObjectStore,
    pub llm: Arc<dyn LlmProvider>,
    pub publisher: Arc<dyn PublisherAdapter>,
    pub settings: Arc<Settings>,
}

/// One handler invocation: the task snapshot, the projection of declared
/// input artifacts, and the merged parameters.
pub struct ToolInvocation {
    pub task: PublishTask,
    pub inputs: ArtifactMap,
    pub params: Value,
    /// Preview runs must not cause externally visible side effects; their
    /// outputs land under `preview/<kind>` and the step index stays put.
    pub preview: bool,
}

/// Handlers are expected to be effectively idempotent: identical inputs and
/// parameters produce identical outputs (up to irrelevant nonces).
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &ToolContext,
        invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError>;
}

pub struct ToolEntry {
    pub spec: ToolSpec,
    pub handler: Arc<dyn ToolHandler>,
}

#[derive(Default)]
pub struct ToolRegistry {
    entries: HashMap<&'static str, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all built-in tools. Adding a tool is a matter of
    /// registering another entry; nothing in the executor changes.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for (spec, handler) in super::tools::builtin_tools() {
            registry.register(spec, handler);
        }
        registry
    }

    pub fn register(&mut self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) {
        self.entries.insert(spec.tool_id, ToolEntry { spec, handler });
    }

    pub fn get(&self, tool_id: &str) -> Option<&ToolEntry> {
        self.entries.get(tool_id)
    }

    pub fn tool_ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Step parameter overrides merged over the tool's defaults
    /// (shallow, key-by-key; overrides win).
    pub fn merged_params(spec: &ToolSpec, overrides: &Value) -> Value {
        let mut merged: Map<String, Value> = spec
            .default_params
            .as_object()
            .cloned()
            .unwrap_or_default();
        if let Some(overrides) = overrides.as_object() {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        Value::Object(merged)
    }

    /// Project the declared inputs out of the artifact map. A missing
    /// declared input is a contract violation and fails the step
    /// permanently.
    pub fn input_projection(
        spec: &ToolSpec,
        artifacts: &ArtifactMap,
    ) -> Result<ArtifactMap, ToolError> {
        let mut projection = ArtifactMap::new();
        for kind in spec.inputs {
            match artifacts.get(*kind) {
                Some(value) => {
                    projection.insert((*kind).to_string(), value.clone());
                }
                None => {
                    return Err(ToolError::permanent(format!(
                        "{}: declared input artifact '{kind}' is missing",
                        spec.tool_id
                    )));
                }
            }
        }
        Ok(projection)
    }

    /// Reject outputs the tool did not declare.
    pub fn validate_outputs(spec: &ToolSpec, outputs: &ArtifactMap) -> Result<(), ToolError> {
        for kind in outputs.keys() {
            if !spec.outputs.contains(&kind.as_str()) {
                return Err(ToolError::permanent(format!(
                    "{}: wrote undeclared output artifact '{kind}'",
                    spec.tool_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipflow_core::domain::ArtifactValue;

    fn spec() -> ToolSpec {
        ToolSpec {
            tool_id: "X01_TEST",
            name: "test tool",
            resource_class: ResourceClass::None,
            inputs: &["transcript"],
            outputs: &["script"],
            default_params: serde_json::json!({"a": 1, "b": 2}),
            param_schema: serde_json::json!({}),
            supports_preview: false,
            supports_retry: false,
            supports_manual_edit: false,
        }
    }

    #[test]
    fn merged_params_let_overrides_win() {
        let merged = ToolRegistry::merged_params(&spec(), &serde_json::json!({"b": 9, "c": 3}));
        assert_eq!(merged, serde_json::json!({"a": 1, "b": 9, "c": 3}));
    }

    #[test]
    fn missing_declared_input_is_permanent() {
        let artifacts = ArtifactMap::new();
        let err = ToolRegistry::input_projection(&spec(), &artifacts).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("transcript"));
    }

    #[test]
    fn projection_only_carries_declared_inputs() {
        let mut artifacts = ArtifactMap::new();
        artifacts.insert("transcript".into(), ArtifactValue::Text("t".into()));
        artifacts.insert("unrelated".into(), ArtifactValue::Text("u".into()));
        let projection = ToolRegistry::input_projection(&spec(), &artifacts).unwrap();
        assert_eq!(projection.len(), 1);
        assert!(projection.contains_key("transcript"));
    }

    #[test]
    fn undeclared_output_is_rejected() {
        let mut outputs = ArtifactMap::new();
        outputs.insert("script".into(), ArtifactValue::Text("s".into()));
        assert!(ToolRegistry::validate_outputs(&spec(), &outputs).is_ok());

        outputs.insert("rogue".into(), ArtifactValue::Text("r".into()));
        let err = ToolRegistry::validate_outputs(&spec(), &outputs).unwrap_err();
        assert!(err.to_string().contains("rogue"));
    }

    #[test]
    fn builtin_registry_serves_the_standard_preset_tools() {
        let registry = ToolRegistry::builtin();
        for tool_id in [
            "T01_INGEST",
            "T08_SPEECH_TO_TEXT",
            "A01_SCRIPT_ANALYSIS",
            "G01_SCRIPT",
            "E01_BURN",
            "T18_QC",
            "P01_PUBLISH",
        ] {
            assert!(registry.get(tool_id).is_some(), "missing {tool_id}");
        }
    }
}
