//! LLM provider seam. The concrete model integration is out of scope; the
//! trait is what the generate/analysis tools call, and the stub returns
//! deterministic, plausible placeholder content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::error::ToolError;

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub title: String,
    pub topic: Option<String>,
    pub description: Option<String>,
    pub style: Option<String>,
    pub tone: Option<String>,
    pub language: Option<String>,
    pub target_platform: Option<String>,
    pub target_duration_sec: Option<u32>,
}

/// Result of LLM content generation from a brief.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedContent {
    pub hook: String,
    pub script: String,
    pub captions_draft: String,
    pub keywords: Vec<String>,
    pub title_suggestion: Option<String>,
    pub model: String,
}

impl GeneratedContent {
    pub fn to_meta(&self) -> Value {
        json!({
            "hook": self.hook,
            "script": self.script,
            "captions_draft": self.captions_draft,
            "keywords": self.keywords,
            "title_suggestion": self.title_suggestion,
            "model": self.model,
        })
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedContent, ToolError>;
}

/// Deterministic stand-in used until a real model is wired up.
pub struct StubLlmProvider;

#[async_trait]
impl LlmProvider for StubLlmProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedContent, ToolError> {
        let topic = request.topic.as_deref().unwrap_or(&request.title);
        let platform = request.target_platform.as_deref().unwrap_or("universal");
        let duration = request.target_duration_sec.unwrap_or(60);

        let hook = format!("You won't believe what happened with {topic} — watch to the end.");
        let mut script = format!(
            "Script for {platform} ({duration}s)\n\n\
             0:00-0:03 — Hook: {hook}\n\
             0:03-0:{a:02} — Setup: {topic}\n\
             0:{a:02}-0:{b:02} — Main beats\n\
             0:{b:02}-0:{duration:02} — CTA and outro\n",
            a = duration / 3,
            b = 2 * duration / 3,
        );
        if let Some(description) = &request.description {
            script.push_str(&format!("\nContext: {description}\n"));
        }
        if let Some(style) = &request.style {
            script.push_str(&format!("Style: {style}\n"));
        }
        if let Some(tone) = &request.tone {
            script.push_str(&format!("Tone: {tone}\n"));
        }

        let captions_draft =
            format!("{hook}\n\nMore about {topic} in our new video!\n\n#shorts #{platform}");

        let keywords = vec![
            topic.split_whitespace().next().unwrap_or("content").to_string(),
            platform.to_string(),
            request.style.clone().unwrap_or_else(|| "video".to_string()),
            "trending".to_string(),
        ];

        Ok(GeneratedContent {
            hook,
            script,
            captions_draft,
            keywords,
            title_suggestion: Some(format!("{topic} — {platform}")),
            model: "stub-v1".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_generation_is_deterministic() {
        let provider = StubLlmProvider;
        let request = GenerationRequest {
            title: "Perfect pasta".into(),
            target_platform: Some("tiktok".into()),
            target_duration_sec: Some(45),
            ..Default::default()
        };
        let a = provider.generate(&request).await.unwrap();
        let b = provider.generate(&request).await.unwrap();
        assert_eq!(a.script, b.script);
        assert!(a.script.contains("tiktok"));
        assert!(a.captions_draft.contains("Perfect pasta"));
        assert!(!a.keywords.is_empty());
    }
}
