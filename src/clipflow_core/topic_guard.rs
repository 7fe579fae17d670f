//! Topic anti-repeat guard: short topic phrases hashed into a signature so
//! back-to-back publishes on one destination can be rejected at enqueue.

use serde_json::Value;
use sha1::{Digest, Sha1};

use super::dedupe::normalize_text;
use super::domain::Candidate;

/// Upper bound on extracted topic tags.
pub const MAX_TOPIC_TAGS: usize = 7;

/// Default anti-repeat window: how many recent published tasks to inspect.
pub const DEFAULT_REPEAT_WINDOW: usize = 5;
/// Default age bound, in days, on the inspected tasks.
pub const DEFAULT_REPEAT_DAYS: i64 = 14;

/// Per-project overrides read out of the project policy document.
#[derive(Debug, Clone, Copy)]
pub struct RepeatPolicy {
    pub window: usize,
    pub days: i64,
}

impl Default for RepeatPolicy {
    fn default() -> Self {
        Self {
            window: DEFAULT_REPEAT_WINDOW,
            days: DEFAULT_REPEAT_DAYS,
        }
    }
}

impl RepeatPolicy {
    pub fn from_project_policy(policy: &Value) -> Self {
        let defaults = RepeatPolicy::default();
        Self {
            window: policy
                .get("topic_repeat_window")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(defaults.window),
            days: policy
                .get("topic_repeat_days")
                .and_then(Value::as_i64)
                .unwrap_or(defaults.days),
        }
    }
}

/// Extract up to [`MAX_TOPIC_TAGS`] short phrases describing the candidate.
///
/// Priority: script-analysis theses, then explicit keywords, then
/// script-data keywords, then fallback tokens from title+caption.
pub fn extract_topic_tags(candidate: &Candidate) -> Vec<String> {
    let meta = &candidate.meta;
    let mut tags: Vec<String> = Vec::new();

    if let Some(analysis) = meta.get("script_analysis").filter(|v| v.is_object()) {
        let theses = analysis
            .get("theses")
            .or_else(|| analysis.get("topics"))
            .and_then(Value::as_array);
        if let Some(theses) = theses {
            for thesis in theses.iter().take(5) {
                let text = match thesis {
                    Value::String(s) => s.as_str(),
                    Value::Object(obj) => obj
                        .get("text")
                        .or_else(|| obj.get("title"))
                        .and_then(Value::as_str)
                        .unwrap_or(""),
                    _ => "",
                };
                let normalized = normalize_text(text);
                let words: Vec<&str> = normalized.split_whitespace().take(3).collect();
                if !words.is_empty() {
                    tags.push(words.join(" "));
                }
            }
        }
    }

    if tags.is_empty() {
        push_keyword_tags(&mut tags, meta.get("keywords"));
    }

    if tags.is_empty() {
        let script_keywords = meta
            .get("script_data")
            .filter(|v| v.is_object())
            .and_then(|d| d.get("keywords"));
        push_keyword_tags(&mut tags, script_keywords);
    }

    if tags.is_empty() {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(title) = candidate.title.as_deref() {
            parts.push(title);
        }
        if let Some(caption) = candidate.caption.as_deref() {
            if Some(caption) != candidate.title.as_deref() {
                parts.push(caption);
            }
        }
        let text = normalize_text(&parts.join(" "));
        let mut seen = std::collections::HashSet::new();
        for word in text.split_whitespace().filter(|w| w.len() > 2) {
            if seen.insert(word.to_string()) {
                tags.push(word.to_string());
            }
            if tags.len() >= 5 {
                break;
            }
        }
    }

    // Deduplicate while preserving order, cap the count.
    let mut clean: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for tag in tags {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && seen.insert(tag.clone()) {
            clean.push(tag);
        }
    }
    clean.truncate(MAX_TOPIC_TAGS);
    clean
}

/// SHA-1 hex over `"|".join(sorted(dedup(lowercased tags)))`. Empty tag list
/// yields an empty signature (no anti-repeat).
pub fn topic_signature(tags: &[String]) -> String {
    let mut normalized: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    if normalized.is_empty() {
        return String::new();
    }
    let digest = Sha1::digest(normalized.join("|").as_bytes());
    hex::encode(digest)
}

/// Extract tags + signature and persist both into the candidate's meta.
pub fn ensure_candidate_topic_meta(candidate: &mut Candidate) -> (Vec<String>, String) {
    let tags = extract_topic_tags(candidate);
    let signature = topic_signature(&tags);
    candidate.set_meta("topic_tags", Value::from(tags.clone()));
    candidate.set_meta("topic_signature", Value::from(signature.clone()));
    (tags, signature)
}

fn push_keyword_tags(tags: &mut Vec<String>, keywords: Option<&Value>) {
    let Some(list) = keywords.and_then(Value::as_array) else {
        return;
    };
    for keyword in list.iter().take(MAX_TOPIC_TAGS) {
        if let Some(k) = keyword.as_str() {
            if !k.trim().is_empty() {
                tags.push(normalize_text(k));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clipflow_core::domain::{CandidateStatus, Platform};

    fn candidate_with_meta(meta: Value) -> Candidate {
        let now = Utc::now();
        Candidate {
            id: 1,
            project_id: 1,
            platform: Platform::Tiktok,
            platform_video_id: "v1".into(),
            url: None,
            author: None,
            title: Some("Five ways to cook perfect pasta at home".into()),
            caption: Some("the best pasta recipe ever".into()),
            thumbnail_url: None,
            source_published_at: None,
            views: None,
            likes: None,
            comments: None,
            shares: None,
            subscribers: None,
            virality_score: None,
            virality_factors: None,
            status: CandidateStatus::New,
            manual_rating: None,
            notes: None,
            reviewed_at: None,
            linked_publish_task_id: None,
            meta,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn theses_take_priority_over_keywords() {
        let c = candidate_with_meta(serde_json::json!({
            "script_analysis": {"theses": ["Why Pasta Water Matters So Much", "Salt early"]},
            "keywords": ["ignored"],
        }));
        let tags = extract_topic_tags(&c);
        assert_eq!(tags[0], "why pasta water");
        assert!(tags.iter().all(|t| t != "ignored"));
    }

    #[test]
    fn object_theses_use_text_or_title() {
        let c = candidate_with_meta(serde_json::json!({
            "script_analysis": {"theses": [{"text": "Boiling Point Basics"}, {"title": "Starch"}]},
        }));
        let tags = extract_topic_tags(&c);
        assert_eq!(tags, vec!["boiling point basics", "starch"]);
    }

    #[test]
    fn keywords_used_when_no_analysis() {
        let c = candidate_with_meta(serde_json::json!({"keywords": ["Pasta", "Cooking"]}));
        assert_eq!(extract_topic_tags(&c), vec!["pasta", "cooking"]);
    }

    #[test]
    fn fallback_tokenizes_title_and_caption() {
        let c = candidate_with_meta(serde_json::json!({}));
        let tags = extract_topic_tags(&c);
        // Words longer than 2 chars, first 5 unique.
        assert_eq!(tags.len(), 5);
        assert_eq!(tags[0], "five");
        assert!(tags.iter().all(|t| t.len() > 2));
    }

    #[test]
    fn tags_are_deduped_and_capped() {
        let many: Vec<String> = (0..20).map(|i| format!("tag{i}")).collect();
        let c = candidate_with_meta(serde_json::json!({"keywords": many}));
        assert_eq!(extract_topic_tags(&c).len(), MAX_TOPIC_TAGS);
    }

    #[test]
    fn signature_ignores_tag_order_and_case() {
        let a = topic_signature(&["Pasta".into(), "cooking".into()]);
        let b = topic_signature(&["COOKING".into(), "pasta".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn empty_tags_give_empty_signature() {
        assert_eq!(topic_signature(&[]), "");
        assert_eq!(topic_signature(&["   ".into()]), "");
    }

    #[test]
    fn ensure_topic_meta_writes_back() {
        let mut c = candidate_with_meta(serde_json::json!({"keywords": ["pasta"]}));
        let (tags, signature) = ensure_candidate_topic_meta(&mut c);
        assert_eq!(tags, vec!["pasta"]);
        assert_eq!(c.meta_str("topic_signature"), Some(signature.as_str()));
        assert!(c.meta.get("topic_tags").is_some());
    }

    #[test]
    fn repeat_policy_reads_project_overrides() {
        let policy = serde_json::json!({"topic_repeat_window": 3, "topic_repeat_days": 7});
        let parsed = RepeatPolicy::from_project_policy(&policy);
        assert_eq!(parsed.window, 3);
        assert_eq!(parsed.days, 7);

        let fallback = RepeatPolicy::from_project_policy(&serde_json::json!({}));
        assert_eq!(fallback.window, DEFAULT_REPEAT_WINDOW);
        assert_eq!(fallback.days, DEFAULT_REPEAT_DAYS);
    }
}
