//! Content-based deduplication: SHA-1 over normalized text, stored in
//! `candidate.meta["content_signature"]` and checked at enqueue time.

use once_cell::sync::Lazy;
use regex::Regex;
use sha1::{Digest, Sha1};
use unicode_normalization::UnicodeNormalization;

use super::domain::Candidate;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").expect("NON_WORD regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("WHITESPACE regex"));

/// Normalize text for signature computation: NFKC, lowercase, strip
/// punctuation (keep letters/digits/whitespace), collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let folded: String = text.nfkc().collect::<String>().to_lowercase();
    let stripped = NON_WORD.replace_all(&folded, "");
    WHITESPACE.replace_all(&stripped, " ").trim().to_string()
}

/// SHA-1 hex of the normalized text. Empty text yields an empty signature,
/// which disables dedup for that candidate.
pub fn compute_signature(text: &str) -> String {
    let normalized = normalize_text(text);
    if normalized.is_empty() {
        return String::new();
    }
    let digest = Sha1::digest(normalized.as_bytes());
    hex::encode(digest)
}

/// Which text fed the signature; kept in candidate meta for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureSource {
    Transcript,
    TitleAndCaption,
    Title,
}

impl SignatureSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SignatureSource::Transcript => "transcript",
            SignatureSource::TitleAndCaption => "title+caption",
            SignatureSource::Title => "title",
        }
    }
}

/// Pick the text to sign. Priority: transcript, then title+caption (caption
/// dropped when identical to the title), then title alone.
pub fn extract_candidate_text(
    candidate: &Candidate,
    transcript: Option<&str>,
) -> (String, SignatureSource) {
    if let Some(t) = transcript {
        let trimmed = t.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), SignatureSource::Transcript);
        }
    }

    let mut parts: Vec<&str> = Vec::new();
    if let Some(title) = candidate.title.as_deref() {
        parts.push(title);
    }
    if let Some(caption) = candidate.caption.as_deref() {
        if Some(caption) != candidate.title.as_deref() {
            parts.push(caption);
        }
    }

    let source = if parts.len() > 1 {
        SignatureSource::TitleAndCaption
    } else {
        SignatureSource::Title
    };
    (parts.join(" ").trim().to_string(), source)
}

/// Compute the content signature for a candidate, preferring the transcript
/// when one is available.
pub fn compute_candidate_signature(
    candidate: &Candidate,
    transcript: Option<&str>,
) -> (String, SignatureSource) {
    let (text, source) = extract_candidate_text(candidate, transcript);
    (compute_signature(&text), source)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;

    use super::*;
    use crate::clipflow_core::domain::{CandidateStatus, Platform};

    fn candidate(title: Option<&str>, caption: Option<&str>) -> Candidate {
        let now = Utc::now();
        Candidate {
            id: 1,
            project_id: 1,
            platform: Platform::Tiktok,
            platform_video_id: "v1".into(),
            url: None,
            author: None,
            title: title.map(str::to_string),
            caption: caption.map(str::to_string),
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
            meta: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn normalization_strips_punctuation_and_case() {
        assert_eq!(normalize_text("Hello, WORLD!!"), "hello world");
        assert_eq!(normalize_text("  a \t b\n\nc  "), "a b c");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn normalization_applies_nfkc() {
        // Fullwidth letters fold to ASCII under NFKC.
        assert_eq!(normalize_text("ＡＢＣ"), "abc");
    }

    #[test]
    fn empty_text_yields_empty_signature() {
        assert_eq!(compute_signature(""), "");
        assert_eq!(compute_signature("!!!"), "");
    }

    #[test]
    fn signature_is_stable_hex_sha1() {
        let sig = compute_signature("Hello World");
        assert_eq!(sig.len(), 40);
        assert_eq!(sig, compute_signature("hello,   world!"));
    }

    #[test]
    fn transcript_wins_over_title() {
        let c = candidate(Some("title"), Some("caption"));
        let (text, source) = extract_candidate_text(&c, Some("the transcript"));
        assert_eq!(text, "the transcript");
        assert_eq!(source, SignatureSource::Transcript);
    }

    #[test]
    fn blank_transcript_falls_back_to_title_caption() {
        let c = candidate(Some("title"), Some("caption"));
        let (text, source) = extract_candidate_text(&c, Some("   "));
        assert_eq!(text, "title caption");
        assert_eq!(source, SignatureSource::TitleAndCaption);
    }

    #[test]
    fn caption_equal_to_title_is_dropped() {
        let c = candidate(Some("same"), Some("same"));
        let (text, source) = extract_candidate_text(&c, None);
        assert_eq!(text, "same");
        assert_eq!(source, SignatureSource::Title);
    }

    proptest! {
        /// Normalization is idempotent, so signing a normalized text gives
        /// the same signature as signing the raw text.
        #[test]
        fn normalization_idempotent(input in ".{0,200}") {
            let once = normalize_text(&input);
            let twice = normalize_text(&once);
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(compute_signature(&input), compute_signature(&once));
        }
    }
}
