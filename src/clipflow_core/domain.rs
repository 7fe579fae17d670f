use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved step-index values used to record control and worker-level events
/// in the step-result log. Real preset steps always index below these.
pub const STEP_INDEX_CONTROL: i32 = 9996;
pub const STEP_INDEX_WORKER: i32 = 9997;
pub const STEP_INDEX_RETRY_FENCE: i32 = 9998;
pub const STEP_INDEX_TERMINAL: i32 = 9999;

pub fn is_sentinel_step_index(index: i32) -> bool {
    (STEP_INDEX_CONTROL..=STEP_INDEX_TERMINAL).contains(&index)
}

/// Error messages persisted on step results are truncated to this length.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1000;

pub fn truncate_error_message(message: &str) -> String {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Published,
    Error,
    Canceled,
    Paused,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Published => "published",
            TaskStatus::Error => "error",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Paused => "paused",
        }
    }

    /// Terminal statuses are never picked up by the dispatcher again without
    /// an explicit resume (`paused`/`error`) — `canceled` not even then.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Published | TaskStatus::Error | TaskStatus::Canceled | TaskStatus::Paused
        )
    }

    pub fn is_resumable(self) -> bool {
        matches!(self, TaskStatus::Paused | TaskStatus::Error)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "published" => Ok(TaskStatus::Published),
            "error" => Ok(TaskStatus::Error),
            "canceled" => Ok(TaskStatus::Canceled),
            "paused" => Ok(TaskStatus::Paused),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CandidateStatus {
    New,
    Approved,
    Used,
    Rejected,
}

impl CandidateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateStatus::New => "NEW",
            CandidateStatus::Approved => "APPROVED",
            CandidateStatus::Used => "USED",
            CandidateStatus::Rejected => "REJECTED",
        }
    }

    /// Once a candidate leaves NEW its status may only advance monotonically
    /// NEW→APPROVED→USED, or move to REJECTED from any non-terminal state.
    pub fn can_advance_to(self, next: CandidateStatus) -> bool {
        use CandidateStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (New, Approved) | (New, Rejected) => true,
            (Approved, Used) | (Approved, Rejected) => true,
            _ => false,
        }
    }
}

impl FromStr for CandidateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(CandidateStatus::New),
            "APPROVED" => Ok(CandidateStatus::Approved),
            "USED" => Ok(CandidateStatus::Used),
            "REJECTED" => Ok(CandidateStatus::Rejected),
            other => Err(format!("unknown candidate status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Error,
    Skipped,
    Paused,
    Canceled,
    Retrying,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Ok => "ok",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
            StepStatus::Paused => "paused",
            StepStatus::Canceled => "canceled",
            StepStatus::Retrying => "retrying",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(StepStatus::Ok),
            "error" => Ok(StepStatus::Error),
            "skipped" => Ok(StepStatus::Skipped),
            "paused" => Ok(StepStatus::Paused),
            "canceled" => Ok(StepStatus::Canceled),
            "retrying" => Ok(StepStatus::Retrying),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// Origin / destination platform tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Tiktok,
    YoutubeShorts,
    InstagramReels,
    VkClips,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Tiktok => "tiktok",
            Platform::YoutubeShorts => "youtube_shorts",
            Platform::InstagramReels => "instagram_reels",
            Platform::VkClips => "vk_clips",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tiktok" => Ok(Platform::Tiktok),
            "youtube_shorts" => Ok(Platform::YoutubeShorts),
            "instagram_reels" => Ok(Platform::InstagramReels),
            "vk_clips" => Ok(Platform::VkClips),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor for a binary artifact stored on the content-addressed object
/// store. `uri` is opaque to everything except the object store itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    pub uri: String,
    pub mime: String,
    pub bytes: u64,
    pub sha256: String,
}

/// One entry of a task's artifact map. The JSON representation stays an open
/// bag: blobs are objects with a `uri` field, text artifacts are plain
/// strings, everything else round-trips as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtifactValue {
    Blob(BlobDescriptor),
    Text(String),
    Scalar(Value),
}

impl ArtifactValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ArtifactValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&BlobDescriptor> {
        match self {
            ArtifactValue::Blob(d) => Some(d),
            _ => None,
        }
    }
}

/// Artifact map keyed by artifact kind (`source_video`, `transcript`, …).
/// BTreeMap keeps the persisted JSON stable across round-trips.
pub type ArtifactMap = BTreeMap<String, ArtifactValue>;

/// Well-known artifact kinds produced by the built-in tools. The map itself
/// is open; these constants only keep call sites typo-free.
pub mod artifact_kind {
    pub const SOURCE_VIDEO: &str = "source_video";
    pub const TRANSCRIPT: &str = "transcript";
    pub const SCRIPT_ANALYSIS: &str = "script_analysis";
    pub const SCRIPT: &str = "script";
    pub const CAPTIONS_DRAFT: &str = "captions_draft";
    pub const BURNED_VIDEO: &str = "burned_video";
    pub const THUMBNAIL: &str = "thumbnail";
    pub const QC_REPORT: &str = "qc_report";
    pub const PUBLISHED_URL: &str = "published_url";
    pub const PUBLISHED_EXTERNAL_ID: &str = "published_external_id";

    /// Prefix under which `supports_preview` runs write their outputs.
    pub const PREVIEW_PREFIX: &str = "preview/";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub name: String,
    /// Opaque policy document; the topic guard reads
    /// `topic_repeat_window` / `topic_repeat_days` out of it when present.
    pub policy: Value,
    pub feed_settings: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: i64,
    pub project_id: i64,
    pub platform: Platform,
    pub platform_video_id: String,
    pub url: Option<String>,
    pub author: Option<String>,
    pub title: Option<String>,
    pub caption: Option<String>,
    pub thumbnail_url: Option<String>,
    pub source_published_at: Option<DateTime<Utc>>,
    pub views: Option<i64>,
    pub likes: Option<i64>,
    pub comments: Option<i64>,
    pub shares: Option<i64>,
    pub subscribers: Option<i64>,
    pub virality_score: Option<f64>,
    pub virality_factors: Option<Value>,
    pub status: CandidateStatus,
    pub manual_rating: Option<i16>,
    pub notes: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub linked_publish_task_id: Option<i64>,
    /// Free-form metadata bag. Conventional keys: `content_signature`,
    /// `topic_tags`, `topic_signature`, `script_analysis`.
    pub meta: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Candidate {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    pub fn set_meta(&mut self, key: &str, value: Value) {
        if !self.meta.is_object() {
            self.meta = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.meta.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    pub fn content_signature(&self) -> Option<&str> {
        self.meta_str("content_signature").filter(|s| !s.is_empty())
    }

    pub fn topic_signature(&self) -> Option<&str> {
        self.meta_str("topic_signature").filter(|s| !s.is_empty())
    }
}

/// One step of a preset: which tool to run and with which overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetStep {
    pub tool_id: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub requires_moderation: bool,
    pub order_index: i32,
}

/// Ordered list of tool steps. Immutable once referenced by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: i64,
    pub name: String,
    pub steps: Vec<PresetStep>,
}

impl Preset {
    /// Steps sorted by order index; the executor's step index `i` refers to
    /// a position in this slice.
    pub fn ordered_steps(&self) -> Vec<&PresetStep> {
        let mut steps: Vec<&PresetStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order_index);
        steps
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishTask {
    pub id: i64,
    pub project_id: i64,
    pub candidate_id: i64,
    pub preset_id: i64,
    pub status: TaskStatus,
    /// Destination platform this task publishes to.
    pub target_platform: Platform,
    /// Higher runs sooner; FIFO by creation time within a priority.
    pub priority: i32,
    /// Dispatcher attempt counter (0 on first run). Authoritative retry
    /// state; the 9998 fence rows are diagnostics only.
    pub attempt: i32,
    pub artifacts: ArtifactMap,
    /// Diagnostics bag written by the executor (step timings, preview keys).
    pub dag_debug: Value,
    pub error_message: Option<String>,
    pub publish_error: Option<String>,
    pub pause_requested_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Exclusive-write claim of the worker currently processing this row.
    pub lease_id: Option<Uuid>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_finished_at: Option<DateTime<Utc>>,
    /// Earliest instant a retried task becomes claimable again.
    pub retry_at: Option<DateTime<Utc>>,
    /// Highest step index a moderator has approved; -1 means none.
    pub moderation_approved_through: i32,
    pub published_url: Option<String>,
    pub published_external_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_views: Option<i64>,
    pub last_likes: Option<i64>,
    pub last_comments: Option<i64>,
    pub last_shares: Option<i64>,
    pub last_metrics_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PublishTask {
    pub fn awaiting_moderation(&self) -> bool {
        self.status == TaskStatus::Paused
            && self
                .pause_reason
                .as_deref()
                .is_some_and(|r| r == PAUSE_REASON_MODERATION)
    }
}

/// Pause reason recorded when the moderation gate pauses a task.
pub const PAUSE_REASON_MODERATION: &str = "awaiting moderation";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub id: i64,
    pub task_id: i64,
    pub step_index: i32,
    pub tool_id: String,
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error_message: Option<String>,
}

/// Fields of a step-result row to append; ids and ordering are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct NewStepResult {
    pub task_id: i64,
    pub step_index: i32,
    pub tool_id: String,
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error_message: Option<String>,
}

/// Normalized safe-area rectangle (fractions of frame dimensions).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeArea {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Target-platform encoding contract consumed by encode/publish steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProfile {
    pub id: i64,
    pub name: String,
    pub target_platform: Platform,
    pub width: i32,
    pub height: i32,
    pub fps: i32,
    pub video_codec: String,
    pub video_bitrate_kbps: i32,
    pub audio_codec: String,
    pub audio_bitrate_kbps: i32,
    pub pix_fmt: Option<String>,
    pub safe_area: Option<SafeArea>,
    /// Platform hard limit.
    pub max_duration_sec: i32,
    /// Target duration for generation.
    pub recommended_duration_sec: i32,
    pub is_builtin: bool,
}

/// Append-only snapshot of external metrics for a published task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedVideoMetric {
    pub id: i64,
    pub task_id: i64,
    pub candidate_id: Option<i64>,
    pub platform: Platform,
    pub external_id: Option<String>,
    pub views: Option<i64>,
    pub likes: Option<i64>,
    pub comments: Option<i64>,
    pub shares: Option<i64>,
    pub snapshot_at: DateTime<Utc>,
    pub hours_since_publish: Option<i32>,
    pub raw_data: Option<Value>,
}

/// External metrics payload handed to `record_metrics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub views: Option<i64>,
    pub likes: Option<i64>,
    pub comments: Option<i64>,
    pub shares: Option<i64>,
    pub raw_data: Option<Value>,
}

/// Filters for task listing; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub project_id: Option<i64>,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_through_str() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Published,
            TaskStatus::Error,
            TaskStatus::Canceled,
            TaskStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn candidate_status_advances_monotonically() {
        use CandidateStatus::*;
        assert!(New.can_advance_to(Approved));
        assert!(Approved.can_advance_to(Used));
        assert!(New.can_advance_to(Rejected));
        assert!(Approved.can_advance_to(Rejected));
        assert!(!Used.can_advance_to(Approved));
        assert!(!Approved.can_advance_to(New));
        assert!(!Rejected.can_advance_to(Approved));
        assert!(Used.can_advance_to(Used));
    }

    #[test]
    fn artifact_value_json_shapes_round_trip() {
        let blob = ArtifactValue::Blob(BlobDescriptor {
            uri: "objects/ab/abcd".into(),
            mime: "video/mp4".into(),
            bytes: 1024,
            sha256: "abcd".into(),
        });
        let text = ArtifactValue::Text("hello".into());
        let scalar = ArtifactValue::Scalar(serde_json::json!(42));

        for value in [blob, text, scalar] {
            let json = serde_json::to_string(&value).unwrap();
            let back: ArtifactValue = serde_json::from_str(&json).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn blob_json_is_an_object_with_uri() {
        let json = serde_json::json!({
            "uri": "objects/12/1234",
            "mime": "video/mp4",
            "bytes": 10,
            "sha256": "1234"
        });
        let parsed: ArtifactValue = serde_json::from_value(json).unwrap();
        assert!(parsed.as_blob().is_some());
    }

    #[test]
    fn sentinel_range_is_closed() {
        assert!(is_sentinel_step_index(STEP_INDEX_CONTROL));
        assert!(is_sentinel_step_index(STEP_INDEX_TERMINAL));
        assert!(!is_sentinel_step_index(0));
        assert!(!is_sentinel_step_index(9995));
    }

    #[test]
    fn error_message_truncation_respects_char_boundaries() {
        let msg = "é".repeat(800);
        let truncated = truncate_error_message(&msg);
        assert!(truncated.len() <= MAX_ERROR_MESSAGE_LEN);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn ordered_steps_sorts_by_order_index() {
        let preset = Preset {
            id: 1,
            name: "p".into(),
            steps: vec![
                PresetStep {
                    tool_id: "B".into(),
                    params: Value::Null,
                    requires_moderation: false,
                    order_index: 2,
                },
                PresetStep {
                    tool_id: "A".into(),
                    params: Value::Null,
                    requires_moderation: false,
                    order_index: 1,
                },
            ],
        };
        let ordered = preset.ordered_steps();
        assert_eq!(ordered[0].tool_id, "A");
        assert_eq!(ordered[1].tool_id, "B");
    }
}
