//! End-to-end pipeline scenarios over the in-memory store and semaphore:
//! happy path, cooperative cancel, duplicate/topic rejection, retry with
//! resume, moderation gating, preview, watchdog reclaim and semaphore
//! saturation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use clipflow::clipflow_core::domain::{
    ArtifactMap, ArtifactValue, CandidateStatus, ExportProfile, Platform, PresetStep,
    PublishTask, STEP_INDEX_CONTROL, STEP_INDEX_RETRY_FENCE, STEP_INDEX_TERMINAL, StepStatus,
    TaskStatus, artifact_kind,
};
use clipflow::clipflow_core::error::ToolError;
use clipflow::clipflow_core::llm::StubLlmProvider;
use clipflow::clipflow_core::publisher::StubPublisherAdapter;
use clipflow::clipflow_core::registry::{
    ResourceClass, ToolContext, ToolHandler, ToolInvocation, ToolSpec,
};
use clipflow::{
    EnqueueError, MemorySemaphore, MemoryStore, Notifier, ObjectStore, PipelineEngine, Settings,
    Store, ToolRegistry,
};

struct Harness {
    engine: Arc<PipelineEngine>,
    store: Arc<MemoryStore>,
    semaphore: Arc<MemorySemaphore>,
    _objects_dir: TempDir,
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.worker_concurrency = 4;
    settings.poll_interval_ms = 50;
    settings.semaphore_wait_timeout_secs = 5;
    settings.normalize();
    settings
}

fn build_harness(registry: ToolRegistry) -> Harness {
    let objects_dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    store.add_export_profile(ExportProfile {
        id: 1,
        name: "TikTok 9:16".into(),
        target_platform: Platform::Tiktok,
        width: 1080,
        height: 1920,
        fps: 30,
        video_codec: "h264".into(),
        video_bitrate_kbps: 8000,
        audio_codec: "aac".into(),
        audio_bitrate_kbps: 128,
        pix_fmt: Some("yuv420p".into()),
        safe_area: None,
        max_duration_sec: 180,
        recommended_duration_sec: 55,
        is_builtin: true,
    });
    let semaphore = Arc::new(MemorySemaphore::new());
    let engine = Arc::new(PipelineEngine::new(
        store.clone(),
        semaphore.clone(),
        Arc::new(registry),
        Arc::new(Notifier::disabled()),
        ObjectStore::new(objects_dir.path()),
        Arc::new(StubLlmProvider),
        Arc::new(StubPublisherAdapter),
        Arc::new(test_settings()),
    ));
    Harness {
        engine,
        store,
        semaphore,
        _objects_dir: objects_dir,
    }
}

async fn seed_candidate(harness: &Harness, title: &str, video_id: &str) -> (i64, i64) {
    let store = &harness.store;
    let project = store
        .create_project("demo", json!({}), json!({}))
        .await
        .unwrap();
    let candidate = store
        .insert_candidate(clipflow::NewCandidate {
            project_id: project.id,
            platform: Platform::Tiktok,
            platform_video_id: video_id.into(),
            url: Some(format!("https://source.example/{video_id}")),
            title: Some(title.into()),
            caption: Some(format!("{title} — full story inside")),
            meta: json!({}),
        })
        .await
        .unwrap();
    store
        .set_candidate_status(candidate.id, CandidateStatus::Approved)
        .await
        .unwrap();
    (project.id, candidate.id)
}

fn standard_steps(tool_ids: &[&str]) -> Vec<PresetStep> {
    tool_ids
        .iter()
        .enumerate()
        .map(|(index, tool_id)| PresetStep {
            tool_id: (*tool_id).to_string(),
            params: json!({}),
            requires_moderation: false,
            order_index: index as i32,
        })
        .collect()
}

const STANDARD_PRESET: &[&str] = &[
    "T01_INGEST",
    "A01_SCRIPT_ANALYSIS",
    "G01_SCRIPT",
    "E01_BURN",
    "T18_QC",
    "P01_PUBLISH",
];

/// Claim/run the task until it settles, collapsing retry backoff so tests
/// do not wait wall-clock minutes.
async fn drive_to_settled(harness: &Harness, task_id: i64) -> PublishTask {
    let lease = Uuid::new_v4();
    for _ in 0..32 {
        let task = harness
            .store
            .get_task(task_id)
            .await
            .unwrap()
            .expect("task exists");
        match task.status {
            TaskStatus::Queued => {
                if task.retry_at.is_some() {
                    harness
                        .store
                        .requeue_task(task_id, task.attempt, None)
                        .await
                        .unwrap();
                }
                if let Some(claimed) = harness.store.claim_next_task(lease).await.unwrap() {
                    harness.engine.run_claimed_task(&claimed).await.unwrap();
                }
            }
            _ => return task,
        }
    }
    panic!("task {task_id} did not settle");
}

fn ok_indexes(rows: &[clipflow::clipflow_core::domain::StepResult]) -> Vec<i32> {
    rows.iter()
        .filter(|r| r.status == StepStatus::Ok && r.step_index < STEP_INDEX_CONTROL)
        .map(|r| r.step_index)
        .collect()
}

// -- custom tools used by individual scenarios ------------------------------

struct CountingNoop {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolHandler for CountingNoop {
    async fn handle(
        &self,
        _ctx: &ToolContext,
        _invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ArtifactMap::new())
    }
}

fn counting_spec() -> ToolSpec {
    ToolSpec {
        tool_id: "TEST_COUNT",
        name: "Counting no-op",
        resource_class: ResourceClass::None,
        inputs: &[],
        outputs: &[],
        default_params: json!({}),
        param_schema: json!({}),
        supports_preview: false,
        supports_retry: false,
        supports_manual_edit: false,
    }
}

struct FlakyOnce {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolHandler for FlakyOnce {
    async fn handle(
        &self,
        _ctx: &ToolContext,
        _invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ToolError::transient("upstream 503"));
        }
        Ok(ArtifactMap::new())
    }
}

fn flaky_spec() -> ToolSpec {
    ToolSpec {
        tool_id: "TEST_FLAKY",
        name: "Fails once then succeeds",
        resource_class: ResourceClass::None,
        inputs: &[],
        outputs: &[],
        default_params: json!({}),
        param_schema: json!({}),
        supports_preview: false,
        supports_retry: false,
        supports_manual_edit: false,
    }
}

struct CancelTrigger;

#[async_trait]
impl ToolHandler for CancelTrigger {
    async fn handle(
        &self,
        ctx: &ToolContext,
        invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        ctx.store
            .request_cancel(invocation.task.id, "user abort")
            .await
            .map_err(|e| ToolError::transient(e.to_string()))?;
        Ok(ArtifactMap::new())
    }
}

fn cancel_trigger_spec() -> ToolSpec {
    ToolSpec {
        tool_id: "TEST_CANCEL_TRIGGER",
        name: "Requests cancel mid-flight",
        resource_class: ResourceClass::None,
        inputs: &[],
        outputs: &[],
        default_params: json!({}),
        param_schema: json!({}),
        supports_preview: false,
        supports_retry: false,
        supports_manual_edit: false,
    }
}

struct SlowWhisper;

#[async_trait]
impl ToolHandler for SlowWhisper {
    async fn handle(
        &self,
        _ctx: &ToolContext,
        _invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut outputs = ArtifactMap::new();
        outputs.insert(
            artifact_kind::TRANSCRIPT.to_string(),
            ArtifactValue::Text("slow transcript".into()),
        );
        Ok(outputs)
    }
}

fn slow_whisper_spec() -> ToolSpec {
    ToolSpec {
        tool_id: "TEST_SLOW_WHISPER",
        name: "Slow transcription",
        resource_class: ResourceClass::Whisper,
        inputs: &[artifact_kind::SOURCE_VIDEO],
        outputs: &[artifact_kind::TRANSCRIPT],
        default_params: json!({}),
        param_schema: json!({}),
        supports_preview: false,
        supports_retry: true,
        supports_manual_edit: false,
    }
}

struct DirectPublish;

#[async_trait]
impl ToolHandler for DirectPublish {
    async fn handle(
        &self,
        _ctx: &ToolContext,
        invocation: ToolInvocation,
    ) -> Result<ArtifactMap, ToolError> {
        let mut outputs = ArtifactMap::new();
        outputs.insert(
            artifact_kind::PUBLISHED_URL.to_string(),
            ArtifactValue::Text(format!("https://videos.example/t{}", invocation.task.id)),
        );
        outputs.insert(
            artifact_kind::PUBLISHED_EXTERNAL_ID.to_string(),
            ArtifactValue::Text(format!("ext-{}", invocation.task.id)),
        );
        Ok(outputs)
    }
}

fn direct_publish_spec() -> ToolSpec {
    ToolSpec {
        tool_id: "TEST_DIRECT_PUBLISH",
        name: "Direct publish",
        resource_class: ResourceClass::None,
        inputs: &[artifact_kind::TRANSCRIPT],
        outputs: &[
            artifact_kind::PUBLISHED_URL,
            artifact_kind::PUBLISHED_EXTERNAL_ID,
        ],
        default_params: json!({}),
        param_schema: json!({}),
        supports_preview: false,
        supports_retry: true,
        supports_manual_edit: false,
    }
}

// -- scenarios --------------------------------------------------------------

#[tokio::test]
async fn happy_path_publishes_with_all_step_results() {
    let harness = build_harness(ToolRegistry::builtin());
    let (_, candidate_id) = seed_candidate(&harness, "Perfect pasta in five steps", "v1").await;
    let preset = harness
        .store
        .create_preset("standard", standard_steps(STANDARD_PRESET))
        .await
        .unwrap();

    let task = harness
        .engine
        .enqueue(candidate_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);

    let settled = drive_to_settled(&harness, task.id).await;
    assert_eq!(settled.status, TaskStatus::Published);
    assert!(settled.published_url.as_deref().is_some_and(|u| !u.is_empty()));
    assert!(settled.published_external_id.is_some());
    assert!(settled.artifacts.contains_key(artifact_kind::PUBLISHED_URL));
    assert!(
        settled
            .artifacts
            .contains_key(artifact_kind::PUBLISHED_EXTERNAL_ID)
    );

    let rows = harness.store.step_results(task.id).await.unwrap();
    assert_eq!(ok_indexes(&rows), vec![0, 1, 2, 3, 4, 5]);
    assert!(
        rows.iter()
            .any(|r| r.step_index == STEP_INDEX_TERMINAL && r.status == StepStatus::Ok)
    );

    // The candidate was consumed by the publish step.
    let candidate = harness
        .store
        .get_candidate(candidate_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(candidate.status, CandidateStatus::Used);
}

#[tokio::test]
async fn cancel_mid_flight_stops_at_next_checkpoint() {
    let mut registry = ToolRegistry::builtin();
    registry.register(cancel_trigger_spec(), Arc::new(CancelTrigger));
    let harness = build_harness(registry);
    let (_, candidate_id) = seed_candidate(&harness, "Cancel me", "v1").await;
    let preset = harness
        .store
        .create_preset(
            "cancels",
            standard_steps(&["T01_INGEST", "TEST_CANCEL_TRIGGER", "A01_SCRIPT_ANALYSIS"]),
        )
        .await
        .unwrap();

    let task = harness
        .engine
        .enqueue(candidate_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();
    let settled = drive_to_settled(&harness, task.id).await;

    assert_eq!(settled.status, TaskStatus::Canceled);
    assert!(settled.canceled_at.is_some());
    assert_eq!(settled.cancel_reason.as_deref(), Some("user abort"));

    let rows = harness.store.step_results(task.id).await.unwrap();
    let control = rows
        .iter()
        .find(|r| r.step_index == STEP_INDEX_CONTROL)
        .expect("control sentinel row");
    assert_eq!(control.tool_id, "CONTROL");
    assert_eq!(control.status, StepStatus::Canceled);
    // Nothing ran past the checkpoint.
    assert!(rows.iter().all(|r| r.step_index != 2));
}

#[tokio::test]
async fn cancel_wins_over_pause() {
    let harness = build_harness(ToolRegistry::builtin());
    let (_, candidate_id) = seed_candidate(&harness, "Race control flags", "v1").await;
    let preset = harness
        .store
        .create_preset("standard", standard_steps(STANDARD_PRESET))
        .await
        .unwrap();
    let task = harness
        .engine
        .enqueue(candidate_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();

    assert!(harness.engine.request_cancel(task.id, "abort").await.unwrap());
    assert!(harness.engine.request_pause(task.id, "pause 1").await.unwrap());
    assert!(harness.engine.request_pause(task.id, "pause 2").await.unwrap());

    let settled = drive_to_settled(&harness, task.id).await;
    assert_eq!(settled.status, TaskStatus::Canceled);
}

#[tokio::test]
async fn pause_then_resume_continues_from_pending_step() {
    let harness = build_harness(ToolRegistry::builtin());
    let (_, candidate_id) = seed_candidate(&harness, "Pause and resume", "v1").await;
    let preset = harness
        .store
        .create_preset("standard", standard_steps(STANDARD_PRESET))
        .await
        .unwrap();
    let task = harness
        .engine
        .enqueue(candidate_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();

    harness.engine.request_pause(task.id, "hold on").await.unwrap();
    let settled = drive_to_settled(&harness, task.id).await;
    assert_eq!(settled.status, TaskStatus::Paused);
    assert!(settled.paused_at.is_some());

    assert!(harness.engine.resume(task.id).await.unwrap());
    let settled = drive_to_settled(&harness, task.id).await;
    assert_eq!(settled.status, TaskStatus::Published);
}

#[tokio::test]
async fn duplicate_content_is_rejected_at_enqueue() {
    let harness = build_harness(ToolRegistry::builtin());
    let (project_id, first_id) = seed_candidate(&harness, "Identical transcript", "v1").await;
    let preset = harness
        .store
        .create_preset("standard", standard_steps(STANDARD_PRESET))
        .await
        .unwrap();
    harness
        .engine
        .enqueue(first_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();

    // Same project, same text, different platform video id.
    let duplicate = harness
        .store
        .insert_candidate(clipflow::NewCandidate {
            project_id,
            platform: Platform::Tiktok,
            platform_video_id: "v2".into(),
            url: None,
            title: Some("Identical transcript".into()),
            caption: Some("Identical transcript — full story inside".into()),
            meta: json!({}),
        })
        .await
        .unwrap();
    harness
        .store
        .set_candidate_status(duplicate.id, CandidateStatus::Approved)
        .await
        .unwrap();

    let result = harness
        .engine
        .enqueue(duplicate.id, preset.id, Platform::Tiktok, 0)
        .await;
    match result {
        Err(EnqueueError::DuplicateContent { duplicate_of, .. }) => {
            assert_eq!(duplicate_of, first_id);
        }
        other => panic!("expected DuplicateContent, got {other:?}"),
    }
    // No task row was created for the duplicate.
    let tasks = harness
        .store
        .list_tasks(&Default::default())
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
}

#[tokio::test]
async fn repeated_topic_is_rejected_within_window() {
    let harness = build_harness(ToolRegistry::builtin());
    let (project_id, first_id) = seed_candidate(&harness, "Sourdough basics", "v1").await;
    harness
        .store
        .update_candidate_meta(
            first_id,
            json!({"keywords": ["sourdough", "baking", "starter"]}),
        )
        .await
        .unwrap();
    let preset = harness
        .store
        .create_preset("standard", standard_steps(STANDARD_PRESET))
        .await
        .unwrap();
    let first_task = harness
        .engine
        .enqueue(first_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();
    let settled = drive_to_settled(&harness, first_task.id).await;
    assert_eq!(settled.status, TaskStatus::Published);

    let second = harness
        .store
        .insert_candidate(clipflow::NewCandidate {
            project_id,
            platform: Platform::Tiktok,
            platform_video_id: "v2".into(),
            url: None,
            title: Some("Completely different title".into()),
            caption: None,
            meta: json!({"keywords": ["Baking", "SOURDOUGH", "starter"]}),
        })
        .await
        .unwrap();
    harness
        .store
        .set_candidate_status(second.id, CandidateStatus::Approved)
        .await
        .unwrap();

    let result = harness
        .engine
        .enqueue(second.id, preset.id, Platform::Tiktok, 0)
        .await;
    assert!(matches!(result, Err(EnqueueError::TopicRepeat { .. })));

    // Outside the window the same topic is fine again.
    harness
        .store
        .backdate_published_for_tests(first_task.id, Utc::now() - chrono::Duration::days(30));
    harness
        .engine
        .enqueue(second.id, preset.id, Platform::Tiktok, 0)
        .await
        .expect("stale topic publishes again");
}

#[tokio::test]
async fn transient_failure_retries_and_resumes_without_rerunning_ok_steps() {
    let count_calls = Arc::new(AtomicUsize::new(0));
    let flaky_calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::builtin();
    registry.register(
        counting_spec(),
        Arc::new(CountingNoop {
            calls: count_calls.clone(),
        }),
    );
    registry.register(
        flaky_spec(),
        Arc::new(FlakyOnce {
            calls: flaky_calls.clone(),
        }),
    );
    let harness = build_harness(registry);
    let (_, candidate_id) = seed_candidate(&harness, "Retry survivor", "v1").await;
    let preset = harness
        .store
        .create_preset(
            "flaky",
            standard_steps(&[
                "T01_INGEST",
                "TEST_COUNT",
                "TEST_FLAKY",
                "A01_SCRIPT_ANALYSIS",
                "G01_SCRIPT",
                "E01_BURN",
                "T18_QC",
                "P01_PUBLISH",
            ]),
        )
        .await
        .unwrap();
    let task = harness
        .engine
        .enqueue(candidate_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();

    let settled = drive_to_settled(&harness, task.id).await;
    assert_eq!(settled.status, TaskStatus::Published);
    assert_eq!(settled.attempt, 1, "one retry consumed");

    // Steps before the flaky one ran exactly once; the flaky one twice.
    assert_eq!(count_calls.load(Ordering::SeqCst), 1);
    assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);

    let rows = harness.store.step_results(task.id).await.unwrap();
    let at_flaky: Vec<StepStatus> = rows
        .iter()
        .filter(|r| r.step_index == 2)
        .map(|r| r.status)
        .collect();
    assert_eq!(at_flaky, vec![StepStatus::Error, StepStatus::Ok]);
    assert!(
        rows.iter()
            .any(|r| r.step_index == STEP_INDEX_RETRY_FENCE && r.status == StepStatus::Retrying)
    );
}

#[tokio::test]
async fn moderation_gate_pauses_until_approved() {
    let harness = build_harness(ToolRegistry::builtin());
    let (_, candidate_id) = seed_candidate(&harness, "Needs a human eye", "v1").await;

    let mut steps = standard_steps(STANDARD_PRESET);
    steps[2].requires_moderation = true; // G01_SCRIPT
    let preset = harness.store.create_preset("moderated", steps).await.unwrap();
    let task = harness
        .engine
        .enqueue(candidate_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();

    let settled = drive_to_settled(&harness, task.id).await;
    assert_eq!(settled.status, TaskStatus::Paused);
    assert!(settled.awaiting_moderation());

    assert!(harness.engine.approve_moderation(task.id, 2).await.unwrap());
    let settled = drive_to_settled(&harness, task.id).await;
    assert_eq!(settled.status, TaskStatus::Published);
}

#[tokio::test]
async fn preview_writes_side_channel_only() {
    let harness = build_harness(ToolRegistry::builtin());
    let (_, candidate_id) = seed_candidate(&harness, "Preview me", "v1").await;
    let preset = harness
        .store
        .create_preset("standard", standard_steps(STANDARD_PRESET))
        .await
        .unwrap();
    let task = harness
        .engine
        .enqueue(candidate_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();
    let settled = drive_to_settled(&harness, task.id).await;
    assert_eq!(settled.status, TaskStatus::Published);
    let canonical_script = settled.artifacts.get(artifact_kind::SCRIPT).cloned();

    // G01_SCRIPT is the preview-capable step (index 2).
    let outputs = harness.engine.run_preview(task.id, 2).await.unwrap();
    assert!(outputs.contains_key(artifact_kind::SCRIPT));

    let after = harness.store.get_task(task.id).await.unwrap().unwrap();
    assert!(after.artifacts.contains_key("preview/script"));
    assert!(after.artifacts.contains_key("preview/captions_draft"));
    assert_eq!(after.artifacts.get(artifact_kind::SCRIPT).cloned(), canonical_script);

    // Preview leaves the step log untouched.
    let rows = harness.store.step_results(task.id).await.unwrap();
    assert_eq!(
        rows.iter().filter(|r| r.step_index == 2).count(),
        1,
        "no extra step result from preview"
    );
}

#[tokio::test]
async fn watchdog_reclaims_stale_processing_task() {
    let harness = build_harness(ToolRegistry::builtin());
    let (_, candidate_id) = seed_candidate(&harness, "Crashed worker", "v1").await;
    let preset = harness
        .store
        .create_preset("standard", standard_steps(STANDARD_PRESET))
        .await
        .unwrap();
    let task = harness
        .engine
        .enqueue(candidate_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();

    // A worker claims the task and dies: status stays processing, the lease
    // goes stale, no step results appear.
    let claimed = harness
        .store
        .claim_next_task(Uuid::new_v4())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, task.id);
    harness
        .store
        .backdate_processing_for_tests(task.id, Utc::now() - chrono::Duration::hours(8));

    let dry = harness.engine.run_watchdog(true).await.unwrap();
    assert_eq!(dry.findings.len(), 1);
    // Dry run mutates nothing.
    let still = harness.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(still.status, TaskStatus::Processing);

    let report = harness.engine.run_watchdog(false).await.unwrap();
    assert_eq!(report.findings.len(), 1);
    let reclaimed = harness.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status, TaskStatus::Queued);

    // The reclaimed task runs to completion on a healthy worker.
    let settled = drive_to_settled(&harness, task.id).await;
    assert_eq!(settled.status, TaskStatus::Published);
}

#[tokio::test]
async fn semaphore_caps_concurrent_whisper_steps_across_workers() {
    let mut registry = ToolRegistry::builtin();
    registry.register(slow_whisper_spec(), Arc::new(SlowWhisper));
    registry.register(direct_publish_spec(), Arc::new(DirectPublish));
    let harness = build_harness(registry);

    let (project_id, first_id) =
        seed_candidate(&harness, "Saturation zero", "v0").await;
    let preset = harness
        .store
        .create_preset(
            "whisper-bound",
            standard_steps(&["T01_INGEST", "TEST_SLOW_WHISPER", "TEST_DIRECT_PUBLISH"]),
        )
        .await
        .unwrap();

    let mut task_ids = Vec::new();
    let first_task = harness
        .engine
        .enqueue(first_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();
    task_ids.push(first_task.id);
    for i in 1..5 {
        let candidate = harness
            .store
            .insert_candidate(clipflow::NewCandidate {
                project_id,
                platform: Platform::Tiktok,
                platform_video_id: format!("v{i}"),
                url: None,
                title: Some(format!("Saturation clip number {i}")),
                caption: None,
                meta: json!({}),
            })
            .await
            .unwrap();
        harness
            .store
            .set_candidate_status(candidate.id, CandidateStatus::Approved)
            .await
            .unwrap();
        let task = harness
            .engine
            .enqueue(candidate.id, preset.id, Platform::Tiktok, i)
            .await
            .unwrap();
        task_ids.push(task.id);
    }

    // Run the real worker pool; probe the semaphore while it works.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pool = {
        let engine = harness.engine.clone();
        tokio::spawn(async move { engine.run_worker_pool(shutdown_rx).await })
    };

    let mut max_live = 0usize;
    for _ in 0..600 {
        max_live = max_live.max(harness.semaphore.live_tokens("whisper"));
        let mut all_done = true;
        for id in &task_ids {
            let task = harness.store.get_task(*id).await.unwrap().unwrap();
            if task.status != TaskStatus::Published {
                all_done = false;
                break;
            }
        }
        if all_done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown_tx.send(true).unwrap();
    pool.await.unwrap();

    assert!(max_live <= 1, "whisper semaphore over-admitted: {max_live}");
    for id in task_ids {
        let task = harness.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Published, "task {id}");
        assert!(task.published_url.is_some());
    }
}

#[tokio::test]
async fn replay_from_last_ok_step_is_idempotent() {
    let harness = build_harness(ToolRegistry::builtin());
    let (_, candidate_id) = seed_candidate(&harness, "Replay equivalence", "v1").await;
    let preset = harness
        .store
        .create_preset("standard", standard_steps(STANDARD_PRESET))
        .await
        .unwrap();
    let task = harness
        .engine
        .enqueue(candidate_id, preset.id, Platform::Tiktok, 0)
        .await
        .unwrap();
    let settled = drive_to_settled(&harness, task.id).await;
    assert_eq!(settled.status, TaskStatus::Published);
    let first_map = serde_json::to_value(&settled.artifacts).unwrap();

    // Force a replay: the executor starts past the last ok step (all of
    // them), re-derives the terminal state, and the map is unchanged.
    harness
        .store
        .requeue_task(task.id, settled.attempt, None)
        .await
        .unwrap();
    let replayed = drive_to_settled(&harness, task.id).await;
    assert_eq!(replayed.status, TaskStatus::Published);
    assert_eq!(serde_json::to_value(&replayed.artifacts).unwrap(), first_map);

    // The terminal marker is fence-protected: the replay must not commit a
    // second ok row at the terminal index.
    let rows = harness.store.step_results(task.id).await.unwrap();
    assert_eq!(
        rows.iter()
            .filter(|r| r.step_index == STEP_INDEX_TERMINAL && r.status == StepStatus::Ok)
            .count(),
        1
    );
}
