use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime configuration, hydrated from the environment once at startup.
/// There is no live reload; workers restart to pick up changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub database_url: String,
    pub redis_url: String,
    /// Root directory of the content-addressed object store.
    pub object_store_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_keep_last: usize,
    pub notify_token: Option<String>,
    pub notify_chat_id: Option<String>,
    /// Semaphore token TTL. Must exceed the 99th-percentile step wall-clock,
    /// otherwise a live step can lose its slot.
    pub semaphore_ttl_secs: u64,
    pub semaphore_wait_timeout_secs: u64,
    /// Per-resource-class concurrency caps shared across all workers.
    pub semaphore_limits: HashMap<String, u32>,
    /// Concurrent executor loops per worker process.
    pub worker_concurrency: usize,
    /// Idle delay between claim attempts when the queue is empty.
    pub poll_interval_ms: u64,
    /// Hard wall-clock limit per dispatcher attempt.
    pub hard_attempt_limit_secs: u64,
    /// Soft limit; surfaces as a graceful checkpoint at a step boundary.
    pub soft_attempt_limit_secs: u64,
    /// Text artifacts at or below this size stay inline in the artifact map.
    pub inline_text_cap_bytes: usize,
    /// Watchdog scan interval.
    pub watchdog_interval_secs: u64,
    /// A queued task older than this with no claim triggers a warn alert.
    pub queue_sla_secs: u64,
    /// No step-result written within this window counts as a stale step.
    pub stale_step_threshold_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/clipflow".into(),
            redis_url: "redis://127.0.0.1:6379/0".into(),
            object_store_dir: PathBuf::from("./data/objects"),
            backup_dir: PathBuf::from("./data/backups"),
            backup_keep_last: 7,
            notify_token: None,
            notify_chat_id: None,
            semaphore_ttl_secs: 2 * 3600,
            semaphore_wait_timeout_secs: 15 * 60,
            semaphore_limits: default_semaphore_limits(),
            worker_concurrency: 2,
            poll_interval_ms: 1000,
            hard_attempt_limit_secs: 6 * 3600,
            soft_attempt_limit_secs: 5 * 3600,
            inline_text_cap_bytes: 64 * 1024,
            watchdog_interval_secs: 5 * 60,
            queue_sla_secs: 30 * 60,
            stale_step_threshold_secs: 45 * 60,
        }
    }
}

fn default_semaphore_limits() -> HashMap<String, u32> {
    HashMap::from([
        ("whisper".to_string(), 1),
        ("ffmpeg".to_string(), 2),
        ("llm".to_string(), 4),
    ])
}

impl Settings {
    /// Build settings from environment variables, falling back to defaults
    /// for anything unset. `.env` files are honoured by the binaries before
    /// this is called.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        let mut settings = Settings {
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: env_string("REDIS_URL").unwrap_or(defaults.redis_url),
            object_store_dir: env_string("OBJECT_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.object_store_dir),
            backup_dir: env_string("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_dir),
            backup_keep_last: env_parse("BACKUP_KEEP_LAST").unwrap_or(defaults.backup_keep_last),
            notify_token: env_string("NOTIFY_BOT_TOKEN"),
            notify_chat_id: env_string("NOTIFY_CHAT_ID"),
            semaphore_ttl_secs: env_parse("SEMAPHORE_TTL_SEC").unwrap_or(defaults.semaphore_ttl_secs),
            semaphore_wait_timeout_secs: env_parse("SEMAPHORE_WAIT_TIMEOUT_SEC")
                .unwrap_or(defaults.semaphore_wait_timeout_secs),
            semaphore_limits: semaphore_limits_from_env()
                .unwrap_or(defaults.semaphore_limits),
            worker_concurrency: env_parse("WORKER_CONCURRENCY").unwrap_or(defaults.worker_concurrency),
            poll_interval_ms: env_parse("POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval_ms),
            hard_attempt_limit_secs: env_parse("HARD_ATTEMPT_LIMIT_SEC")
                .unwrap_or(defaults.hard_attempt_limit_secs),
            soft_attempt_limit_secs: env_parse("SOFT_ATTEMPT_LIMIT_SEC")
                .unwrap_or(defaults.soft_attempt_limit_secs),
            inline_text_cap_bytes: env_parse("INLINE_TEXT_CAP_BYTES")
                .unwrap_or(defaults.inline_text_cap_bytes),
            watchdog_interval_secs: env_parse("WATCHDOG_INTERVAL_SEC")
                .unwrap_or(defaults.watchdog_interval_secs),
            queue_sla_secs: env_parse("QUEUE_SLA_SEC").unwrap_or(defaults.queue_sla_secs),
            stale_step_threshold_secs: env_parse("STALE_STEP_THRESHOLD_SEC")
                .unwrap_or(defaults.stale_step_threshold_secs),
        };
        settings.normalize();
        settings
    }

    /// Clamp values into sane ranges so a bad environment cannot wedge the
    /// worker (zero concurrency, soft limit above hard limit, …).
    pub fn normalize(&mut self) {
        self.worker_concurrency = self.worker_concurrency.max(1);
        self.backup_keep_last = self.backup_keep_last.max(1);
        self.poll_interval_ms = self.poll_interval_ms.clamp(50, 60_000);
        if self.soft_attempt_limit_secs >= self.hard_attempt_limit_secs {
            self.soft_attempt_limit_secs = self.hard_attempt_limit_secs.saturating_sub(60).max(1);
        }
        self.semaphore_ttl_secs = self.semaphore_ttl_secs.max(60);
        for limit in self.semaphore_limits.values_mut() {
            *limit = (*limit).max(1);
        }
    }

    pub fn semaphore_ttl(&self) -> Duration {
        Duration::from_secs(self.semaphore_ttl_secs)
    }

    pub fn semaphore_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.semaphore_wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn hard_attempt_limit(&self) -> Duration {
        Duration::from_secs(self.hard_attempt_limit_secs)
    }

    pub fn soft_attempt_limit(&self) -> Duration {
        Duration::from_secs(self.soft_attempt_limit_secs)
    }

    pub fn semaphore_limit(&self, resource_class: &str) -> u32 {
        self.semaphore_limits
            .get(resource_class)
            .copied()
            .unwrap_or(1)
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// `SEMAPHORE_LIMITS="whisper=1,ffmpeg=2,llm=4"`.
fn semaphore_limits_from_env() -> Option<HashMap<String, u32>> {
    let raw = env_string("SEMAPHORE_LIMITS")?;
    let mut limits = HashMap::new();
    for pair in raw.split(',') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        if let Ok(limit) = value.trim().parse::<u32>() {
            limits.insert(name.trim().to_string(), limit);
        }
    }
    if limits.is_empty() { None } else { Some(limits) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_soft_limit_below_hard_limit() {
        let mut settings = Settings::default();
        settings.soft_attempt_limit_secs = 7200;
        settings.hard_attempt_limit_secs = 3600;
        settings.normalize();
        assert!(settings.soft_attempt_limit_secs < settings.hard_attempt_limit_secs);
    }

    #[test]
    fn normalize_floors_concurrency_and_limits() {
        let mut settings = Settings::default();
        settings.worker_concurrency = 0;
        settings.semaphore_limits.insert("whisper".into(), 0);
        settings.normalize();
        assert_eq!(settings.worker_concurrency, 1);
        assert_eq!(settings.semaphore_limit("whisper"), 1);
    }

    #[test]
    fn unknown_resource_class_defaults_to_one() {
        let settings = Settings::default();
        assert_eq!(settings.semaphore_limit("no-such-class"), 1);
    }

    #[test]
    fn semaphore_limits_parse_from_pair_list() {
        // Not using the env directly to keep the test hermetic.
        let parsed: HashMap<String, u32> = "whisper=1, ffmpeg=3"
            .split(',')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                Some((name.trim().to_string(), value.trim().parse().ok()?))
            })
            .collect();
        assert_eq!(parsed.get("whisper"), Some(&1));
        assert_eq!(parsed.get("ffmpeg"), Some(&3));
    }
}
