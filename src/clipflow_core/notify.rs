//! Outbound alert channel with a per-title throttle.
//!
//! Invocation never blocks the caller and never propagates errors: the HTTP
//! send happens on a detached task and failures are only logged.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, warn};

use super::settings::Settings;

/// Same title at most once per this window, per process.
const THROTTLE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Alert body is clipped to the transport's message limit.
const MAX_BODY_LEN: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    fn marker(self) -> &'static str {
        match self {
            Severity::Info => "🟢",
            Severity::Warn => "🟡",
            Severity::Error => "🔴",
        }
    }

    fn throttle_prefix(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
struct Transport {
    token: String,
    chat_id: String,
}

pub struct Notifier {
    client: reqwest::Client,
    transport: Option<Transport>,
    throttle: Mutex<HashMap<String, Instant>>,
}

impl Notifier {
    pub fn from_settings(settings: &Settings) -> Self {
        let transport = match (&settings.notify_token, &settings.notify_chat_id) {
            (Some(token), Some(chat_id)) => Some(Transport {
                token: token.clone(),
                chat_id: chat_id.clone(),
            }),
            _ => None,
        };
        Self {
            client: reqwest::Client::new(),
            transport,
            throttle: Mutex::new(HashMap::new()),
        }
    }

    /// A notifier with no transport configured; every send is a no-op.
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            transport: None,
            throttle: Mutex::new(HashMap::new()),
        }
    }

    pub fn error(&self, title: &str, payload: Option<&str>) {
        self.send(Severity::Error, title, payload);
    }

    pub fn warn(&self, title: &str, payload: Option<&str>) {
        self.send(Severity::Warn, title, payload);
    }

    pub fn info(&self, title: &str, payload: Option<&str>) {
        self.send(Severity::Info, title, payload);
    }

    fn send(&self, severity: Severity, title: &str, payload: Option<&str>) {
        if !self.should_send(&format!("{}:{}", severity.throttle_prefix(), title)) {
            debug!(title, "notification throttled");
            return;
        }
        let Some(transport) = self.transport.clone() else {
            debug!(title, "notifier not configured, skipping");
            return;
        };

        let mut body = format!("{} <b>{}</b>", severity.marker(), title);
        if let Some(payload) = payload {
            let clipped: String = payload.chars().take(500).collect();
            body.push_str(&format!("\n<pre>{clipped}</pre>"));
        }
        if body.len() > MAX_BODY_LEN {
            let mut end = MAX_BODY_LEN;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }

        let client = self.client.clone();
        tokio::spawn(async move {
            let url = format!("https://api.telegram.org/bot{}/sendMessage", transport.token);
            let result = client
                .post(&url)
                .json(&json!({
                    "chat_id": transport.chat_id,
                    "text": body,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }))
                .timeout(Duration::from_secs(10))
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(status = %response.status(), "notification transport rejected message");
                }
                Err(e) => {
                    warn!(error = %e, "notification send failed");
                }
            }
        });
    }

    fn should_send(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut throttle = self.throttle.lock().expect("notify throttle poisoned");
        match throttle.get(key) {
            Some(last) if now.duration_since(*last) < THROTTLE_WINDOW => false,
            _ => {
                throttle.insert(key.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_suppresses_repeat_titles() {
        let notifier = Notifier::disabled();
        assert!(notifier.should_send("error:task failed"));
        assert!(!notifier.should_send("error:task failed"));
        // Different severity prefix or title is a different key.
        assert!(notifier.should_send("warn:task failed"));
        assert!(notifier.should_send("error:another title"));
    }

    #[tokio::test]
    async fn disabled_notifier_accepts_sends() {
        let notifier = Notifier::disabled();
        notifier.error("boom", Some("payload"));
        notifier.warn("slow", None);
        notifier.info("ok", None);
    }
}
