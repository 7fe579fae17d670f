//! Publisher adapter seam. Concrete platform uploads are out of scope; the
//! publish tool talks to this trait and the stub fabricates a receipt.

use async_trait::async_trait;

use super::domain::{BlobDescriptor, Platform};
use super::error::ToolError;

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub platform: Platform,
    pub video: BlobDescriptor,
    pub title: Option<String>,
    pub captions: Option<String>,
}

/// Terminal publishing result recorded on the task row.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub external_id: String,
    pub url: String,
}

#[async_trait]
pub trait PublisherAdapter: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, ToolError>;
}

/// Stand-in adapter: derives a stable receipt from the video hash so
/// replays of an identical step produce the identical result.
pub struct StubPublisherAdapter;

#[async_trait]
impl PublisherAdapter for StubPublisherAdapter {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, ToolError> {
        let short = request.video.sha256.get(..12).ok_or_else(|| {
            ToolError::permanent("video descriptor carries a malformed sha256")
        })?;
        let external_id = format!("{}-{}", request.platform, short);
        Ok(PublishReceipt {
            url: format!("https://videos.example/{external_id}"),
            external_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_receipt_is_stable_per_video() {
        let adapter = StubPublisherAdapter;
        let request = PublishRequest {
            platform: Platform::Tiktok,
            video: BlobDescriptor {
                uri: "objects/ab/abcdef".into(),
                mime: "video/mp4".into(),
                bytes: 1,
                sha256: "abcdef0123456789".into(),
            },
            title: None,
            captions: None,
        };
        let a = adapter.publish(&request).await.unwrap();
        let b = adapter.publish(&request).await.unwrap();
        assert_eq!(a.external_id, b.external_id);
        assert!(a.url.contains(&a.external_id));
        assert!(a.external_id.starts_with("tiktok-"));
    }
}
