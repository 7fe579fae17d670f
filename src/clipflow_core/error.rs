use thiserror::Error;

/// Error taxonomy propagated by tool handlers.
///
/// Transient failures are retried by the dispatcher up to the retry cap;
/// permanent failures terminate the task. Handler panics are caught at the
/// invocation boundary and classified as transient on the first attempt,
/// permanent afterwards.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ToolError {
    pub fn transient(message: impl Into<String>) -> Self {
        ToolError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ToolError::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum SemaphoreError {
    #[error("semaphore '{name}': timed out waiting {waited_secs}s for slot (limit={limit})")]
    Timeout {
        name: String,
        limit: u32,
        waited_secs: u64,
    },
    #[error("semaphore store unavailable: {0}")]
    Unavailable(String),
}

/// Rejections raised at enqueue time, never inside a running task.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("duplicate content: candidate {duplicate_of} already carries signature {signature}")]
    DuplicateContent { duplicate_of: i64, signature: String },
    #[error("topic repeat: signature {signature} published within the anti-repeat window")]
    TopicRepeat { signature: String },
    #[error("candidate {candidate_id} has status {status}, expected APPROVED")]
    CandidateNotApproved { candidate_id: i64, status: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
