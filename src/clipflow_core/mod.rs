pub mod artifacts;
pub mod backup;
pub mod dedupe;
pub mod domain;
pub mod engine;
pub mod error;
pub mod llm;
pub mod notify;
pub mod publisher;
pub mod registry;
pub mod semaphore;
pub mod settings;
pub mod store;
pub mod tools;
pub mod topic_guard;

pub use artifacts::ObjectStore;
pub use domain::*;
pub use engine::{
    ControlFlow, ExecOutcome, HealthReport, PipelineEngine, WatchdogAction, WatchdogFinding,
    WatchdogReport,
};
pub use error::{EnqueueError, SemaphoreError, ToolError};
pub use notify::Notifier;
pub use registry::{ResourceClass, ToolContext, ToolHandler, ToolInvocation, ToolRegistry, ToolSpec};
pub use semaphore::{MemorySemaphore, RedisSemaphore, Semaphore};
pub use settings::Settings;
pub use store::{CommitStepError, MemoryStore, NewCandidate, NewPublishTask, PgStore, Store};
