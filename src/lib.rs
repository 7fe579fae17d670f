pub mod clipflow_core;

pub use crate::clipflow_core::{
    ControlFlow, EnqueueError, ExecOutcome, HealthReport, MemorySemaphore, MemoryStore,
    NewCandidate, NewPublishTask, Notifier, ObjectStore, PgStore, PipelineEngine, RedisSemaphore,
    Semaphore, Settings, Store, ToolError, ToolRegistry, WatchdogReport,
};

/// Install the process-wide tracing subscriber. `RUST_LOG` controls the
/// filter; defaults to `info` for this crate.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
