//! Pipeline engine: the dependency container shared by the executor, the
//! dispatcher worker loops, the control surface and the watchdog.

use std::sync::Arc;

use crate::clipflow_core::artifacts::ObjectStore;
use crate::clipflow_core::llm::LlmProvider;
use crate::clipflow_core::notify::Notifier;
use crate::clipflow_core::publisher::PublisherAdapter;
use crate::clipflow_core::registry::{ToolContext, ToolRegistry};
use crate::clipflow_core::semaphore::Semaphore;
use crate::clipflow_core::settings::Settings;
use crate::clipflow_core::store::Store;

mod control;
mod dispatcher;
mod enqueue;
mod executor;
mod spawner;
mod watchdog;

pub use control::ControlFlow;
pub use executor::ExecOutcome;
pub use watchdog::{HealthReport, WatchdogAction, WatchdogFinding, WatchdogReport};

/// Built once at startup and handed to every worker; no process-global
/// mutable state.
pub struct PipelineEngine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) semaphore: Arc<dyn Semaphore>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) settings: Arc<Settings>,
    pub(crate) tool_ctx: ToolContext,
}

impl PipelineEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        semaphore: Arc<dyn Semaphore>,
        registry: Arc<ToolRegistry>,
        notifier: Arc<Notifier>,
        objects: ObjectStore,
        llm: Arc<dyn LlmProvider>,
        publisher: Arc<dyn PublisherAdapter>,
        settings: Arc<Settings>,
    ) -> Self {
        let tool_ctx = ToolContext {
            store: store.clone(),
            objects,
            llm,
            publisher,
            settings: settings.clone(),
        };
        Self {
            store,
            semaphore,
            registry,
            notifier,
            settings,
            tool_ctx,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
