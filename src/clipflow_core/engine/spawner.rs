//! Worker pool: N concurrent claim/run loops per process. Any worker can
//! claim any task; the claim itself is the mutual exclusion.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::PipelineEngine;

impl PipelineEngine {
    /// Run `worker_concurrency` claim/run loops until `shutdown` flips.
    /// In-flight attempts finish before the pool returns (cooperative
    /// shutdown at claim boundaries).
    pub async fn run_worker_pool(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let concurrency = self.settings.worker_concurrency;
        info!(concurrency, "starting worker pool");
        let mut handles = Vec::with_capacity(concurrency);
        for index in 0..concurrency {
            let engine = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(engine, index, shutdown).await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker loop aborted");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(engine: Arc<PipelineEngine>, index: usize, mut shutdown: watch::Receiver<bool>) {
    // One lease identity per loop; every task this loop claims carries it.
    let lease_id = Uuid::new_v4();
    info!(worker = index, lease = %lease_id, "worker loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = match engine.store.claim_next_task(lease_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(worker = index, error = %format!("{e:#}"), "claim failed");
                None
            }
        };

        match claimed {
            Some(task) => {
                info!(
                    worker = index,
                    task_id = task.id,
                    priority = task.priority,
                    attempt = task.attempt,
                    "claimed task"
                );
                if let Err(e) = engine.run_claimed_task(&task).await {
                    warn!(
                        worker = index,
                        task_id = task.id,
                        error = %format!("{e:#}"),
                        "attempt bookkeeping failed"
                    );
                }
            }
            None => {
                // Idle: wait out the poll interval, but wake immediately on
                // shutdown.
                tokio::select! {
                    _ = tokio::time::sleep(engine.settings.poll_interval()) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    info!(worker = index, "worker loop stopped");
}
