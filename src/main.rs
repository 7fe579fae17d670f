use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use clipflow::clipflow_core::backup;
use clipflow::clipflow_core::domain::{MetricsSnapshot, Platform, TaskFilter, TaskStatus};
use clipflow::clipflow_core::llm::StubLlmProvider;
use clipflow::clipflow_core::publisher::StubPublisherAdapter;
use clipflow::{
    Notifier, ObjectStore, PgStore, PipelineEngine, RedisSemaphore, Settings, Store, ToolRegistry,
};

#[derive(Parser)]
#[command(name = "clipflow", about = "Content-production pipeline orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool (claim/run loops + watchdog) until Ctrl-C.
    Worker {
        /// Override the configured number of concurrent executor loops.
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Enqueue a publish task for an approved candidate.
    Enqueue {
        #[arg(long)]
        candidate: i64,
        #[arg(long)]
        preset: i64,
        /// Destination platform (tiktok, youtube_shorts, instagram_reels, vk_clips).
        #[arg(long)]
        platform: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Request a cooperative pause; takes effect at the next step boundary.
    Pause {
        task: i64,
        #[arg(long, default_value = "paused from CLI")]
        reason: String,
    },
    /// Request a cooperative cancel; wins over pause when both are set.
    Cancel {
        task: i64,
        #[arg(long, default_value = "canceled from CLI")]
        reason: String,
    },
    /// Re-enqueue a paused or errored task.
    Resume { task: i64 },
    /// Approve moderation-gated steps up to and including the given index.
    Approve {
        task: i64,
        #[arg(long)]
        through_step: i32,
    },
    /// List tasks, optionally filtered.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        project: Option<i64>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one task with its step results.
    Get { task: i64 },
    /// Scan for stuck tasks. Dry-run by default; --apply reconciles.
    Watchdog {
        #[arg(long)]
        apply: bool,
    },
    /// Task counts, queue age and stuck totals.
    Health,
    /// Append an external metrics snapshot for a published task.
    RecordMetrics {
        task: i64,
        #[arg(long)]
        views: Option<i64>,
        #[arg(long)]
        likes: Option<i64>,
        #[arg(long)]
        comments: Option<i64>,
        #[arg(long)]
        shares: Option<i64>,
    },
    /// Run pg_dump with retention rotation.
    Backup,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    clipflow::init_tracing();

    let cli = Cli::parse();
    let mut settings = Settings::from_env();

    match &cli.command {
        Command::Migrate => {
            let store = PgStore::connect(&settings.database_url).await?;
            store.migrate().await?;
            info!("migrations applied");
            return Ok(());
        }
        Command::Backup => {
            let report = backup::run_backup(&settings).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        _ => {}
    }

    if let Command::Worker { concurrency } = &cli.command {
        if let Some(concurrency) = concurrency {
            settings.worker_concurrency = *concurrency;
            settings.normalize();
        }
    }

    let engine = build_engine(settings).await?;

    match cli.command {
        Command::Worker { .. } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                    let _ = shutdown_tx.send(true);
                }
            });
            let watchdog = {
                let engine = engine.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { engine.run_watchdog_loop(shutdown).await })
            };
            engine.run_worker_pool(shutdown_rx).await;
            watchdog.await.ok();
        }
        Command::Enqueue {
            candidate,
            preset,
            platform,
            priority,
        } => {
            let platform = Platform::from_str(&platform).map_err(|e| anyhow::anyhow!(e))?;
            let task = engine.enqueue(candidate, preset, platform, priority).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Command::Pause { task, reason } => {
            report_bool(engine.request_pause(task, &reason).await?, "pause requested");
        }
        Command::Cancel { task, reason } => {
            report_bool(engine.request_cancel(task, &reason).await?, "cancel requested");
        }
        Command::Resume { task } => {
            report_bool(engine.resume(task).await?, "resumed");
        }
        Command::Approve { task, through_step } => {
            report_bool(
                engine.approve_moderation(task, through_step).await?,
                "moderation approved",
            );
        }
        Command::List {
            status,
            project,
            limit,
        } => {
            let status = status
                .map(|s| TaskStatus::from_str(&s))
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            let tasks = engine
                .store()
                .list_tasks(&TaskFilter {
                    status,
                    project_id: project,
                    limit: Some(limit),
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        Command::Get { task } => {
            let row = engine
                .store()
                .get_task(task)
                .await?
                .with_context(|| format!("task {task} not found"))?;
            let steps = engine.store().step_results(task).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "task": row,
                    "stepResults": steps,
                }))?
            );
        }
        Command::Watchdog { apply } => {
            let report = engine.run_watchdog(!apply).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Health => {
            let report = engine.get_health().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::RecordMetrics {
            task,
            views,
            likes,
            comments,
            shares,
        } => {
            let metric = engine
                .store()
                .record_metrics(
                    task,
                    MetricsSnapshot {
                        views,
                        likes,
                        comments,
                        shares,
                        raw_data: None,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&metric)?);
        }
        Command::Migrate | Command::Backup => unreachable!("handled above"),
    }

    Ok(())
}

async fn build_engine(settings: Settings) -> Result<Arc<PipelineEngine>> {
    let settings = Arc::new(settings);
    let store = Arc::new(PgStore::connect(&settings.database_url).await?);
    let semaphore = Arc::new(
        RedisSemaphore::connect(&settings.redis_url)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
    );
    let objects = ObjectStore::new(settings.object_store_dir.clone());
    Ok(Arc::new(PipelineEngine::new(
        store,
        semaphore,
        Arc::new(ToolRegistry::builtin()),
        Arc::new(Notifier::from_settings(&settings)),
        objects,
        Arc::new(StubLlmProvider),
        Arc::new(StubPublisherAdapter),
        settings,
    )))
}

fn report_bool(accepted: bool, action: &str) {
    if accepted {
        println!("ok: {action}");
    } else {
        println!("no-op: task missing or not eligible");
    }
}
