use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use audit_resilience::{
    CacheEngine, FileStore, KeyValueStore, OperationExecutor, OperationModeController,
    OperationQueue, QueuedOperation, ResilienceConfig, ResilienceError,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "resilience-tool")]
#[command(about = "Inspect and repair the persisted resilience state")]
struct Cli {
    /// JSON file backing the durable store
    #[arg(long, default_value = "resilience-store.json")]
    store: PathBuf,

    /// Optional JSON configuration (keys, cache prefix, ...)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Mode {
        #[command(subcommand)]
        action: ModeAction,
    },
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum ModeAction {
    Show,
    Real,
    Demo {
        #[arg(long, default_value = "manual switch")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    List,
    /// Reset a failed operation so the application retries it on its next drain
    Retry { id: String },
    Remove { id: String },
    Clear,
    PurgeFailed {
        #[arg(long)]
        older_than_secs: u64,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    Sweep,
    Invalidate { prefix: String },
    Clear,
}

/// The tool edits queue state only; replaying belongs to the application.
struct DetachedExecutor;

#[async_trait]
impl OperationExecutor for DetachedExecutor {
    async fn execute(&self, operation: &QueuedOperation) -> audit_resilience::Result<()> {
        Err(ResilienceError::Network(format!(
            "resilience-tool cannot execute operation '{}'",
            operation.id
        )))
    }
}

struct Tool {
    store: Arc<dyn KeyValueStore>,
    config: ResilienceConfig,
}

impl Tool {
    fn open(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => ResilienceConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))?,
            None => ResilienceConfig::default(),
        };
        let store = FileStore::open(&cli.store)
            .with_context(|| format!("Failed to open store '{}'", cli.store.display()))?;
        Ok(Self {
            store: Arc::new(store),
            config,
        })
    }

    fn mode(&self) -> Arc<OperationModeController> {
        Arc::new(OperationModeController::open(
            self.store.clone(),
            self.config.storage_keys.mode.clone(),
            self.config.mode.clone(),
        ))
    }

    fn queue(&self) -> OperationQueue {
        OperationQueue::open(
            self.store.clone(),
            self.config.storage_keys.queue.clone(),
            self.mode(),
            Arc::new(DetachedExecutor),
            self.config.queue.clone(),
        )
    }

    fn cache(&self) -> CacheEngine {
        CacheEngine::new(self.store.clone(), self.mode(), self.config.cache.clone())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let tool = Tool::open(&cli)?;

    match cli.command {
        Command::Mode { action } => run_mode(&tool, action),
        Command::Queue { action } => run_queue(&tool, action),
        Command::Cache { action } => run_cache(&tool, action),
    }
}

fn run_mode(tool: &Tool, action: ModeAction) -> Result<()> {
    let mode = tool.mode();
    match action {
        ModeAction::Show => {}
        ModeAction::Real => mode.enable_real_mode().context("Failed to enable real mode")?,
        ModeAction::Demo { reason } => mode
            .enable_demo_mode(reason)
            .context("Failed to enable demo mode")?,
    }
    let status = mode.status().context("Failed to read mode status")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn run_queue(tool: &Tool, action: QueueAction) -> Result<()> {
    let queue = tool.queue();
    match action {
        QueueAction::List => {
            let operations = queue.operations();
            if operations.is_empty() {
                println!("Queue is empty");
                return Ok(());
            }
            for op in operations {
                println!(
                    "{}  {:<10} {}/{:?} {}  attempts={}/{}  next={}{}",
                    op.id,
                    op.status.as_str(),
                    op.entity_type,
                    op.operation_type,
                    op.entity_id.as_deref().unwrap_or("-"),
                    op.attempts,
                    op.retry.max_attempts,
                    op.next_retry_time
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    op.error
                        .map(|err| format!("  error={}", err))
                        .unwrap_or_default(),
                );
            }
            println!(
                "pending={} error={} success={}",
                queue.pending_count(),
                queue.error_count(),
                queue.success_count()
            );
        }
        QueueAction::Retry { id } => {
            let op = queue
                .reset_for_retry(&id)
                .with_context(|| format!("Failed to reset operation '{}'", id))?;
            println!("Operation {} is pending again", op.id);
        }
        QueueAction::Remove { id } => {
            queue
                .remove(&id)
                .with_context(|| format!("Failed to remove operation '{}'", id))?;
            println!("Removed operation {}", id);
        }
        QueueAction::Clear => {
            let removed = queue.clear().context("Failed to clear queue")?;
            println!("Removed {} operation(s)", removed);
        }
        QueueAction::PurgeFailed { older_than_secs } => {
            if older_than_secs == 0 {
                return Err(anyhow!("--older-than-secs must be positive"));
            }
            let purged = queue
                .purge_failed(Duration::from_secs(older_than_secs))
                .context("Failed to purge failed operations")?;
            println!("Purged {} failed operation(s)", purged);
        }
    }
    Ok(())
}

fn run_cache(tool: &Tool, action: CacheAction) -> Result<()> {
    let cache = tool.cache();
    let removed = match action {
        CacheAction::Sweep => cache.sweep_expired().context("Failed to sweep cache")?,
        CacheAction::Invalidate { prefix } => cache
            .invalidate_by_prefix(&prefix)
            .with_context(|| format!("Failed to invalidate prefix '{}'", prefix))?,
        CacheAction::Clear => cache.clear().context("Failed to clear cache")?,
    };
    println!("Removed {} cache entr{}", removed, if removed == 1 { "y" } else { "ies" });
    Ok(())
}
