//! Wayfarer CLI - inspect and maintain a device's offline sync queue.
//!
//! Works directly on the on-disk queue, without contacting the sync
//! gateway, so it is safe to use while the device is offline.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use wayfarer_common::DeviceId;
use wayfarer_storage::create_default_registry;
use wayfarer_sync::{
    merge_payloads, ChangeKind, Conflict, ConflictResolver, NewChange, OfflineStore, Resolution,
    SyncConfig, QUEUE_RECORD,
};

#[derive(Parser)]
#[command(name = "wayfarer")]
#[command(about = "Wayfarer - offline sync queue tooling")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the offline queue (default: platform data dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Device id for a new queue.
    #[arg(long, global = true)]
    device: Option<String>,

    /// Sync configuration file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a local change.
    Queue {
        /// Change kind: "create", "update", or "delete".
        #[arg(short, long)]
        kind: String,

        /// Entity type (e.g. "trip").
        #[arg(short = 't', long)]
        entity_type: String,

        /// Entity id.
        #[arg(short = 'i', long)]
        entity_id: String,

        /// Payload as a JSON string.
        #[arg(short, long, default_value = "{}")]
        payload: String,
    },

    /// List queued changes.
    Pending,

    /// Check the queue for malformed or inconsistent entries.
    Validate,

    /// Collapse queued changes to the latest one per entity.
    Compact,

    /// Show queue status.
    Status,

    /// Delete the queue.
    Reset {
        /// Skip the confirmation check.
        #[arg(long)]
        yes: bool,
    },

    /// Merge two payload files the way a conflict merge does.
    Merge {
        /// Local payload (JSON file).
        #[arg(short, long)]
        local: PathBuf,

        /// Remote payload (JSON file).
        #[arg(short, long)]
        remote: PathBuf,
    },

    /// Rank conflicts from a JSON file by priority.
    Rank {
        /// JSON array of conflicts.
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    // Completions need no data directory or config
    if let Commands::Completions { shell } = cli.command {
        cmd_completions(shell);
        return Ok(());
    }

    let ctx = Workspace::from_cli(&cli)?;

    match cli.command {
        Commands::Queue {
            kind,
            entity_type,
            entity_id,
            payload,
        } => cmd_queue(&ctx, &kind, &entity_type, &entity_id, &payload),

        Commands::Pending => cmd_pending(&ctx),

        Commands::Validate => cmd_validate(&ctx),

        Commands::Compact => cmd_compact(&ctx),

        Commands::Status => cmd_status(&ctx),

        Commands::Reset { yes } => cmd_reset(&ctx, yes),

        Commands::Merge { local, remote } => cmd_merge(&local, &remote).await,

        Commands::Rank { file } => cmd_rank(&ctx, &file).await,

        Commands::Completions { .. } => Ok(()),
    }
}

/// Settings shared by every command.
struct Workspace {
    data_dir: PathBuf,
    device: Option<DeviceId>,
    config: SyncConfig,
}

impl Workspace {
    fn from_cli(cli: &Cli) -> Result<Self> {
        let data_dir = match &cli.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .context("No platform data directory; pass --data-dir")?
                .join("wayfarer"),
        };

        let device = cli
            .device
            .as_deref()
            .map(DeviceId::new)
            .transpose()
            .context("Invalid device id")?;

        let config = match &cli.config {
            Some(path) => SyncConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => SyncConfig::default(),
        };

        Ok(Self {
            data_dir,
            device,
            config,
        })
    }

    fn open_store(&self) -> Result<OfflineStore> {
        let root = self.data_dir.to_string_lossy().to_string();
        let backend = create_default_registry()
            .resolve("local", serde_json::json!({ "root": root }))
            .context("Failed to open data directory")?;

        OfflineStore::open(backend, self.device.clone()).context("Failed to open offline queue")
    }
}

/// Queue a change.
fn cmd_queue(
    ctx: &Workspace,
    kind: &str,
    entity_type: &str,
    entity_id: &str,
    payload: &str,
) -> Result<()> {
    let kind: ChangeKind = kind.parse().context("Invalid change kind")?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let mut store = ctx.open_store()?;
    let id = store
        .enqueue(NewChange::new(kind, entity_type, entity_id, payload))
        .context("Failed to queue change")?;

    info!("Queued {} on {}/{}", kind, entity_type, entity_id);
    println!("{}", id);

    Ok(())
}

/// List queued changes.
fn cmd_pending(ctx: &Workspace) -> Result<()> {
    let store = ctx.open_store()?;

    if store.is_empty() {
        println!("No pending changes.");
        return Ok(());
    }

    println!("Pending changes ({}):", store.len());
    for change in store.pending() {
        println!(
            "  v{:<4} {:<7} {:<24} {}  {}",
            change.version,
            change.kind.to_string(),
            change.key().to_string(),
            change.timestamp.to_rfc3339(),
            change.id
        );
    }

    Ok(())
}

/// Validate the queue.
fn cmd_validate(ctx: &Workspace) -> Result<()> {
    let store = ctx.open_store()?;
    let report = store.validate();

    if report.is_ok() {
        println!("Queue is valid ({} changes).", store.len());
        return Ok(());
    }

    for defect in &report.defects {
        println!("  - {}", defect);
    }
    anyhow::bail!("Queue has {} defect(s)", report.defects.len());
}

/// Compact the queue.
fn cmd_compact(ctx: &Workspace) -> Result<()> {
    let mut store = ctx.open_store()?;
    let dropped = store.compact().context("Failed to compact queue")?;

    println!(
        "Dropped {} superseded change(s); {} remaining.",
        dropped.len(),
        store.len()
    );
    for id in dropped {
        println!("  - {}", id);
    }

    Ok(())
}

/// Show queue status.
fn cmd_status(ctx: &Workspace) -> Result<()> {
    let store = ctx.open_store()?;

    let last_sync = store
        .last_sync_time()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());

    println!("Offline Queue:");
    println!("  Device: {}", store.device_id());
    println!(
        "  Location: {}",
        ctx.data_dir.join(format!("{}.json", QUEUE_RECORD)).display()
    );
    println!("  Pending changes: {}", store.len());
    println!("  Last sync: {}", last_sync);
    println!("Sync Settings:");
    println!("  Interval: {:?}", ctx.config.sync_interval);
    println!(
        "  Retry: {} attempts, {:?} apart",
        ctx.config.max_retries, ctx.config.retry_delay
    );
    println!(
        "  Conflict strategy: {:?} (auto: {})",
        ctx.config.conflict_strategy, ctx.config.auto_resolve_conflicts
    );

    Ok(())
}

/// Delete the queue.
fn cmd_reset(ctx: &Workspace, yes: bool) -> Result<()> {
    let mut store = ctx.open_store()?;

    if !yes && !store.is_empty() {
        anyhow::bail!(
            "Queue still holds {} unsynced change(s); pass --yes to discard them",
            store.len()
        );
    }

    store.reset().context("Failed to reset queue")?;
    println!("Offline queue reset.");

    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Print the merged payload.
async fn cmd_merge(local: &Path, remote: &Path) -> Result<()> {
    let local: serde_json::Value = read_json(local).await?;
    let remote: serde_json::Value = read_json(remote).await?;

    let merged = merge_payloads(&local, &remote);
    println!("{}", serde_json::to_string_pretty(&merged)?);

    Ok(())
}

/// Print conflicts ordered by priority.
async fn cmd_rank(ctx: &Workspace, file: &Path) -> Result<()> {
    let conflicts: Vec<Conflict> = read_json(file).await?;
    let resolver = ConflictResolver::new(ctx.config.priority.clone());

    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }

    println!("{:>8}  {:<24} {:<15} {:<9} id", "priority", "entity", "local/remote", "mergeable");
    for (priority, conflict) in resolver.rank(&conflicts) {
        let kinds = format!("{}/{}", conflict.local_change.kind, conflict.remote_change.kind);
        let mergeable = resolver.validate_choice(&conflict, Resolution::Merge);
        println!(
            "{:>8}  {:<24} {:<15} {:<9} {}",
            priority,
            conflict.key().to_string(),
            kinds,
            if mergeable { "yes" } else { "no" },
            conflict.id
        );
    }

    Ok(())
}

fn cmd_completions(shell: Shell) {
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "wayfarer", &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_queue() {
        let cli = Cli::try_parse_from([
            "wayfarer", "--data-dir", "/tmp/w", "queue", "-k", "update", "-t", "trip", "-i", "t1",
            "-p", r#"{"title":"Oslo"}"#,
        ])
        .unwrap();

        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/w")));
        assert!(matches!(cli.command, Commands::Queue { ref entity_id, .. } if entity_id == "t1"));
    }

    #[tokio::test]
    async fn test_completions_ignore_workspace() {
        let cli = Cli::try_parse_from([
            "wayfarer", "--config", "/nonexistent/wayfarer.json", "completions", "bash",
        ])
        .unwrap();

        assert!(run(cli).await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_config_fails_other_commands() {
        let cli = Cli::try_parse_from([
            "wayfarer", "--config", "/nonexistent/wayfarer.json", "status",
        ])
        .unwrap();

        assert!(run(cli).await.is_err());
    }
}
