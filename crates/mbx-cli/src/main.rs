//! mbx: MirrorBox command-line interface
//!
//! Commands:
//!   init                    - write a default config file
//!   add <paths...>          - register files for syncing (glob-aware)
//!   status                  - list tracked files
//!   sync <file>             - reconcile one file with the remote
//!   sync-all                - reconcile every unsynced file
//!   download <file>         - force a download
//!   upload <file>           - force an upload
//!   resolve <file> <winner> - settle a conflicted file
//!   rm <file>               - unregister a file
//!   clear-cache             - apply the cache eviction policy
//!   config                  - print the active configuration
//!   check                   - diagnose config, remote, and network
//!   auto                    - run periodic sync until Ctrl-C

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use mbx_core::{
    BatchSyncResult, FileMetadata, MbxError, SyncConfig, SyncResult, SyncStatus, SyncStrategy,
};
use mbx_store::{
    is_archive, FsLocalStore, JsonMetadataStore, OpendalRemoteStore, RemoteStore,
    UnzipCommandExtractor,
};
use mbx_sync::client::{ProgressStream, SyncClient};
use mbx_sync::gate::{NetworkState, StaticNetworkMonitor};

// ── CLI structure ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "mbx",
    version,
    about = "MirrorBox sync client",
    long_about = "mbx: register files, reconcile them with a remote store, and manage the local cache"
)]
struct Cli {
    /// Path to mirrorbox.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "MBX_CONFIG",
        default_value = "~/.config/mirrorbox/config.toml"
    )]
    config: PathBuf,

    /// Path to the metadata catalog JSON file
    #[arg(
        long,
        env = "MBX_STATE",
        default_value = "~/.local/share/mirrorbox/state.json"
    )]
    state: PathBuf,

    /// Treat the network as offline
    #[arg(long)]
    offline: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MBX_LOG", default_value = "warn")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "MBX_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Register files for syncing (arguments may be glob patterns)
    Add {
        /// Files or glob patterns (e.g. "docs/**/*.md")
        #[arg(required = true)]
        patterns: Vec<String>,
        /// Eviction priority (lower evicts first under cache_priority)
        #[arg(long, short = 'p', default_value_t = 0)]
        priority: i32,
        /// Sync each file right after registering it
        #[arg(long)]
        sync: bool,
    },

    /// List tracked files
    Status {
        /// Emit the raw records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reconcile one file with the remote
    Sync {
        /// File id (or unique id prefix, or exact file name)
        file: String,
    },

    /// Reconcile every unsynced file
    #[command(name = "sync-all")]
    SyncAll,

    /// Force a download regardless of strategy
    Download {
        file: String,
        /// Destination path (default: the file's recorded local path)
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Force an upload regardless of strategy
    Upload {
        file: String,
        /// Source path (default: the file's recorded local path)
        #[arg(long)]
        src: Option<PathBuf>,
    },

    /// Settle a conflicted file
    Resolve {
        file: String,
        /// Which side wins
        winner: Winner,
    },

    /// Unregister a file
    Rm {
        file: String,
        /// Also delete the local copy
        #[arg(long)]
        local: bool,
        /// Also delete the remote copy
        #[arg(long)]
        remote: bool,
    },

    /// Apply the configured cache eviction policy now
    #[command(name = "clear-cache")]
    ClearCache,

    /// Print the active configuration
    Config,

    /// Diagnose configuration, remote reachability, and network gating
    Check,

    /// Run periodic sync in the foreground until Ctrl-C
    Auto,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Winner {
    /// Upload the local copy
    Local,
    /// Download the remote copy
    Remote,
    /// Take whichever side was modified more recently
    Newest,
}

impl Winner {
    fn strategy(self) -> SyncStrategy {
        match self {
            Winner::Local => SyncStrategy::LocalWins,
            Winner::Remote => SyncStrategy::RemoteWins,
            Winner::Newest => SyncStrategy::NewestWins,
        }
    }
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "mbx starting"
    );

    let config_path = expand_tilde(&cli.config);

    // init runs before config load: there is nothing to load yet.
    if let Commands::Init { force } = &cli.command {
        return cmd_init(&config_path, *force).await;
    }

    let config = load_config(&config_path).await?;
    let ctx = Ctx {
        config,
        config_path,
        state_path: expand_tilde(&cli.state),
        offline: cli.offline,
    };

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Add {
            patterns,
            priority,
            sync,
        } => cmd_add(&ctx, &patterns, priority, sync).await,
        Commands::Status { json } => cmd_status(&ctx, json).await,
        Commands::Sync { file } => cmd_sync(&ctx, &file).await,
        Commands::SyncAll => cmd_sync_all(&ctx).await,
        Commands::Download { file, dest } => cmd_download(&ctx, &file, dest).await,
        Commands::Upload { file, src } => cmd_upload(&ctx, &file, src).await,
        Commands::Resolve { file, winner } => cmd_resolve(&ctx, &file, winner).await,
        Commands::Rm {
            file,
            local,
            remote,
        } => cmd_rm(&ctx, &file, local, remote).await,
        Commands::ClearCache => cmd_clear_cache(&ctx).await,
        Commands::Config => cmd_config_show(&ctx),
        Commands::Check => cmd_check(&ctx).await,
        Commands::Auto => cmd_auto(&ctx).await,
    }
}

// ── Shared command context ────────────────────────────────────────────────────

struct Ctx {
    config: SyncConfig,
    config_path: PathBuf,
    state_path: PathBuf,
    offline: bool,
}

impl Ctx {
    /// Wire a client from the config: JSON catalog, local filesystem,
    /// OpenDAL remote, `unzip` extraction.
    async fn client(&self) -> Result<SyncClient> {
        let metadata = JsonMetadataStore::open(&self.state_path)
            .await
            .with_context(|| format!("opening catalog: {}", self.state_path.display()))?;
        let remote =
            OpendalRemoteStore::connect(&self.config).context("building remote operator")?;
        let state = if self.offline {
            NetworkState::offline()
        } else {
            // No platform monitor in the CLI: assume a wired, unmetered link.
            NetworkState::ethernet()
        };

        let mut config = self.config.clone();
        config.sync_dir = expand_tilde(&config.sync_dir);

        SyncClient::new(
            config,
            Arc::new(metadata),
            Arc::new(FsLocalStore::new()),
            Arc::new(remote),
            Arc::new(UnzipCommandExtractor::new()),
            Arc::new(StaticNetworkMonitor::new(state)),
        )
        .context("constructing sync client")
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<SyncConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: SyncConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate().context("invalid configuration")?;
        Ok(config)
    } else {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(SyncConfig::default())
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}

// ── `mbx init` ────────────────────────────────────────────────────────────────

async fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "config already exists: {} (use --force to overwrite)",
            config_path.display()
        );
    }

    let rendered =
        toml::to_string_pretty(&SyncConfig::default()).context("serializing default config")?;
    if let Some(parent) = config_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(config_path, rendered)
        .await
        .with_context(|| format!("writing {}", config_path.display()))?;

    println!("Wrote {}", config_path.display());
    println!("Set base_url to your remote (memory://, fs:///path, s3://bucket), then `mbx add <files>`.");
    Ok(())
}

// ── `mbx add` ─────────────────────────────────────────────────────────────────

async fn cmd_add(ctx: &Ctx, patterns: &[String], priority: i32, sync_now: bool) -> Result<()> {
    let client = ctx.client().await?;

    let mut added = Vec::new();
    for pattern in patterns {
        let mut matched = false;
        for entry in glob::glob(pattern).with_context(|| format!("bad pattern: {pattern}"))? {
            let path = entry.with_context(|| format!("expanding pattern: {pattern}"))?;
            if !path.is_file() {
                continue;
            }
            matched = true;

            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("resolving {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string());
            let fs_meta = std::fs::metadata(&path)
                .with_context(|| format!("reading metadata: {}", path.display()))?;

            let mut meta = FileMetadata::new(name, ctx.config.base_url.as_str());
            meta.file_size = fs_meta.len();
            if let Ok(modified) = fs_meta.modified() {
                if let Ok(age) = modified.duration_since(std::time::UNIX_EPOCH) {
                    meta.last_modified = age.as_secs();
                }
            }
            meta.file_path = path;
            meta.priority = priority;
            meta.is_zip_file = is_archive(&meta.file_name);

            match client.add_file(meta, false).await {
                SyncResult::Success(meta) => {
                    println!("added  {}  {}", short_id(&meta.file_id), meta.file_name);
                    added.push(meta.file_id);
                }
                SyncResult::Error { message, .. } => {
                    anyhow::bail!("registering under {pattern}: {message}")
                }
                other => anyhow::bail!("unexpected result registering under {pattern}: {other:?}"),
            }
        }
        if !matched {
            anyhow::bail!("no files match: {pattern}");
        }
    }

    if sync_now {
        for file_id in &added {
            run_transfer(client.sync_file(file_id), "sync").await?;
        }
    } else {
        println!(
            "{} file(s) registered. Run `mbx sync-all` to sync.",
            added.len()
        );
    }
    Ok(())
}

// ── `mbx status` ──────────────────────────────────────────────────────────────

async fn cmd_status(ctx: &Ctx, json: bool) -> Result<()> {
    let client = ctx.client().await?;
    let files = client.list_files().await.context("listing files")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }
    if files.is_empty() {
        println!("No files tracked. Register some with `mbx add <paths>`.");
        return Ok(());
    }

    println!(
        "{:<10} {:<12} {:>10}  {:<5} {}",
        "ID", "STATUS", "SIZE", "FLAGS", "NAME"
    );
    for f in &files {
        let mut flags = String::new();
        if f.is_downloaded {
            flags.push('D');
        }
        if f.is_uploaded {
            flags.push('U');
        }
        if f.is_extracted {
            flags.push('X');
        }
        println!(
            "{:<10} {:<12} {:>10}  {:<5} {}",
            short_id(&f.file_id),
            f.sync_status.as_str(),
            fmt_bytes(f.file_size),
            flags,
            f.file_name
        );
    }

    let count = |s: SyncStatus| files.iter().filter(|f| f.sync_status == s).count();
    println!();
    println!(
        "{} tracked, {} synced, {} conflicted",
        files.len(),
        count(SyncStatus::Synced),
        count(SyncStatus::Conflict)
    );
    Ok(())
}

// ── `mbx sync` / `mbx download` / `mbx upload` ────────────────────────────────

async fn cmd_sync(ctx: &Ctx, file: &str) -> Result<()> {
    let client = ctx.client().await?;
    let file_id = resolve_file_id(&client, file).await?;
    run_transfer(client.sync_file(&file_id), "sync").await
}

async fn cmd_download(ctx: &Ctx, file: &str, dest: Option<PathBuf>) -> Result<()> {
    let client = ctx.client().await?;
    let file_id = resolve_file_id(&client, file).await?;
    run_transfer(client.download_file(&file_id, dest), "download").await
}

async fn cmd_upload(ctx: &Ctx, file: &str, src: Option<PathBuf>) -> Result<()> {
    let client = ctx.client().await?;
    let file_id = resolve_file_id(&client, file).await?;
    run_transfer(client.upload_file(&file_id, src), "upload").await
}

// ── `mbx sync-all` ────────────────────────────────────────────────────────────

async fn cmd_sync_all(ctx: &Ctx) -> Result<()> {
    let client = ctx.client().await?;
    let pending = client
        .list_files()
        .await
        .context("listing files")?
        .iter()
        .filter(|f| f.sync_status != SyncStatus::Synced)
        .count();
    if pending == 0 {
        println!("Everything is synced.");
        return Ok(());
    }

    let pb = make_progress_bar(pending as u64, "sync-all");
    let mut stream = client.sync_all();
    let mut last = BatchSyncResult::default();
    while let Some(snapshot) = stream.next().await {
        pb.set_position(snapshot.total_processed as u64);
        pb.set_message(format!(
            "{} ok, {} failed, {} conflicts",
            snapshot.success_count, snapshot.failed_count, snapshot.conflict_count
        ));
        last = snapshot;
    }
    pb.finish_with_message("done");

    println!();
    println!("Sync complete:");
    println!("  synced:    {}", last.success_count);
    println!("  conflicts: {}", last.conflict_count);
    println!("  failed:    {}", last.failed_count);
    for (file_id, message) in &last.failed_files {
        println!("    {}: {}", short_id(file_id), message);
    }
    if last.conflict_count > 0 {
        println!("Settle conflicts with `mbx resolve <file> local|remote|newest`.");
    }
    Ok(())
}

// ── `mbx resolve` ─────────────────────────────────────────────────────────────

async fn cmd_resolve(ctx: &Ctx, file: &str, winner: Winner) -> Result<()> {
    let client = ctx.client().await?;
    let file_id = resolve_file_id(&client, file).await?;

    match client.resolve_conflict(&file_id, winner.strategy()).await {
        SyncResult::Success(meta) => {
            println!("Resolved: {} is synced.", meta.file_name);
            Ok(())
        }
        SyncResult::Error {
            message, detail, ..
        } => {
            let detail = detail.map(|d| format!(" ({d})")).unwrap_or_default();
            anyhow::bail!("{message}{detail}")
        }
        SyncResult::Conflict { .. } => anyhow::bail!("still conflicted; try a different winner"),
    }
}

// ── `mbx rm` ──────────────────────────────────────────────────────────────────

async fn cmd_rm(ctx: &Ctx, file: &str, local: bool, remote: bool) -> Result<()> {
    let client = ctx.client().await?;
    let file_id = resolve_file_id(&client, file).await?;

    match client.remove_file(&file_id, local, remote).await {
        SyncResult::Success(meta) => {
            let mut notes = Vec::new();
            if local {
                notes.push("local copy deleted");
            }
            if remote {
                notes.push("remote copy deleted");
            }
            let detail = if notes.is_empty() {
                "content kept".to_string()
            } else {
                notes.join(", ")
            };
            if local && remote {
                println!("Removed {} ({detail}).", meta.file_name);
            } else {
                println!("Unregistered {} ({detail}).", meta.file_name);
            }
            Ok(())
        }
        SyncResult::Error { message, .. } => anyhow::bail!(message),
        SyncResult::Conflict { .. } => anyhow::bail!("unexpected conflict while removing"),
    }
}

// ── `mbx clear-cache` ─────────────────────────────────────────────────────────

async fn cmd_clear_cache(ctx: &Ctx) -> Result<()> {
    let client = ctx.client().await?;
    let freed = client.clear_cache().await.context("clearing cache")?;
    println!("Freed {}", fmt_bytes(freed));
    Ok(())
}

// ── `mbx config` ──────────────────────────────────────────────────────────────

fn cmd_config_show(ctx: &Ctx) -> Result<()> {
    if ctx.config_path.exists() {
        println!("# Configuration from: {}", ctx.config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            ctx.config_path.display()
        );
    }
    println!();
    let rendered =
        toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `mbx check` ───────────────────────────────────────────────────────────────

async fn cmd_check(ctx: &Ctx) -> Result<()> {
    println!(
        "Config:   {} [{}]",
        ctx.config_path.display(),
        if ctx.config_path.exists() {
            "file"
        } else {
            "defaults"
        }
    );
    println!("Catalog:  {}", ctx.state_path.display());
    println!("Remote:   {}", ctx.config.base_url);

    // A metadata query for a name that never exists proves the operator
    // can reach the backend.
    let remote =
        OpendalRemoteStore::connect(&ctx.config).context("building remote operator")?;
    match remote.metadata("connectivity-probe").await {
        Ok(_) => println!("          reachable"),
        Err(e) => println!("          UNREACHABLE: {e}"),
    }

    let client = ctx.client().await?;
    println!(
        "Network:  {:?} required, link is {} — {}",
        ctx.config.network_type,
        if ctx.offline {
            "offline"
        } else {
            "ethernet (assumed)"
        },
        if client.is_network_available() {
            "suitable"
        } else {
            "NOT SUITABLE"
        }
    );

    let files = client.list_files().await.context("listing files")?;
    let count = |s: SyncStatus| files.iter().filter(|f| f.sync_status == s).count();
    println!(
        "Files:    {} tracked ({} synced, {} pending, {} conflicted, {} failed)",
        files.len(),
        count(SyncStatus::Synced),
        count(SyncStatus::Pending),
        count(SyncStatus::Conflict),
        count(SyncStatus::Failed)
    );

    match ctx.config.auto_sync_interval_secs {
        Some(secs) => println!("Auto:     every {secs}s"),
        None => println!("Auto:     off"),
    }
    Ok(())
}

// ── `mbx auto` ────────────────────────────────────────────────────────────────

async fn cmd_auto(ctx: &Ctx) -> Result<()> {
    let interval = ctx
        .config
        .auto_sync_interval_secs
        .context("auto_sync_interval_secs is not set; add it to the config or run `mbx sync-all`")?;

    let client = ctx.client().await?;

    // The timer waits a full period before its first pass; run one now so
    // the operator sees immediate activity.
    println!("Running initial sync...");
    let result = client.sync_all_now().await.context("initial sync")?;
    println!(
        "  {} ok, {} failed, {} conflicts",
        result.success_count, result.failed_count, result.conflict_count
    );

    client.start_auto_sync().await;
    println!("Auto-sync every {interval}s. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    client.close().await;
    println!("Stopped.");
    Ok(())
}

// ── File lookup ───────────────────────────────────────────────────────────────

/// Accept a full id, an unambiguous id prefix, or an exact file name.
async fn resolve_file_id(client: &SyncClient, needle: &str) -> Result<String> {
    if client
        .get_file(needle)
        .await
        .context("querying catalog")?
        .is_some()
    {
        return Ok(needle.to_string());
    }

    let files = client.list_files().await.context("listing files")?;
    let matches: Vec<&FileMetadata> = files
        .iter()
        .filter(|f| f.file_id.starts_with(needle) || f.file_name == needle)
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no tracked file matches '{needle}'"),
        [one] => Ok(one.file_id.clone()),
        many => anyhow::bail!(
            "'{needle}' is ambiguous ({} matches); use the full id",
            many.len()
        ),
    }
}

// ── Progress display ──────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Drain a progress stream into a bar; report the terminal outcome.
async fn run_transfer(mut stream: ProgressStream, label: &str) -> Result<()> {
    let pb = make_progress_bar(0, label);
    let mut failure: Option<MbxError> = None;
    let mut last_status = None;

    while let Some(event) = stream.next().await {
        match event {
            Ok(update) => {
                if update.total_bytes > 0 {
                    pb.set_length(update.total_bytes);
                    pb.set_position(update.bytes_transferred);
                }
                pb.set_message(format!("{} [{}]", update.file_name, update.status.as_str()));
                last_status = Some(update.status);
            }
            Err(e) => failure = Some(e),
        }
    }

    match (failure, last_status) {
        (Some(e), _) => {
            pb.abandon_with_message("failed");
            Err(e).context(format!("{label} failed"))
        }
        (None, Some(SyncStatus::Conflict)) => {
            pb.abandon_with_message("conflict");
            println!("Conflict: the local and remote copies have both changed.");
            println!("Settle it with `mbx resolve <file> local|remote|newest`.");
            Ok(())
        }
        _ => {
            pb.finish_with_message("done");
            Ok(())
        }
    }
}

// ── Utilities ─────────────────────────────────────────────────────────────────

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(format!("{}/{}", home, &s[2..]))
    } else {
        path.to_path_buf()
    }
}

fn short_id(file_id: &str) -> &str {
    &file_id[..8.min(file_id.len())]
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
