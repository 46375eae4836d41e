//! savesync: keep application save files in sync with remote storage
//!
//! - Content checksums decide what changed, never timestamps
//! - Paths are stored relative to the install folder or home folder
//! - Smart sync picks push or pull from recorded usage time
//! - Migrates flat folders written by older tools into the per-item layout

mod debug_log;
mod progress;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr as _, eyre};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use savesync_core::config::SaveSyncConfig;
use savesync_core::engine::{EngineSettings, SmartAction, SmartSyncOutcome, SyncEngine, TrackedItem};
use savesync_core::{ConflictPolicy, FsRecordStore, PathRoots, PortablePath};
use savesync_transport::RcloneTransport;

use crate::progress::{Progress, Status, print_status, print_warning, spinner};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "savesync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Keep application save files in sync with remote storage")]
#[command(long_about = r#"
savesync tracks save files by content checksum and moves them through rclone.

Examples:
  savesync scan hollow                        Detect changed save files
  savesync sync hollow                        Push or pull, whichever is fresher
  savesync session hollow                     Track while playing, sync on Ctrl+C
  savesync migrate hollow --policy merge      Adopt a legacy flat folder
  savesync contract /games/hollow Saves/a.sav Show the stored form of a path
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect changed files and record their checksums
    Scan {
        /// Item id from the config
        item: String,
    },

    /// Compare local and remote usage without transferring anything
    Status {
        item: String,

        /// Indifference threshold (default: manual threshold from config)
        #[arg(long)]
        threshold_minutes: Option<u64>,
    },

    /// Upload files whose content is not yet on the remote
    Push { item: String },

    /// Download files that differ from the remote
    Pull { item: String },

    /// Push or pull, whichever side has more usage recorded
    Sync {
        item: String,

        /// Use the automatic (post-exit) threshold
        #[arg(long)]
        auto: bool,
    },

    /// Scan periodically until Ctrl+C, then account usage and sync
    Session { item: String },

    /// Manage explicitly tracked files
    Track {
        #[command(subcommand)]
        action: TrackCommand,
    },

    /// Move a legacy flat remote folder into the per-item layout
    Migrate {
        item: String,

        /// keep-existing, replace-with-legacy or merge
        #[arg(short, long, default_value = "keep-existing")]
        policy: ConflictPolicy,

        /// Legacy remote folder (default: `legacy_remote` from config)
        #[arg(long)]
        from: Option<String>,
    },

    /// Print the portable form of a local path
    Contract {
        install_root: PathBuf,
        path: PathBuf,
    },

    /// Print the local path of a portable path
    Expand {
        install_root: PathBuf,
        portable: String,
    },

    /// Show version and build info
    Version,
}

#[derive(Subcommand)]
enum TrackCommand {
    /// Start tracking a file
    Add { item: String, path: PathBuf },

    /// Stop tracking a file, by its portable path
    Remove { item: String, portable: String },

    /// List tracked files
    List { item: String },
}

type Engine = SyncEngine<FsRecordStore, RcloneTransport>;

struct App {
    config: SaveSyncConfig,
    config_path: PathBuf,
    engine: Engine,
}

impl App {
    fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path
            .or_else(SaveSyncConfig::default_path)
            .ok_or_else(|| eyre!("no config directory on this platform, pass --config"))?;
        let config = SaveSyncConfig::load(&config_path)?;
        debug!(path = %config_path.display(), items = config.items.len(), "loaded config");

        let settings = EngineSettings {
            remote_root: config.remote.clone(),
            fetch_timeout: config.fetch_timeout(),
            transfer_timeout: config.transfer_timeout(),
            scan_interval: config.scan_interval(),
        };
        let engine = SyncEngine::new(
            FsRecordStore::new(config.state_dir()),
            RcloneTransport::new(&config.rclone_binary, config.rclone_args.clone()),
            settings,
        );

        Ok(Self {
            config,
            config_path,
            engine,
        })
    }

    fn item(&self, id: &str) -> Result<TrackedItem> {
        let config = self.config.item(id).ok_or_else(|| {
            eyre!(
                "unknown item `{id}`, add an [[item]] entry to {}",
                self.config_path.display()
            )
        })?;
        Ok(TrackedItem::from_config(config)?)
    }

    /// Item that is about to talk to the remote
    fn remote_item(&self, id: &str) -> Result<TrackedItem> {
        if self.config.remote.is_empty() {
            return Err(eyre!(
                "no remote configured, set `remote` in {}",
                self.config_path.display()
            ));
        }
        self.item(id)
    }
}

/// Cancel the token on the first Ctrl+C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("ctrl+c received");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let session = debug_log::init(cli.verbose);
    debug!(log = %session.log_path.display(), "debug log");

    match cli.command {
        Commands::Version => {
            eprintln!("savesync {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Contract { install_root, path } => {
            let portable = PathRoots::detect(install_root).contract(&path)?;
            println!("{portable}");
        }
        Commands::Expand {
            install_root,
            portable,
        } => {
            let local = PathRoots::detect(install_root).expand_str(&portable)?;
            println!("{}", local.display());
        }
        command => {
            let app = App::load(cli.config)?;
            run(&app, command).await?;
        }
    }

    drop(session);
    Ok(())
}

async fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Scan { item } => scan_command(app, &item),
        Commands::Status {
            item,
            threshold_minutes,
        } => status_command(app, &item, threshold_minutes).await,
        Commands::Push { item } => push_command(app, &item).await,
        Commands::Pull { item } => pull_command(app, &item).await,
        Commands::Sync { item, auto } => {
            let threshold = if auto {
                app.config.thresholds.automatic()
            } else {
                app.config.thresholds.manual()
            };
            sync_command(app, &item, threshold).await
        }
        Commands::Session { item } => session_command(app, &item).await,
        Commands::Track { action } => track_command(app, action),
        Commands::Migrate { item, policy, from } => {
            migrate_command(app, &item, policy, from).await
        }
        Commands::Contract { .. } | Commands::Expand { .. } | Commands::Version => Ok(()),
    }
}

fn scan_command(app: &App, id: &str) -> Result<()> {
    let item = app.item(id)?;
    let progress = Progress::new();
    let outcome = app.engine.scan(&item, &cancel_on_ctrl_c())?;
    progress.scan(&outcome);
    Ok(())
}

async fn status_command(app: &App, id: &str, threshold_minutes: Option<u64>) -> Result<()> {
    let item = app.remote_item(id)?;
    let threshold = threshold_minutes
        .map_or_else(|| app.config.thresholds.manual(), |m| Duration::from_secs(m * 60));

    let records = app.engine.records(&item);
    print_status(
        Status::TRACKING,
        &format!(
            "{} files, {} ({} pending upload)",
            records.len(),
            humansize::format_size(records.total_size(), humansize::BINARY),
            records.pending_upload().len()
        ),
    );
    if let Some(last) = records.metadata.last_sync {
        print_status(
            "Last sync",
            &format!(
                "{:?} at {}, {} transferred, {} failed",
                last.outcome, last.at, last.transferred, last.failed
            ),
        );
    }

    let pb = spinner(Status::COMPARING, app.engine.remote_dir(&item));
    let comparison = app.engine.compare(&item, threshold).await;
    pb.finish_and_clear();

    Progress::new().comparison(&comparison);
    print_status(
        "Recommends",
        &format!("{:?}", comparison.recommendation()).to_lowercase(),
    );
    Ok(())
}

async fn push_command(app: &App, id: &str) -> Result<()> {
    let item = app.remote_item(id)?;
    let cancel = cancel_on_ctrl_c();
    let progress = Progress::new();

    let scan = app.engine.scan(&item, &cancel)?;
    debug!(changed = scan.candidates.len(), "scanned before push");

    let pb = spinner(Status::UPLOADING, app.engine.remote_dir(&item));
    let report = app.engine.push(&item, &cancel).await;
    pb.finish_and_clear();

    progress.transfer(&report?);
    Ok(())
}

async fn pull_command(app: &App, id: &str) -> Result<()> {
    let item = app.remote_item(id)?;
    let progress = Progress::new();

    let pb = spinner(Status::DOWNLOADING, app.engine.remote_dir(&item));
    let report = app.engine.pull(&item, &cancel_on_ctrl_c()).await;
    pb.finish_and_clear();

    progress.transfer(&report?);
    Ok(())
}

fn print_smart_sync(progress: &Progress, outcome: &SmartSyncOutcome) {
    progress.comparison(&outcome.comparison);
    match &outcome.action {
        SmartAction::Pushed(report) | SmartAction::Pulled(report) => progress.transfer(report),
        SmartAction::UpToDate => print_status(Status::FRESH, "nothing to transfer"),
    }
}

async fn sync_command(app: &App, id: &str, threshold: Duration) -> Result<()> {
    let item = app.remote_item(id)?;
    let progress = Progress::new();

    let pb = spinner(Status::COMPARING, app.engine.remote_dir(&item));
    let outcome = app
        .engine
        .smart_sync(&item, threshold, &cancel_on_ctrl_c())
        .await;
    pb.finish_and_clear();

    print_smart_sync(&progress, &outcome?);
    Ok(())
}

async fn session_command(app: &App, id: &str) -> Result<()> {
    let item = app.remote_item(id)?;
    let started = Instant::now();
    print_status(
        Status::TRACKING,
        &format!("{} (Ctrl+C to end the session)", item.key),
    );

    let summary = app.engine.track_session(&item, &cancel_on_ctrl_c()).await;
    let elapsed = started.elapsed();
    debug!(scans = summary.scans, changed = summary.changed, "session loop ended");

    let progress = Progress::new();
    let outcome = app.engine.finish_session(&item, elapsed)?;
    progress.scan(&outcome);
    print_status("Played", &progress::format_usage(elapsed));

    let pb = spinner(Status::COMPARING, app.engine.remote_dir(&item));
    let synced = app
        .engine
        .smart_sync(&item, app.config.thresholds.automatic(), &cancel_on_ctrl_c())
        .await;
    pb.finish_and_clear();

    print_smart_sync(&progress, &synced?);
    Ok(())
}

fn track_command(app: &App, action: TrackCommand) -> Result<()> {
    match action {
        TrackCommand::Add { item, path } => {
            let item = app.item(&item)?;
            let absolute = std::path::absolute(&path)
                .wrap_err_with(|| format!("failed to resolve {}", path.display()))?;
            let portable = app.engine.track(&item, &absolute)?;
            print_status(Status::TRACKING, portable.as_str());
        }
        TrackCommand::Remove { item, portable } => {
            let item = app.item(&item)?;
            let portable = PortablePath::parse(&portable)?;
            match app.engine.untrack(&item, &portable)? {
                Some(_) => print_status("Removed", portable.as_str()),
                None => print_warning("Unknown", &format!("{portable} is not tracked")),
            }
        }
        TrackCommand::List { item } => {
            let item = app.item(&item)?;
            let records = app.engine.records(&item);
            for record in records.records.values() {
                let state = if record.needs_upload() {
                    "pending"
                } else {
                    "synced"
                };
                let local = local_display(&item.roots, &record.portable_path);
                println!(
                    "{:<8} {:>10}  {}  {}",
                    state,
                    humansize::format_size(record.size_bytes, humansize::BINARY),
                    record.portable_path,
                    local
                );
            }
        }
    }
    Ok(())
}

fn local_display(roots: &PathRoots, portable: &PortablePath) -> String {
    match roots.expand(portable) {
        Ok(path) => path.display().to_string(),
        Err(e) => {
            warn!(%portable, error = %e, "cannot expand on this machine");
            String::from("-")
        }
    }
}

async fn migrate_command(
    app: &App,
    id: &str,
    policy: ConflictPolicy,
    from: Option<String>,
) -> Result<()> {
    let item = app.remote_item(id)?;
    let legacy = from
        .or_else(|| app.config.item(id).and_then(|i| i.legacy_remote.clone()))
        .ok_or_else(|| eyre!("no legacy folder for `{id}`, pass --from or set legacy_remote"))?;
    let progress = Progress::new();

    let pb = spinner(
        Status::MIGRATING,
        format!("{legacy} -> {}", app.engine.remote_dir(&item)),
    );
    let outcome = app
        .engine
        .migrate(&item, &legacy, policy, &cancel_on_ctrl_c())
        .await;
    pb.finish_and_clear();

    progress.migration(&outcome?);
    Ok(())
}
