use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use newsync::config::Config;
use newsync::remote;
use newsync::storage::{Database, DatabaseError, EntryFlag};
use newsync::sync::{FeedResult, SessionResult, SessionStatus, SyncOrchestrator, SyncSettings, TriggerResult};

/// Get the config directory path (~/.config/newsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("newsync"))
}

/// Create `dir` if needed and restrict it to the current user.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        tracing::info!(path = %dir.display(), "Created data directory");
    }

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "Failed to set directory permissions to 0700"
            );
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "newsync", version, about = "Keep a local feed cache in sync with a news server")]
struct Args {
    /// Config file (default: ~/.config/newsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache database (default: ~/.config/newsync/newsync.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync pass and print its summary
    Sync,
    /// List cached feeds with unread counts
    Feeds,
    /// List cached entries of a feed, blocked words applied
    Entries {
        feed_id: String,
        /// Only unread entries
        #[arg(long)]
        unread: bool,
    },
    /// Subscribe to a feed
    Add { url: String },
    /// Rename a feed
    Rename { feed_id: String, title: String },
    /// Unsubscribe from a feed
    Delete { feed_id: String },
    /// Mark an entry read
    Read {
        entry_id: String,
        /// Mark unread instead
        #[arg(long)]
        unread: bool,
    },
    /// Star an entry
    Star {
        entry_id: String,
        /// Remove the star instead
        #[arg(long)]
        unstar: bool,
    },
    /// Change local display preferences of a feed
    Prefs {
        feed_id: String,
        #[arg(long)]
        open_in_browser: Option<bool>,
        /// Comma or newline separated words hiding matching entries
        #[arg(long)]
        blocked_words: Option<String>,
    },
    /// Show cache statistics and unsent flag changes
    Status,
    /// Sync periodically until interrupted
    Daemon,
    /// Clear the local cache
    Logout,
}

impl Command {
    /// Commands that read or change the cache benefit from a fresh pass first.
    fn wants_startup_sync(&self) -> bool {
        !matches!(self, Command::Sync | Command::Daemon | Command::Logout)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => get_config_dir()?.join("config.toml"),
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = match args.db {
        Some(path) => path,
        None => {
            let dir = get_config_dir()?;
            ensure_private_dir(&dir)?;
            dir.join("newsync.db")
        }
    };
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: Another instance of newsync appears to be running. Please close it and try again.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let client = remote::connect(&config, db.clone()).context("Failed to set up the remote backend")?;
    let orchestrator = SyncOrchestrator::new(db, client, SyncSettings::from_config(&config));

    if config.sync_on_startup && args.command.wants_startup_sync() {
        if let TriggerResult::Ran(result) = orchestrator.trigger_sync().await {
            if !result.is_success() {
                eprintln!("Warning: startup sync did not complete, showing cached data");
            }
        }
    }

    run_command(&orchestrator, &config, args.command).await
}

async fn run_command(orchestrator: &SyncOrchestrator, config: &Config, command: Command) -> Result<()> {
    let db = orchestrator.db();

    match command {
        Command::Sync => match orchestrator.trigger_sync().await {
            TriggerResult::Ran(result) => {
                print_session(&result);
                if !result.is_success() {
                    std::process::exit(2);
                }
            }
            other => println!("Sync already running: {other:?}"),
        },

        Command::Feeds => {
            let feeds = db.get_feeds().await.context("Failed to load feeds")?;
            let counts: std::collections::HashMap<String, i64> = db
                .get_unread_counts()
                .await
                .context("Failed to load unread counts")?
                .into_iter()
                .collect();
            if feeds.is_empty() {
                println!("No feeds. Add one with: newsync add <url>");
            }
            for feed in feeds {
                let unread = counts.get(&feed.id).copied().unwrap_or(0);
                println!("{:>5}  {}  {}", unread, feed.id, feed.title);
            }
        }

        Command::Entries { feed_id, unread } => {
            let entries = db
                .get_visible_entries(&feed_id, unread)
                .await
                .with_context(|| format!("Failed to load entries of feed {feed_id}"))?;
            for entry in entries {
                let marker = match (entry.read, entry.starred) {
                    (_, true) => '*',
                    (false, false) => 'N',
                    (true, false) => ' ',
                };
                println!("{marker} {}  {}", entry.id, entry.title);
                if let Some(link) = &entry.link {
                    println!("    {link}");
                }
            }
        }

        Command::Add { url } => {
            let feed = orchestrator.add_feed(&url).await.context("Failed to add feed")?;
            println!("Added {}  {}", feed.id, feed.title);
        }

        Command::Rename { feed_id, title } => {
            orchestrator
                .rename_feed(&feed_id, &title)
                .await
                .context("Failed to rename feed")?;
            println!("Renamed {feed_id}");
        }

        Command::Delete { feed_id } => {
            orchestrator
                .delete_feed(&feed_id)
                .await
                .context("Failed to delete feed")?;
            println!("Deleted {feed_id}");
        }

        Command::Read { entry_id, unread } => {
            orchestrator
                .set_entry_flag(&entry_id, EntryFlag::Read, !unread)
                .await
                .context("Failed to update read state")?;
        }

        Command::Star { entry_id, unstar } => {
            orchestrator
                .set_entry_flag(&entry_id, EntryFlag::Starred, !unstar)
                .await
                .context("Failed to update star")?;
        }

        Command::Prefs {
            feed_id,
            open_in_browser,
            blocked_words,
        } => {
            let feed = orchestrator
                .set_feed_preferences(&feed_id, open_in_browser, blocked_words.as_deref())
                .await
                .context("Failed to update feed preferences")?;
            println!(
                "{}: open in browser = {}, blocked words = {:?}",
                feed.id,
                feed.open_entries_in_browser,
                feed.blocked_words_list()
            );
        }

        Command::Status => {
            let feeds = db.get_feeds().await.context("Failed to load feeds")?;
            let unread: i64 = db
                .get_unread_counts()
                .await
                .context("Failed to load unread counts")?
                .iter()
                .map(|(_, n)| n)
                .sum();
            let pending = db.get_pending_flags().await.context("Failed to load pending changes")?;

            println!("Backend:  {}", config.backend);
            println!("Feeds:    {}", feeds.len());
            println!("Unread:   {unread}");
            println!("Pending:  {}", pending.len());
            for p in pending {
                println!("    {} {}={}", p.entry_id, p.flag, p.value);
            }
        }

        Command::Daemon => {
            let interval = config.background_interval().ok_or_else(|| {
                anyhow::anyhow!("background_sync_interval_minutes is 0; set it in the config to run the daemon")
            })?;
            tracing::info!(interval_secs = interval.as_secs(), "Starting periodic sync");

            let mut states = orchestrator.subscribe();
            let reporter = async {
                while states.changed().await.is_ok() {
                    let last = states.borrow_and_update().last_result().cloned();
                    if let Some(result) = last {
                        print_session(&result);
                    }
                }
            };

            tokio::select! {
                _ = orchestrator.run_periodic(interval) => {}
                _ = reporter => {}
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl-C")?;
                    tracing::info!("Interrupted, stopping");
                }
            }
        }

        Command::Logout => {
            orchestrator.logout().await.context("Failed to clear the cache")?;
            println!("Local cache cleared.");
        }
    }

    Ok(())
}

fn print_session(result: &SessionResult) {
    let elapsed = (result.finished_at - result.started_at).num_milliseconds();
    match &result.status {
        SessionStatus::Success if result.is_partial() => {
            println!("Sync finished with errors in {elapsed} ms")
        }
        SessionStatus::Success => println!("Sync finished in {elapsed} ms"),
        SessionStatus::Failed(reason) => println!("Sync failed after {elapsed} ms: {reason}"),
    }

    if let Some(feeds) = &result.feeds {
        if feeds.replaced {
            println!(
                "  feeds: {} total, {} added, {} removed",
                feeds.total,
                feeds.added.len(),
                feeds.removed.len()
            );
        }
    }
    if result.pending.acknowledged + result.pending.dropped + result.pending.deferred > 0 {
        println!(
            "  pending changes: {} sent, {} dropped, {} kept",
            result.pending.acknowledged, result.pending.dropped, result.pending.deferred
        );
    }
    for outcome in &result.outcomes {
        match &outcome.result {
            FeedResult::Synced(stats) if stats.merged.inserted > 0 => {
                println!("  {}: {} new", outcome.feed_id, stats.merged.inserted)
            }
            FeedResult::Synced(_) => {}
            FeedResult::Vanished => println!("  {}: removed by the server", outcome.feed_id),
            FeedResult::Failed { kind, message } => {
                println!("  {}: failed ({}): {message}", outcome.feed_id, kind.label())
            }
        }
    }
}
