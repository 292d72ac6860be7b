use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{AppConfig, ConfigLoader, CONFIG_ENV, DATA_ENV};
use crate::gateway::{RemoteNotes, SessionAccount};
use crate::retry::RetryPolicy;
use crate::storage::{LocalState, SqliteBackend};
use crate::store::{StoreOptions, SyncStore};

pub mod commands;

use self::commands::{ListArgs, NewArgs, ShareArgs};

#[derive(Parser, Debug)]
#[command(
    name = "notes-sync",
    version,
    about = "Offline-first notes with background sync"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the config file location (takes precedence over NOTESYNC_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over NOTESYNC_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Account to sign in as, overriding account.id from the config
    #[arg(long)]
    pub account: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print notes for the current view
    List(ListArgs),
    /// Create a note
    New(NewArgs),
    /// Print every tag in use
    Tags,
    /// Print notes whose latest edit has not reached the backend
    Pending,
    /// Upload local work and reload from the backend
    Sync,
    /// Print a published note by its public slug
    Share(ShareArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var(CONFIG_ENV, path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var(DATA_ENV, path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let mut config = loader.load_or_init()?;
    if let Some(account) = cli.account.clone() {
        config.account.id = Some(account);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    let output = runtime.block_on(execute(&config, cli.command))?;
    print!("{output}");
    Ok(())
}

async fn execute(config: &AppConfig, command: Commands) -> Result<String> {
    let backend = SqliteBackend::open(&config.storage.backend_database)?;
    let local = LocalState::open(&config.storage.state_database)?;
    let session = match &config.account.id {
        Some(id) => SessionAccount::signed_in(id.as_str()),
        None => SessionAccount::default(),
    };
    let gateway = RemoteNotes::new(
        Arc::new(backend),
        Arc::new(session),
        RetryPolicy::from(&config.retry),
    );
    let store = SyncStore::with_local_state(gateway.clone(), StoreOptions::from(config), local);

    let output = match command {
        Commands::List(args) => commands::list_notes(&store, args).await,
        Commands::New(args) => commands::new_note(&store, args).await,
        Commands::Tags => Ok(commands::list_tags(&store)),
        Commands::Pending => Ok(commands::list_pending(&store)),
        Commands::Sync => commands::sync(&store, &gateway).await,
        Commands::Share(args) => commands::show_shared(&gateway, args).await,
    };
    // Let background writes finish before the runtime goes away.
    store.settle().await;
    output
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| anyhow::anyhow!(err))
    })
    .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_list_flags() {
        let cli = Cli::try_parse_from([
            "notes-sync",
            "--account",
            "acct-1",
            "list",
            "--archived",
            "--tag",
            "work",
            "--sort",
            "title",
        ])
        .unwrap();
        assert_eq!(cli.account.as_deref(), Some("acct-1"));
        match cli.command {
            Commands::List(args) => {
                assert!(args.archived);
                assert_eq!(args.tag.as_deref(), Some("work"));
                assert_eq!(args.sort, Some(crate::model::SortMode::Title));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn new_accepts_repeated_tags() {
        let cli = Cli::try_parse_from([
            "notes-sync", "new", "Plan", "--tag", "a", "--tag", "b",
        ])
        .unwrap();
        match cli.command {
            Commands::New(args) => {
                assert_eq!(args.title.as_deref(), Some("Plan"));
                assert_eq!(args.tags, vec!["a", "b"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_sort_mode_is_rejected() {
        assert!(Cli::try_parse_from(["notes-sync", "list", "--sort", "random"]).is_err());
    }
}
