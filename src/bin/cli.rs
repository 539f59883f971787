use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lib::auth::AuthPrompt;
use lib::config::Config;
use lib::models::{Platform, SyncSummary};
use lib::sync::SyncManager;
use spotify_tidal_sync as lib;
use std::path::{Path, PathBuf};
use tracing::subscriber as tracing_subscriber_global;
use tracing::{info, warn};
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "spotify-tidal-sync", version)]
struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every playlist, or only the named ones
    Sync {
        /// Sync every playlist on both platforms
        #[arg(long, conflicts_with = "playlists")]
        all: bool,

        /// Playlist names to sync (looked up on Spotify first, then TIDAL)
        #[arg(long, num_args = 1..)]
        playlists: Vec<String>,
    },
    /// Reconcile a single playlist identified by platform and id
    SyncPair {
        #[arg(long)]
        source: Platform,
        #[arg(long)]
        target: Platform,
        #[arg(long)]
        playlist_id: String,
    },
    /// Log in to a platform and store its credential
    Auth { platform: Platform },
    /// Forget a platform's credential and cached playlists
    Disconnect { platform: Platform },
    /// Show the authentication state of both platforms
    Status,
    /// List cached playlists without touching the network
    Cached { platform: Platform },
    /// Fetch a platform's playlists and update the cache
    Refresh { platform: Platform },
    /// List playlist names present on both platforms
    Common,
    /// Validate config file and exit
    ConfigValidate,
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    let user = dirs::config_dir().map(|d| d.join("spotify-tidal-sync").join("config.toml"));
    [user, Some(PathBuf::from("config/example-config.toml"))]
        .into_iter()
        .flatten()
        .find(|p| p.exists())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut cfg = match path {
        Some(p) => Config::from_path(p).with_context(|| format!("loading config from {}", p.display()))?,
        None => Config::default(),
    };
    cfg.apply_env();
    Ok(cfg)
}

fn show_prompt(prompt: &AuthPrompt) {
    match prompt {
        AuthPrompt::Browser { url } => {
            println!("Opening your browser to log in. If it does not open, visit:\n  {}", url);
            if let Err(e) = webbrowser::open(url) {
                warn!("could not open a browser: {}", e);
            }
        }
        AuthPrompt::Device { verification_uri, user_code } => {
            println!("Visit {} and enter the code {}", verification_uri, user_code);
            let _ = webbrowser::open(verification_uri);
        }
    }
}

fn finish(summary: &SyncSummary) {
    print!("{}", summary);
    if !summary.is_success() {
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let config_path = resolve_config_path(cli.config.as_deref());
    let cfg = load_config(config_path.as_deref())?;

    if let Commands::ConfigValidate = cli.command {
        let problems = cfg.validate();
        if problems.is_empty() {
            println!("OK");
            return Ok(());
        }
        for p in &problems {
            eprintln!("Config validation failed: {}", p);
        }
        std::process::exit(2);
    }

    // Logs go to both stdout and a daily-rotated file in cfg.log_dir.
    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(&cfg.log_dir, "spotify-tidal-sync.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Honor RUST_LOG if set, otherwise default to info.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer);
    tracing_subscriber_global::set_global_default(subscriber).context("installing tracing subscriber")?;

    match &config_path {
        Some(p) => info!("Using config {}", p.display()),
        None => info!("No config file found; using defaults and environment"),
    }

    let manager = SyncManager::new(&cfg).context("opening local database")?;

    match cli.command {
        Commands::Sync { all, playlists } => {
            let cancel = manager.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received; finishing the current playlist");
                    cancel.cancel();
                }
            });
            let summary = if all || playlists.is_empty() {
                manager.sync_all().await?
            } else {
                manager.sync_by_names(&playlists).await?
            };
            finish(&summary);
        }
        Commands::SyncPair {
            source,
            target,
            playlist_id,
        } => {
            let outcome = manager.sync_pair(source, target, &playlist_id).await;
            println!("{}", outcome.message());
            if !outcome.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Auth { platform } => {
            match manager.sessions().authenticate_interactive(platform, show_prompt).await {
                Ok(session) => println!(
                    "{} authenticated; token valid until {}",
                    platform,
                    session.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
                ),
                Err(e) => {
                    eprintln!("Authentication failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Disconnect { platform } => {
            let purged = manager.sessions().disconnect(platform).await?;
            println!("{} disconnected; {} cached playlists removed", platform, purged);
        }
        Commands::Status => {
            for platform in Platform::ALL {
                match manager.sessions().load_session(platform).await {
                    Ok(Some(session)) => println!(
                        "{:<8} authenticated (expires {})",
                        platform.to_string(),
                        session.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                    Ok(None) => println!("{:<8} not authenticated", platform.to_string()),
                    Err(e) => println!("{:<8} not authenticated: {}", platform.to_string(), e),
                }
            }
        }
        Commands::Cached { platform } => {
            let cached = manager.list_cached(platform).await?;
            if cached.is_empty() {
                println!("No cached {} playlists. Run `refresh {}` first.", platform, platform);
            }
            for entry in cached {
                let synced = entry
                    .last_synced_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "- {} ({}) {} tracks, last synced {}",
                    entry.name, entry.playlist_id, entry.track_count, synced
                );
            }
        }
        Commands::Refresh { platform } => match manager.refresh(platform).await {
            Ok(playlists) => println!("Cached {} {} playlists", playlists.len(), platform),
            Err(e) => {
                eprintln!("Failed to list {} playlists: {}", platform, e);
                std::process::exit(1);
            }
        },
        Commands::Common => {
            let names = manager.common_playlists().await?;
            if names.is_empty() {
                println!("No playlist names are shared between Spotify and TIDAL.");
            }
            for name in names {
                println!("- {}", name);
            }
        }
        Commands::ConfigValidate => unreachable!("handled before logging is set up"),
    }

    Ok(())
}
