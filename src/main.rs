//! mediacheck: track films, series, manga and music from the terminal,
//! online or offline.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use mediacheck::probe::FixedProbe;
use mediacheck::{
    Config, ConsumptionState, MediaDraft, MediaRef, MediaType, SyncOutcome, Tracker,
};

#[derive(Parser, Debug)]
#[command(name = "mediacheck", version, about = "Personal media tracker with offline sync")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Never contact the server for this invocation
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in (falls back to the cached account when the server is unreachable)
    Login {
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account (local-only when offline)
    Register {
        username: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    /// Link the current local-only account to the server
    Upgrade {
        #[arg(long)]
        password: String,
    },
    /// List media with your state and score
    List,
    /// Add a media item
    Add {
        title: String,
        #[arg(long = "type")]
        media_type: MediaType,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        plot: Option<String>,
        #[arg(long)]
        chapters: Option<String>,
        #[arg(long = "quote")]
        quotes: Vec<String>,
    },
    /// Delete a media item (`12` or `local-3`)
    Delete { media: MediaRef },
    /// Set your consumption state: check, checked, viewing, done
    State {
        media: MediaRef,
        state: ConsumptionState,
    },
    /// Set (1-10) or clear your score
    Score {
        media: MediaRef,
        score: Option<u8>,
    },
    /// Push local changes and pull remote ones
    Sync,
    /// Show session, connectivity and pending work
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mediacheck=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<mediacheck::Error>() {
                Some(err) => {
                    error!("{:#}", e);
                    eprintln!("{}", err.user_message());
                }
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let mut tracker = Tracker::from_config(&config)?;
    if cli.offline {
        tracker = tracker.with_probe(Arc::new(FixedProbe::offline()));
    }

    match &cli.command {
        Command::Login { username, password } => {
            let session = tracker.login(username, password).await?;
            let mode = if session.is_offline { " (local-only account)" } else { "" };
            println!("Logged in as {}{}", session.username, mode);
            return Ok(());
        }
        Command::Register { username, password } => {
            let session = tracker.register(username, password).await?;
            if session.is_offline {
                println!("Created local-only account {}. Run `mediacheck upgrade` once online.", session.username);
            } else {
                println!("Registered {}", session.username);
            }
            return Ok(());
        }
        Command::Status => {
            tracker.restore_session().await?;
            return print_status(&tracker).await;
        }
        _ => {}
    }

    tracker
        .restore_session()
        .await?
        .context("Not logged in. Run `mediacheck login <username>` first.")?;

    match cli.command {
        Command::Logout => {
            tracker.logout().await?;
            println!("Logged out");
        }
        Command::Upgrade { password } => {
            let session = tracker.upgrade_offline_account(&password).await?;
            println!("{} is now linked to the server", session.username);
        }
        Command::List => {
            for item in tracker.media_with_user_data().await? {
                let id = match (item.media.id, item.media.local_id) {
                    (Some(id), _) => id.to_string(),
                    (None, Some(key)) => MediaRef::Local(key).to_string(),
                    (None, None) => "?".to_string(),
                };
                let state = item
                    .user_state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let score = item
                    .user_score
                    .map(|s| format!("{s}/10"))
                    .unwrap_or_default();
                println!(
                    "{:>9}  {:<7} {:<8} {} {}",
                    id, item.media.media_type, state, item.media.title, score
                );
            }
        }
        Command::Add {
            title,
            media_type,
            url,
            plot,
            chapters,
            quotes,
        } => {
            let mut draft = MediaDraft::new().title(title).media_type(media_type);
            if let Some(url) = url {
                draft = draft.url(url);
            }
            if let Some(plot) = plot {
                draft = draft.plot(plot);
            }
            if let Some(chapters) = chapters {
                draft = draft.chapters(chapters);
            }
            for quote in quotes {
                draft = draft.quote(quote);
            }
            let media = tracker.add_media(draft).await?;
            match media.id {
                Some(id) => println!("Added '{}' as {}", media.title, id),
                None => println!(
                    "Added '{}' locally as {}; it will be uploaded on the next sync",
                    media.title,
                    media.local_id.map(MediaRef::Local).map(|r| r.to_string()).unwrap_or_default()
                ),
            }
        }
        Command::Delete { media } => {
            tracker.delete_media(media).await?;
            println!("Deleted {}", media);
        }
        Command::State { media, state } => {
            let saved = tracker.set_state(media, state).await?;
            println!("{} is now {}", media, saved.state);
        }
        Command::Score { media, score } => {
            let saved = tracker.set_score(media, score).await?;
            match saved.score {
                Some(score) => println!("Scored {} {}/10", media, score),
                None => println!("Cleared score for {}", media),
            }
        }
        Command::Sync => match tracker.sync().await? {
            SyncOutcome::Completed(report) => println!(
                "Pushed {}, pulled {} ({} push failures, {} skipped)",
                report.pushed(),
                report.pulled(),
                report.push_failures,
                report.skipped_malformed + report.skipped_tombstoned
            ),
            SyncOutcome::AlreadyRunning => println!("A sync is already running"),
            SyncOutcome::Offline => println!("Offline; nothing synced"),
        },
        Command::Login { .. } | Command::Register { .. } | Command::Status => {}
    }

    Ok(())
}

async fn print_status(tracker: &Tracker) -> Result<()> {
    let status = tracker.status().await?;
    match &status.session {
        Some(s) if s.is_offline => println!("User:        {} (local-only)", s.username),
        Some(s) => println!("User:        {}", s.username),
        None => println!("User:        not logged in"),
    }
    println!("Server:      {}", if status.online { "reachable" } else { "unreachable" });
    println!(
        "Last sync:   {}",
        status
            .last_sync
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    println!("Unsynced:    {} media", status.unsynced_media);
    println!("Deletes:     {} pending", status.pending_deletes);
    if !status.offline_accounts.is_empty() {
        println!("Local-only:  {}", status.offline_accounts.join(", "));
    }
    Ok(())
}
