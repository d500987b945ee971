use std::io::Read;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use formsync::sync::monitor::watch_reachability;
use formsync::{FormSync, ProcessSummary, Response, SyncProgress, SyncQueueEntry};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "formsync", about = "Offline-first survey response store and sync client")]
struct Cli {
    /// Database path (default: ~/.formsync/formsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl SyncProgress for StderrProgress {
    fn on_run_start(&self, pending: usize) {
        if pending > 0 {
            eprintln!("Syncing {pending} queued entries...");
        }
    }

    fn on_entry_start(&self, entry: &SyncQueueEntry, index: usize, total: usize) {
        eprintln!(
            "[{}/{}] {} #{} ({} responses)",
            index + 1,
            total,
            entry.operation,
            entry.id,
            entry.payload.responses().len()
        );
    }

    fn on_entry_failed(&self, _entry: &SyncQueueEntry, error: &str, parked: bool) {
        if parked {
            eprintln!("  Failed permanently, needs review: {error}");
        } else {
            eprintln!("  Failed, will retry: {error}");
        }
    }

    fn on_run_complete(&self, summary: &ProcessSummary) {
        if summary.attempted > 0 {
            eprintln!(
                "  Done: {} synced, {} failed ({} parked)",
                summary.succeeded, summary.failed, summary.dead_lettered
            );
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show local store and sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage in-progress drafts
    Draft {
        #[command(subcommand)]
        action: DraftAction,
    },
    /// Finalize one response from a JSON file (or - for stdin)
    Submit {
        #[arg(value_name = "FILE")]
        file: String,
    },
    /// Finalize a JSON array of responses as one batch
    Import {
        #[arg(value_name = "FILE")]
        file: String,
    },
    /// Inspect and repair the sync queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Re-enqueue unsynced responses that have no queue entry
    Recover,
    /// Run the sync queue once against the configured endpoint
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Watch connectivity and sync automatically until interrupted
    Watch,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Delete all local responses, drafts, and queued work
    Clear {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Run the reference sync server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
        /// Server database path (default: ~/.formsync/server.db)
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(Subcommand)]
enum DraftAction {
    /// Save answers for a session, replacing any earlier draft
    Save {
        session_id: String,
        /// JSON object of answers (file path or - for stdin)
        #[arg(value_name = "FILE")]
        file: String,
        #[arg(long)]
        survey: Option<String>,
    },
    /// Show the draft for a session
    Show { session_id: String },
    /// List all drafts
    List,
    /// Discard the draft for a session
    Discard { session_id: String },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued entries, oldest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Give failed entries a fresh retry budget (all of them if no id)
    Retry { id: Option<i64> },
    /// Abandon an entry and the unsynced responses it carries
    Drop { id: i64 },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// Remove a config value
    Unset { key: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Commands::Serve { bind, data } = &cli.command {
        return handle_serve(bind, data.as_deref()).await;
    }

    let db = match &cli.db {
        Some(path) => formsync::Database::open_at(path).await?,
        None => formsync::Database::open().await?,
    };
    let session = FormSync::open(db).await?;

    match cli.command {
        Commands::Status { json } => print_status(&session, json).await?,
        Commands::Draft { action } => handle_draft(&session, action).await?,
        Commands::Submit { file } => {
            let response: Response = serde_json::from_value(read_json(&file)?)?;
            let id = session.save_response(response).await?;
            println!("Saved {id} locally, pending sync.");
        }
        Commands::Import { file } => {
            let responses: Vec<Response> = serde_json::from_value(read_json(&file)?)?;
            let ids = session.save_responses(responses).await?;
            println!("Saved {} responses locally as one batch, pending sync.", ids.len());
        }
        Commands::Queue { action } => handle_queue(&session, action).await?,
        Commands::Recover => {
            let n = session.store().recover_orphans().await?;
            println!("Re-enqueued {n} responses.");
        }
        Commands::Sync { json } => {
            let summary = session.sync_now(&StderrProgress).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_sync_summary(&summary);
            }
        }
        Commands::Watch => handle_watch(&session).await?,
        Commands::Config { action } => handle_config(&session, action).await?,
        Commands::Clear { yes } => {
            if !yes {
                anyhow::bail!("refusing to clear local data without --yes");
            }
            session.store().clear_all().await?;
            println!("Local data cleared.");
        }
        Commands::Serve { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Read JSON from a file path, or stdin for `-`.
fn read_json(path: &str) -> anyhow::Result<serde_json::Value> {
    let raw = if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)?
    };
    Ok(serde_json::from_str(&raw)?)
}

async fn print_status(session: &FormSync, json: bool) -> anyhow::Result<()> {
    let stats = session.stats().await?;
    let failed = session.store().failed_entries().await?;
    let last_run = session.store().recent_runs(1).await?.into_iter().next();

    if json {
        let out = serde_json::json!({
            "stats": stats,
            "failed_entries": failed,
            "endpoint": session.settings().endpoint.as_ref().map(|u| u.as_str()),
            "last_run": last_run,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "Responses: {} ({} synced, {} saved locally, pending sync)",
        stats.total_responses, stats.synced_responses, stats.unsynced_responses
    );
    println!("Drafts:    {}", stats.drafts);
    if failed > 0 {
        println!("Queue:     {} entries ({failed} need review)", stats.sync_queue);
    } else {
        println!("Queue:     {} entries", stats.sync_queue);
    }
    match &session.settings().endpoint {
        Some(url) => println!("Endpoint:  {url}"),
        None => println!("Endpoint:  not configured"),
    }
    match last_run {
        Some(run) => println!(
            "Last sync: {} ({}, {} trigger, {}/{} succeeded)",
            run.completed_at.as_deref().unwrap_or(&run.started_at),
            run.status,
            run.trigger,
            run.succeeded,
            run.attempted
        ),
        None => println!("Last sync: never"),
    }
    Ok(())
}

fn print_sync_summary(summary: &ProcessSummary) {
    if summary.attempted == 0 {
        println!("Nothing to sync.");
        return;
    }
    println!(
        "Sync {}: {} entries attempted, {} succeeded, {} failed, {} responses synced",
        summary.status.as_str(),
        summary.attempted,
        summary.succeeded,
        summary.failed,
        summary.responses_synced
    );
    if summary.dead_lettered > 0 {
        println!(
            "{} entries were parked. Inspect with 'formsync queue list', then 'formsync queue retry'.",
            summary.dead_lettered
        );
    }
}

async fn handle_draft(session: &FormSync, action: DraftAction) -> anyhow::Result<()> {
    match action {
        DraftAction::Save {
            session_id,
            file,
            survey,
        } => {
            let answers = match read_json(&file)? {
                serde_json::Value::Object(map) => map,
                _ => anyhow::bail!("draft answers must be a JSON object"),
            };
            session
                .save_draft(&session_id, survey.as_deref(), answers)
                .await?;
            println!("Draft saved for session {session_id}.");
        }
        DraftAction::Show { session_id } => match session.get_draft(&session_id).await? {
            Some(draft) => println!("{}", serde_json::to_string_pretty(&draft)?),
            None => println!("No draft for session {session_id}."),
        },
        DraftAction::List => {
            let drafts = session.store().list_drafts().await?;
            if drafts.is_empty() {
                println!("No drafts.");
            }
            for draft in drafts {
                println!(
                    "{}  survey={}  answers={}  saved={}",
                    draft.session_id,
                    draft.survey_id.as_deref().unwrap_or("-"),
                    draft.answers.len(),
                    draft.saved_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        DraftAction::Discard { session_id } => {
            if session.store().discard_draft(&session_id).await? {
                println!("Draft discarded.");
            } else {
                println!("No draft for session {session_id}.");
            }
        }
    }
    Ok(())
}

async fn handle_queue(session: &FormSync, action: QueueAction) -> anyhow::Result<()> {
    match action {
        QueueAction::List { json } => {
            let entries = session.store().list_queue().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            if entries.is_empty() {
                println!("Sync queue is empty.");
            }
            for entry in entries {
                println!(
                    "#{:<5} {:<16} {:<8} retries={}  responses={}",
                    entry.id,
                    entry.operation,
                    entry.status,
                    entry.retries,
                    entry.payload.response_ids().join(",")
                );
                if let Some(err) = &entry.last_error {
                    println!("       last error: {err}");
                }
            }
        }
        QueueAction::Retry { id } => {
            let n = session.store().retry_failed(id).await?;
            println!("{n} entries back in the queue.");
        }
        QueueAction::Drop { id } => {
            match session.store().discard_entry(id).await? {
                Some(n) => println!("Entry #{id} dropped along with {n} unsynced responses."),
                None => return Err(formsync::Error::NotFound(format!("queue entry #{id}")).into()),
            }
        }
    }
    Ok(())
}

async fn handle_watch(session: &FormSync) -> anyhow::Result<()> {
    let remote = Arc::new(session.remote()?);
    let progress: Arc<dyn SyncProgress> = Arc::new(StderrProgress);

    let initial = remote.probe().await;
    let (signals_tx, signals_rx) = watch::channel(initial);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let probe = tokio::spawn(watch_reachability(
        remote.clone(),
        session.settings().probe_interval,
        signals_tx,
        shutdown_rx.clone(),
    ));
    let monitor = tokio::spawn(
        session
            .monitor(remote.clone(), progress)
            .run(signals_rx, shutdown_rx),
    );

    eprintln!(
        "Watching {} ({}). Press Ctrl-C to stop.",
        remote.endpoint(),
        if initial { "online" } else { "offline" }
    );
    tokio::signal::ctrl_c().await?;
    shutdown_tx.send_replace(true);
    let (probe, monitor) = tokio::join!(probe, monitor);
    probe?;
    monitor?;
    Ok(())
}

async fn handle_config(session: &FormSync, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match session.get_config(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            session.set_config(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::Unset { key } => {
            if session.unset_config(&key).await? {
                println!("{key} removed.");
            } else {
                println!("{key} is not set");
            }
        }
        ConfigAction::List => {
            let items = session.list_config().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

async fn handle_serve(bind: &str, data: Option<&str>) -> anyhow::Result<()> {
    let path = match data {
        Some(path) => std::path::PathBuf::from(path),
        None => {
            let dir = dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?
                .join(".formsync");
            std::fs::create_dir_all(&dir)?;
            dir.join("server.db")
        }
    };
    let db = formsync::Database::open_with_schema(&path, formsync::storage::Schema::Server).await?;
    let listener = tokio::net::TcpListener::bind(bind).await?;
    formsync::server::serve(listener, formsync::server::ServerStore::new(db), async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}
