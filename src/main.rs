//! resumable-importer command line.
//!
//! `import` runs one invocation of an import session. When the session
//! suspends (time limit, `--chunked`, or a shutdown signal) a JSON
//! continuation line is printed to stdout and the process exits with
//! [`EXIT_SUSPENDED`]; running the same command again with the printed
//! session id picks up where it stopped.

#![warn(clippy::all)]

mod cli;
mod config;
mod shutdown;
mod types;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use resumable_importer::content::SqliteContentStore;
use resumable_importer::import::{
    ArchiveReader, AttachmentMaterializer, HttpFetcher, ImportOutcome, ImportPipeline,
    ImportSummary, JsonArchiveReader,
};
use resumable_importer::runner::{ExecutionBudget, LoopExecutor, StdoutSink};
use resumable_importer::state::{
    CheckpointTracker, Housekeeper, SessionStore, SqliteSessionStore, BATCH_ID_KEY, UPDATED_AT_KEY,
};

/// Exit code of an invocation that suspended and must be re-invoked
/// (`EX_TEMPFAIL`).
const EXIT_SUSPENDED: i32 = 75;

async fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Open the session database, or `None` if it was never created.
async fn open_existing_store(state: &cli::StateArgs) -> anyhow::Result<Option<Arc<dyn SessionStore>>> {
    let db_path = config::state_db_path(state);
    if !db_path.exists() {
        println!("No session database found at {}", db_path.display());
        println!("Run an import first to create the database.");
        return Ok(None);
    }
    let store = SqliteSessionStore::open(&db_path).await?;
    Ok(Some(Arc::new(store)))
}

fn print_summary(session_id: &str, summary: &ImportSummary) {
    println!("Import complete (session {session_id})");
    println!();
    println!("Terms:");
    println!("  Imported: {}", summary.terms.succeed.len());
    println!("  Failed:   {}", summary.terms.failed.len());
    println!("Entities:");
    println!("  Imported: {}", summary.entities.succeed.len());
    println!("  Failed:   {}", summary.entities.failed.len());
    println!("  Skipped:  {}", summary.skipped.len());
    println!("Backfill:");
    println!("  Parents linked:     {}", summary.backfill.parents_linked);
    println!("  Parents unresolved: {}", summary.backfill.parents_unresolved);
    println!("  Meta refs updated:  {}", summary.backfill.meta_refs_updated);
    println!("  URLs rewritten:     {}", summary.backfill.urls_rewritten);

    if !summary.errors.is_empty() {
        println!();
        println!("Errors:");
        for error in &summary.errors {
            println!("  {error}");
        }
    }
}

/// Run the import command.
async fn run_import(args: cli::ImportArgs) -> anyhow::Result<()> {
    let config = config::Config::from_cli(args)?;
    tracing::debug!(?config, "Resolved configuration");

    ensure_parent(&config.state_db).await?;
    ensure_parent(&config.content_db).await?;

    let archive = JsonArchiveReader.parse(&config.archive).await?;
    let sessions: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::open(&config.state_db).await?);
    let content = Arc::new(SqliteContentStore::open(&config.content_db).await?);

    let token = shutdown::install_signal_handler();
    let budget = ExecutionBudget::new(config.time_limit, token);
    let tracker = CheckpointTracker::new(sessions, config.session_id.as_str());
    let executor = LoopExecutor::new(tracker, config.policy(), budget).with_name("import");

    let fetcher = Arc::new(HttpFetcher::build()?);
    let materializer =
        AttachmentMaterializer::new(content.clone(), fetcher, config.attachment_options());
    let pipeline = ImportPipeline::new(
        executor,
        content,
        materializer,
        Arc::new(StdoutSink),
        config.pipeline_options(),
    );

    tracing::info!(
        session = %config.session_id,
        archive = %config.archive.display(),
        "Starting import"
    );

    match pipeline.run(&archive).await? {
        ImportOutcome::Completed(summary) => {
            print_summary(&config.session_id, &summary);
            Ok(())
        }
        ImportOutcome::Suspended(continuation) => {
            tracing::info!(
                session = %continuation.session_id,
                context = %continuation.context,
                "Import suspended, re-run with --session-id {} to continue",
                continuation.session_id
            );
            std::process::exit(EXIT_SUSPENDED);
        }
    }
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let Some(store) = open_existing_store(&args.state).await? else {
        return Ok(());
    };

    let Some(session_id) = args.session_id else {
        let sessions = store.list_sessions().await?;
        if sessions.is_empty() {
            println!("No sessions.");
        }
        for (id, doc) in sessions {
            let updated = doc
                .get(UPDATED_AT_KEY)
                .and_then(serde_json::Value::as_i64)
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "never".to_string());
            match doc.get(BATCH_ID_KEY).and_then(serde_json::Value::as_str) {
                Some(batch) => println!("{id}  (updated {updated}, batch {batch})"),
                None => println!("{id}  (updated {updated})"),
            }
        }
        return Ok(());
    };

    let tracker = CheckpointTracker::new(store, session_id.as_str());
    let summary = tracker.summary().await?;

    println!("Session: {session_id}");
    if let Some(updated) = &summary.updated_at {
        println!("Last write: {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    println!("Processed items:");
    if summary.processed.is_empty() {
        println!("  (none)");
    }
    for (context, count) in &summary.processed {
        println!("  {context}: {count}");
    }
    println!();
    println!("Completed steps: {}", summary.completed_steps.join(", "));
    println!("Consecutive skips: {}", summary.consecutive_skips);
    println!("Skipped items: {}", summary.skipped.len());

    if args.skipped {
        for record in &summary.skipped {
            let when = record
                .recorded_at()
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_default();
            println!("  [{when}] {} {} - {}", record.context, record.key, record.reason);
        }
    }

    Ok(())
}

/// Run the reset-session command.
async fn run_reset_session(args: cli::ResetSessionArgs) -> anyhow::Result<()> {
    let Some(store) = open_existing_store(&args.state).await? else {
        return Ok(());
    };

    if !args.yes {
        print!("Delete all state of session {}? [y/N] ", args.session_id);
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    if store.delete(&args.session_id).await? {
        println!("Session {} deleted.", args.session_id);
    } else {
        println!("Session {} not found.", args.session_id);
    }
    Ok(())
}

/// Run the clean command.
async fn run_clean(args: cli::CleanArgs) -> anyhow::Result<()> {
    let Some(store) = open_existing_store(&args.state).await? else {
        return Ok(());
    };

    let housekeeper = Housekeeper::new(store, args.enable_housekeeping);
    if !housekeeper.is_enabled() {
        println!("Session housekeeping is disabled; pass --enable-housekeeping to delete sessions.");
        return Ok(());
    }

    let report = match &args.batch_id {
        Some(batch_id) => {
            housekeeper
                .delete_by_batch(batch_id, args.keep_session.as_deref())
                .await?
        }
        None => housekeeper.cleanup_expired(args.max_age_days).await?,
    };

    println!("Removed {} session(s).", report.removed_count());
    for id in &report.removed_ids {
        println!("  {id}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Import(args) => run_import(args).await,
        Command::Status(args) => run_status(args).await,
        Command::ResetSession(args) => run_reset_session(args).await,
        Command::Clean(args) => run_clean(args).await,
    }
}
