use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "resumable-importer",
    version,
    about = "Import content archives in resumable, checkpointed chunks"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run or resume an import session
    Import(ImportArgs),

    /// Show the progress of a session
    Status(StatusArgs),

    /// Delete a session's state
    ResetSession(ResetSessionArgs),

    /// Remove expired sessions or every session of a batch
    Clean(CleanArgs),
}

/// Where session state lives.
#[derive(Args, Debug, Clone)]
pub struct StateArgs {
    /// Directory for state and content databases
    #[arg(long, default_value = "~/.resumable-importer", env = "RESUMABLE_IMPORTER_DIR")]
    pub state_directory: String,

    /// Session database (default: <state-directory>/sessions.db)
    #[arg(long)]
    pub state_db: Option<String>,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Archive to import (JSON export)
    pub archive: String,

    #[command(flatten)]
    pub state: StateArgs,

    /// Session to resume (a new one is created when omitted)
    #[arg(long, env = "RESUMABLE_IMPORTER_SESSION")]
    pub session_id: Option<String>,

    /// Batch the session belongs to, for `clean --batch-id`
    #[arg(long)]
    pub batch_id: Option<String>,

    /// Suffix for loop contexts, to run several imports in one session
    #[arg(long)]
    pub discriminator: Option<String>,

    /// Content database (default: <state-directory>/content.db)
    #[arg(long)]
    pub content_db: Option<String>,

    /// Directory attachments are stored in (default: <state-directory>/uploads)
    #[arg(long)]
    pub uploads_dir: Option<String>,

    /// Public URL of the uploads directory
    #[arg(long, default_value = "/uploads")]
    pub uploads_url: String,

    /// Resolve relative attachment URLs against this instead of the archive's base URL
    #[arg(long)]
    pub base_url: Option<String>,

    /// Entity types to import, comma-separated (default: all)
    #[arg(long = "types", value_delimiter = ',')]
    pub types: Vec<String>,

    /// Record failing items and move on instead of aborting
    #[arg(long)]
    pub skip_on_error: bool,

    /// Failures an item may accumulate before it is skipped for good
    #[arg(long, default_value_t = 2)]
    pub max_error_attempts: u32,

    /// Abort after this many consecutively skipped items (0 disables)
    #[arg(long, default_value_t = 5)]
    pub max_consecutive_skips: u32,

    /// Suspend after every item
    #[arg(long)]
    pub chunked: bool,

    /// Suspend once this many seconds have elapsed
    #[arg(long)]
    pub time_limit: Option<u64>,

    /// Do not fetch attachments
    #[arg(long)]
    pub no_attachments: bool,

    /// Largest attachment to accept, in bytes (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_attachment_size: u64,

    /// Attempts per attachment fetch
    #[arg(long, default_value_t = 3)]
    pub fetch_attempts: u32,

    /// Timeout per attachment fetch, in seconds
    #[arg(long, default_value_t = 300)]
    pub fetch_timeout: u64,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// Session to inspect (omit to list every session)
    #[arg(long)]
    pub session_id: Option<String>,

    /// Print each skipped item
    #[arg(long)]
    pub skipped: bool,
}

#[derive(Args, Debug)]
pub struct ResetSessionArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// Session to delete
    #[arg(long)]
    pub session_id: String,

    /// Skip confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

#[derive(Args, Debug)]
pub struct CleanArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// Actually delete sessions (housekeeping is off by default)
    #[arg(long)]
    pub enable_housekeeping: bool,

    /// Remove sessions not written for this many days
    #[arg(long, default_value_t = 30)]
    pub max_age_days: u32,

    /// Remove every session of this batch instead
    #[arg(long)]
    pub batch_id: Option<String>,

    /// Session to keep when cleaning a batch
    #[arg(long, requires = "batch_id")]
    pub keep_session: Option<String>,
}
