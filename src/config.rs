use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use resumable_importer::import::{AttachmentOptions, PipelineOptions};
use resumable_importer::retry::RetryConfig;
use resumable_importer::runner::LoopPolicy;

use crate::cli::{ImportArgs, StateArgs};

const SESSION_DB_NAME: &str = "sessions.db";
const CONTENT_DB_NAME: &str = "content.db";
const UPLOADS_DIR_NAME: &str = "uploads";

/// Settings for one `import` invocation, resolved from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub archive: PathBuf,
    pub session_id: String,
    pub state_db: PathBuf,
    pub content_db: PathBuf,
    pub uploads_dir: PathBuf,
    pub uploads_url: String,
    pub base_url: Option<String>,
    pub batch_id: Option<String>,
    pub discriminator: Option<String>,
    /// `None` imports every entity type.
    pub allowed_types: Option<BTreeSet<String>>,

    pub time_limit: Option<Duration>,
    pub fetch_timeout: Duration,
    pub max_attachment_size: u64,

    pub max_error_attempts: u32,
    pub max_consecutive_skips: u32,
    pub fetch_attempts: u32,

    pub skip_on_error: bool,
    pub chunked: bool,
    pub fetch_attachments: bool,
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Session database path for the given state arguments.
pub(crate) fn state_db_path(state: &StateArgs) -> PathBuf {
    match &state.state_db {
        Some(path) => expand_tilde(path),
        None => expand_tilde(&state.state_directory).join(SESSION_DB_NAME),
    }
}

impl Config {
    pub fn from_cli(args: ImportArgs) -> anyhow::Result<Self> {
        if args.max_error_attempts == 0 {
            anyhow::bail!("--max-error-attempts must be at least 1");
        }
        if args.fetch_attempts == 0 {
            anyhow::bail!("--fetch-attempts must be at least 1");
        }

        let state_directory = expand_tilde(&args.state.state_directory);
        let state_db = state_db_path(&args.state);
        let content_db = args
            .content_db
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| state_directory.join(CONTENT_DB_NAME));
        let uploads_dir = args
            .uploads_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| state_directory.join(UPLOADS_DIR_NAME));

        let session_id = args
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let allowed_types: BTreeSet<String> = args
            .types
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        Ok(Self {
            archive: expand_tilde(&args.archive),
            session_id,
            state_db,
            content_db,
            uploads_dir,
            uploads_url: args.uploads_url,
            base_url: args.base_url,
            batch_id: args.batch_id,
            discriminator: args.discriminator,
            allowed_types: (!allowed_types.is_empty()).then_some(allowed_types),
            time_limit: args.time_limit.map(Duration::from_secs),
            fetch_timeout: Duration::from_secs(args.fetch_timeout),
            max_attachment_size: args.max_attachment_size,
            max_error_attempts: args.max_error_attempts,
            max_consecutive_skips: args.max_consecutive_skips,
            fetch_attempts: args.fetch_attempts,
            skip_on_error: args.skip_on_error,
            chunked: args.chunked,
            fetch_attachments: !args.no_attachments,
        })
    }

    pub fn policy(&self) -> LoopPolicy {
        LoopPolicy {
            skip_on_error: self.skip_on_error,
            max_error_attempts: self.max_error_attempts,
            force_chunking: self.chunked,
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            policy: self.policy(),
            max_consecutive_skips: self.max_consecutive_skips,
            allowed_types: self.allowed_types.clone(),
            batch_id: self.batch_id.clone(),
            discriminator: self.discriminator.clone(),
            base_url: self.base_url.clone(),
        }
    }

    pub fn attachment_options(&self) -> AttachmentOptions {
        AttachmentOptions {
            enabled: self.fetch_attachments,
            uploads_dir: self.uploads_dir.clone(),
            uploads_url: self.uploads_url.clone(),
            max_size: self.max_attachment_size,
            retry: RetryConfig::with_attempts(self.fetch_attempts),
            timeout: self.fetch_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;

    fn import_args(extra: &[&str]) -> ImportArgs {
        let mut argv = vec!["resumable-importer", "import", "export.json"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Import(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let path = expand_tilde("~/imports");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(path, home.join("imports"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(expand_tilde("/var/lib/x"), PathBuf::from("/var/lib/x"));
        assert_eq!(expand_tilde("relative"), PathBuf::from("relative"));
    }

    #[test]
    fn test_paths_default_under_state_directory() {
        let config = Config::from_cli(import_args(&["--state-directory", "/srv/imports"])).unwrap();
        assert_eq!(config.state_db, PathBuf::from("/srv/imports/sessions.db"));
        assert_eq!(config.content_db, PathBuf::from("/srv/imports/content.db"));
        assert_eq!(config.uploads_dir, PathBuf::from("/srv/imports/uploads"));
    }

    #[test]
    fn test_explicit_paths_win() {
        let config = Config::from_cli(import_args(&[
            "--state-directory",
            "/srv/imports",
            "--state-db",
            "/tmp/s.db",
            "--uploads-dir",
            "/var/www/uploads",
        ]))
        .unwrap();
        assert_eq!(config.state_db, PathBuf::from("/tmp/s.db"));
        assert_eq!(config.uploads_dir, PathBuf::from("/var/www/uploads"));
    }

    #[test]
    fn test_session_id_generated_when_missing() {
        let a = Config::from_cli(import_args(&[])).unwrap();
        let b = Config::from_cli(import_args(&[])).unwrap();
        assert!(!a.session_id.is_empty());
        assert_ne!(a.session_id, b.session_id);

        let given = Config::from_cli(import_args(&["--session-id", "S1"])).unwrap();
        assert_eq!(given.session_id, "S1");
    }

    #[test]
    fn test_options_passthrough() {
        let config = Config::from_cli(import_args(&[
            "--skip-on-error",
            "--chunked",
            "--types",
            "post, page",
            "--no-attachments",
            "--fetch-attempts",
            "5",
        ]))
        .unwrap();
        let options = config.pipeline_options();
        assert!(options.policy.skip_on_error);
        assert!(options.policy.force_chunking);
        assert_eq!(
            options.allowed_types.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["page", "post"]
        );
        let attachments = config.attachment_options();
        assert!(!attachments.enabled);
        assert_eq!(attachments.retry.max_attempts, 5);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(Config::from_cli(import_args(&["--max-error-attempts", "0"])).is_err());
        assert!(Config::from_cli(import_args(&["--fetch-attempts", "0"])).is_err());
    }
}
