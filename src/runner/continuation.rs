//! Suspension hand-off.
//!
//! A suspended loop returns a [`Continuation`] instead of terminating the
//! process. The orchestrator hands it to a [`ContinuationSink`] as its last
//! action, and whoever drives the import re-invokes the same session later.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Everything a re-invocation needs to know about where a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    pub session_id: String,
    /// Execution context of the suspended loop.
    pub context: String,
    /// Key of the first item the next invocation will process.
    pub next_hint: Option<String>,
    /// Name of the runner that suspended.
    pub name: String,
}

#[derive(Serialize)]
struct ContinueEvent<'a> {
    action: &'static str,
    #[serde(flatten)]
    continuation: &'a Continuation,
}

/// Where suspension signals go.
#[async_trait]
pub trait ContinuationSink: Send + Sync {
    async fn emit_continue(&self, continuation: &Continuation) -> std::io::Result<()>;
}

/// Writes one JSON line per continuation to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

/// Render the line a [`StdoutSink`] writes, without the trailing newline.
pub fn continue_line(continuation: &Continuation) -> serde_json::Result<String> {
    serde_json::to_string(&ContinueEvent {
        action: "continue",
        continuation,
    })
}

#[async_trait]
impl ContinuationSink for StdoutSink {
    async fn emit_continue(&self, continuation: &Continuation) -> std::io::Result<()> {
        let mut line = continue_line(continuation)?;
        line.push('\n');
        let mut stdout = tokio::io::stdout();
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_continue_line_shape() {
        let c = Continuation {
            session_id: "S1".into(),
            context: "ImportPipeline::posts".into(),
            next_hint: Some("2".into()),
            name: "import".into(),
        };
        let line = continue_line(&c).unwrap();
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            parsed,
            json!({
                "action": "continue",
                "session_id": "S1",
                "context": "ImportPipeline::posts",
                "next_hint": "2",
                "name": "import"
            })
        );
        assert!(!line.contains('\n'));
    }
}
