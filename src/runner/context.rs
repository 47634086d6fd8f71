use std::fmt;

use serde::{Deserialize, Serialize};

/// Scopes checkpoint state to one logical loop: a call site name plus an
/// optional caller-supplied discriminator, joined with `::`.
///
/// Two loops with different contexts never see each other's progress,
/// results or error attempts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext(String);

impl ExecutionContext {
    pub fn new(site: &str) -> Self {
        Self(site.to_string())
    }

    /// `site::discriminator`, or just `site` when the discriminator is empty.
    pub fn with_discriminator(site: &str, discriminator: &str) -> Self {
        if discriminator.is_empty() {
            return Self::new(site);
        }
        Self(format!("{site}::{discriminator}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ExecutionContext {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
