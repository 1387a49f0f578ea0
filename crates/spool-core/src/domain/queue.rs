use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a job queue ("default", "critical", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for QueueName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds an ordered queue list from string literals.
///
/// ```ignore
/// let queues = queue_names(&["critical", "default"]);
/// ```
pub fn queue_names(names: &[&str]) -> Vec<QueueName> {
    names.iter().map(|n| QueueName::new(*n)).collect()
}
