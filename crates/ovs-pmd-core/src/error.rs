//! Error types shared by the collectors.
//!
//! Parse-level problems never surface here: the record builder and the
//! drop-counter scanner skip what they cannot read. Only failures to obtain
//! source text (or typed database records) become errors.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure to run an external diagnostic command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command ran but exited non-zero. For `ovs-appctl` this is how an
    /// unregistered command (e.g. PMD commands on a kernel datapath) shows up.
    #[error("{program} exited with status {status:?}")]
    Unavailable { program: String, status: Option<i32> },

    /// The process could not be started at all.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The command did not finish before the invoker's deadline.
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// Waiting on the child or reading its output failed.
    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl CommandError {
    /// True when the command exists on the other side but is not active.
    ///
    /// Collectors treat this as "feature absent" rather than a failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Failure of one sub-collection within a poll cycle.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("unexpected {source_name} output: {reason}")]
    Parse { source_name: String, reason: String },

    #[error("database query {query} failed: {reason}")]
    Database { query: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CollectError {
    pub(crate) fn parse(source_name: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn database(query: &str, reason: impl Into<String>) -> Self {
        Self::Database {
            query: query.to_string(),
            reason: reason.into(),
        }
    }
}
