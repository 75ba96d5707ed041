//! Resume points for interrupted processes.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Separator between the process name and the state index in the stored form.
pub const SEPARATOR: &str = "?!";

/// Errors from parsing a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("checkpoint '{0}' must contain exactly one '?!'")]
    Separator(String),

    #[error("checkpoint '{0}' has an empty process name")]
    EmptyProcess(String),

    #[error("checkpoint '{input}' has an invalid state index '{index}'")]
    Index { input: String, index: String },
}

/// Where to resume a process: the process name and the index of the state
/// that was running when it was interrupted.
///
/// Stored as `"<process>?!<index>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checkpoint {
    pub process: String,
    pub index: usize,
}

impl Checkpoint {
    pub fn new(process: impl Into<String>, index: usize) -> Self {
        Self {
            process: process.into(),
            index,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.process, SEPARATOR, self.index)
    }
}

impl FromStr for Checkpoint {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        let [process, index] = parts.as_slice() else {
            return Err(CheckpointError::Separator(s.to_string()));
        };
        if process.is_empty() {
            return Err(CheckpointError::EmptyProcess(s.to_string()));
        }
        let index = index.parse::<usize>().map_err(|_| CheckpointError::Index {
            input: s.to_string(),
            index: index.to_string(),
        })?;
        Ok(Self::new(*process, index))
    }
}
