//! Error types for swarm-core

use std::time::Duration;

use thiserror::Error;

use crate::state::{Event, State};

/// Core error type
#[derive(Error, Debug)]
pub enum SwarmError {
    /// Invalid profile or runner configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed ramp-up rate string such as `"10/"` or `"abc"`
    #[error("invalid ramp-up rate {0:?}: expected \"N\" or \"N/<duration>\"")]
    InvalidRampUpRate(String),

    /// No worker is available to receive a spawn
    #[error("no available workers")]
    NoWorkers,

    /// Requested spawn count cannot give every worker at least one user
    #[error("spawn count {spawn_count} is lower than the {workers} available workers")]
    SpawnCountTooSmall {
        /// Requested spawn count
        spawn_count: i64,
        /// Workers currently available
        workers: usize,
    },

    /// A lifecycle event not allowed from the current state
    #[error("cannot apply {event:?} while {from:?}")]
    InvalidTransition {
        /// State the runner was in
        from: State,
        /// Rejected event
        event: Event,
    },

    /// The task-discovery poller did not answer in time
    #[error("timed out after {0:?} waiting for task payload")]
    TaskFetchTimeout(Duration),

    /// Transport failure (connect, handshake, rejected request)
    #[error("transport error: {0}")]
    Transport(String),

    /// A control RPC exceeded its deadline
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Frame codec error
    #[error("codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    /// Build a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Build a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether the error came from bad input rather than a runtime fault
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            SwarmError::Config(_)
                | SwarmError::InvalidRampUpRate(_)
                | SwarmError::NoWorkers
                | SwarmError::SpawnCountTooSmall { .. }
        )
    }
}

/// Result type alias
pub type SwarmResult<T> = std::result::Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_classified() {
        assert!(SwarmError::config("bad").is_config());
        assert!(SwarmError::NoWorkers.is_config());
        assert!(SwarmError::InvalidRampUpRate("x".into()).is_config());
        assert!(!SwarmError::transport("reset").is_config());
        assert!(!SwarmError::Timeout("register").is_config());
    }

    #[test]
    fn test_error_display() {
        let err = SwarmError::SpawnCountTooSmall {
            spawn_count: 1,
            workers: 3,
        };
        assert_eq!(
            err.to_string(),
            "spawn count 1 is lower than the 3 available workers"
        );

        let err = SwarmError::InvalidTransition {
            from: State::Init,
            event: Event::Stop,
        };
        assert_eq!(err.to_string(), "cannot apply Stop while Init");
    }
}
