//! # Errors
//!
//! Crate-wide error type. Subsystem constructors, backend request operations
//! and the orchestrator's `spawn` all report through [`Error`]; the shutdown
//! path never fails outward, so nothing here describes a failed stop.

use crate::cluster::ClusterError;
use crate::framework::Network;

/// Errors produced by the proxy and its subsystems.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A subsystem failed to start while the service was being spawned.
    #[error("failed to spawn {subsystem}: {source}")]
    Spawn {
        subsystem: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// An API listener could not bind its address.
    #[error("failed to start {network} socket based HTTP API at {addr}: {source}")]
    Bind {
        network: Network,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The broker or coordination service rejected a request.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A message could not be delivered after exhausting retries.
    #[error("delivery failed after {attempts} attempts: {source}")]
    Delivery {
        attempts: usize,
        #[source]
        source: ClusterError,
    },

    /// No message became available within the long polling timeout.
    #[error("long polling timeout: group={group}, topic={topic}")]
    LongPollTimeout { group: String, topic: String },

    /// The subsystem is shutting down and no longer accepts requests.
    #[error("{0} is stopped")]
    Stopped(&'static str),
}

impl Error {
    pub(crate) fn spawn(subsystem: &'static str, source: Error) -> Self {
        Error::Spawn {
            subsystem,
            source: Box::new(source),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_names_subsystem_and_cause() {
        let err = Error::spawn("consumer", Error::Cluster(ClusterError::NoSeedPeers));
        let msg = err.to_string();
        assert!(msg.contains("consumer"), "{msg}");
        assert!(msg.contains("no seed peers"), "{msg}");
    }
}
