//! Errors in the library.
use std::time::Duration;
use thiserror::Error;

/// Errors in the library.
///
/// Recoverability follows the propagation policy of the framework:
/// [`InsufficientData`](TandemError::InsufficientData) is recoverable at
/// the call site (skip this update cycle and retry later),
/// [`AlreadyPaired`](TandemError::AlreadyPaired) is benign (the losing
/// writer of a write-once key treats it as already-done), and the
/// remaining variants propagate to the caller.
#[derive(Debug, Error)]
pub enum TandemError {
    /// A batch was requested that exceeds the usable transitions.
    #[error("requested {requested} transitions, buffer holds {available}")]
    InsufficientData {
        /// Number of transitions requested.
        requested: usize,
        /// Number of usable transitions available.
        available: usize,
    },

    /// A model name was never registered on the parameter server.
    #[error("unknown model name: {0}")]
    UnknownModel(String),

    /// An unrecognized rollout-variant tag was passed to a lookup.
    #[error("unknown actor type: {0}")]
    UnknownActorType(String),

    /// An unrecognized exploration strategy tag.
    #[error("unknown noise mode: {0}")]
    UnknownNoiseMode(String),

    /// A rendezvous primitive exceeded its deadline. Fatal to the run.
    #[error("{what} timed out after {timeout:?}")]
    CoordinationTimeout {
        /// The operation that timed out.
        what: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// A write-once rendezvous key was already set by a peer.
    #[error("rendezvous key already paired: {0}")]
    AlreadyPaired(String),

    /// A snapshot does not match the parameters it is loaded into.
    #[error("snapshot mismatch: {0}")]
    SnapshotMismatch(String),

    /// A coordination channel was closed on the other side.
    #[error("failed to communicate with {0}: channel closed")]
    ChannelClosed(&'static str),
}
