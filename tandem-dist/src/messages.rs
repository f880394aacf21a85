//! Messages exchanged between workers and services.
use crossbeam_channel::Sender;
use std::sync::Arc;
use tandem_core::{Snapshot, TandemError, Transition};

/// Requests served by the parameter-server thread. Every request carries
/// a reply channel; senders block on it, which gives the calls their
/// synchronous RPC semantics.
pub(crate) enum ServerRequest {
    /// Publish a snapshot under a model name, returning the new version.
    Push {
        name: String,
        snapshot: Snapshot,
        reply: Sender<u64>,
    },

    /// Fetch the latest snapshot of a model name.
    Pull {
        name: String,
        reply: Sender<Result<(u64, Arc<Snapshot>), TandemError>>,
    },

    /// List registered model names.
    Names { reply: Sender<Vec<String>> },
}

/// Experience pushed by one actor to the trainer's replay buffer.
#[derive(Debug)]
pub struct PushedTransitions {
    /// Identifier of the pushing actor.
    pub actor_id: usize,

    /// Transitions in insertion order; whole episodes are kept
    /// contiguous so episode insertion stays atomic.
    pub transitions: Vec<Transition>,
}
