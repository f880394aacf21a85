#![warn(missing_docs)]
//! Coordination layer for distributed actor/learner training.
//!
//! Workers exchange model parameters through a [`ParamServer`], meet at
//! [`RendezvousGroup`] barriers and signal milestones through its
//! write-once pairing primitive, and keep their local model copies fresh
//! with a [`SyncController`]. Actor threads push experience to the
//! trainer's replay buffer through a [`ReplayProxy`].
//!
//! Transport is message passing between threads with blocking RPC
//! semantics: a call returns when the serving side replied, and the only
//! operations that take a timeout are the rendezvous primitives.
mod messages;
mod param_server;
mod rendezvous;
mod replay_proxy;
mod sync;

pub use messages::PushedTransitions;
pub use param_server::{ParamServer, ParamServerHandle};
pub use rendezvous::RendezvousGroup;
pub use replay_proxy::{spawn_buffer_writer, ReplayProxy, ReplayProxyConfig};
pub use sync::{SyncController, SyncModel};
