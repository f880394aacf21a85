//! Forwarding transitions from actor threads to a shared replay buffer.
use crate::messages::PushedTransitions;
use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use log::{info, trace};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};
use tandem_core::{Episode, ReplayBuffer, TandemError, Transition};

/// Configuration of [`ReplayProxy`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplayProxyConfig {
    /// Number of buffered transitions that triggers a flush.
    pub flush_threshold: usize,
}

impl Default for ReplayProxyConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 100,
        }
    }
}

impl ReplayProxyConfig {
    /// Sets the flush threshold.
    pub fn flush_threshold(mut self, flush_threshold: usize) -> Self {
        self.flush_threshold = flush_threshold;
        self
    }
}

/// Actor-side stand-in for the replay buffer.
///
/// Transitions are buffered locally and sent to the buffer-writer
/// thread in batches, so actors never contend on the buffer lock per
/// step. [`store_episode`](Self::store_episode) flushes eagerly, which
/// keeps each episode's transitions contiguous in the shared buffer.
pub struct ReplayProxy {
    actor_id: usize,
    config: ReplayProxyConfig,
    pending: Vec<Transition>,
    sender: Sender<PushedTransitions>,
}

impl ReplayProxy {
    /// Creates a proxy for actor `actor_id`, sending into `sender`.
    pub fn new(
        actor_id: usize,
        config: ReplayProxyConfig,
        sender: Sender<PushedTransitions>,
    ) -> Self {
        Self {
            actor_id,
            config,
            pending: Vec::new(),
            sender,
        }
    }

    /// Number of transitions waiting to be flushed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Buffers a transition, flushing when the threshold is reached.
    pub fn store(&mut self, transition: Transition) -> Result<()> {
        self.pending.push(transition);
        if self.pending.len() >= self.config.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Buffers a whole episode and flushes immediately.
    pub fn store_episode(&mut self, episode: Episode) -> Result<()> {
        self.pending.extend(episode);
        self.flush()
    }

    /// Sends all pending transitions to the buffer writer.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let transitions = std::mem::take(&mut self.pending);
        trace!(
            "actor {} flushing {} transitions",
            self.actor_id,
            transitions.len()
        );
        self.sender
            .send(PushedTransitions {
                actor_id: self.actor_id,
                transitions,
            })
            .map_err(|_| TandemError::ChannelClosed("replay buffer writer"))?;
        Ok(())
    }
}

impl Drop for ReplayProxy {
    fn drop(&mut self) {
        // best effort, the writer may already be gone during teardown
        let _ = self.flush();
    }
}

/// Spawns the thread that drains pushed transitions into the shared
/// replay buffer. It exits when `stop` is set or every proxy is gone.
pub fn spawn_buffer_writer(
    receiver: Receiver<PushedTransitions>,
    buffer: Arc<Mutex<ReplayBuffer>>,
    stop: Arc<Mutex<bool>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut written = 0;
        while let Ok(pushed) = receiver.recv() {
            {
                let mut buffer = buffer.lock().unwrap();
                written += pushed.transitions.len();
                for transition in pushed.transitions {
                    buffer.store(transition);
                }
            }
            trace!("writer stored batch from actor {}", pushed.actor_id);
            if *stop.lock().unwrap() {
                break;
            }
        }
        info!("buffer writer stopped after {} transitions", written);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use tandem_core::{ReplayBufferConfig, TensorData};
    use test_log::test;

    fn transition(reward: f32) -> Transition {
        let state = vec![(
            "state".to_string(),
            TensorData::new(vec![2], vec![reward, 0.0]).unwrap(),
        )]
        .into_iter()
        .collect();
        Transition::new(
            state,
            vec![("action".to_string(), TensorData::scalar(0.0))]
                .into_iter()
                .collect(),
            vec![(
                "state".to_string(),
                TensorData::new(vec![2], vec![0.0, 0.0]).unwrap(),
            )]
            .into_iter()
            .collect(),
            reward,
            false,
        )
    }

    #[test]
    fn store_flushes_at_the_threshold() {
        let (sender, receiver) = unbounded();
        let config = ReplayProxyConfig::default().flush_threshold(3);
        let mut proxy = ReplayProxy::new(0, config, sender);
        proxy.store(transition(0.0)).unwrap();
        proxy.store(transition(1.0)).unwrap();
        assert_eq!(proxy.pending(), 2);
        assert!(receiver.is_empty());
        proxy.store(transition(2.0)).unwrap();
        assert_eq!(proxy.pending(), 0);
        let pushed = receiver.recv().unwrap();
        assert_eq!(pushed.actor_id, 0);
        assert_eq!(pushed.transitions.len(), 3);
    }

    #[test]
    fn store_episode_flushes_immediately() {
        let (sender, receiver) = unbounded();
        let config = ReplayProxyConfig::default().flush_threshold(100);
        let mut proxy = ReplayProxy::new(1, config, sender);
        let episode: Episode = (0..5).map(|i| transition(i as f32)).collect();
        proxy.store_episode(episode).unwrap();
        assert_eq!(proxy.pending(), 0);
        assert_eq!(receiver.recv().unwrap().transitions.len(), 5);
    }

    #[test]
    fn flush_into_a_closed_writer_fails() {
        let (sender, receiver) = unbounded();
        drop(receiver);
        let mut proxy = ReplayProxy::new(0, ReplayProxyConfig::default(), sender);
        proxy.pending.push(transition(0.0));
        let err = proxy.flush().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TandemError>(),
            Some(TandemError::ChannelClosed(_))
        ));
        proxy.pending.clear();
    }

    #[test]
    fn writer_drains_pushes_into_the_buffer() {
        let (sender, receiver) = unbounded();
        let buffer = Arc::new(Mutex::new(
            ReplayBuffer::build(&ReplayBufferConfig::default().capacity(16)),
        ));
        let stop = Arc::new(Mutex::new(false));
        let handle = spawn_buffer_writer(receiver, buffer.clone(), stop);

        let config = ReplayProxyConfig::default().flush_threshold(4);
        let mut proxy = ReplayProxy::new(0, config, sender);
        for i in 0..8 {
            proxy.store(transition(i as f32)).unwrap();
        }
        drop(proxy);
        handle.join().unwrap();
        assert_eq!(buffer.lock().unwrap().len(), 8);
    }
}
