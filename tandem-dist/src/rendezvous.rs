//! Rendezvous primitives shared by a fixed group of workers.
use anyhow::Result;
use log::trace;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};
use tandem_core::TandemError;

struct BarrierState {
    arrived: usize,
    generation: u64,
}

struct Shared {
    size: usize,
    barrier: Mutex<BarrierState>,
    barrier_cvar: Condvar,
    pairs: Mutex<HashMap<String, Value>>,
}

/// One member's view of a rendezvous group.
///
/// Created as a fixed-size set up front; every member must hold exactly
/// one handle. Carries two primitives: a reusable [`barrier`] and a
/// write-once key/value [`pair`] registry.
///
/// [`barrier`]: RendezvousGroup::barrier
/// [`pair`]: RendezvousGroup::pair
pub struct RendezvousGroup {
    member_id: usize,
    shared: Arc<Shared>,
}

impl RendezvousGroup {
    /// Creates a group of `members` handles, one per worker.
    ///
    /// # Panics
    ///
    /// Panics if `members` is zero.
    pub fn create(members: usize) -> Vec<Self> {
        assert!(members > 0, "a rendezvous group needs at least one member");
        let shared = Arc::new(Shared {
            size: members,
            barrier: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            barrier_cvar: Condvar::new(),
            pairs: Mutex::new(HashMap::new()),
        });
        (0..members)
            .map(|member_id| RendezvousGroup {
                member_id,
                shared: shared.clone(),
            })
            .collect()
    }

    /// This member's index within the group.
    pub fn member_id(&self) -> usize {
        self.member_id
    }

    /// Number of members in the group.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Blocks until every member has entered the barrier, or `timeout`
    /// elapses. The barrier is reusable; generations keep a late waiter
    /// of round `n` from being released by round `n + 1`.
    ///
    /// # Errors
    ///
    /// [`TandemError::CoordinationTimeout`] if the group did not
    /// assemble in time. The group is left in an undefined round after
    /// a timeout and should be torn down.
    pub fn barrier(&self, timeout: Duration) -> Result<()> {
        let mut state = self
            .shared
            .barrier
            .lock()
            .map_err(|_| TandemError::ChannelClosed("rendezvous barrier"))?;
        state.arrived += 1;
        trace!(
            "member {} at barrier ({}/{})",
            self.member_id,
            state.arrived,
            self.shared.size
        );
        if state.arrived == self.shared.size {
            state.arrived = 0;
            state.generation += 1;
            self.shared.barrier_cvar.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        let (state, wait) = self
            .shared
            .barrier_cvar
            .wait_timeout_while(state, timeout, |s| s.generation == generation)
            .map_err(|_| TandemError::ChannelClosed("rendezvous barrier"))?;
        drop(state);
        if wait.timed_out() {
            return Err(TandemError::CoordinationTimeout {
                what: "barrier".to_string(),
                timeout,
            }
            .into());
        }
        Ok(())
    }

    /// Registers `value` under `key`, exactly once per key across the
    /// whole group. Never blocks; [`barrier`](Self::barrier) is the one
    /// waiting primitive and the one that takes a timeout.
    ///
    /// # Errors
    ///
    /// [`TandemError::AlreadyPaired`] if some member (possibly this
    /// one) already paired the key. Callers racing to claim a key treat
    /// this as a benign loss, not a failure.
    pub fn pair(&self, key: &str, value: Value) -> Result<()> {
        let mut pairs = self
            .shared
            .pairs
            .lock()
            .map_err(|_| TandemError::ChannelClosed("rendezvous pairs"))?;
        if pairs.contains_key(key) {
            return Err(TandemError::AlreadyPaired(key.to_string()).into());
        }
        pairs.insert(key.to_string(), value);
        Ok(())
    }

    /// Whether `key` has been paired by any member.
    pub fn is_paired(&self, key: &str) -> Result<bool> {
        let pairs = self
            .shared
            .pairs
            .lock()
            .map_err(|_| TandemError::ChannelClosed("rendezvous pairs"))?;
        Ok(pairs.contains_key(key))
    }

    /// The value paired under `key`, if any.
    pub fn paired_value(&self, key: &str) -> Result<Option<Value>> {
        let pairs = self
            .shared
            .pairs
            .lock()
            .map_err(|_| TandemError::ChannelClosed("rendezvous pairs"))?;
        Ok(pairs.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;
    use test_log::test;

    #[test]
    fn barrier_releases_all_members_together() {
        let members = RendezvousGroup::create(3);
        let mut handles = vec![];
        for member in members {
            handles.push(thread::spawn(move || {
                member.barrier(Duration::from_secs(5)).is_ok()
            }));
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn barrier_times_out_when_a_member_is_missing() {
        let mut members = RendezvousGroup::create(2);
        let lone = members.pop().unwrap();
        let err = lone.barrier(Duration::from_millis(50)).unwrap_err();
        match err.downcast_ref::<TandemError>() {
            Some(TandemError::CoordinationTimeout { what, .. }) => assert_eq!(what, "barrier"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn barrier_is_reusable_across_rounds() {
        let members = RendezvousGroup::create(2);
        let mut handles = vec![];
        for member in members {
            handles.push(thread::spawn(move || {
                for _ in 0..10 {
                    member.barrier(Duration::from_secs(5)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn exactly_one_member_wins_a_pair_race() {
        let members = RendezvousGroup::create(4);
        let mut handles = vec![];
        for member in members {
            handles.push(thread::spawn(move || {
                member.pair("solved", json!(member.member_id())).is_ok()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn paired_value_is_visible_to_every_member() {
        let members = RendezvousGroup::create(2);
        members[0].pair("solved", json!({"score": 200.0})).unwrap();
        assert!(members[1].is_paired("solved").unwrap());
        assert_eq!(
            members[1].paired_value("solved").unwrap(),
            Some(json!({"score": 200.0}))
        );
        assert_eq!(members[1].paired_value("unsolved").unwrap(), None);
    }

    #[test]
    fn repairing_a_key_reports_already_paired() {
        let members = RendezvousGroup::create(1);
        members[0].pair("solved", json!(1)).unwrap();
        let err = members[0].pair("solved", json!(2)).unwrap_err();
        match err.downcast_ref::<TandemError>() {
            Some(TandemError::AlreadyPaired(key)) => assert_eq!(key, "solved"),
            other => panic!("unexpected error: {:?}", other),
        }
        // the original value survives the rejected write
        assert_eq!(members[0].paired_value("solved").unwrap(), Some(json!(1)));
    }
}
