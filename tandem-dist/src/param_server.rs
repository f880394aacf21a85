//! Parameter server: named, versioned slots of model snapshots.
use crate::messages::ServerRequest;
use anyhow::Result;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::info;
use std::{collections::HashMap, sync::Arc, thread};
use tandem_core::{Snapshot, TandemError};

/// One slot per model name.
struct Slot {
    version: u64,
    snapshot: Arc<Snapshot>,
}

/// The serving side of the parameter-server group.
///
/// A spawned thread owns every slot, so pushes replace snapshots
/// atomically and pulls always observe a complete snapshot (behind an
/// `Arc`, never torn). Pushes are last-writer-wins with no ordering
/// guarantee across concurrent pushers; only the designated trainer of a
/// model should push it. The thread exits when every handle is dropped.
pub struct ParamServer;

impl ParamServer {
    /// Spawns the server thread and returns a handle to it.
    pub fn spawn() -> ParamServerHandle {
        let (sender, receiver) = unbounded();
        thread::spawn(move || Self::run(receiver));
        info!("parameter server started");
        ParamServerHandle { sender }
    }

    fn run(receiver: Receiver<ServerRequest>) {
        let mut slots: HashMap<String, Slot> = HashMap::new();

        while let Ok(req) = receiver.recv() {
            match req {
                ServerRequest::Push {
                    name,
                    snapshot,
                    reply,
                } => {
                    let slot = slots.entry(name).or_insert(Slot {
                        version: 0,
                        snapshot: Arc::new(Snapshot::new()),
                    });
                    slot.version += 1;
                    slot.snapshot = Arc::new(snapshot);
                    let _ = reply.send(slot.version);
                }
                ServerRequest::Pull { name, reply } => {
                    let result = match slots.get(&name) {
                        Some(slot) => Ok((slot.version, slot.snapshot.clone())),
                        None => Err(TandemError::UnknownModel(name)),
                    };
                    let _ = reply.send(result);
                }
                ServerRequest::Names { reply } => {
                    let _ = reply.send(slots.keys().cloned().collect());
                }
            }
        }
        info!("parameter server stopped");
    }
}

/// Cloneable handle to a [`ParamServer`]. Clones may live on any worker
/// thread; each call blocks until the server replied.
#[derive(Clone)]
pub struct ParamServerHandle {
    sender: Sender<ServerRequest>,
}

impl ParamServerHandle {
    /// Publishes `snapshot` under `name`, atomically replacing the
    /// previous one. Publishing registers the name. Returns the new
    /// version of the slot.
    pub fn push(&self, name: &str, snapshot: Snapshot) -> Result<u64> {
        let (reply, response) = bounded(1);
        self.sender
            .send(ServerRequest::Push {
                name: name.to_string(),
                snapshot,
                reply,
            })
            .map_err(|_| TandemError::ChannelClosed("parameter server"))?;
        let version = response
            .recv()
            .map_err(|_| TandemError::ChannelClosed("parameter server"))?;
        Ok(version)
    }

    /// Returns the latest published snapshot of `name` and its version.
    ///
    /// Never blocks waiting for a push: the last-known snapshot is
    /// returned, possibly stale relative to a concurrent push.
    ///
    /// # Errors
    ///
    /// [`TandemError::UnknownModel`] if the name was never pushed.
    pub fn pull(&self, name: &str) -> Result<(u64, Arc<Snapshot>)> {
        let (reply, response) = bounded(1);
        self.sender
            .send(ServerRequest::Pull {
                name: name.to_string(),
                reply,
            })
            .map_err(|_| TandemError::ChannelClosed("parameter server"))?;
        let result = response
            .recv()
            .map_err(|_| TandemError::ChannelClosed("parameter server"))?;
        Ok(result?)
    }

    /// Names of all registered models.
    pub fn names(&self) -> Result<Vec<String>> {
        let (reply, response) = bounded(1);
        self.sender
            .send(ServerRequest::Names { reply })
            .map_err(|_| TandemError::ChannelClosed("parameter server"))?;
        let names = response
            .recv()
            .map_err(|_| TandemError::ChannelClosed("parameter server"))?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::TensorData;
    use test_log::test;

    fn snapshot(v: f32) -> Snapshot {
        let mut s = Snapshot::new();
        s.insert("weight", TensorData::new(vec![2, 2], vec![v; 4]).unwrap());
        s
    }

    #[test]
    fn push_then_pull_roundtrips_bit_identical() {
        let server = ParamServer::spawn();
        let pushed = snapshot(1.0);
        let v = server.push("actor", pushed.clone()).unwrap();
        assert_eq!(v, 1);
        let (version, pulled) = server.pull("actor").unwrap();
        assert_eq!(version, 1);
        assert_eq!(*pulled, pushed);
    }

    #[test]
    fn pull_of_unknown_model_fails() {
        let server = ParamServer::spawn();
        let err = server.pull("never-pushed").unwrap_err();
        match err.downcast_ref::<TandemError>() {
            Some(TandemError::UnknownModel(name)) => assert_eq!(name, "never-pushed"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn push_bumps_version_and_overwrites() {
        let server = ParamServer::spawn();
        server.push("actor", snapshot(1.0)).unwrap();
        let v2 = server.push("actor", snapshot(2.0)).unwrap();
        assert_eq!(v2, 2);
        let (_, pulled) = server.pull("actor").unwrap();
        assert!(pulled.allclose(&snapshot(2.0), 0.0));
    }

    #[test]
    fn pull_from_another_thread_sees_pushed_tensors() {
        let server = ParamServer::spawn();
        // all-ones [2, 2] weight for model "actor", pulled elsewhere
        server.push("actor", snapshot(1.0)).unwrap();
        let handle = server.clone();
        let worker = std::thread::spawn(move || {
            let (_, pulled) = handle.pull("actor").unwrap();
            pulled.allclose(&snapshot(1.0), 1e-6)
        });
        assert!(worker.join().unwrap());
    }

    #[test]
    fn names_lists_registered_models() {
        let server = ParamServer::spawn();
        server.push("actor", snapshot(0.0)).unwrap();
        server.push("critic", snapshot(0.0)).unwrap();
        let mut names = server.names().unwrap();
        names.sort();
        assert_eq!(names, vec!["actor".to_string(), "critic".to_string()]);
    }

    #[test]
    fn concurrent_pushers_are_last_writer_wins() {
        let server = ParamServer::spawn();
        let mut handles = vec![];
        for k in 0..4 {
            let server = server.clone();
            handles.push(std::thread::spawn(move || {
                server.push("actor", snapshot(k as f32)).unwrap()
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let (version, pulled) = server.pull("actor").unwrap();
        assert_eq!(version, 4);
        // the surviving snapshot is one of the pushed ones, complete
        let w = pulled.get("weight").unwrap();
        assert!(w.data().iter().all(|&v| v == w.data()[0]));
    }
}
