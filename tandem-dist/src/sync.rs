//! Keeping a local model aligned with its slot on the parameter server.
use crate::ParamServerHandle;
use anyhow::Result;
use log::{info, trace};
use tandem_core::Snapshot;

/// Models that can be synchronized through the parameter server.
pub trait SyncModel {
    /// Captures the model's current parameters.
    fn snapshot(&self) -> Snapshot;

    /// Overwrites the model's parameters from a snapshot.
    fn load_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;
}

/// Tracks one model's slot on the parameter server and pulls new
/// versions into a local [`SyncModel`].
///
/// Automatic mode syncs opportunistically on [`sync_if_auto`]; manual
/// mode leaves the cadence to the caller via [`manual_sync`]. Either
/// way a pull is skipped when the local copy is already at the served
/// version.
///
/// [`sync_if_auto`]: SyncController::sync_if_auto
/// [`manual_sync`]: SyncController::manual_sync
pub struct SyncController {
    handle: ParamServerHandle,
    model_name: String,
    auto: bool,
    last_version: Option<u64>,
    calls_since_sync: usize,
}

impl SyncController {
    /// Creates a controller for `model_name`, in automatic mode.
    pub fn new(handle: ParamServerHandle, model_name: impl Into<String>) -> Self {
        Self {
            handle,
            model_name: model_name.into(),
            auto: true,
            last_version: None,
            calls_since_sync: 0,
        }
    }

    /// Switches automatic synchronization on or off.
    pub fn set_sync(&mut self, auto: bool) {
        info!(
            "sync of {} set to {}",
            self.model_name,
            if auto { "automatic" } else { "manual" }
        );
        self.auto = auto;
    }

    /// Whether automatic synchronization is enabled.
    pub fn sync_enabled(&self) -> bool {
        self.auto
    }

    /// Version of the snapshot last loaded into the local model.
    pub fn last_version(&self) -> Option<u64> {
        self.last_version
    }

    /// Number of decision points observed since the last actual load.
    /// Counts version-skipped pulls and, in manual mode, gated
    /// [`sync_if_auto`](Self::sync_if_auto) calls.
    pub fn calls_since_sync(&self) -> usize {
        self.calls_since_sync
    }

    /// Pulls the served snapshot and loads it into `model` if its
    /// version differs from the last one loaded. Returns whether a load
    /// happened.
    pub fn manual_sync<M: SyncModel>(&mut self, model: &mut M) -> Result<bool> {
        let (version, snapshot) = self.handle.pull(&self.model_name)?;
        if self.last_version == Some(version) {
            self.calls_since_sync += 1;
            trace!(
                "{} already at version {}, skipping",
                self.model_name,
                version
            );
            return Ok(false);
        }
        model.load_snapshot(&snapshot)?;
        self.last_version = Some(version);
        self.calls_since_sync = 0;
        trace!("{} synced to version {}", self.model_name, version);
        Ok(true)
    }

    /// Like [`manual_sync`](Self::manual_sync), but a no-op in manual
    /// mode. Called by agents at decision points.
    pub fn sync_if_auto<M: SyncModel>(&mut self, model: &mut M) -> Result<bool> {
        if !self.auto {
            self.calls_since_sync += 1;
            return Ok(false);
        }
        self.manual_sync(model)
    }

    /// Publishes the model's current parameters to its slot. Returns
    /// the new served version and records it as the local one.
    pub fn publish<M: SyncModel>(&mut self, model: &M) -> Result<u64> {
        let version = self.handle.push(&self.model_name, model.snapshot())?;
        self.last_version = Some(version);
        self.calls_since_sync = 0;
        Ok(version)
    }
}
