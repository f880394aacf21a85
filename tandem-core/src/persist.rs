//! Snapshot persistence: one file per named network, keyed by version.
use crate::{Snapshot, TandemError};
use anyhow::{Context, Result};
use log::info;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

fn file_name(stem: &str, version: usize) -> String {
    format!("{}_{}.bin", stem, version)
}

/// Writes one snapshot to `dir/{stem}_{version}.bin`, creating `dir` if
/// needed. Returns the written path.
pub fn save_snapshot(
    dir: impl AsRef<Path>,
    stem: &str,
    version: usize,
    snapshot: &Snapshot,
) -> Result<PathBuf> {
    fs::create_dir_all(&dir)?;
    let path = dir.as_ref().join(file_name(stem, version));
    let file = File::create(&path).with_context(|| format!("creating {:?}", path))?;
    bincode::serialize_into(BufWriter::new(file), snapshot)
        .with_context(|| format!("writing snapshot to {:?}", path))?;
    info!("saved snapshot {:?}", path);
    Ok(path)
}

/// Reads the snapshot stored at `dir/{stem}_{version}.bin`.
pub fn load_snapshot(dir: impl AsRef<Path>, stem: &str, version: usize) -> Result<Snapshot> {
    let path = dir.as_ref().join(file_name(stem, version));
    let file = File::open(&path).with_context(|| format!("opening {:?}", path))?;
    let snapshot = bincode::deserialize_from(BufReader::new(file))
        .with_context(|| format!("reading snapshot from {:?}", path))?;
    info!("loaded snapshot {:?}", path);
    Ok(snapshot)
}

/// Saves several networks at once.
///
/// `networks` maps internal attribute names to snapshots; `network_map`
/// remaps attribute names to on-disk file stems. Attributes without an
/// entry keep their own name as the stem.
pub fn save_group(
    dir: impl AsRef<Path>,
    networks: &BTreeMap<String, Snapshot>,
    network_map: &BTreeMap<String, String>,
    version: usize,
) -> Result<()> {
    for (attr, snapshot) in networks {
        let stem = network_map.get(attr).map(String::as_str).unwrap_or(attr);
        save_snapshot(&dir, stem, version, snapshot)?;
    }
    Ok(())
}

/// Loads the named attributes back, resolving stems through
/// `network_map` as [`save_group`] does.
pub fn load_group(
    dir: impl AsRef<Path>,
    attrs: &[&str],
    network_map: &BTreeMap<String, String>,
    version: usize,
) -> Result<BTreeMap<String, Snapshot>> {
    let mut out = BTreeMap::new();
    for &attr in attrs {
        let stem = network_map
            .get(attr)
            .map(String::as_str)
            .unwrap_or(attr);
        let snapshot = load_snapshot(&dir, stem, version)
            .map_err(|_| TandemError::UnknownModel(attr.to_string()))?;
        out.insert(attr.to_string(), snapshot);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorData;
    use tempdir::TempDir;

    fn snapshot(v: f32) -> Snapshot {
        let mut s = Snapshot::new();
        s.insert("w", TensorData::new(vec![2, 2], vec![v; 4]).unwrap());
        s
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = TempDir::new("tandem-persist").unwrap();
        let s = snapshot(0.5);
        save_snapshot(dir.path(), "qnet", 3, &s).unwrap();
        let loaded = load_snapshot(dir.path(), "qnet", 3).unwrap();
        assert!(loaded.allclose(&s, 0.0));
        assert!(load_snapshot(dir.path(), "qnet", 4).is_err());
    }

    #[test]
    fn group_respects_network_map() {
        let dir = TempDir::new("tandem-persist").unwrap();
        let mut networks = BTreeMap::new();
        networks.insert("actor".to_string(), snapshot(1.0));
        networks.insert("critic".to_string(), snapshot(2.0));
        let mut map = BTreeMap::new();
        map.insert("actor".to_string(), "policy_net".to_string());

        save_group(dir.path(), &networks, &map, 7).unwrap();
        assert!(dir.path().join("policy_net_7.bin").exists());
        assert!(dir.path().join("critic_7.bin").exists());

        let loaded = load_group(dir.path(), &["actor", "critic"], &map, 7).unwrap();
        assert!(loaded["actor"].allclose(&networks["actor"], 0.0));
        assert!(loaded["critic"].allclose(&networks["critic"], 0.0));
    }
}
