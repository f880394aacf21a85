//! YAML helpers for configuration structs.
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

/// Loads a configuration from a YAML file.
pub fn load_yaml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
    let config = serde_yaml::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {:?}", path))?;
    Ok(config)
}

/// Saves a configuration to a YAML file.
pub fn save_yaml<T: Serialize>(config: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("creating {:?}", path))?;
    serde_yaml::to_writer(BufWriter::new(file), config)
        .with_context(|| format!("writing {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay_buffer::ReplayBufferConfig;
    use tempdir::TempDir;

    #[test]
    fn yaml_roundtrip_reproduces_config() {
        let dir = TempDir::new("tandem-config").unwrap();
        let path = dir.path().join("replay.yaml");
        let config = ReplayBufferConfig::default().capacity(64).seed(7);
        save_yaml(&config, &path).unwrap();
        let loaded: ReplayBufferConfig = load_yaml(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
