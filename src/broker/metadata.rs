//! The metadata snapshot: which topics and channels exist and whether they
//! are paused. Written on every structural change, read once at startup.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "fanoutd.dat";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub channels: Vec<ChannelMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub name: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub ephemeral: bool,
}

impl Metadata {
    /// The same snapshot without anything ephemeral.
    pub fn durable(&self) -> Metadata {
        Metadata {
            version: self.version.clone(),
            topics: self
                .topics
                .iter()
                .filter(|t| !t.ephemeral)
                .map(|t| TopicMetadata {
                    channels: t.channels.iter().filter(|c| !c.ephemeral).cloned().collect(),
                    ..t.clone()
                })
                .collect(),
        }
    }
}

pub fn metadata_path(data_path: &Path) -> PathBuf {
    data_path.join(METADATA_FILE)
}

/// Read the snapshot; a missing file is an empty snapshot.
pub fn load(path: &Path) -> Result<Metadata> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Metadata::default()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data)
        .map_err(|e| Error::Metadata(format!("failed to parse {}: {}", path.display(), e)))
}

/// Replace the snapshot atomically: write a temp file, fsync, rename.
pub fn persist(path: &Path, metadata: &Metadata) -> Result<()> {
    let data = serde_json::to_vec(metadata).map_err(|e| Error::Metadata(e.to_string()))?;
    let tmp = path.with_extension(format!("{}.tmp", rand::random::<u32>()));

    let written = (|| -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(written?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Metadata {
        Metadata {
            version: "0.1.0".into(),
            topics: vec![
                TopicMetadata {
                    name: "orders".into(),
                    paused: true,
                    ephemeral: false,
                    channels: vec![
                        ChannelMetadata {
                            name: "billing".into(),
                            paused: false,
                            ephemeral: false,
                        },
                        ChannelMetadata {
                            name: "tail#ephemeral".into(),
                            paused: false,
                            ephemeral: true,
                        },
                    ],
                },
                TopicMetadata {
                    name: "scratch#ephemeral".into(),
                    paused: false,
                    ephemeral: true,
                    channels: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn test_durable_drops_ephemeral() {
        let durable = sample().durable();
        assert_eq!(durable.topics.len(), 1);
        assert_eq!(durable.topics[0].channels.len(), 1);
        assert_eq!(durable.topics[0].channels[0].name, "billing");
        assert!(durable.topics[0].paused);
    }

    #[test]
    fn test_persist_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = metadata_path(dir.path());
        assert_eq!(load(&path).unwrap(), Metadata::default());

        persist(&path, &sample()).unwrap();
        assert_eq!(load(&path).unwrap(), sample());

        persist(&path, &Metadata::default()).unwrap();
        assert_eq!(load(&path).unwrap(), Metadata::default());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_garbage_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = metadata_path(dir.path());
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(load(&path), Err(Error::Metadata(_))));
    }

    #[test]
    fn test_missing_fields_default() {
        let dir = TempDir::new().unwrap();
        let path = metadata_path(dir.path());
        fs::write(&path, br#"{"topics":[{"name":"t","channels":[{"name":"c"}]}]}"#).unwrap();
        let metadata = load(&path).unwrap();
        assert!(!metadata.topics[0].paused);
        assert_eq!(metadata.topics[0].channels[0].name, "c");
    }
}
