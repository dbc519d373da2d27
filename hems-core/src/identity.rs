//! Persisted mapping from numeric device id to hardware address.
//!
//! The on-disk form is a small versioned JSON document:
//!
//! ```text
//! {"version": 1, "devices": [{"dev_id": 4660, "addr": "00:12:4B:00:01:02:03:04"}]}
//! ```
//!
//! Writes go to `<path>.tmp`, are fsynced, then renamed over `<path>`, so a
//! crash mid-write leaves the previous file intact.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{HardwareAddress, Result};

/// Numeric id → hardware address.
pub type IdentityMap = BTreeMap<u16, HardwareAddress>;

const FORMAT_VERSION: u32 = 1;

/// Storage backend for the identity mapping.
pub trait IdentityStore {
    /// Load the mapping. Missing or unreadable data yields an empty map.
    fn load(&self) -> IdentityMap;

    /// Replace the stored mapping.
    fn store(&mut self, map: &IdentityMap) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    version: u32,
    devices: Vec<IdentityEntry>,
}

#[derive(Serialize, Deserialize)]
struct IdentityEntry {
    dev_id: u16,
    addr: HardwareAddress,
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// Identity mapping kept in a JSON file.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileIdentityStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> IdentityMap {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(_) => return IdentityMap::new(),
        };

        let file: IdentityFile = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %self.path.display(), "Unreadable identity cache: {e}");
                return IdentityMap::new();
            }
        };

        if file.version != FORMAT_VERSION {
            warn!(
                path = %self.path.display(),
                "Unsupported identity cache version {}",
                file.version
            );
            return IdentityMap::new();
        }

        file.devices
            .into_iter()
            .map(|entry| (entry.dev_id, entry.addr))
            .collect()
    }

    fn store(&mut self, map: &IdentityMap) -> Result<()> {
        info!("Store dev_id map");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = IdentityFile {
            version: FORMAT_VERSION,
            devices: map
                .iter()
                .map(|(&dev_id, &addr)| IdentityEntry { dev_id, addr })
                .collect(),
        };
        let text = serde_json::to_string_pretty(&file)?;

        let tmp = self.tmp_path();
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(text.as_bytes())?;
            f.flush()?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-memory store with the same contract, for tests and one-shot decoding.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdentityStore {
    map: IdentityMap,
    pub writes: usize,
    /// When set, every `store` fails with an I/O error.
    pub fail_writes: bool,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_map(map: IdentityMap) -> Self {
        MemoryIdentityStore {
            map,
            ..Self::default()
        }
    }

    pub fn map(&self) -> &IdentityMap {
        &self.map
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> IdentityMap {
        self.map.clone()
    }

    fn store(&mut self, map: &IdentityMap) -> Result<()> {
        if self.fail_writes {
            return Err(std::io::Error::other("identity store write refused").into());
        }
        self.map = map.clone();
        self.writes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> HardwareAddress {
        HardwareAddress::new([0x00, 0x12, 0x4B, 0x00, 0x01, 0x02, 0x03, last])
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIdentityStore::new(dir.path().join("absent.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("dev_id.json");
        let mut store = FileIdentityStore::new(&path);

        let mut map = IdentityMap::new();
        map.insert(0x1234, addr(0x04));
        map.insert(0x0001, addr(0x05));
        store.store(&map).unwrap();

        let loaded = FileIdentityStore::new(&path).load();
        assert_eq!(loaded, map);
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn test_file_is_inspectable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev_id.json");
        let mut store = FileIdentityStore::new(&path);

        let mut map = IdentityMap::new();
        map.insert(4660, addr(0x04));
        store.store(&map).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["devices"][0]["dev_id"], 4660);
        assert_eq!(json["devices"][0]["addr"], "00:12:4B:00:01:02:03:04");
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev_id.json");
        fs::write(&path, "\u{80}\u{3}}garbage").unwrap();
        assert!(FileIdentityStore::new(&path).load().is_empty());
    }

    #[test]
    fn test_unknown_version_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev_id.json");
        fs::write(&path, r#"{"version": 99, "devices": []}"#).unwrap();
        assert!(FileIdentityStore::new(&path).load().is_empty());
    }

    #[test]
    fn test_overwrite_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev_id.json");
        let mut store = FileIdentityStore::new(&path);

        let mut map = IdentityMap::new();
        map.insert(1, addr(0x01));
        store.store(&map).unwrap();
        map.insert(1, addr(0x02));
        store.store(&map).unwrap();

        assert_eq!(store.load().get(&1), Some(&addr(0x02)));
    }

    #[test]
    fn test_memory_store_contract() {
        let mut store = MemoryIdentityStore::new();
        assert!(store.load().is_empty());

        let mut map = IdentityMap::new();
        map.insert(7, addr(0x07));
        store.store(&map).unwrap();
        assert_eq!(store.load(), map);
        assert_eq!(store.writes, 1);

        store.fail_writes = true;
        assert!(store.store(&map).is_err());
        assert_eq!(store.writes, 1);
    }
}
