//! On-disk state: node identity and the saved-teammate list, as JSON in the state dir.

use std::path::{Path, PathBuf};

use anyhow::Context;
use manet_core::{LocalIdentity, SavedTeammate};

const IDENTITY_FILE: &str = "identity.json";
const TEAMMATES_FILE: &str = "teammates.json";

#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Identity from disk, or a fresh one written back.
    pub fn load_or_create_identity(&self) -> anyhow::Result<LocalIdentity> {
        let path = self.dir.join(IDENTITY_FILE);
        if path.exists() {
            let raw = std::fs::read(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            return serde_json::from_slice(&raw)
                .with_context(|| format!("parsing {}", path.display()));
        }
        let identity = LocalIdentity::generate();
        self.write_atomic(IDENTITY_FILE, &serde_json::to_vec_pretty(&identity)?)?;
        tracing::info!(address = %identity.address, callsign = %identity.callsign, "generated identity");
        Ok(identity)
    }

    pub fn save_identity(&self, identity: &LocalIdentity) -> anyhow::Result<()> {
        self.write_atomic(IDENTITY_FILE, &serde_json::to_vec_pretty(identity)?)
    }

    /// Saved teammates; a missing file is an empty list.
    pub fn load_teammates(&self) -> anyhow::Result<Vec<SavedTeammate>> {
        let path = self.dir.join(TEAMMATES_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save_teammates(&self, list: &[SavedTeammate]) -> anyhow::Result<()> {
        self.write_atomic(TEAMMATES_FILE, &serde_json::to_vec_pretty(list)?)
    }

    /// Write to a temp file then rename over the target.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let target = self.dir.join(name);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &target)
            .with_context(|| format!("replacing {}", target.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manet_core::{Address, MacAddress, TransportKind};

    fn temp_store() -> Store {
        Store::new(std::env::temp_dir().join(format!("manet-store-{}", uuid::Uuid::new_v4())))
    }

    #[test]
    fn teammates_roundtrip() {
        let store = temp_store();
        assert!(store.load_teammates().unwrap().is_empty());
        let mut mate = SavedTeammate {
            address: Some(Address(42)),
            callsign: Some("BRAVO".into()),
            last_contact_ms: 99,
            enabled: false,
            ..Default::default()
        };
        mate.macs
            .insert(TransportKind::Bluetooth, MacAddress::new([1, 2, 3, 4, 5, 6]));
        store.save_teammates(&[mate.clone()]).unwrap();
        assert_eq!(store.load_teammates().unwrap(), vec![mate]);
        assert!(!store.dir().join(".teammates.json.tmp").exists());
        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[test]
    fn identity_is_stable_across_loads() {
        let store = temp_store();
        let first = store.load_or_create_identity().unwrap();
        let second = store.load_or_create_identity().unwrap();
        assert_eq!(first, second);
        assert!(first.address.is_node());
        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[test]
    fn corrupt_teammates_file_is_an_error() {
        let store = temp_store();
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.dir().join(TEAMMATES_FILE), b"{not json").unwrap();
        assert!(store.load_teammates().is_err());
        let _ = std::fs::remove_dir_all(store.dir());
    }
}
