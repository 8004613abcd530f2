//! File-backed kill switch for shared workers.
//!
//! The document is plain JSON, `{"global": bool, "addresses": [string]}`,
//! hand-editable by operators. Loading tolerates a missing file and any
//! unreadable or mistyped document by falling back to the empty default;
//! fields missing from an otherwise well-formed document default
//! individually. Mutation call sites wrap {load, mutate, save} inside one
//! [`Lock`](crate::lock::Lock) critical section; this type itself is just
//! the document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::address::SocketAddress;
use crate::error::{Result, WorkerError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct KillSwitchData {
    global: bool,
    addresses: Vec<String>,
}

/// One loaded kill-switch document, bound to its path.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    path: PathBuf,
    data: KillSwitchData,
}

impl KillSwitch {
    /// Loads the document at `path`, treating anything unreadable or
    /// malformed as the empty default.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self { path, data }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the document back, creating parent directories as needed.
    /// The serialized form is built in memory first and written in a single
    /// call, so a concurrent reader never observes a torn file.
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let document = serde_json::to_vec(&self.data)
            .map_err(|err| WorkerError::Runtime(format!("unencodable kill switch: {err}")))?;
        std::fs::write(&self.path, document)
            .map_err(|_| WorkerError::Runtime("can't save the kill switch file".to_owned()))
    }

    pub fn global(&self) -> bool {
        self.data.global
    }

    pub fn set_global(&mut self, global: bool) -> &mut Self {
        self.data.global = global;
        self
    }

    pub fn addresses(&self) -> &[String] {
        &self.data.addresses
    }

    pub fn set_addresses(&mut self, addresses: Vec<String>) -> &mut Self {
        self.data.addresses = addresses;
        self
    }

    /// No-op if the address is already present.
    pub fn add_address(&mut self, address: &SocketAddress) -> &mut Self {
        if !self.has_address(address) {
            self.data.addresses.push(address.to_string());
        }
        self
    }

    pub fn remove_address(&mut self, address: &SocketAddress) -> &mut Self {
        self.data
            .addresses
            .retain(|entry| entry != address.as_str());
        self
    }

    pub fn has_address(&self, address: &SocketAddress) -> bool {
        self.data
            .addresses
            .iter()
            .any(|entry| entry == address.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_loads_as_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let switch = KillSwitch::load(dir.path().join("absent.json"));
        assert!(!switch.global());
        assert!(switch.addresses().is_empty());
    }

    #[test]
    fn test_malformed_documents_are_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kill.json");
        for junk in ["", "[]", "not json", r#"{"global": "yes", "addresses": 3}"#] {
            std::fs::write(&path, junk).expect("write");
            let switch = KillSwitch::load(&path);
            assert!(!switch.global(), "junk document {junk:?} should default");
            assert!(switch.addresses().is_empty());
        }
    }

    #[test]
    fn test_partial_documents_keep_known_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kill.json");
        std::fs::write(&path, r#"{"global": true}"#).expect("write");
        let switch = KillSwitch::load(&path);
        assert!(switch.global());
        assert!(switch.addresses().is_empty());
    }

    #[test]
    fn test_save_creates_parents_and_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/deeper/kill.json");
        let address = SocketAddress::from("unix:///tmp/a.sock");

        let mut switch = KillSwitch::load(&path);
        switch.set_global(true).add_address(&address);
        switch.save().expect("save");

        let reloaded = KillSwitch::load(&path);
        assert!(reloaded.global());
        assert!(reloaded.has_address(&address));
    }

    #[test]
    fn test_add_address_deduplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut switch = KillSwitch::load(dir.path().join("kill.json"));
        let address = SocketAddress::from("tcp://127.0.0.1:9000");
        switch.add_address(&address).add_address(&address);
        assert_eq!(switch.addresses().len(), 1);

        switch.remove_address(&address);
        assert!(!switch.has_address(&address));
    }
}
