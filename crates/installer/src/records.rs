//! Flat key=value record of resolved node addresses and roles.
//!
//! Written after provisioning and read back on subsequent invocations so
//! reruns skip guest address re-discovery. Deliberately a plain `nodes.env`
//! file: greppable, sourceable, trivially editable by the operator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use k3s::{Node, NodeRole};
use tracing::info;

/// The address/role record for one deployment.
#[derive(Debug, Clone, Default)]
pub struct Records {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

/// `lab-agent1` -> `LAB_AGENT1`.
fn key_stem(node_name: &str) -> String {
    node_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl Records {
    /// Create an empty record backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Load the record from disk, or start empty if the file is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::new(path));
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let entries = content
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .filter_map(|line| {
                let (key, value) = line.split_once('=')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        info!(path = %path.display(), "loaded address record");
        Ok(Self { path, entries })
    }

    /// Save the record to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut content = String::from("# Managed by forgelab; resolved node addresses.\n");
        for (key, value) in &self.entries {
            content.push_str(&format!("{key}={value}\n"));
        }

        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// Record a node's resolved address and role.
    pub fn set_node(&mut self, node: &Node, address: &str) {
        let stem = key_stem(&node.name);
        self.entries
            .insert(format!("{stem}_ADDR"), address.to_string());
        self.entries
            .insert(format!("{stem}_ROLE"), node.role.to_string());
        self.entries.insert(
            "UPDATED_AT".to_string(),
            chrono::Utc::now().to_rfc3339(),
        );
    }

    /// The recorded address for a node name, if any.
    #[must_use]
    pub fn address(&self, node_name: &str) -> Option<&str> {
        self.entries
            .get(&format!("{}_ADDR", key_stem(node_name)))
            .map(String::as_str)
    }

    /// The recorded role for a node name, if any.
    #[must_use]
    pub fn role(&self, node_name: &str) -> Option<NodeRole> {
        match self
            .entries
            .get(&format!("{}_ROLE", key_stem(node_name)))
            .map(String::as_str)
        {
            Some("server") => Some(NodeRole::Server),
            Some("agent") => Some(NodeRole::Agent),
            _ => None,
        }
    }

    /// Remove the record file (teardown).
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.env");

        let mut records = Records::new(&path);
        let server = Node::new("lab-server", NodeRole::Server);
        let agent = Node::new("lab-agent1", NodeRole::Agent);
        records.set_node(&server, "10.30.0.11");
        records.set_node(&agent, "10.30.0.12");
        records.save().unwrap();

        let loaded = Records::load(&path).unwrap();
        assert_eq!(loaded.address("lab-server"), Some("10.30.0.11"));
        assert_eq!(loaded.address("lab-agent1"), Some("10.30.0.12"));
        assert_eq!(loaded.role("lab-server"), Some(NodeRole::Server));
        assert_eq!(loaded.role("lab-agent1"), Some(NodeRole::Agent));
        assert_eq!(loaded.address("lab-agent2"), None);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = Records::load(dir.path().join("nodes.env")).unwrap();
        assert_eq!(records.address("lab-server"), None);
    }

    #[test]
    fn test_file_is_flat_key_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.env");

        let mut records = Records::new(&path);
        records.set_node(&Node::new("lab-server", NodeRole::Server), "10.30.0.11");
        records.save().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("LAB_SERVER_ADDR=10.30.0.11"));
        assert!(content.contains("LAB_SERVER_ROLE=server"));
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.env");

        let mut records = Records::new(&path);
        records.set_node(&Node::new("lab-server", NodeRole::Server), "10.30.0.11");
        records.save().unwrap();
        assert!(path.exists());

        records.remove().unwrap();
        assert!(!path.exists());
    }
}
