//! File-backed directory.
//!
//! Loads a JSON snapshot of directory state into a [`MemoryDirectory`] and
//! writes it back on [`SnapshotDirectory::save`]. Used by the CLI to plan
//! and apply changes offline against an exported copy of a directory.

use super::DirectoryClient;
use super::memory::{DirectoryState, MemoryDirectory};
use crate::error::Result;
use crate::types::{Entity, EntityKind, ListQuery, Page};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk snapshot format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the snapshot was last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub state: DirectoryState,
}

impl Snapshot {
    /// Read a snapshot file. A missing file yields an empty snapshot.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No snapshot at {}, starting empty", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the snapshot, creating parent directories as needed.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// A [`DirectoryClient`] persisted to a JSON snapshot file.
#[derive(Debug)]
pub struct SnapshotDirectory {
    path: PathBuf,
    saved_at: Option<DateTime<Utc>>,
    directory: MemoryDirectory,
}

impl SnapshotDirectory {
    /// Open the snapshot at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = Snapshot::load(&path)?;
        debug!(
            "Loaded snapshot {} ({} groups, {} users)",
            path.display(),
            snapshot.state.groups.len(),
            snapshot.state.users.len()
        );
        Ok(Self {
            path,
            saved_at: snapshot.saved_at,
            directory: MemoryDirectory::from_state(snapshot.state),
        })
    }

    /// Persist the current state back to the snapshot file.
    pub fn save(&mut self) -> Result<()> {
        let now = Utc::now();
        let snapshot = Snapshot {
            saved_at: Some(now),
            state: self.directory.state(),
        };
        snapshot.write(&self.path)?;
        self.saved_at = Some(now);
        debug!("Saved snapshot {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the loaded snapshot was last saved, if ever.
    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at
    }

    /// The underlying in-memory directory.
    pub fn directory(&self) -> &MemoryDirectory {
        &self.directory
    }
}

impl DirectoryClient for SnapshotDirectory {
    fn get(&self, kind: EntityKind, parent: Option<&str>, id: &str) -> Result<Entity> {
        self.directory.get(kind, parent, id)
    }

    fn list_page(&self, query: &ListQuery, page_token: Option<&str>) -> Result<Page> {
        self.directory.list_page(query, page_token)
    }

    fn insert(&self, parent: Option<&str>, entity: &Entity) -> Result<Entity> {
        self.directory.insert(parent, entity)
    }

    fn patch(&self, parent: Option<&str>, id: &str, entity: &Entity) -> Result<Entity> {
        self.directory.patch(parent, id, entity)
    }

    fn update(&self, parent: Option<&str>, id: &str, entity: &Entity) -> Result<Entity> {
        self.directory.update(parent, id, entity)
    }

    fn delete(&self, kind: EntityKind, parent: Option<&str>, id: &str) -> Result<()> {
        self.directory.delete(kind, parent, id)
    }

    fn has_member(&self, group: &str, member: &str) -> Result<bool> {
        self.directory.has_member(group, member)
    }
}
