//! Self-describing JSON records on the local filesystem.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   world/snapshot.json                    full WorldSnapshot
//!   entities/<category>/<name>.json        one record per registry entity
//!   entities/agent/<id>.json               one record per agent
//!   events/<tick:020>-<seq:020>.json       one record per event
//! ```
//!
//! Every write goes to a uniquely named temp file in the target directory,
//! is synced, and is then renamed over the target, so a reader sees either
//! the old record or the new one. `world/snapshot.json` is written last;
//! it is the record a restart resumes from.
//!
//! Category and entity names are percent-encoded into file names, so any
//! registry name maps to exactly one file.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tellus_types::{AGENT_CATEGORY, Event, WorldSnapshot};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

const WORLD_DIR: &str = "world";
const SNAPSHOT_FILE: &str = "snapshot.json";
const ENTITIES_DIR: &str = "entities";
const EVENTS_DIR: &str = "events";
const RECORD_EXTENSION: &str = ".json";

/// What one [`FileStore::save_snapshot`] call wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotWrite {
    /// Registry entity records written.
    pub entities: usize,
    /// Agent records written.
    pub agents: usize,
    /// Stale records removed.
    pub pruned: usize,
}

/// Filesystem-backed record store rooted at one directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::io(&root, source))?;
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the full-world record.
    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(WORLD_DIR).join(SNAPSHOT_FILE)
    }

    /// Path of one entity record.
    pub fn entity_path(&self, category: &str, name: &str) -> PathBuf {
        self.root
            .join(ENTITIES_DIR)
            .join(encode_name(category))
            .join(record_file_name(name))
    }

    /// Path of one event record. Lexical order of these names is
    /// emission order.
    pub fn event_path(&self, event: &Event) -> PathBuf {
        self.root
            .join(EVENTS_DIR)
            .join(format!("{:020}-{:020}{RECORD_EXTENSION}", event.tick, event.seq))
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Write a snapshot: every entity and agent record, then the full-world
    /// record. Entity records no longer present in the snapshot are removed.
    ///
    /// # Errors
    ///
    /// Returns the first write failure. Records written before it stay on
    /// disk; the previous full-world record is untouched.
    pub fn save_snapshot(&self, snapshot: &WorldSnapshot) -> Result<SnapshotWrite, StoreError> {
        let mut written: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut report = SnapshotWrite::default();

        for (category, name, record) in snapshot.entity_records() {
            write_json(&self.entity_path(category, name), record)?;
            written
                .entry(encode_name(category))
                .or_default()
                .insert(record_file_name(name));
            report.entities = report.entities.saturating_add(1);
        }
        for (id, agent) in &snapshot.agents {
            write_json(&self.entity_path(AGENT_CATEGORY, id), agent)?;
            written
                .entry(encode_name(AGENT_CATEGORY))
                .or_default()
                .insert(record_file_name(id));
            report.agents = report.agents.saturating_add(1);
        }

        report.pruned = self.prune_entities(&written)?;
        write_json(&self.snapshot_path(), snapshot)?;
        debug!(
            tick = snapshot.tick,
            entities = report.entities,
            agents = report.agents,
            pruned = report.pruned,
            "Snapshot written"
        );
        Ok(report)
    }

    /// Load the full-world record.
    ///
    /// Returns `Ok(None)` when no snapshot has been written yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file exists but cannot be read and
    /// [`StoreError::Serialization`] if it is not a snapshot.
    pub fn load_snapshot(&self) -> Result<Option<WorldSnapshot>, StoreError> {
        read_json(&self.snapshot_path())
    }

    /// Load one entity record, if present.
    ///
    /// # Errors
    ///
    /// See [`load_snapshot`](Self::load_snapshot).
    pub fn load_entity(
        &self,
        category: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        read_json(&self.entity_path(category, name))
    }

    fn prune_entities(
        &self,
        written: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<usize, StoreError> {
        let entities = self.root.join(ENTITIES_DIR);
        let mut pruned: usize = 0;
        for category_dir in list_dir(&entities)? {
            let Some(category) = category_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let keep = written.get(category);
            for record in list_dir(&category_dir)? {
                let Some(file) = record.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !is_record(file) || keep.is_some_and(|names| names.contains(file)) {
                    continue;
                }
                fs::remove_file(&record).map_err(|source| StoreError::io(&record, source))?;
                pruned = pruned.saturating_add(1);
            }
        }
        Ok(pruned)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Write one event record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Serialization`].
    pub fn save_event(&self, event: &Event) -> Result<(), StoreError> {
        write_json(&self.event_path(event), event)
    }

    /// Write events in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// See [`save_event`](Self::save_event).
    pub fn save_events(&self, events: &[Event]) -> Result<(), StoreError> {
        events.iter().try_for_each(|event| self.save_event(event))
    }

    /// The newest `n` persisted events, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory or a record cannot be
    /// read and [`StoreError::Serialization`] for a malformed record.
    pub fn recent_events(&self, n: usize) -> Result<Vec<Event>, StoreError> {
        let mut files: Vec<PathBuf> = list_dir(&self.root.join(EVENTS_DIR))?
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(is_record)
            })
            .collect();
        files.sort();
        let skip = files.len().saturating_sub(n);
        let mut events = Vec::with_capacity(files.len().saturating_sub(skip));
        for path in files.iter().skip(skip) {
            if let Some(event) = read_json(path)? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

/// Percent-encode a name into a file-name-safe string.
///
/// ASCII letters, digits, `-`, `_`, and non-leading `.` pass through;
/// every other byte becomes `%XX`. The empty name encodes as `%`.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (index, byte) in name.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_')
            || (byte == b'.' && index > 0);
        if plain {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}

fn record_file_name(name: &str) -> String {
    format!("{}{RECORD_EXTENSION}", encode_name(name))
}

fn is_record(file_name: &str) -> bool {
    !file_name.starts_with('.') && file_name.ends_with(RECORD_EXTENSION)
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(StoreError::io(dir, source)),
    };
    entries
        .map(|entry| {
            entry
                .map(|entry| entry.path())
                .map_err(|source| StoreError::io(dir, source))
        })
        .collect()
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|source| StoreError::serialization(path, source))?;
    write_atomic(path, &bytes)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(StoreError::io(path, source)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::serialization(path, source))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| StoreError::io(parent, source))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let temp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let written = File::create(&temp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    let result = written.and_then(|()| fs::rename(&temp, path));
    if let Err(source) = result {
        let _ = fs::remove_file(&temp);
        return Err(StoreError::io(path, source));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(encode_name("river_folk"), "river_folk");
        assert_eq!(encode_name("agent-7.v2"), "agent-7.v2");
    }

    #[test]
    fn unsafe_bytes_are_escaped() {
        assert_eq!(encode_name("a/b"), "a%2Fb");
        assert_eq!(encode_name(".."), "%2E.");
        assert_eq!(encode_name("a b"), "a%20b");
        assert_eq!(encode_name(""), "%");
        assert_ne!(encode_name("a/b"), encode_name("a_b"));
    }

    #[test]
    fn records_exclude_temp_files() {
        assert!(is_record("flood.json"));
        assert!(!is_record(".flood.json.abc.tmp"));
        assert!(!is_record("notes.txt"));
    }
}
