#![forbid(unsafe_code)]

use crate::packet::SourceKey;
use crate::rules::RuleKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum PersistError {
    Io(std::io::Error),
    Format(serde_json::Error),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "io: {e}"),
            PersistError::Format(e) => write!(f, "format: {e}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        PersistError::Io(e)
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        PersistError::Format(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    pub rule_type: Option<RuleKind>,
    pub reason: String,
}

impl BlockEntry {
    pub fn for_source(key: &SourceKey, rule_type: Option<RuleKind>, reason: String) -> BlockEntry {
        BlockEntry {
            ip: key.ip.to_string(),
            port: key.port,
            protocol: key.protocol.to_string(),
            rule_type,
            reason,
        }
    }

    fn same_source(&self, other: &BlockEntry) -> bool {
        self.ip == other.ip && self.port == other.port && self.protocol == other.protocol
    }
}

/// The blocked-source set, persisted as a pretty-printed JSON array so it
/// survives restarts and stays readable by operators.
#[derive(Debug, Default, Clone)]
pub struct BlockList {
    entries: Vec<BlockEntry>,
}

impl BlockList {
    pub fn new() -> BlockList {
        BlockList::default()
    }

    /// Loads the persisted list; a missing file is an empty list.
    pub fn load(path: &Path) -> Result<BlockList, PersistError> {
        if !path.exists() {
            return Ok(BlockList::new());
        }
        let text = fs::read_to_string(path)?;
        if text.trim().is_empty() {
            return Ok(BlockList::new());
        }
        let entries = serde_json::from_str(&text)?;
        Ok(BlockList { entries })
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&self.entries)?;
        fs::write(path, body)?;
        Ok(())
    }

    /// Adds an entry unless the source is already blocked. Returns whether
    /// the list changed.
    pub fn block(&mut self, entry: BlockEntry) -> bool {
        if self.entries.iter().any(|e| e.same_source(&entry)) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Removes the entry for a source. Returns whether the list changed.
    pub fn unblock(&mut self, key: &SourceKey) -> bool {
        let probe = BlockEntry::for_source(key, None, String::new());
        let before = self.entries.len();
        self.entries.retain(|e| !e.same_source(&probe));
        before != self.entries.len()
    }

    pub fn contains(&self, key: &SourceKey) -> bool {
        let probe = BlockEntry::for_source(key, None, String::new());
        self.entries.iter().any(|e| e.same_source(&probe))
    }

    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
