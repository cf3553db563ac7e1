#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_ROOT: &str = "/etc/palisade";
const MAX_BACKUPS_DEFAULT: usize = 5;

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub root: PathBuf,
    pub rules: PathBuf,
    pub blocklist: PathBuf,
    pub events_log: PathBuf,
    pub state_dir: PathBuf,
    versions_dir: PathBuf,
    meta_file: PathBuf,
}

impl ConfigPaths {
    pub fn new(root: PathBuf) -> Self {
        let rules_dir = root.join("rules");
        let state_dir = root.join("state");
        let logs_dir = root.join("logs");
        let versions_dir = state_dir.join("versions");
        ConfigPaths {
            root: root.clone(),
            rules: rules_dir.join("rules.json"),
            blocklist: state_dir.join("blocklist.json"),
            events_log: logs_dir.join("events.log"),
            state_dir: state_dir.clone(),
            versions_dir: versions_dir.clone(),
            meta_file: state_dir.join("config_meta"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigMeta {
    pub version: u64,
    pub hash_hex: String,
    pub updated_at: u64,
}

#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub paths: ConfigPaths,
    pub version: u64,
    pub hash_hex: String,
    pub tampered: bool,
}

pub struct ConfigManager {
    pub paths: ConfigPaths,
    max_backups: usize,
}

impl ConfigManager {
    pub fn default_root() -> PathBuf {
        std::env::var("PALISADE_CONFIG_ROOT")
            .or_else(|_| std::env::var("FIREWALL_CONFIG_ROOT"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_ROOT))
    }

    pub fn new_with_backups(root: PathBuf, max_backups: usize) -> Result<Self, String> {
        let paths = ConfigPaths::new(root);
        let mgr = ConfigManager {
            paths,
            max_backups: max_backups.max(1),
        };
        mgr.ensure_layout()?;
        Ok(mgr)
    }

    pub fn new(root: PathBuf) -> Result<Self, String> {
        Self::new_with_backups(root, MAX_BACKUPS_DEFAULT)
    }

    /// Confines a user-supplied path to the config root.
    pub fn resolve_path(&self, path: &str) -> Result<PathBuf, String> {
        let root = &self.paths.root;
        let root_canon = if root.exists() {
            root.canonicalize().unwrap_or_else(|_| root.clone())
        } else {
            root.clone()
        };
        let p = Path::new(path);
        let abs = if p.exists() {
            p.canonicalize()
                .map_err(|e| format!("canonicalize {path}: {e}"))?
        } else {
            let parent = p.parent().unwrap_or_else(|| Path::new("."));
            let base = if parent.exists() {
                parent
                    .canonicalize()
                    .map_err(|e| format!("canonicalize parent of {path}: {e}"))?
            } else {
                root_canon.clone()
            };
            base.join(p.file_name().ok_or_else(|| "invalid path".to_string())?)
        };
        if abs.components().count() == 0 || !abs.starts_with(&root_canon) {
            return Err(format!(
                "path {} must reside under config root {}",
                abs.display(),
                root_canon.display()
            ));
        }
        Ok(abs)
    }

    fn ensure_layout(&self) -> Result<(), String> {
        let rules_dir = self.paths.root.join("rules");
        let logs_dir = self.paths.root.join("logs");
        let dirs = [
            self.paths.root.as_path(),
            rules_dir.as_path(),
            self.paths.state_dir.as_path(),
            logs_dir.as_path(),
            self.paths.versions_dir.as_path(),
        ];
        for d in dirs {
            fs::create_dir_all(d).map_err(|e| format!("create dir {}: {e}", d.display()))?;
        }
        Ok(())
    }

    fn load_meta(&self) -> ConfigMeta {
        let mut meta = ConfigMeta {
            version: 0,
            hash_hex: String::new(),
            updated_at: 0,
        };
        let Ok(text) = fs::read_to_string(&self.paths.meta_file) else {
            return meta;
        };
        for line in text.lines() {
            let Some((field, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match field.trim() {
                "version" => meta.version = value.parse().unwrap_or(0),
                "hash" => meta.hash_hex = value.to_string(),
                "updated_at" => meta.updated_at = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        meta
    }

    fn write_meta(&self, meta: &ConfigMeta) -> Result<(), String> {
        let body = format!(
            "version={}\nhash={}\nupdated_at={}\n",
            meta.version, meta.hash_hex, meta.updated_at
        );
        fs::write(&self.paths.meta_file, body)
            .map_err(|e| format!("write meta {}: {e}", self.paths.meta_file.display()))
    }

    /// Digest over the tracked files: each path name followed by its
    /// contents. A missing file contributes nothing, so creating it later
    /// changes the hash.
    fn hash_tracked(&self) -> String {
        let mut hasher = Sha256::new();
        for path in self.tracked_files() {
            let Ok(contents) = fs::read(&path) else {
                continue;
            };
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(&contents);
        }
        hex::encode(hasher.finalize())
    }

    fn tracked_files(&self) -> Vec<PathBuf> {
        vec![self.paths.rules.clone(), self.paths.blocklist.clone()]
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        let meta = self.load_meta();
        let hash = self.hash_tracked();
        let tampered = !meta.hash_hex.is_empty() && meta.hash_hex != hash;
        ConfigSnapshot {
            paths: self.paths.clone(),
            version: meta.version,
            hash_hex: hash,
            tampered,
        }
    }

    /// Records a new configuration version: hashes the tracked files and
    /// copies them into a numbered backup directory.
    pub fn record_version(&self) -> Result<ConfigMeta, String> {
        let meta = ConfigMeta {
            version: self.load_meta().version.saturating_add(1),
            hash_hex: self.hash_tracked(),
            updated_at: now_secs(),
        };

        let backup = self.paths.versions_dir.join(meta.version.to_string());
        fs::create_dir_all(&backup)
            .map_err(|e| format!("create version dir {}: {e}", backup.display()))?;
        for path in self.tracked_files() {
            let Some(name) = path.file_name() else {
                continue;
            };
            if path.exists() {
                let _ = fs::copy(&path, backup.join(name));
            }
        }

        self.prune_backups()?;
        self.write_meta(&meta)?;
        Ok(meta)
    }

    fn prune_backups(&self) -> Result<(), String> {
        let dir = &self.paths.versions_dir;
        let mut versions: Vec<(u64, PathBuf)> = fs::read_dir(dir)
            .map_err(|e| format!("read versions dir {}: {e}", dir.display()))?
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let version = name.to_str()?.parse().ok()?;
                Some((version, entry.path()))
            })
            .collect();
        versions.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (_, stale) in versions.into_iter().skip(self.max_backups) {
            let _ = fs::remove_dir_all(stale);
        }
        Ok(())
    }

    /// Restores the previous recorded version's tracked files.
    pub fn rollback(&self) -> Result<ConfigSnapshot, String> {
        let current = self.load_meta();
        if current.version == 0 {
            return Err("no previous versions to rollback".into());
        }
        let target = current.version - 1;
        let backup = self.paths.versions_dir.join(target.to_string());
        if !backup.exists() {
            return Err(format!(
                "backup version {} not found in {}",
                target,
                backup.display()
            ));
        }
        for path in self.tracked_files() {
            let Some(name) = path.file_name() else {
                continue;
            };
            let saved = backup.join(name);
            if !saved.exists() {
                continue;
            }
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            fs::copy(&saved, &path).map_err(|e| format!("restore {}: {e}", path.display()))?;
        }
        self.write_meta(&ConfigMeta {
            version: target,
            hash_hex: self.hash_tracked(),
            updated_at: now_secs(),
        })?;
        Ok(self.snapshot())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
