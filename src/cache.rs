//! The persisted settings cache.
//!
//! A directory of file-per-key JSON blobs under `<root>/.csbuild/settings/`,
//! holding data that survives between runs but is cheap to regenerate:
//! include-scan memos, last-result records, and anything adapters choose to
//! stash. Clearing the cache forces a full rebuild but never loses user data.

use crate::{
    error::{BuildError, Result},
    utils,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug)]
pub struct SettingsCache {
    dir: PathBuf,
    // Write-through memory of everything read or written this run.
    loaded: Mutex<HashMap<String, serde_json::Value>>,
}

impl SettingsCache {
    /// Opens (creating if needed) the cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| BuildError::io(err, &dir))?;
        Ok(Self { dir, loaded: Mutex::new(HashMap::new()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store a value under `key`, writing it to disk immediately.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_value(value)?;
        let path = self.path_for(key);
        utils::write_json_file(&json, &path)?;
        self.loaded.lock().insert(key.to_string(), json);
        Ok(())
    }

    /// Load a value stored under `key`, or `None` when absent or unreadable.
    ///
    /// Unreadable entries are treated as absent: the cache only ever holds
    /// regenerable data, so a corrupt blob means recompute, not fail.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        {
            let loaded = self.loaded.lock();
            if let Some(json) = loaded.get(key) {
                return serde_json::from_value(json.clone()).ok();
            }
        }
        let path = self.path_for(key);
        let json: serde_json::Value = utils::read_json_file(&path).ok()?;
        let value = serde_json::from_value(json.clone()).ok();
        if value.is_some() {
            self.loaded.lock().insert(key.to_string(), json);
        }
        value
    }

    /// Remove a stored value. A no-op when the key does not exist.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.loaded.lock().remove(key);
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BuildError::io(err, path)),
        }
    }

    /// Wipe the entire cache tree and start fresh.
    pub fn clear(&self) -> Result<()> {
        debug!("clearing settings cache at {}", self.dir.display());
        self.loaded.lock().clear();
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(|err| BuildError::io(err, &self.dir))?;
        }
        fs::create_dir_all(&self.dir).map_err(|err| BuildError::io(err, &self.dir))?;
        Ok(())
    }

    // Keys may contain `/` to group entries into subdirectories; every other
    // character outside [A-Za-z0-9._-] is replaced so any key is a legal
    // filename.
    fn path_for(&self, key: &str) -> PathBuf {
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(sanitized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_values() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SettingsCache::open(dir.path().join("settings")).unwrap();
        cache.save("answer", &42u32).unwrap();
        assert_eq!(cache.get::<u32>("answer"), Some(42));
        assert_eq!(cache.get::<u32>("missing"), None);
    }

    #[test]
    fn persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings");
        {
            let cache = SettingsCache::open(&path).unwrap();
            cache.save("scans/a.c", &vec!["x".to_string(), "y".to_string()]).unwrap();
        }
        let cache = SettingsCache::open(&path).unwrap();
        assert_eq!(
            cache.get::<Vec<String>>("scans/a.c"),
            Some(vec!["x".to_string(), "y".to_string()])
        );
    }

    #[test]
    fn clear_wipes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SettingsCache::open(dir.path().join("settings")).unwrap();
        cache.save("k", &1u8).unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.get::<u8>("k"), None);
    }

    #[test]
    fn keys_with_odd_characters_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SettingsCache::open(dir.path().join("settings")).unwrap();
        cache.save("results/app tc1:x64|debug", &7i32).unwrap();
        assert_eq!(cache.get::<i32>("results/app tc1:x64|debug"), Some(7));
    }
}
