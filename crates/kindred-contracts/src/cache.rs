use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::features::Feature;

/// Bump when the stored entry layout changes; older blobs read as misses.
pub const CACHE_SCHEMA_VERSION: u64 = 1;

/// One cached generation result, keyed by `(feature, conversation)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub schema_version: u64,
    pub data: Value,
    /// Character the payload was generated for. Entries for another
    /// character are stale and must not be redisplayed.
    pub character: String,
    pub saved_at: String,
    /// True when `data` is the deterministic placeholder payload.
    pub fallback: bool,
    pub sequence: u64,
}

impl CacheEntry {
    pub fn new(data: Value, character: impl Into<String>, fallback: bool, sequence: u64) -> Self {
        Self {
            schema_version: CACHE_SCHEMA_VERSION,
            data,
            character: character.into(),
            saved_at: now_utc_iso(),
            fallback,
            sequence,
        }
    }
}

/// File-backed store for generated payloads, one JSON object per file with
/// `"{feature}::{conversation}"` keys. Writes merge onto the on-disk state
/// so independent instances sharing a file do not clobber each other's keys;
/// per key the semantics stay last-write-wins.
#[derive(Debug, Clone)]
pub struct GenerationCache {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
    removed_keys: Vec<String>,
    cleared: bool,
}

impl GenerationCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
            removed_keys: Vec::new(),
            cleared: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry_key(feature: Feature, conversation_id: &str) -> String {
        format!("{}::{}", feature.key(), conversation_id)
    }

    /// Fetches the entry for the pair, treating character-identity and
    /// schema-version mismatches as misses.
    pub fn get(
        &mut self,
        feature: Feature,
        conversation_id: &str,
        active_character: &str,
    ) -> Option<CacheEntry> {
        let entry = self.peek(feature, conversation_id)?;
        if entry.character != active_character {
            return None;
        }
        Some(entry)
    }

    /// Fetches the entry without the character-identity check. Used for
    /// sequence inspection and diagnostics, never for redisplay.
    pub fn peek(&mut self, feature: Feature, conversation_id: &str) -> Option<CacheEntry> {
        let key = Self::entry_key(feature, conversation_id);
        let raw = self.ensure_loaded(true).get(&key)?.clone();
        let entry: CacheEntry = serde_json::from_value(raw).ok()?;
        if entry.schema_version != CACHE_SCHEMA_VERSION {
            return None;
        }
        Some(entry)
    }

    /// Unconditional overwrite: last write wins, no merge.
    pub fn put(
        &mut self,
        feature: Feature,
        conversation_id: &str,
        entry: &CacheEntry,
    ) -> anyhow::Result<()> {
        let key = Self::entry_key(feature, conversation_id);
        let snapshot = serde_json::to_value(entry)?;
        let payload = self.ensure_loaded(true);
        payload.insert(key.clone(), snapshot);
        self.removed_keys.retain(|removed| removed != &key);
        if !self.dirty_keys.contains(&key) {
            self.dirty_keys.push(key);
        }
        self.flush()
    }

    /// Drops one pair's entry. Returns whether anything was removed.
    pub fn clear(&mut self, feature: Feature, conversation_id: &str) -> anyhow::Result<bool> {
        let key = Self::entry_key(feature, conversation_id);
        let payload = self.ensure_loaded(true);
        let existed = payload.remove(&key).is_some();
        if existed {
            self.dirty_keys.retain(|dirty| dirty != &key);
            if !self.removed_keys.contains(&key) {
                self.removed_keys.push(key);
            }
            self.flush()?;
        }
        Ok(existed)
    }

    /// Drops every entry. Returns how many were removed.
    pub fn clear_all(&mut self) -> anyhow::Result<usize> {
        let payload = self.ensure_loaded(true);
        let count = payload.len();
        payload.clear();
        self.dirty_keys.clear();
        self.removed_keys.clear();
        self.cleared = true;
        self.flush()?;
        Ok(count)
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if self.cleared {
            write_json_object(&self.path, &Map::new())?;
            self.cleared = false;
            return Ok(());
        }
        if self.dirty_keys.is_empty() && self.removed_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Some(payload) = &self.payload {
            for key in &self.dirty_keys {
                if let Some(value) = payload.get(key) {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
        }
        for key in &self.removed_keys {
            on_disk.remove(key);
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        self.removed_keys.clear();
        Ok(())
    }

    fn ensure_loaded(&mut self, refresh: bool) -> &mut Map<String, Value> {
        if refresh || self.payload.is_none() {
            self.payload = Some(read_json_object(&self.path).unwrap_or_default());
        }
        self.payload.as_mut().expect("cache payload initialized")
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(character: &str, sequence: u64) -> CacheEntry {
        CacheEntry::new(
            json!([{"title": "A", "content": "B"}]),
            character,
            false,
            sequence,
        )
    }

    #[test]
    fn put_then_get_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut cache = GenerationCache::new(temp.path().join("cache.json"));
        let stored = entry("林晚", 1);
        cache.put(Feature::Notes, "c1", &stored)?;
        assert_eq!(cache.get(Feature::Notes, "c1", "林晚"), Some(stored));
        Ok(())
    }

    #[test]
    fn character_mismatch_is_a_miss() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut cache = GenerationCache::new(temp.path().join("cache.json"));
        cache.put(Feature::Notes, "c1", &entry("林晚", 1))?;
        assert_eq!(cache.get(Feature::Notes, "c1", "别人"), None);
        // The data still exists under the key.
        assert!(cache.peek(Feature::Notes, "c1").is_some());
        Ok(())
    }

    #[test]
    fn features_and_conversations_do_not_collide() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut cache = GenerationCache::new(temp.path().join("cache.json"));
        cache.put(Feature::Notes, "c1", &entry("林晚", 1))?;
        assert_eq!(cache.get(Feature::Mail, "c1", "林晚"), None);
        assert_eq!(cache.get(Feature::Notes, "c2", "林晚"), None);
        Ok(())
    }

    #[test]
    fn put_overwrites_unconditionally() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut cache = GenerationCache::new(temp.path().join("cache.json"));
        cache.put(Feature::Notes, "c1", &entry("林晚", 5))?;
        let newer = entry("林晚", 2);
        cache.put(Feature::Notes, "c1", &newer)?;
        assert_eq!(cache.get(Feature::Notes, "c1", "林晚"), Some(newer));
        Ok(())
    }

    #[test]
    fn entries_survive_reload_from_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let stored = entry("林晚", 1);
        GenerationCache::new(&path).put(Feature::Wallet, "c1", &stored)?;
        let mut reloaded = GenerationCache::new(&path);
        assert_eq!(reloaded.get(Feature::Wallet, "c1", "林晚"), Some(stored));
        Ok(())
    }

    #[test]
    fn unknown_schema_version_is_a_miss() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut stored = entry("林晚", 1);
        stored.schema_version = CACHE_SCHEMA_VERSION + 1;
        GenerationCache::new(&path).put(Feature::Notes, "c1", &stored)?;
        assert_eq!(GenerationCache::new(&path).get(Feature::Notes, "c1", "林晚"), None);
        Ok(())
    }

    #[test]
    fn clear_removes_one_pair() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut cache = GenerationCache::new(&path);
        cache.put(Feature::Notes, "c1", &entry("林晚", 1))?;
        cache.put(Feature::Mail, "c1", &entry("林晚", 2))?;
        assert!(cache.clear(Feature::Notes, "c1")?);
        assert!(!cache.clear(Feature::Notes, "c1")?);
        let mut reloaded = GenerationCache::new(&path);
        assert_eq!(reloaded.get(Feature::Notes, "c1", "林晚"), None);
        assert!(reloaded.get(Feature::Mail, "c1", "林晚").is_some());
        Ok(())
    }

    #[test]
    fn clear_all_empties_the_store() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut cache = GenerationCache::new(&path);
        cache.put(Feature::Notes, "c1", &entry("林晚", 1))?;
        cache.put(Feature::Maps, "c2", &entry("别人", 2))?;
        assert_eq!(cache.clear_all()?, 2);
        let mut reloaded = GenerationCache::new(&path);
        assert_eq!(reloaded.peek(Feature::Notes, "c1"), None);
        assert_eq!(reloaded.peek(Feature::Maps, "c2"), None);
        Ok(())
    }

    #[test]
    fn independent_instances_merge_distinct_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut cache_a = GenerationCache::new(&path);
        let mut cache_b = GenerationCache::new(&path);
        cache_a.put(Feature::Notes, "c1", &entry("林晚", 1))?;
        cache_b.put(Feature::Mail, "c1", &entry("林晚", 2))?;
        let mut reloaded = GenerationCache::new(&path);
        assert!(reloaded.get(Feature::Notes, "c1", "林晚").is_some());
        assert!(reloaded.get(Feature::Mail, "c1", "林晚").is_some());
        Ok(())
    }
}
