//! Persistent key=value records.
//!
//! A store is one directory; each record is one file of `key=value`
//! lines. A record is replaced atomically: the new content is written to
//! a temp file, fsynced, and renamed over the old one. Separate stores
//! exist for containers and for volumes.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use arbor_shared::{ArborError, ArborResult};

/// One record's keys and values, ordered for stable files.
pub type KvRecord = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct KvStore {
    dir: PathBuf,
}

impl KvStore {
    /// Open a store, creating its directory.
    pub fn open(dir: impl Into<PathBuf>) -> ArborResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| ArborError::from(e).context(format!("creating kv store {}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Atomically replace a record.
    pub fn save(&self, id: &str, record: &KvRecord) -> ArborResult<()> {
        for key in record.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\n') {
                return Err(ArborError::invalid_data(format!("bad kv key {:?}", key)));
            }
        }
        let path = self.record_path(id);
        let tmp = self.dir.join(format!(".{}.tmp", id));
        let mut file = File::create(&tmp)
            .map_err(|e| ArborError::from(e).context(format!("creating {}", tmp.display())))?;
        for (key, value) in record {
            writeln!(file, "{}={}", key, value)
                .map_err(|e| ArborError::from(e).context("writing kv record"))?;
        }
        file.sync_all()
            .map_err(|e| ArborError::from(e).context("syncing kv record"))?;
        fs::rename(&tmp, &path)
            .map_err(|e| ArborError::from(e).context(format!("renaming into {}", path.display())))?;
        Ok(())
    }

    /// Load one record; unknown keys are preserved as-is.
    pub fn load(&self, id: &str) -> ArborResult<KvRecord> {
        let path = self.record_path(id);
        let content = fs::read_to_string(&path)
            .map_err(|e| ArborError::from(e).context(format!("reading {}", path.display())))?;
        Ok(parse_record(&content))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.record_path(id).exists()
    }

    pub fn remove(&self, id: &str) -> ArborResult<()> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArborError::from(e).context(format!("removing kv record {}", id))),
        }
    }

    /// Enumerate record ids, skipping leftover temp files.
    pub fn list(&self) -> ArborResult<Vec<String>> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| ArborError::from(e).context(format!("listing {}", self.dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| ArborError::from(e).context("reading kv dir entry"))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                // Stale temp file from an interrupted save.
                let _ = fs::remove_file(entry.path());
                continue;
            }
            ids.push(name);
        }
        ids.sort();
        Ok(ids)
    }
}

fn parse_record(content: &str) -> KvRecord {
    let mut record = KvRecord::new();
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        // Values may contain '='; only the first one splits.
        match line.split_once('=') {
            Some((key, value)) => record.insert(key.to_string(), value.to_string()),
            None => record.insert(line.to_string(), String::new()),
        };
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(pairs: &[(&str, &str)]) -> KvRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path().join("containers")).unwrap();
        let rec = record(&[
            ("state", "dead"),
            ("command", "sh -c 'x=1; echo $x'"),
            ("env", "A=1;B=2=3"),
        ]);
        store.save("13", &rec).unwrap();
        assert_eq!(store.load("13").unwrap(), rec);
    }

    #[test]
    fn test_save_replaces_atomically() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        store.save("v1", &record(&[("a", "1")])).unwrap();
        store.save("v1", &record(&[("a", "2"), ("b", "3")])).unwrap();
        let loaded = store.load("v1").unwrap();
        assert_eq!(loaded.get("a").map(String::as_str), Some("2"));
        assert_eq!(loaded.get("b").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_list_skips_and_sweeps_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        store.save("2", &record(&[("x", "y")])).unwrap();
        store.save("10", &record(&[("x", "y")])).unwrap();
        fs::write(dir.path().join(".3.tmp"), "partial").unwrap();

        let ids = store.list().unwrap();
        assert_eq!(ids, vec!["10".to_string(), "2".to_string()]);
        assert!(!dir.path().join(".3.tmp").exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        store.save("x", &record(&[("a", "b")])).unwrap();
        store.remove("x").unwrap();
        store.remove("x").unwrap();
        assert!(!store.exists("x"));
    }

    #[test]
    fn test_bad_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        assert!(store.save("x", &record(&[("a=b", "v")])).is_err());
        assert!(store.save("x", &record(&[("", "v")])).is_err());
    }

    #[test]
    fn test_value_keeps_equals_signs() {
        assert_eq!(
            parse_record("k=a=b=c\n"),
            record(&[("k", "a=b=c")])
        );
        assert_eq!(parse_record("flag\n"), record(&[("flag", "")]));
    }

    proptest::proptest! {
        #[test]
        fn prop_record_roundtrip(
            pairs in proptest::collection::btree_map(
                "[a-z_][a-z0-9_]{0,16}",
                "[ -~]{0,32}",
                0..8,
            )
        ) {
            let dir = TempDir::new().unwrap();
            let store = KvStore::open(dir.path()).unwrap();
            store.save("r", &pairs).unwrap();
            proptest::prop_assert_eq!(store.load("r").unwrap(), pairs);
        }
    }
}
