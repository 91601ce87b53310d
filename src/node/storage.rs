use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use super::log::Term;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Key/value state machine backed by an append-only write-ahead log.
///
/// Every record is one `key=value` line, appended before the in-memory map is
/// mutated; on restart the file is replayed front-to-back, last write wins.
/// Guarded by its own reader/writer lock so state-machine reads never contend
/// with consensus bookkeeping.
pub struct Store {
    inner: RwLock<StoreInner>,
}

struct StoreInner {
    wal: File,
    data: HashMap<String, String>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Store> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating data dir {}", dir.display()))?;
        }
        let mut wal = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("opening write-ahead log {}", path.display()))?;
        let data = Self::replay(&mut wal).context("replaying write-ahead log")?;
        Ok(Store {
            inner: RwLock::new(StoreInner { wal, data }),
        })
    }

    fn replay(wal: &mut File) -> Result<HashMap<String, String>> {
        wal.seek(SeekFrom::Start(0))?;
        let mut data = HashMap::new();
        for line in BufReader::new(&mut *wal).lines() {
            let line = line?;
            if let Some((key, value)) = line.split_once('=') {
                data.insert(key.to_string(), value.to_string());
            }
        }
        Ok(data)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.data.get(key).cloned()
    }

    /// Append the record durably, then mutate the map. A failed append leaves
    /// the map untouched.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        writeln!(&mut inner.wal, "{key}={value}").context("appending write-ahead record")?;
        inner.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Serialize the whole map as a flat JSON object.
    pub fn export(&self) -> Result<Vec<u8>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_vec(&inner.data).context("serializing snapshot payload")
    }

    /// Atomically replace the map with a deserialized snapshot. The WAL is
    /// rewritten to the imported pairs so a restart replays the installed
    /// state, not the pre-snapshot history.
    pub fn import(&self, data: &[u8]) -> Result<()> {
        let map: HashMap<String, String> =
            serde_json::from_slice(data).context("decoding snapshot payload")?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .wal
            .set_len(0)
            .context("truncating write-ahead log")?;
        for (key, value) in &map {
            writeln!(&mut inner.wal, "{key}={value}")
                .context("rewriting write-ahead record")?;
        }
        inner.data = map;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct Meta {
    term: Term,
    voted_for: Option<String>,
}

/// Durable term/vote record. Raft's one-vote-per-term invariant has to
/// survive restarts, so both are rewritten atomically on every change.
pub struct MetaStore {
    path: PathBuf,
}

impl MetaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<(Term, Option<String>)> {
        if !self.path.exists() {
            return Ok((0, None));
        }
        let raw = fs::read(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let meta: Meta = serde_json::from_slice(&raw).context("decoding term/vote metadata")?;
        Ok((meta.term, meta.voted_for))
    }

    pub fn save(&self, term: Term, voted_for: Option<&str>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating data dir {}", dir.display()))?;
        }
        let meta = Meta {
            term,
            voted_for: voted_for.map(str::to_string),
        };
        let raw = serde_json::to_vec(&meta).context("encoding term/vote metadata")?;
        atomic_write(&self.path, &raw)
    }
}

/// Write a snapshot file atomically: temp file, sync, rename.
pub fn save_snapshot(path: &Path, data: &[u8]) -> Result<()> {
    atomic_write(path, data)
}

pub fn load_snapshot(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading snapshot {}", path.display()))
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file =
        File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    file.write_all(data)
        .with_context(|| format!("writing {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn replay_is_order_preserving_last_write_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        fs::write(&path, "a=1\na=2\nb=1\n").unwrap();

        let store = Store::open(&path).unwrap();
        assert_eq!(store.get("a"), Some("2".to_string()));
        assert_eq!(store.get("b"), Some("1".to_string()));
        assert_eq!(store.get("c"), None);
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let store = Store::open(&path).unwrap();
            store.set("k", "v1").unwrap();
            store.set("k", "v2").unwrap();
            store.set("other", "x").unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.get("k"), Some("v2".to_string()));
        assert_eq!(store.get("other"), Some("x".to_string()));
    }

    #[test]
    fn values_may_contain_the_separator() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("wal.log")).unwrap();
        store.set("eq", "a=b=c").unwrap();
        assert_eq!(store.get("eq"), Some("a=b=c".to_string()));
    }

    #[test]
    fn export_import_roundtrip() {
        let dir = tempdir().unwrap();
        let src = Store::open(dir.path().join("src.wal")).unwrap();
        src.set("a", "1").unwrap();
        src.set("b", "2").unwrap();

        let dst = Store::open(dir.path().join("dst.wal")).unwrap();
        dst.set("stale", "gone").unwrap();
        dst.import(&src.export().unwrap()).unwrap();

        assert_eq!(dst.get("a"), Some("1".to_string()));
        assert_eq!(dst.get("b"), Some("2".to_string()));
        // import replaces the map, it does not merge
        assert_eq!(dst.get("stale"), None);
    }

    #[test]
    fn empty_export_import() {
        let dir = tempdir().unwrap();
        let empty = Store::open(dir.path().join("empty.wal")).unwrap();
        let store = Store::open(dir.path().join("wal.log")).unwrap();
        store.set("a", "1").unwrap();
        store.import(&empty.export().unwrap()).unwrap();
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn import_rewrites_the_wal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let store = Store::open(&path).unwrap();
            store.set("old", "1").unwrap();
            store
                .import(br#"{"fresh":"2"}"#)
                .unwrap();
        }
        // a restart must replay the imported state, not the old history
        let store = Store::open(&path).unwrap();
        assert_eq!(store.get("old"), None);
        assert_eq!(store.get("fresh"), Some("2".to_string()));
    }

    #[test]
    fn concurrent_sets_are_all_recorded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let store = Arc::new(Store::open(&path).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                for j in 0..50 {
                    store.set(&format!("k{i}-{j}"), &format!("v{j}")).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // readable now and after replay
        drop(store);
        let store = Store::open(&path).unwrap();
        for i in 0..8 {
            for j in 0..50 {
                assert_eq!(store.get(&format!("k{i}-{j}")), Some(format!("v{j}")));
            }
        }
    }

    #[test]
    fn overlapping_sets_on_one_key_are_never_torn() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("wal.log")).unwrap());

        let mut handles = Vec::new();
        for i in 0..4 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    store.set("contended", &format!("writer-{i}")).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let value = store.get("contended").unwrap();
        assert!((0..4).any(|i| value == format!("writer-{i}")), "torn value: {value}");
    }

    #[test]
    fn meta_roundtrip_and_default() {
        let dir = tempdir().unwrap();
        let meta = MetaStore::new(dir.path().join("meta.json"));
        assert_eq!(meta.load().unwrap(), (0, None));

        meta.save(7, Some("n2")).unwrap();
        assert_eq!(meta.load().unwrap(), (7, Some("n2".to_string())));

        meta.save(8, None).unwrap();
        assert_eq!(meta.load().unwrap(), (8, None));
        // no temp file left behind
        assert!(!dir.path().join("meta.tmp").exists());
    }

    #[test]
    fn snapshot_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        save_snapshot(&path, br#"{"a":"1"}"#).unwrap();
        assert_eq!(load_snapshot(&path).unwrap(), br#"{"a":"1"}"#.to_vec());
        assert!(!dir.path().join("snapshot.tmp").exists());
    }
}
