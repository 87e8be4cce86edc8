use std::collections::{BTreeMap, HashMap};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{FileKey, Md5Digest};
use crate::error::SyncError;
use crate::fs_util;

/// What the index knows about a (key, digest) pair before registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexDecision {
    /// File is in the pool with the expected digest; nothing to fetch.
    AlreadyCorrect,
    /// File is not in the pool.
    Missing,
    /// File is in the pool but its digest differs from the expected one.
    Mismatched,
}

/// The session's view of the local file store: which files already exist
/// with which digests, and where completed transfers get recorded.
pub trait FileIndex {
    fn check(&mut self, key: &FileKey, digest: &Md5Digest) -> Result<IndexDecision, SyncError>;
    fn register_completed(&mut self, key: &FileKey, digest: &Md5Digest) -> Result<(), SyncError>;
    fn pool_path(&self, key: &FileKey) -> Utf8PathBuf;
    fn close(&mut self) -> Result<(), SyncError>;
}

const DB_FILE: &str = "files.json";
const DB_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct DbFile {
    version: u32,
    #[serde(default)]
    files: BTreeMap<String, FileRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRecord {
    md5: String,
    registered_at: String,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    digest: Md5Digest,
    registered_at: String,
}

impl StoredRecord {
    fn new(digest: Md5Digest) -> Self {
        Self {
            digest,
            registered_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Files database persisted as JSON next to a pool directory tree.
#[derive(Debug)]
pub struct FsFileIndex {
    db_path: Utf8PathBuf,
    pool_root: Utf8PathBuf,
    files: HashMap<FileKey, StoredRecord>,
    dirty: bool,
}

impl FsFileIndex {
    pub fn open(db_dir: &Utf8Path, pool_dir: &Utf8Path) -> Result<Self, SyncError> {
        fs::create_dir_all(db_dir.as_std_path())
            .map_err(|err| SyncError::StorageInit(format!("create {db_dir}: {err}")))?;
        fs::create_dir_all(pool_dir.as_std_path())
            .map_err(|err| SyncError::StorageInit(format!("create {pool_dir}: {err}")))?;

        let db_path = db_dir.join(DB_FILE);
        let mut files = HashMap::new();
        if db_path.as_std_path().exists() {
            let content = fs::read_to_string(db_path.as_std_path())
                .map_err(|err| SyncError::StorageInit(format!("read {db_path}: {err}")))?;
            let db: DbFile = serde_json::from_str(&content)
                .map_err(|err| SyncError::StorageInit(format!("parse {db_path}: {err}")))?;
            for (key, record) in db.files {
                let key: FileKey = key
                    .parse()
                    .map_err(|_| SyncError::StorageInit(format!("bad key in database: {key}")))?;
                let digest: Md5Digest = record.md5.parse().map_err(|_| {
                    SyncError::StorageInit(format!("bad digest in database for {key}"))
                })?;
                files.insert(
                    key,
                    StoredRecord {
                        digest,
                        registered_at: record.registered_at,
                    },
                );
            }
        }

        Ok(Self {
            db_path,
            pool_root: pool_dir.to_path_buf(),
            files,
            dirty: false,
        })
    }

    pub fn pool_root(&self) -> &Utf8Path {
        &self.pool_root
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn persist(&mut self) -> Result<(), SyncError> {
        let db = DbFile {
            version: DB_VERSION,
            files: self
                .files
                .iter()
                .map(|(key, record)| {
                    (
                        key.as_str().to_string(),
                        FileRecord {
                            md5: record.digest.as_str().to_string(),
                            registered_at: record.registered_at.clone(),
                        },
                    )
                })
                .collect(),
        };
        let content =
            serde_json::to_vec_pretty(&db).map_err(|err| SyncError::Storage(err.to_string()))?;
        fs_util::write_bytes_atomic(&self.db_path, &content)
            .map_err(|err| SyncError::Storage(err.to_string()))?;
        self.dirty = false;
        Ok(())
    }
}

impl FileIndex for FsFileIndex {
    fn check(&mut self, key: &FileKey, digest: &Md5Digest) -> Result<IndexDecision, SyncError> {
        let on_disk = self.pool_path(key);
        if let Some(recorded) = self.files.get(key) {
            if recorded.digest != *digest {
                return Ok(IndexDecision::Mismatched);
            }
            if on_disk.as_std_path().is_file() {
                return Ok(IndexDecision::AlreadyCorrect);
            }
            // Recorded but gone from the pool; forget the stale record.
            debug!(key = %key, "recorded file missing from pool, refetching");
            self.files.remove(key);
            self.dirty = true;
            return Ok(IndexDecision::Missing);
        }
        if on_disk.as_std_path().is_file() {
            let actual = Md5Digest::of_file(on_disk.as_std_path())
                .map_err(|err| SyncError::Storage(err.to_string()))?;
            if actual == *digest {
                debug!(key = %key, "adopting unrecorded pool file");
                self.files.insert(key.clone(), StoredRecord::new(actual));
                self.dirty = true;
                return Ok(IndexDecision::AlreadyCorrect);
            }
            return Ok(IndexDecision::Mismatched);
        }
        Ok(IndexDecision::Missing)
    }

    fn register_completed(&mut self, key: &FileKey, digest: &Md5Digest) -> Result<(), SyncError> {
        self.files
            .insert(key.clone(), StoredRecord::new(digest.clone()));
        self.dirty = true;
        self.persist()
    }

    fn pool_path(&self, key: &FileKey) -> Utf8PathBuf {
        self.pool_root.join(key.as_str())
    }

    fn close(&mut self) -> Result<(), SyncError> {
        if self.dirty {
            self.persist()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;

    fn open_in(temp: &tempfile::TempDir) -> FsFileIndex {
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        FsFileIndex::open(&root.join("db"), &root.join("pool")).unwrap()
    }

    fn key(value: &str) -> FileKey {
        value.parse().unwrap()
    }

    fn digest(value: &str) -> Md5Digest {
        value.parse().unwrap()
    }

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[test]
    fn missing_file_reports_missing() {
        let temp = tempfile::tempdir().unwrap();
        let mut index = open_in(&temp);
        assert!(index.is_empty());
        assert!(index.pool_root().ends_with("pool"));
        let decision = index
            .check(&key("pool/a.deb"), &digest(EMPTY_MD5))
            .unwrap();
        assert_eq!(decision, IndexDecision::Missing);
        assert!(index.is_empty());
    }

    #[test]
    fn registered_file_reports_already_correct() {
        let temp = tempfile::tempdir().unwrap();
        let mut index = open_in(&temp);
        let k = key("pool/a.deb");
        let d = digest(EMPTY_MD5);

        let path = index.pool_path(&k);
        crate::fs_util::ensure_parent(&path).unwrap();
        std::fs::write(path.as_std_path(), b"").unwrap();
        index.register_completed(&k, &d).unwrap();

        assert_eq!(index.check(&k, &d).unwrap(), IndexDecision::AlreadyCorrect);
    }

    #[test]
    fn recorded_digest_mismatch() {
        let temp = tempfile::tempdir().unwrap();
        let mut index = open_in(&temp);
        let k = key("pool/a.deb");
        index.register_completed(&k, &digest(EMPTY_MD5)).unwrap();

        let other = digest("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(index.check(&k, &other).unwrap(), IndexDecision::Mismatched);
    }

    #[test]
    fn unrecorded_pool_file_is_adopted_when_digest_matches() {
        let temp = tempfile::tempdir().unwrap();
        let mut index = open_in(&temp);
        let k = key("pool/a.deb");
        let path = index.pool_path(&k);
        crate::fs_util::ensure_parent(&path).unwrap();
        std::fs::write(path.as_std_path(), b"").unwrap();

        let d = digest(EMPTY_MD5);
        assert_eq!(index.check(&k, &d).unwrap(), IndexDecision::AlreadyCorrect);
        assert_eq!(index.len(), 1);

        let other = digest("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        let k2 = key("pool/b.deb");
        let path2 = index.pool_path(&k2);
        crate::fs_util::ensure_parent(&path2).unwrap();
        std::fs::write(path2.as_std_path(), b"").unwrap();
        assert_eq!(index.check(&k2, &other).unwrap(), IndexDecision::Mismatched);
    }

    #[test]
    fn database_survives_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let k = key("pool/a.deb");
        let d = digest(EMPTY_MD5);
        {
            let mut index = open_in(&temp);
            index.register_completed(&k, &d).unwrap();
            index.close().unwrap();
        }
        let index = open_in(&temp);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn corrupt_database_fails_open() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("db").as_std_path()).unwrap();
        std::fs::write(root.join("db").join(DB_FILE).as_std_path(), b"not json").unwrap();
        let err = FsFileIndex::open(&root.join("db"), &root.join("pool")).unwrap_err();
        assert_matches!(err, SyncError::StorageInit(_));
    }
}
