use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Pool-relative path uniquely identifying where a file belongs locally.
/// Doubles as the deduplication key for download requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileKey(String);

impl FileKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileKey {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && !trimmed.starts_with('/')
            && !trimmed.ends_with('/')
            && trimmed
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != "..");
        if !is_valid {
            return Err(SyncError::InvalidFileKey(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for FileKey {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FileKey> for String {
    fn from(key: FileKey) -> Self {
        key.0
    }
}

/// Expected MD5 content digest, normalized to lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Md5Digest(String);

impl Md5Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Streaming digest of a file on disk.
    pub fn of_file(path: &Path) -> Result<Self, SyncError> {
        let mut file =
            std::fs::File::open(path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut hasher = Md5::new();
        io::copy(&mut file, &mut hasher).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(Self(hex::encode(hasher.finalize())))
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Md5Digest {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid =
            normalized.len() == 32 && normalized.chars().all(|ch| ch.is_ascii_hexdigit());
        if !is_valid {
            return Err(SyncError::InvalidDigest(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for Md5Digest {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Md5Digest> for String {
    fn from(digest: Md5Digest) -> Self {
        digest.0
    }
}

/// One file a caller wants mirrored: where to fetch it from, where it
/// belongs in the pool, and the digest it must arrive with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub source: String,
    pub key: FileKey,
    pub digest: Md5Digest,
}
