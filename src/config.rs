use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::FileRequest;
use crate::error::SyncError;

pub const DEFAULT_METHOD_DIR: &str = "/usr/lib/poolsync/methods";

#[derive(Debug, Deserialize, Serialize)]
pub struct Manifest {
    pub db_dir: String,
    pub pool_dir: String,
    #[serde(default)]
    pub method_dir: Option<String>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpstreamEntry {
    pub method: String,
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FileEntry {
    pub source: String,
    pub key: String,
    pub md5: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub db_dir: Utf8PathBuf,
    pub pool_dir: Utf8PathBuf,
    pub method_dir: Utf8PathBuf,
    pub upstreams: Vec<ResolvedUpstream>,
}

#[derive(Debug, Clone)]
pub struct ResolvedUpstream {
    pub method: String,
    pub config: Option<String>,
    pub files: Vec<FileRequest>,
}

pub struct ManifestLoader;

impl ManifestLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedManifest, SyncError> {
        let manifest_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("poolsync.json"),
        };

        if path.is_none() && !manifest_path.exists() {
            return Err(SyncError::MissingManifest);
        }

        let content = fs::read_to_string(&manifest_path)
            .map_err(|_| SyncError::ManifestRead(manifest_path.display().to_string()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .map_err(|err| SyncError::ManifestParse(err.to_string()))?;

        Self::resolve_manifest(manifest)
    }

    pub fn resolve_manifest(manifest: Manifest) -> Result<ResolvedManifest, SyncError> {
        let upstreams = manifest
            .upstreams
            .into_iter()
            .map(|entry| {
                let files = entry
                    .files
                    .into_iter()
                    .map(|file| {
                        Ok(FileRequest {
                            source: file.source,
                            key: file.key.parse()?,
                            digest: file.md5.parse()?,
                        })
                    })
                    .collect::<Result<Vec<_>, SyncError>>()?;
                Ok(ResolvedUpstream {
                    method: entry.method,
                    config: entry.config,
                    files,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        Ok(ResolvedManifest {
            db_dir: Utf8PathBuf::from(manifest.db_dir),
            pool_dir: Utf8PathBuf::from(manifest.pool_dir),
            method_dir: Utf8PathBuf::from(
                manifest
                    .method_dir
                    .unwrap_or_else(|| DEFAULT_METHOD_DIR.to_string()),
            ),
            upstreams,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn resolve_manifest_defaults_method_dir() {
        let manifest = Manifest {
            db_dir: "var/db".to_string(),
            pool_dir: "var/pool".to_string(),
            method_dir: None,
            upstreams: vec![UpstreamEntry {
                method: "http".to_string(),
                config: Some("mirror.example.org".to_string()),
                files: vec![FileEntry {
                    source: "http://mirror.example.org/a.deb".to_string(),
                    key: "pool/main/a.deb".to_string(),
                    md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
                }],
            }],
        };

        let resolved = ManifestLoader::resolve_manifest(manifest).unwrap();
        assert_eq!(resolved.method_dir, Utf8PathBuf::from(DEFAULT_METHOD_DIR));
        assert_eq!(resolved.upstreams.len(), 1);
        assert_eq!(resolved.upstreams[0].files[0].key.as_str(), "pool/main/a.deb");
    }

    #[test]
    fn resolve_manifest_rejects_bad_digest() {
        let manifest = Manifest {
            db_dir: "var/db".to_string(),
            pool_dir: "var/pool".to_string(),
            method_dir: None,
            upstreams: vec![UpstreamEntry {
                method: "http".to_string(),
                config: None,
                files: vec![FileEntry {
                    source: "http://mirror.example.org/a.deb".to_string(),
                    key: "pool/main/a.deb".to_string(),
                    md5: "nope".to_string(),
                }],
            }],
        };

        let err = ManifestLoader::resolve_manifest(manifest).unwrap_err();
        assert_matches!(err, SyncError::InvalidDigest(_));
    }
}
