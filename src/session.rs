use std::collections::HashMap;

use camino::Utf8Path;
use tracing::{debug, info};

use crate::domain::{FileKey, FileRequest, Md5Digest};
use crate::error::SyncError;
use crate::fs_util;
use crate::index::{FileIndex, FsFileIndex, IndexDecision};
use crate::method::{CancelToken, FetchProtocol, TransferRequest};

/// One requested file: where the backend fetches it from, where it lands
/// in the pool, and the digest every requester agreed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    source: String,
    key: FileKey,
    digest: Md5Digest,
}

impl DownloadItem {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn key(&self) -> &FileKey {
        &self.key
    }

    pub fn digest(&self) -> &Md5Digest {
        &self.digest
    }
}

/// One configured fetch backend instance with its queue of downloads,
/// in registration order.
#[derive(Debug)]
pub struct Upstream {
    method: String,
    config: Option<String>,
    queue: Vec<DownloadItem>,
}

impl Upstream {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }

    pub fn queued(&self) -> &[DownloadItem] {
        &self.queue
    }
}

/// Handle to an upstream within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamId(usize);

/// Result of registering one file (or a batch) for download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new item was queued.
    Added,
    /// The file is already in the pool or already queued with the same
    /// digest; nothing new to do.
    AlreadySatisfied,
}

impl RegisterOutcome {
    pub fn is_added(self) -> bool {
        matches!(self, RegisterOutcome::Added)
    }
}

/// Location of an item inside the upstream queues. The registry maps each
/// file key to the single item that owns it; ownership stays with the
/// upstream queue.
#[derive(Debug, Clone, Copy)]
struct ItemRef {
    upstream: usize,
    position: usize,
}

/// A download session: all upstreams, all requested files, and the file
/// index they are resolved against. Dropping the session cancels anything
/// not yet run.
pub struct DownloadSession {
    index: Box<dyn FileIndex>,
    upstreams: Vec<Upstream>,
    registry: HashMap<FileKey, ItemRef>,
}

impl DownloadSession {
    /// Open a session over a files database and pool directory on disk.
    pub fn open(db_dir: &Utf8Path, pool_dir: &Utf8Path) -> Result<Self, SyncError> {
        let index = FsFileIndex::open(db_dir, pool_dir)?;
        Ok(Self::with_index(Box::new(index)))
    }

    /// Build a session over an externally supplied file index.
    pub fn with_index(index: Box<dyn FileIndex>) -> Self {
        Self {
            index,
            upstreams: Vec::new(),
            registry: HashMap::new(),
        }
    }

    /// Release everything. Queued-but-not-run downloads are cancelled;
    /// the index close error, if any, is informational.
    pub fn close(mut self) -> Result<(), SyncError> {
        self.upstreams.clear();
        self.registry.clear();
        self.index.close()
    }

    pub fn file_index(&self) -> &dyn FileIndex {
        self.index.as_ref()
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    /// Number of distinct files queued for download.
    pub fn queued_len(&self) -> usize {
        self.registry.len()
    }

    /// Add a fetch backend instance. Duplicate method ids are fine; two
    /// upstreams may share a backend type with different configs.
    pub fn add_upstream(&mut self, method: &str, config: Option<&str>) -> UpstreamId {
        self.upstreams.push(Upstream {
            method: method.to_string(),
            config: config.map(str::to_string),
            queue: Vec::new(),
        });
        UpstreamId(self.upstreams.len() - 1)
    }

    /// Queue one file for download through the given upstream.
    ///
    /// The first registration of a file key binds its digest for the rest
    /// of the session: re-registering with the same digest is a no-op,
    /// with a different digest a `ChecksumConflict`.
    pub fn register_file(
        &mut self,
        upstream: UpstreamId,
        source: &str,
        key: FileKey,
        digest: Md5Digest,
    ) -> Result<RegisterOutcome, SyncError> {
        match self.index.check(&key, &digest)? {
            IndexDecision::AlreadyCorrect => {
                debug!(key = %key, "already in pool");
                return Ok(RegisterOutcome::AlreadySatisfied);
            }
            // A mismatched pool file gets refetched and overwritten just
            // like a missing one.
            IndexDecision::Missing | IndexDecision::Mismatched => {}
        }

        if let Some(existing) = self.registry.get(&key) {
            let bound = &self.upstreams[existing.upstream].queue[existing.position].digest;
            if *bound == digest {
                debug!(key = %key, "already queued");
                return Ok(RegisterOutcome::AlreadySatisfied);
            }
            return Err(SyncError::ChecksumConflict {
                key: key.to_string(),
                existing: bound.to_string(),
                requested: digest.to_string(),
            });
        }

        let queue = &mut self.upstreams[upstream.0].queue;
        queue.push(DownloadItem {
            source: source.to_string(),
            key: key.clone(),
            digest,
        });
        self.registry.insert(
            key,
            ItemRef {
                upstream: upstream.0,
                position: queue.len() - 1,
            },
        );
        Ok(RegisterOutcome::Added)
    }

    /// Queue a batch of files. Every entry is processed even after a
    /// conflict; the first error, if any, is returned once the batch is
    /// done. Otherwise `Added` wins over `AlreadySatisfied`.
    pub fn register_files(
        &mut self,
        upstream: UpstreamId,
        requests: impl IntoIterator<Item = FileRequest>,
    ) -> Result<RegisterOutcome, SyncError> {
        let mut outcome = RegisterOutcome::AlreadySatisfied;
        let mut first_error = None;
        for request in requests {
            match self.register_file(upstream, &request.source, request.key, request.digest) {
                Ok(RegisterOutcome::Added) => outcome = RegisterOutcome::Added,
                Ok(RegisterOutcome::AlreadySatisfied) => {}
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// Find the queued item for a file key, if any.
    pub fn lookup(&self, key: &FileKey) -> Option<&DownloadItem> {
        let item = self.registry.get(key)?;
        Some(&self.upstreams[item.upstream].queue[item.position])
    }

    /// Fetch everything queued. Backends are opened and fed in
    /// registration order; any setup or submission failure aborts the
    /// whole run. Completed transfers are recorded in the file index and
    /// are not rolled back on a later failure.
    pub fn run(
        &mut self,
        protocol: &dyn FetchProtocol,
        runner_dir: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        let mut run = protocol.init_run()?;

        for upstream in &self.upstreams {
            let backend = run.open_backend(&upstream.method, upstream.config.as_deref())?;
            for item in &upstream.queue {
                let destination = self.index.pool_path(&item.key);
                fs_util::ensure_parent(&destination).map_err(|err| SyncError::Submit {
                    key: item.key.to_string(),
                    message: err.to_string(),
                })?;
                run.submit(
                    backend,
                    TransferRequest {
                        source: item.source.clone(),
                        destination,
                        digest: item.digest.clone(),
                        key: item.key.clone(),
                    },
                )?;
            }
            info!(
                method = %upstream.method,
                files = upstream.queue.len(),
                "upstream submitted"
            );
        }

        run.execute(runner_dir, self.index.as_mut(), cancel)
        // The run tears itself down on drop, error path included.
    }
}
