use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid file key: {0}")]
    InvalidFileKey(String),

    #[error("invalid md5 digest: {0}")]
    InvalidDigest(String),

    #[error("checksum conflict for {key}: bound to {existing}, rejected {requested}")]
    ChecksumConflict {
        key: String,
        existing: String,
        requested: String,
    },

    #[error("failed to open files database: {0}")]
    StorageInit(String),

    #[error("files database error: {0}")]
    Storage(String),

    #[error("failed to initialize fetch run: {0}")]
    ProtocolInit(String),

    #[error("failed to open backend {method}: {message}")]
    BackendOpen { method: String, message: String },

    #[error("failed to queue {key}: {message}")]
    Submit { key: String, message: String },

    #[error("fetch execution failed: {0}")]
    Execute(String),

    #[error("fetch run cancelled")]
    Cancelled,

    #[error("missing manifest file poolsync.json in current directory")]
    MissingManifest,

    #[error("failed to read manifest at {0}")]
    ManifestRead(String),

    #[error("failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
