pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod index;
pub mod method;
pub mod session;

pub use domain::{FileKey, FileRequest, Md5Digest};
pub use error::SyncError;
pub use index::{FileIndex, FsFileIndex, IndexDecision};
pub use method::{CancelToken, FetchProtocol, FetchRun, SubprocessProtocol, TransferRequest};
pub use session::{DownloadItem, DownloadSession, RegisterOutcome, Upstream, UpstreamId};
