use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::domain::{FileKey, Md5Digest};
use crate::error::SyncError;
use crate::index::FileIndex;

/// One transfer handed to a backend: fetch `source` into `destination`,
/// which must arrive with `digest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source: String,
    pub destination: Utf8PathBuf,
    pub digest: Md5Digest,
    pub key: FileKey,
}

/// Reference to a backend connection within one run, issued by
/// `FetchRun::open_backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendHandle(pub usize);

/// Cooperative cancellation flag shared with the caller; checked between
/// transfers, never mid-file.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Factory for fetch runs. One run collects backend connections and their
/// queued transfers, then executes them all; teardown happens on drop.
pub trait FetchProtocol {
    fn init_run(&self) -> Result<Box<dyn FetchRun>, SyncError>;
}

pub trait FetchRun {
    fn open_backend(
        &mut self,
        method: &str,
        config: Option<&str>,
    ) -> Result<BackendHandle, SyncError>;

    fn submit(&mut self, backend: BackendHandle, request: TransferRequest)
    -> Result<(), SyncError>;

    /// Perform all queued transfers. Each delivered file is verified
    /// against its expected digest and recorded in the file index.
    fn execute(
        &mut self,
        runner_dir: &Utf8Path,
        index: &mut dyn FileIndex,
        cancel: &CancelToken,
    ) -> Result<(), SyncError>;
}

/// Drives one external runner executable per backend id.
///
/// A runner lives at `<runner_dir>/<method>` and is invoked with the
/// backend config string as its single argument, if any. It reads one
/// `source<TAB>destination` line per queued file on stdin and answers
/// `ok <destination>` or `fail <destination> <message>` per file on stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessProtocol;

impl FetchProtocol for SubprocessProtocol {
    fn init_run(&self) -> Result<Box<dyn FetchRun>, SyncError> {
        Ok(Box::new(SubprocessRun::default()))
    }
}

#[derive(Debug, Default)]
struct SubprocessRun {
    backends: Vec<BackendQueue>,
}

#[derive(Debug)]
struct BackendQueue {
    method: String,
    config: Option<String>,
    requests: Vec<TransferRequest>,
}

impl FetchRun for SubprocessRun {
    fn open_backend(
        &mut self,
        method: &str,
        config: Option<&str>,
    ) -> Result<BackendHandle, SyncError> {
        if method.is_empty() || method.contains('/') {
            return Err(SyncError::BackendOpen {
                method: method.to_string(),
                message: "method id must be a bare executable name".to_string(),
            });
        }
        self.backends.push(BackendQueue {
            method: method.to_string(),
            config: config.map(str::to_string),
            requests: Vec::new(),
        });
        Ok(BackendHandle(self.backends.len() - 1))
    }

    fn submit(
        &mut self,
        backend: BackendHandle,
        request: TransferRequest,
    ) -> Result<(), SyncError> {
        let queue = self
            .backends
            .get_mut(backend.0)
            .ok_or_else(|| SyncError::Submit {
                key: request.key.to_string(),
                message: "unknown backend handle".to_string(),
            })?;
        queue.requests.push(request);
        Ok(())
    }

    fn execute(
        &mut self,
        runner_dir: &Utf8Path,
        index: &mut dyn FileIndex,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        for queue in &self.backends {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if queue.requests.is_empty() {
                debug!(method = %queue.method, "backend has no queued files, skipping");
                continue;
            }
            run_backend(queue, runner_dir, index, cancel)?;
        }
        Ok(())
    }
}

fn run_backend(
    queue: &BackendQueue,
    runner_dir: &Utf8Path,
    index: &mut dyn FileIndex,
    cancel: &CancelToken,
) -> Result<(), SyncError> {
    let runner = runner_dir.join(&queue.method);
    if !runner.as_std_path().is_file() {
        return Err(SyncError::Execute(format!(
            "no runner for method {} at {runner}",
            queue.method
        )));
    }

    info!(method = %queue.method, files = queue.requests.len(), "running backend");

    let mut command = Command::new(runner.as_std_path());
    if let Some(config) = &queue.config {
        command.arg(config);
    }
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|err| SyncError::Execute(format!("spawn {runner}: {err}")))?;

    let outcome = drive_runner(queue, &mut child, index, cancel);
    if outcome.is_err() {
        let _ = child.kill();
    }
    let status = child
        .wait()
        .map_err(|err| SyncError::Execute(format!("wait for {runner}: {err}")))?;
    outcome?;
    if !status.success() {
        return Err(SyncError::Execute(format!(
            "runner for method {} exited with {status}",
            queue.method
        )));
    }
    Ok(())
}

fn drive_runner(
    queue: &BackendQueue,
    child: &mut Child,
    index: &mut dyn FileIndex,
    cancel: &CancelToken,
) -> Result<(), SyncError> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SyncError::Execute("runner stdin unavailable".to_string()))?;
    let mut input = String::new();
    for request in &queue.requests {
        input.push_str(&format!("{}\t{}\n", request.source, request.destination));
    }
    // Feed from a separate thread so a runner answering as it goes cannot
    // deadlock against our unread replies. Closing stdin ends the queue.
    let feeder = std::thread::spawn(move || stdin.write_all(input.as_bytes()));

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SyncError::Execute("runner stdout unavailable".to_string()))?;
    let reader = BufReader::new(stdout);

    // Each queued destination must be acknowledged exactly once; a runner
    // repeating itself is as malformed as one answering for unqueued files.
    let mut acknowledged: HashSet<&Utf8PathBuf> = HashSet::new();
    let mut failures: Vec<String> = Vec::new();
    for line in reader.lines() {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let line = line.map_err(|err| SyncError::Execute(format!("read from runner: {err}")))?;
        let Some((kind, rest)) = parse_reply(&line) else {
            warn!(method = %queue.method, line, "ignoring malformed runner reply");
            continue;
        };
        let Some((request, message)) = match_reply(rest, &queue.requests) else {
            warn!(method = %queue.method, reply = rest, "runner reply for unqueued file");
            continue;
        };
        if !acknowledged.insert(&request.destination) {
            warn!(method = %queue.method, destination = %request.destination, "duplicate runner reply, ignoring");
            continue;
        }
        match kind {
            ReplyKind::Ok => {
                let actual = Md5Digest::of_file(request.destination.as_std_path())
                    .map_err(|err| SyncError::Execute(err.to_string()))?;
                if actual != request.digest {
                    failures.push(format!(
                        "{}: delivered with digest {actual}, expected {}",
                        request.key, request.digest
                    ));
                    continue;
                }
                index.register_completed(&request.key, &request.digest)?;
                debug!(key = %request.key, "transfer complete");
            }
            ReplyKind::Fail => {
                failures.push(format!(
                    "{}: {}",
                    request.key,
                    message.unwrap_or("runner reported failure")
                ));
            }
        }
    }

    if feeder.join().is_err() {
        return Err(SyncError::Execute("runner stdin writer panicked".to_string()));
    }

    if !failures.is_empty() {
        return Err(SyncError::Execute(format!(
            "method {}: {} of {} transfers failed; first: {}",
            queue.method,
            failures.len(),
            queue.requests.len(),
            failures[0]
        )));
    }
    if acknowledged.len() != queue.requests.len() {
        return Err(SyncError::Execute(format!(
            "method {}: runner acknowledged {} of {} transfers",
            queue.method,
            acknowledged.len(),
            queue.requests.len()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyKind {
    Ok,
    Fail,
}

fn parse_reply(line: &str) -> Option<(ReplyKind, &str)> {
    let trimmed = line.trim();
    let (word, rest) = trimmed.split_once(' ')?;
    let kind = match word {
        "ok" => ReplyKind::Ok,
        "fail" => ReplyKind::Fail,
        _ => return None,
    };
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }
    Some((kind, rest))
}

/// Matches a reply body against the queued destinations. Destinations may
/// contain spaces, so the reply is matched by whole-destination prefix
/// rather than split at the first space; whatever follows is the message.
fn match_reply<'r, 'q>(
    rest: &'r str,
    requests: &'q [TransferRequest],
) -> Option<(&'q TransferRequest, Option<&'r str>)> {
    requests.iter().find_map(|request| {
        let destination = request.destination.as_str();
        if rest == destination {
            return Some((request, None));
        }
        rest.strip_prefix(destination)
            .and_then(|tail| tail.strip_prefix(' '))
            .map(|message| (request, Some(message.trim())))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_for(destination: &str) -> TransferRequest {
        TransferRequest {
            source: "http://example.org/a.deb".to_string(),
            destination: destination.into(),
            digest: "d41d8cd98f00b204e9800998ecf8427e".parse().unwrap(),
            key: "pool/a.deb".parse().unwrap(),
        }
    }

    #[test]
    fn parse_ok_reply() {
        let (kind, rest) = parse_reply("ok /pool/main/a.deb").unwrap();
        assert_eq!(kind, ReplyKind::Ok);
        assert_eq!(rest, "/pool/main/a.deb");
    }

    #[test]
    fn parse_fail_reply() {
        let (kind, rest) = parse_reply("fail /pool/main/a.deb 404 not found").unwrap();
        assert_eq!(kind, ReplyKind::Fail);
        assert_eq!(rest, "/pool/main/a.deb 404 not found");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_reply("").is_none());
        assert!(parse_reply("ok").is_none());
        assert!(parse_reply("done /pool/a.deb").is_none());
    }

    #[test]
    fn match_reply_splits_message_after_destination() {
        let requests = vec![request_for("/pool/main/a.deb")];

        let (request, message) = match_reply("/pool/main/a.deb", &requests).unwrap();
        assert_eq!(request.destination, "/pool/main/a.deb");
        assert_eq!(message, None);

        let (_, message) = match_reply("/pool/main/a.deb 404 not found", &requests).unwrap();
        assert_eq!(message, Some("404 not found"));

        assert!(match_reply("/pool/main/b.deb", &requests).is_none());
    }

    #[test]
    fn match_reply_handles_spaces_in_destination() {
        let requests = vec![request_for("/srv/my pool/main/a.deb")];

        let (request, message) = match_reply("/srv/my pool/main/a.deb", &requests).unwrap();
        assert_eq!(request.destination, "/srv/my pool/main/a.deb");
        assert_eq!(message, None);

        let (_, message) = match_reply("/srv/my pool/main/a.deb timeout", &requests).unwrap();
        assert_eq!(message, Some("timeout"));
    }

    #[test]
    fn submit_to_unknown_handle_is_rejected() {
        let mut run = SubprocessRun::default();
        let request = TransferRequest {
            source: "http://example.org/a.deb".to_string(),
            destination: "/tmp/a.deb".into(),
            digest: "d41d8cd98f00b204e9800998ecf8427e".parse().unwrap(),
            key: "pool/a.deb".parse().unwrap(),
        };
        let err = run.submit(BackendHandle(3), request).unwrap_err();
        assert!(matches!(err, SyncError::Submit { .. }));
    }

    #[test]
    fn open_backend_rejects_path_separators() {
        let mut run = SubprocessRun::default();
        let err = run.open_backend("../http", None).unwrap_err();
        assert!(matches!(err, SyncError::BackendOpen { .. }));
    }

    #[test]
    fn cancel_token_roundtrip() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
    }
}
