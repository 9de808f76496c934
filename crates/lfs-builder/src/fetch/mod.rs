//! Artifact acquisition: make sure each referenced archive exists in the
//! sources directory with a matching checksum.
//!
//! Downloads land in a hidden `.part` file next to the destination and are
//! renamed into place only once the digest matches, so a file under the
//! artifact's own name is always complete. Transfer failures and digest
//! mismatches are retried under separate bounds; an interrupt aborts the whole
//! sequence.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::checksum::{Algorithm, digest_file};
use crate::config::BuilderConfig;
use crate::document::ArtifactRef;
use crate::error::{Error, Result};

pub mod http;

pub use http::HttpFetcher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Complete,
    Failed(String),
    Cancelled,
}

/// Transfers one URL into `sink`. Implementations must poll `cancel` while
/// transferring and return [`FetchOutcome::Cancelled`] when it trips.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, sink: &mut dyn Write, cancel: &CancelToken) -> FetchOutcome;
}

#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub algorithm: Algorithm,
    /// When set, downloads come from `<prefix><file>` instead of the artifact URL.
    pub mirror_prefix: Option<String>,
    /// Total transfer attempts before giving up (at least one is always made).
    pub fetch_retries: u32,
    /// Re-downloads allowed after a completed transfer fails verification.
    pub checksum_retries: u32,
    pub retry_delay: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Md5,
            mirror_prefix: None,
            fetch_retries: 5,
            checksum_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl AcquireOptions {
    pub fn from_config(cfg: &BuilderConfig, book_version: &str) -> Self {
        Self {
            algorithm: cfg.general.checksum,
            mirror_prefix: cfg.mirror_prefix(book_version),
            fetch_retries: cfg.download.fetch_retries,
            checksum_retries: cfg.download.checksum_retries,
            ..Self::default()
        }
    }

    pub fn source_url(&self, artifact: &ArtifactRef) -> String {
        match self.mirror_prefix.as_deref() {
            Some(prefix) => format!("{prefix}{}", artifact.file),
            None => artifact.url.clone(),
        }
    }
}

fn partial_path(dest_dir: &Path, file: &str) -> PathBuf {
    dest_dir.join(format!(".{file}.part"))
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial download"),
    }
}

fn interrupted(artifact: &ArtifactRef, part: &Path) -> Error {
    remove_partial(part);
    Error::acquisition(format!("interrupted while fetching {artifact}"))
}

fn pause(delay: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline && !cancel.is_cancelled() {
        std::thread::sleep(Duration::from_millis(50).min(delay));
    }
}

fn download_once(
    fetcher: &dyn Fetcher,
    url: &str,
    part: &Path,
    cancel: &CancelToken,
) -> Result<FetchOutcome> {
    let mut file = fs::File::create(part)
        .map_err(|e| Error::io(format!("failed to create {}: {e}", part.display())))?;
    let outcome = fetcher.fetch(url, &mut file, cancel);
    if outcome == FetchOutcome::Complete
        && let Err(e) = file.sync_all()
    {
        return Ok(FetchOutcome::Failed(format!("failed to flush download: {e}")));
    }
    Ok(outcome)
}

/// Guarantees `dest_dir/<artifact.file>` exists with the expected checksum.
///
/// An existing file is verified and never overwritten: a match returns without
/// any network access, a mismatch is an integrity error and the file is left
/// for the operator to inspect.
pub fn ensure(
    fetcher: &dyn Fetcher,
    artifact: &ArtifactRef,
    dest_dir: &Path,
    opts: &AcquireOptions,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    let dest = dest_dir.join(&artifact.file);
    if dest.exists() {
        let got = digest_file(opts.algorithm, &dest)?;
        if got == artifact.checksum {
            info!(file = %dest.display(), checksum = %got, "artifact present, skipping");
            return Ok(dest);
        }
        return Err(Error::integrity(format!(
            "{} exists but its {} is {} (expected {})",
            dest.display(),
            opts.algorithm.name(),
            got,
            artifact.checksum
        )));
    }

    fs::create_dir_all(dest_dir)
        .map_err(|e| Error::io(format!("failed to create dir {}: {e}", dest_dir.display())))?;

    let url = opts.source_url(artifact);
    let part = partial_path(dest_dir, &artifact.file);
    let fetch_bound = opts.fetch_retries.max(1);
    let mut fetch_failures = 0u32;
    let mut checksum_failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(interrupted(artifact, &part));
        }

        info!(url = %url, file = %artifact.file, "fetching");
        let outcome = match download_once(fetcher, &url, &part, cancel) {
            Ok(o) => o,
            Err(e) => {
                remove_partial(&part);
                return Err(e);
            }
        };

        match outcome {
            FetchOutcome::Cancelled => return Err(interrupted(artifact, &part)),
            FetchOutcome::Failed(reason) => {
                remove_partial(&part);
                fetch_failures += 1;
                warn!(
                    url = %url,
                    attempt = fetch_failures,
                    max = fetch_bound,
                    reason = %reason,
                    "fetch failed"
                );
                if fetch_failures >= fetch_bound {
                    return Err(Error::acquisition(format!(
                        "failed to fetch {artifact} from {url} after {fetch_failures} attempt(s): {reason}"
                    )));
                }
            }
            FetchOutcome::Complete => {
                let got = match digest_file(opts.algorithm, &part) {
                    Ok(d) => d,
                    Err(e) => {
                        remove_partial(&part);
                        return Err(e);
                    }
                };
                if got == artifact.checksum {
                    fs::rename(&part, &dest).map_err(|e| {
                        remove_partial(&part);
                        Error::io(format!(
                            "failed to rename {} -> {}: {e}",
                            part.display(),
                            dest.display()
                        ))
                    })?;
                    info!(file = %dest.display(), "artifact fetched and verified");
                    return Ok(dest);
                }
                remove_partial(&part);
                checksum_failures += 1;
                warn!(
                    url = %url,
                    expected = %artifact.checksum,
                    actual = %got,
                    "checksum mismatch, retrying"
                );
                if checksum_failures > opts.checksum_retries {
                    return Err(Error::acquisition(format!(
                        "{artifact} from {url} failed verification {checksum_failures} time(s); last {} was {got}, expected {}",
                        opts.algorithm.name(),
                        artifact.checksum
                    )));
                }
            }
        }

        pause(opts.retry_delay, cancel);
    }
}

/// One mutex per destination path so two callers never write the same file.
#[derive(Debug, Default)]
pub struct AcquireLocks {
    slots: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl AcquireLocks {
    pub fn slot(&self, path: &Path) -> Result<Arc<Mutex<()>>> {
        let mut g = self
            .slots
            .lock()
            .map_err(|_| Error::acquisition("acquire lock registry poisoned"))?;
        Ok(Arc::clone(g.entry(path.to_path_buf()).or_default()))
    }
}

pub fn ensure_locked(
    locks: &AcquireLocks,
    fetcher: &dyn Fetcher,
    artifact: &ArtifactRef,
    dest_dir: &Path,
    opts: &AcquireOptions,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    let slot = locks.slot(&dest_dir.join(&artifact.file))?;
    let _guard = slot
        .lock()
        .map_err(|_| Error::acquisition(format!("lock for {} poisoned", artifact.file)))?;
    ensure(fetcher, artifact, dest_dir, opts, cancel)
}

/// Acquires every artifact with up to `jobs` worker threads.
///
/// Paths come back in input order. The first failure stops the remaining
/// workers (their partial files are removed) and is returned.
pub fn acquire_all(
    fetcher: &dyn Fetcher,
    artifacts: &[ArtifactRef],
    dest_dir: &Path,
    opts: &AcquireOptions,
    cancel: &CancelToken,
    jobs: usize,
) -> Result<Vec<PathBuf>> {
    let locks = AcquireLocks::default();
    let local = cancel.child();
    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<Option<PathBuf>>> = Mutex::new(vec![None; artifacts.len()]);
    let first_err: Mutex<Option<Error>> = Mutex::new(None);
    let workers = jobs.max(1).min(artifacts.len().max(1));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if local.is_cancelled() {
                        break;
                    }
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(artifact) = artifacts.get(i) else {
                        break;
                    };
                    match ensure_locked(&locks, fetcher, artifact, dest_dir, opts, &local) {
                        Ok(p) => {
                            if let Ok(mut r) = results.lock() {
                                r[i] = Some(p);
                            }
                        }
                        Err(e) => {
                            if let Ok(mut slot) = first_err.lock()
                                && slot.is_none()
                            {
                                *slot = Some(e);
                            }
                            local.cancel();
                            break;
                        }
                    }
                }
            });
        }
    });

    if let Some(e) = first_err
        .into_inner()
        .map_err(|_| Error::acquisition("acquisition worker panicked"))?
    {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(Error::acquisition("interrupted"));
    }

    let results = results
        .into_inner()
        .map_err(|_| Error::acquisition("acquisition worker panicked"))?;
    results
        .into_iter()
        .zip(artifacts)
        .map(|(p, a)| p.ok_or_else(|| Error::acquisition(format!("{a} was not acquired"))))
        .collect()
}
