//! Download Engine (C10, §4.10): executes a single file transfer end to end.
//!
//! Single-writer per destination path by construction: the Task Store's atomic claim
//! guarantees at most one worker ever holds a given task at a time.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::events::{Event, EventSink};
use crate::hash::{digests_match, quarantine_file, HashError, StreamingDigest};
use crate::http::{FailureType, HttpClient, HttpError};
use crate::rate::{Channel, RateGovernor};

/// Streaming chunk size, within the §4.10 8 KiB-64 KiB band.
const CHUNK_HINT_BYTES: usize = 64 * 1024;

/// What to fetch and where it ultimately belongs.
#[derive(Debug, Clone)]
pub struct DownloadSpec {
    pub url: String,
    pub destination: PathBuf,
    pub declared_sha256: Option<String>,
    pub declared_size: Option<u64>,
    /// §9 Open Question (b): an independent name-match short-circuit, checked before the
    /// digest check, not instead of it.
    pub skip_existing: bool,
}

/// Outcome of a single [`download_file`] attempt.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// The destination already satisfied either the `skip_existing` or digest check.
    Skipped,
    Completed { bytes: u64, duration: Duration },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Http(#[from] HttpError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("integrity check failed and file was quarantined: {0}")]
    Integrity(#[from] HashError),
}

impl EngineError {
    /// Maps this error onto the retry-classification taxonomy (§4.2.1).
    #[must_use]
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::Http(e) => FailureType::from_http_error(e),
            Self::Io { .. } => FailureType::Unknown,
            Self::Integrity(_) => FailureType::Integrity,
        }
    }
}

/// Executes the full per-file algorithm (§4.10, steps 1-6).
///
/// # Errors
/// Returns [`EngineError`] on transport failure, filesystem failure, or an integrity mismatch
/// (in which case the corrupt temp file has already been moved to quarantine).
#[instrument(skip(client, rate, events, spec), fields(task_id, url = %spec.url))]
#[allow(clippy::too_many_arguments)]
pub async fn download_file(
    client: &HttpClient,
    rate: &RateGovernor,
    channel: Channel,
    root: &Path,
    task_id: &str,
    kind: &str,
    spec: &DownloadSpec,
    events: &EventSink,
) -> Result<DownloadOutcome, EngineError> {
    let dest = &spec.destination;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| io_err(parent, source))?;
    }

    if spec.skip_existing && tokio::fs::metadata(dest).await.is_ok() {
        debug!(path = %dest.display(), "skip_existing: destination already present");
        return Ok(DownloadOutcome::Skipped);
    }

    if let Some(declared) = &spec.declared_sha256 {
        if let Ok(existing_digest) = digest_of_file(dest).await {
            if digests_match(&existing_digest, declared) {
                debug!(path = %dest.display(), "destination already matches declared digest");
                return Ok(DownloadOutcome::Skipped);
            }
        }
    }

    events.emit(Event::DownloadStarted {
        task_id: task_id.to_string(),
        kind: kind.to_string(),
        url: spec.url.clone(),
        destination: dest.display().to_string(),
    });

    let started = Instant::now();
    let tmp_path = tmp_path_for(dest);
    let existing_tmp_bytes = tokio::fs::metadata(&tmp_path).await.map(|m| m.len()).unwrap_or(0);

    let attempt_resume = existing_tmp_bytes > 0
        && spec
            .declared_size
            .is_none_or(|declared| existing_tmp_bytes < declared);

    rate.acquire(channel).await;

    let timeout = client.adaptive_total_timeout(spec.declared_size.unwrap_or(0));
    let resume_from = attempt_resume.then_some(existing_tmp_bytes);
    let response = client.download(&spec.url, resume_from, timeout).await?;

    let resumed = attempt_resume && response.status() == reqwest::StatusCode::PARTIAL_CONTENT;

    let (mut file, mut digest, mut bytes_written) = if resumed {
        let mut handle = OpenOptions::new()
            .append(true)
            .open(&tmp_path)
            .await
            .map_err(|source| io_err(&tmp_path, source))?;
        handle
            .seek(std::io::SeekFrom::End(0))
            .await
            .map_err(|source| io_err(&tmp_path, source))?;
        let digest = stream_digest_file(&tmp_path).await.unwrap_or_default();
        (handle, digest, existing_tmp_bytes)
    } else {
        let handle = File::create(&tmp_path)
            .await
            .map_err(|source| io_err(&tmp_path, source))?;
        (handle, StreamingDigest::new(), 0)
    };

    let mut stream = response.bytes_stream();
    let mut progress_accumulator = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| HttpError::network(&spec.url, e))?;
        file.write_all(&chunk)
            .await
            .map_err(|source| io_err(&tmp_path, source))?;
        digest.update(&chunk);
        bytes_written += chunk.len() as u64;
        progress_accumulator += chunk.len();

        if progress_accumulator >= CHUNK_HINT_BYTES {
            progress_accumulator = 0;
            events.emit(Event::DownloadProgress {
                task_id: task_id.to_string(),
                bytes_completed: bytes_written,
                bytes_total: spec.declared_size,
            });
        }
    }
    file.flush().await.map_err(|source| io_err(&tmp_path, source))?;
    drop(file);

    let computed = digest.finalize_hex();

    if let Some(declared) = &spec.declared_sha256 {
        if !digests_match(&computed, declared) {
            let quarantined = quarantine_file(root, task_id, &tmp_path)?;
            warn!(
                task_id,
                path = %quarantined.display(),
                expected = %declared,
                actual = %computed,
                "integrity mismatch, quarantined"
            );
            client.record_outcome(crate::http::DownloadOutcome::OtherFailure);
            return Err(HashError::Mismatch {
                expected: declared.clone(),
                actual: computed,
            }
            .into());
        }
    }

    tokio::fs::rename(&tmp_path, dest)
        .await
        .map_err(|source| io_err(dest, source))?;

    let duration = started.elapsed();
    let throughput_mbps = if duration.as_secs_f64() > 0.0 {
        (bytes_written as f64 / (1024.0 * 1024.0)) / duration.as_secs_f64()
    } else {
        0.0
    };

    client.record_outcome(crate::http::DownloadOutcome::Success);
    events.emit(Event::DownloadCompleted {
        task_id: task_id.to_string(),
        bytes: bytes_written,
        duration_s: duration.as_secs_f64(),
        throughput_mbps,
    });
    info!(path = %dest.display(), bytes = bytes_written, resumed, "download complete");

    Ok(DownloadOutcome::Completed {
        bytes: bytes_written,
        duration,
    })
}

fn tmp_path_for(dest: &Path) -> PathBuf {
    match dest.extension().and_then(|e| e.to_str()) {
        Some(ext) => dest.with_extension(format!("{ext}.tmp")),
        None => dest.with_extension("tmp"),
    }
}

async fn digest_of_file(path: &Path) -> std::io::Result<String> {
    Ok(stream_digest_file(path).await?.finalize_hex())
}

/// Computes a file's digest by reading it in fixed-size chunks rather than loading it
/// whole, matching the streaming-write budget this engine holds during an upload (§5: model
/// checkpoints run to multiple gigabytes).
async fn stream_digest_file(path: &Path) -> std::io::Result<StreamingDigest> {
    let mut file = File::open(path).await?;
    let mut digest = StreamingDigest::new();
    let mut buf = vec![0u8; CHUNK_HINT_BYTES];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest)
}

fn io_err(path: &Path, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::RateGovernor;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rate_governor() -> RateGovernor {
        RateGovernor::new(&[])
    }

    #[tokio::test]
    async fn test_download_file_writes_and_renames_into_place() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = HttpClient::new(None).unwrap();
        let rate = rate_governor();
        let (events, _rx) = crate::events::channel();

        let spec = DownloadSpec {
            url: format!("{}/f.bin", server.uri()),
            destination: tmp.path().join("f.bin"),
            declared_sha256: None,
            declared_size: None,
            skip_existing: false,
        };

        let outcome = download_file(
            &client,
            &rate,
            Channel::ModelFile,
            tmp.path(),
            "task-1",
            "model_file",
            &spec,
            &events,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, DownloadOutcome::Completed { bytes: 11, .. }));
        assert_eq!(std::fs::read(tmp.path().join("f.bin")).unwrap(), b"hello world");
        assert!(!tmp_path_for(&tmp.path().join("f.bin")).exists());
    }

    #[tokio::test]
    async fn test_download_file_skips_when_skip_existing_and_destination_present() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("f.bin");
        std::fs::write(&dest, b"already here").unwrap();

        let client = HttpClient::new(None).unwrap();
        let rate = rate_governor();
        let (events, _rx) = crate::events::channel();

        let spec = DownloadSpec {
            url: "https://example.com/f.bin".to_string(),
            destination: dest.clone(),
            declared_sha256: None,
            declared_size: None,
            skip_existing: true,
        };

        let outcome = download_file(
            &client,
            &rate,
            Channel::ModelFile,
            tmp.path(),
            "task-1",
            "model_file",
            &spec,
            &events,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, DownloadOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_download_file_skips_when_existing_digest_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("f.bin");
        std::fs::write(&dest, b"hello world").unwrap();

        let mut digest = StreamingDigest::new();
        digest.update(b"hello world");
        let declared = digest.finalize_hex();

        let client = HttpClient::new(None).unwrap();
        let rate = rate_governor();
        let (events, _rx) = crate::events::channel();

        let spec = DownloadSpec {
            url: "https://example.com/f.bin".to_string(),
            destination: dest.clone(),
            declared_sha256: Some(declared),
            declared_size: None,
            skip_existing: false,
        };

        let outcome = download_file(
            &client,
            &rate,
            Channel::ModelFile,
            tmp.path(),
            "task-1",
            "model_file",
            &spec,
            &events,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, DownloadOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_download_file_quarantines_on_digest_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"corrupted content".to_vec()))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = HttpClient::new(None).unwrap();
        let rate = rate_governor();
        let (events, _rx) = crate::events::channel();

        let spec = DownloadSpec {
            url: format!("{}/f.bin", server.uri()),
            destination: tmp.path().join("f.bin"),
            declared_sha256: Some("0".repeat(64)),
            declared_size: None,
            skip_existing: false,
        };

        let result = download_file(
            &client,
            &rate,
            Channel::ModelFile,
            tmp.path(),
            "task-1",
            "model_file",
            &spec,
            &events,
        )
        .await;

        assert!(matches!(result, Err(EngineError::Integrity(_))));
        assert!(tmp
            .path()
            .join("corrupted")
            .join("task-1")
            .join("f.bin.tmp")
            .exists());
        assert!(!tmp.path().join("f.bin").exists());
    }
}
