//! Streaming digest verification and quarantine (C3, §4.3).

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{instrument, warn};

/// Errors raised while verifying or quarantining a download.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("declared digest {expected} does not match computed digest {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("io error quarantining file: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental SHA-256 accumulator fed one chunk at a time during the streaming write (§4.3:
/// "computed during streaming write, not after").
#[derive(Debug, Default)]
pub struct StreamingDigest {
    hasher: Sha256,
}

impl StreamingDigest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Finalizes the digest as a lowercase hex string.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex_encode(&self.hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compares a computed digest to the server-declared one, case-insensitively.
#[must_use]
pub fn digests_match(computed_hex: &str, declared_hex: &str) -> bool {
    computed_hex.eq_ignore_ascii_case(declared_hex)
}

/// Moves a failed temp file to `<root>/corrupted/<task_id>/<name>` (§4.3).
///
/// # Errors
/// Returns [`HashError::Io`] if the quarantine directory cannot be created or the rename fails.
#[instrument(skip(tmp_path))]
pub fn quarantine_file(root: &Path, task_id: &str, tmp_path: &Path) -> Result<PathBuf, HashError> {
    let dir = root.join("corrupted").join(task_id);
    std::fs::create_dir_all(&dir)?;

    let name = tmp_path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_else(|| std::ffi::OsString::from("quarantined.bin"));
    let dest = dir.join(name);

    std::fs::rename(tmp_path, &dest)?;
    warn!(task_id, dest = %dest.display(), "quarantined file after repeated integrity failures");
    Ok(dest)
}

/// Tracks consecutive integrity failures for a single task so the caller can quarantine after
/// three (§4.3, §8 boundary behavior).
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegrityFailureCounter(u8);

/// Number of consecutive integrity failures that trigger quarantine (§4.3).
pub const MAX_INTEGRITY_FAILURES: u8 = 3;

impl IntegrityFailureCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure, returning `true` if the task should now be quarantined.
    pub fn record_failure(&mut self) -> bool {
        self.0 = self.0.saturating_add(1);
        self.0 >= MAX_INTEGRITY_FAILURES
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_digest_matches_oneshot_sha256() {
        let mut digest = StreamingDigest::new();
        digest.update(b"hello ");
        digest.update(b"world");
        let hex = digest.finalize_hex();

        let mut direct = Sha256::new();
        direct.update(b"hello world");
        assert_eq!(hex, hex_encode(&direct.finalize()));
    }

    #[test]
    fn test_digests_match_is_case_insensitive() {
        assert!(digests_match("ABCDEF", "abcdef"));
        assert!(!digests_match("abcdef", "123456"));
    }

    #[test]
    fn test_quarantine_file_moves_into_task_subdir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let tmp_file = root.join("model.safetensors.tmp");
        std::fs::write(&tmp_file, b"partial").unwrap();

        let dest = quarantine_file(root, "task-123", &tmp_file).unwrap();

        assert_eq!(dest, root.join("corrupted/task-123/model.safetensors.tmp"));
        assert!(dest.exists());
        assert!(!tmp_file.exists());
    }

    #[test]
    fn test_integrity_failure_counter_quarantines_after_three() {
        let mut counter = IntegrityFailureCounter::new();
        assert!(!counter.record_failure());
        assert!(!counter.record_failure());
        assert!(counter.record_failure());
    }

    #[test]
    fn test_integrity_failure_counter_resets_on_success() {
        let mut counter = IntegrityFailureCounter::new();
        counter.record_failure();
        counter.record_failure();
        counter.reset();
        assert!(!counter.record_failure());
    }
}
