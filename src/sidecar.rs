//! Metadata Materializer (C5, §4.5): writes `description.md` and `<stem>.civitai.info`.
//!
//! Writes are atomic (write to `.tmp`, then rename), the same idiom the rest of this
//! crate's filesystem writers (Download Engine, Task Store backup rotation) use.

use std::path::Path;

use chrono_lite::now_rfc3339;
use thiserror::Error;
use tracing::instrument;

use crate::model::{Model, RemoteFile, Version};
use crate::pathplan::{description_path, metadata_snapshot_path};

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("io error writing sidecar at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize raw metadata snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Writes `description.md` and `<stem>.civitai.info` for a fetched version payload (§4.5).
///
/// `raw_payload` is the verbatim JSON the hosting service returned for this version, kept
/// so the `.civitai.info` sidecar is not a lossy round-trip through the typed [`Version`].
///
/// # Errors
/// Returns [`SidecarError`] if either atomic write fails.
#[instrument(skip(model, version, primary_file, raw_payload))]
pub async fn materialize(
    version_dir: &Path,
    model: &Model,
    version: &Version,
    primary_file: Option<&RemoteFile>,
    raw_payload: &serde_json::Value,
) -> Result<(), SidecarError> {
    tokio::fs::create_dir_all(version_dir)
        .await
        .map_err(|source| SidecarError::Io {
            path: version_dir.to_path_buf(),
            source,
        })?;

    let summary = render_description(model, version, primary_file);
    atomic_write(&description_path(version_dir), summary.as_bytes()).await?;

    if let Some(file) = primary_file {
        let snapshot_path = metadata_snapshot_path(version_dir, file);
        let snapshot = serde_json::to_vec_pretty(raw_payload)?;
        atomic_write(&snapshot_path, &snapshot).await?;
    }

    Ok(())
}

async fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), SidecarError> {
    let tmp_path = path.with_extension(tmp_extension(path));
    tokio::fs::write(&tmp_path, contents)
        .await
        .map_err(|source| SidecarError::Io {
            path: tmp_path.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|source| SidecarError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

fn tmp_extension(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    }
}

fn render_description(model: &Model, version: &Version, primary_file: Option<&RemoteFile>) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", model.display_name()));
    out.push_str(&format!("- Version: {}\n", version.name));
    out.push_str(&format!("- Creator: {}\n", model.creator_handle()));
    out.push_str(&format!(
        "- Type: {}\n",
        model
            .model_type
            .map(|t| format!("{t:?}"))
            .unwrap_or_else(|| "unknown".to_string())
    ));
    out.push_str(&format!(
        "- Base model: {}\n",
        version.base_model.as_deref().unwrap_or("unknown")
    ));
    if !version.trained_words.is_empty() {
        out.push_str(&format!(
            "- Trigger words: {}\n",
            version.trained_words.join(", ")
        ));
    }
    if let Some(file) = primary_file {
        if let Some(sha) = file.sha256() {
            out.push_str(&format!("- SHA-256: {sha}\n"));
        }
        if let Some(size_kb) = file.size_kb {
            out.push_str(&format!("- Size: {}\n", human_readable_size(size_kb)));
        }
    }
    if let Some(count) = version.download_count {
        out.push_str(&format!("- Downloads: {count}\n"));
    }
    if let Some(rating) = version.rating {
        out.push_str(&format!("- Rating: {rating:.2}\n"));
    }
    out.push_str(&format!("- NSFW: {}\n", model.nsfw));
    out.push_str(&format!("- Fetched at: {}\n", now_rfc3339()));
    if let Some(url) = &version.download_url {
        out.push_str(&format!("- Download URL: {url}\n"));
    }
    out.push_str(&format!(
        "- Web URL: https://civitai.com/models/{}?modelVersionId={}\n",
        model.id, version.id
    ));

    if let Some(description) = &version.description {
        out.push_str("\n## Description\n\n");
        out.push_str(description);
        out.push('\n');
    }

    out
}

fn human_readable_size(size_kb: f64) -> String {
    let bytes = size_kb * 1024.0;
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB"];
    let mut value = bytes;
    let mut unit_idx = 0;
    while value >= 1024.0 && unit_idx < UNITS.len() - 1 {
        value /= 1024.0;
        unit_idx += 1;
    }
    format!("{:.2} {}", value, UNITS[unit_idx])
}

/// Minimal RFC 3339 timestamp helper (kept local so this module has no extra date-time
/// dependency beyond what the rest of the crate already pulls in).
mod chrono_lite {
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Returns the current time as an RFC 3339 UTC timestamp with second precision.
    #[must_use]
    pub fn now_rfc3339() -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format_unix_secs(secs)
    }

    fn format_unix_secs(secs: u64) -> String {
        const SECS_PER_DAY: u64 = 86_400;
        let days = secs / SECS_PER_DAY;
        let time_of_day = secs % SECS_PER_DAY;
        let (h, m, s) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);
        let (y, mo, d) = civil_from_days(days as i64);
        format!("{y:04}-{mo:02}-{d:02}T{h:02}:{m:02}:{s:02}Z")
    }

    /// Howard Hinnant's `civil_from_days` algorithm (public domain), used instead of pulling
    /// in a calendar dependency for a single display timestamp.
    fn civil_from_days(z: i64) -> (i64, u32, u32) {
        let z = z + 719_468;
        let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
        let doe = (z - era * 146_097) as u64;
        let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
        let y = yoe as i64 + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
        let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
        (if m <= 2 { y + 1 } else { y }, m, d)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_known_unix_timestamp() {
            // 2024-01-01T00:00:00Z
            assert_eq!(format_unix_secs(1_704_067_200), "2024-01-01T00:00:00Z");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileFormat, HashMap_, ModelMode, ModelType};

    fn sample() -> (Model, Version, RemoteFile) {
        let model = Model {
            id: 1,
            name: Some("Great Checkpoint".to_string()),
            creator: Some("alice".to_string()),
            model_type: Some(ModelType::Checkpoint),
            nsfw: false,
            tags: vec!["style".to_string()],
            mode: ModelMode::Active,
            model_versions: vec![],
        };
        let file = RemoteFile {
            name: "model.safetensors".to_string(),
            size_kb: Some(1024.0),
            hashes: serde_json::from_str::<HashMap_>(r#"{"SHA256": "abc123"}"#).unwrap(),
            primary: true,
            metadata_format: FileFormat::SafeTensor,
            download_url: "https://example.com/f".to_string(),
        };
        let version = Version {
            id: 10,
            model_id: Some(1),
            name: "v1.0".to_string(),
            base_model: Some("SDXL".to_string()),
            trained_words: vec!["trigger".to_string()],
            files: vec![file.clone()],
            images: vec![],
            download_url: Some("https://example.com/f".to_string()),
            download_count: Some(42),
            rating: Some(4.5),
            description: Some("A fine model.".to_string()),
        };
        (model, version, file)
    }

    #[tokio::test]
    async fn test_materialize_writes_both_sidecars() {
        let tmp = tempfile::tempdir().unwrap();
        let (model, version, file) = sample();
        let raw = serde_json::json!({"id": 10, "name": "v1.0"});

        materialize(tmp.path(), &model, &version, Some(&file), &raw)
            .await
            .unwrap();

        assert!(tmp.path().join("description.md").exists());
        assert!(tmp.path().join("model.civitai.info").exists());

        let description = std::fs::read_to_string(tmp.path().join("description.md")).unwrap();
        assert!(description.contains("abc123"));
        assert!(description.contains("trigger"));
        assert!(description.contains("A fine model."));

        let snapshot = std::fs::read_to_string(tmp.path().join("model.civitai.info")).unwrap();
        assert!(snapshot.contains("\"id\""));
    }

    #[tokio::test]
    async fn test_materialize_creates_destination_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        let (model, version, _file) = sample();
        let raw = serde_json::json!({});

        materialize(&nested, &model, &version, None, &raw).await.unwrap();
        assert!(nested.join("description.md").exists());
    }

    #[test]
    fn test_human_readable_size() {
        assert_eq!(human_readable_size(1024.0), "1.00 MiB");
        assert_eq!(human_readable_size(0.5), "512.00 B");
    }
}
