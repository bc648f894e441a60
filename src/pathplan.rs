//! Taxonomy-driven destination path planner (C4, §4.4).

use std::path::PathBuf;

use crate::model::{Image, Model, RemoteFile, Version};

/// Canonical tag categories, in the fixed match-priority order used for ties (§4.4).
const CATEGORIES: &[(&str, &[&str])] = &[
    (
        "CONCEPT",
        &["concept", "idea", "technique"],
    ),
    (
        "CHARACTER",
        &["character", "oc", "persona", "waifu"],
    ),
    ("STYLE", &["style", "artstyle", "aesthetic"]),
    ("POSE", &["pose", "posing", "stance"]),
    ("CLOTHING", &["clothing", "outfit", "costume", "armor"]),
    ("OBJECT", &["object", "prop", "item", "weapon"]),
    ("BACKGROUND", &["background", "scenery", "environment"]),
    ("ANIMAL", &["animal", "creature", "pet"]),
    ("VEHICLE", &["vehicle", "car", "ship", "mecha"]),
];

/// Fallback category when no tag matches (§4.4).
const MISC_CATEGORY: &str = "MISC";

/// Classifies a model's tags into a canonical tag category (§4.4).
///
/// Exact (case-insensitive) match against the model's tag set wins; otherwise substring
/// match on any keyword within any tag; otherwise `MISC`.
#[must_use]
pub fn classify_tag_category(tags: &[String]) -> &'static str {
    let normalized: Vec<String> = tags.iter().map(|t| t.to_ascii_lowercase()).collect();

    for (category, keywords) in CATEGORIES {
        if keywords
            .iter()
            .any(|kw| normalized.iter().any(|tag| tag == kw))
        {
            return category;
        }
    }

    for (category, keywords) in CATEGORIES {
        if keywords
            .iter()
            .any(|kw| normalized.iter().any(|tag| tag.contains(kw)))
        {
            return category;
        }
    }

    MISC_CATEGORY
}

/// Replaces Windows/Unix-hostile characters and control chars with `_`, strips
/// leading/trailing whitespace and dots, and truncates to 200 chars while preserving
/// the file extension (§4.4 Sanitization).
#[must_use]
pub fn sanitize_path_segment(input: &str) -> String {
    const MAX_LEN: usize = 200;

    let replaced: String = input
        .chars()
        .map(|c| {
            if matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control()
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced
        .trim()
        .trim_matches('.')
        .to_string();

    if trimmed.is_empty() {
        return "_".to_string();
    }

    truncate_preserving_extension(&trimmed, MAX_LEN)
}

fn truncate_preserving_extension(name: &str, max_len: usize) -> String {
    if name.chars().count() <= max_len {
        return name.to_string();
    }

    match name.rfind('.') {
        Some(dot_idx) if dot_idx > 0 => {
            let (stem, ext) = name.split_at(dot_idx);
            let ext_len = ext.chars().count();
            let keep = max_len.saturating_sub(ext_len);
            let truncated_stem: String = stem.chars().take(keep).collect();
            format!("{truncated_stem}{ext}")
        }
        _ => name.chars().take(max_len).collect(),
    }
}

/// The resolved destination directory for a (model, version) pair (§4.4).
#[must_use]
pub fn version_directory(root: &std::path::Path, model: &Model, version: &Version) -> PathBuf {
    let base_model = sanitize_path_segment(version.base_model.as_deref().unwrap_or("unknown"));
    let category = classify_tag_category(&model.tags);
    let dirname = sanitize_path_segment(&format!(
        "{}_{}_{}",
        model.creator_handle(),
        model_name_for_dir(model),
        version.name
    ));

    root.join("models")
        .join(base_model)
        .join(category)
        .join(dirname)
}

fn model_name_for_dir(model: &Model) -> String {
    model.display_name()
}

/// Destination directory for images not attached to any model (`<root>/images/<creator>/`, §4.4).
#[must_use]
pub fn unattached_image_directory(root: &std::path::Path, creator: &str) -> PathBuf {
    root.join("images").join(sanitize_path_segment(creator))
}

/// Path for the primary binary: exact remote file name (§4.4).
#[must_use]
pub fn primary_file_path(version_dir: &std::path::Path, file: &RemoteFile) -> PathBuf {
    version_dir.join(sanitize_path_segment(&file.name))
}

/// Path for the raw metadata snapshot sidecar: `<stem>.civitai.info` (§4.4, §4.5).
#[must_use]
pub fn metadata_snapshot_path(version_dir: &std::path::Path, file: &RemoteFile) -> PathBuf {
    let stem = file_stem(&file.name);
    version_dir.join(format!("{}.civitai.info", sanitize_path_segment(&stem)))
}

/// Path for the human-readable summary: always `description.md` (§4.4, §4.5).
#[must_use]
pub fn description_path(version_dir: &std::path::Path) -> PathBuf {
    version_dir.join("description.md")
}

/// Path for the Nth (1-indexed) preview image of a file: `<stem>.preview<.N>.<ext>` where N is
/// empty for the first and 2-indexed afterwards (§4.4).
#[must_use]
pub fn preview_image_path(
    version_dir: &std::path::Path,
    file: &RemoteFile,
    index_one_based: usize,
    ext: &str,
) -> PathBuf {
    let stem = sanitize_path_segment(&file_stem(&file.name));
    let ext = sanitize_path_segment(ext);
    let name = if index_one_based <= 1 {
        format!("{stem}.preview.{ext}")
    } else {
        format!("{stem}.preview.{index_one_based}.{ext}")
    };
    version_dir.join(name)
}

/// Path for a gallery image: `Gallery/<image-id>.<ext>` (§4.4).
#[must_use]
pub fn gallery_image_path(version_dir: &std::path::Path, image: &Image, ext: &str) -> PathBuf {
    version_dir
        .join("Gallery")
        .join(format!("{}.{}", image.id, sanitize_path_segment(ext)))
}

fn file_stem(name: &str) -> String {
    std::path::Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelMode;

    fn model_with_tags(tags: &[&str]) -> Model {
        Model {
            id: 1,
            name: Some("Great Checkpoint".to_string()),
            creator: Some("alice".to_string()),
            model_type: None,
            nsfw: false,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            mode: ModelMode::Active,
            model_versions: vec![],
        }
    }

    #[test]
    fn test_sanitize_replaces_hostile_chars() {
        assert_eq!(sanitize_path_segment("a<b>c:d\"e/f\\g|h?i*j"), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn test_sanitize_strips_leading_trailing_dots_and_whitespace() {
        assert_eq!(sanitize_path_segment("  ..name..  "), "name");
    }

    #[test]
    fn test_sanitize_truncates_preserving_extension() {
        let long_stem = "a".repeat(250);
        let name = format!("{long_stem}.safetensors");
        let result = sanitize_path_segment(&name);
        assert!(result.chars().count() <= 200);
        assert!(result.ends_with(".safetensors"));
    }

    #[test]
    fn test_classify_exact_match_wins_over_substring() {
        // "style" would substring-match CONCEPT's "technique"? no—verify exact match category.
        let category = classify_tag_category(&["style".to_string()]);
        assert_eq!(category, "STYLE");
    }

    #[test]
    fn test_classify_substring_fallback() {
        let category = classify_tag_category(&["my fancy character design".to_string()]);
        assert_eq!(category, "CHARACTER");
    }

    #[test]
    fn test_classify_misc_when_no_match() {
        let category = classify_tag_category(&["totally unrelated".to_string()]);
        assert_eq!(category, "MISC");
    }

    #[test]
    fn test_version_directory_layout() {
        let root = std::path::Path::new("/root");
        let model = model_with_tags(&["character"]);
        let version = Version {
            id: 10,
            model_id: Some(1),
            name: "v1".to_string(),
            base_model: Some("SDXL".to_string()),
            trained_words: vec![],
            files: vec![],
            images: vec![],
            download_url: None,
            download_count: None,
            rating: None,
            description: None,
        };

        let dir = version_directory(root, &model, &version);
        assert_eq!(
            dir,
            std::path::PathBuf::from("/root/models/SDXL/CHARACTER/alice_Great Checkpoint_v1")
        );
    }

    #[test]
    fn test_preview_image_path_numbering() {
        let dir = std::path::Path::new("/root/models/x");
        let file = RemoteFile {
            name: "model.safetensors".to_string(),
            size_kb: None,
            hashes: Default::default(),
            primary: true,
            metadata_format: Default::default(),
            download_url: "https://example.com".to_string(),
        };
        assert_eq!(
            preview_image_path(dir, &file, 1, "jpg"),
            dir.join("model.preview.jpg")
        );
        assert_eq!(
            preview_image_path(dir, &file, 2, "jpg"),
            dir.join("model.preview.2.jpg")
        );
    }
}
