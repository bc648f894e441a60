//! Remote data model (§3): models, versions, files, images, and the digest map.
//!
//! Every struct here tolerates unknown/missing fields per §9's "Dynamic JSON
//! payloads" note: mandatory fields are the ids, urls, and digests the core
//! actually needs; everything else is `#[serde(default)]`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Canonical model type (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ModelType {
    Checkpoint,
    TextualInversion,
    Hypernetwork,
    AestheticGradient,
    #[serde(rename = "LORA")]
    Lora,
    Controlnet,
    Poses,
    /// Anything the hosting service introduces that this crate does not yet know about.
    #[serde(other)]
    Other,
}

/// Lifecycle mode of a model (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ModelMode {
    #[default]
    Active,
    Archived,
    TakenDown,
}

/// Binary artifact format (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[serde(rename = "SafeTensor")]
    SafeTensor,
    #[serde(rename = "PickleTensor")]
    PickleTensor,
    #[serde(other)]
    #[default]
    Other,
}

/// A model as returned by the hosting service (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default, rename = "type")]
    pub model_type: Option<ModelType>,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub mode: ModelMode,
    #[serde(default)]
    pub model_versions: Vec<Version>,
}

impl Model {
    /// Returns the creator handle, falling back to `"unknown"` when the payload omitted it.
    #[must_use]
    pub fn creator_handle(&self) -> &str {
        self.creator.as_deref().unwrap_or("unknown")
    }

    /// Returns the model's display name, falling back to `"model{id}"` when the payload
    /// omitted it (§4.5: the sidecar summary names the model distinctly from its version).
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("model{}", self.id))
    }
}

/// A single version of a model (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub id: i64,
    #[serde(default)]
    pub model_id: Option<i64>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub trained_words: Vec<String>,
    #[serde(default)]
    pub files: Vec<RemoteFile>,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub download_count: Option<u64>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A downloadable file attached to a [`Version`] (§3).
///
/// Named `RemoteFile` (not `File`) to avoid colliding with `std::fs::File` at call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub name: String,
    #[serde(default)]
    pub size_kb: Option<f64>,
    #[serde(default)]
    pub hashes: HashMap_,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub metadata_format: FileFormat,
    pub download_url: String,
}

impl RemoteFile {
    /// Returns the declared SHA-256 digest, applying §9's "Duck-typed hash maps" lookup:
    /// canonical algorithm names are uppercased and whitespace-stripped before comparison.
    #[must_use]
    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("SHA256")
    }
}

/// A case/whitespace-normalized `{algorithm: digest}` map (§9 "Duck-typed hash maps").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashMap_(BTreeMap<String, String>);

impl HashMap_ {
    /// Looks up a digest by canonical algorithm name (e.g. `"SHA256"`).
    #[must_use]
    pub fn get(&self, canonical_algo: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| normalize_algo(k) == canonical_algo)
            .map(|(_, v)| v.as_str())
    }
}

fn normalize_algo(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// A preview or gallery image (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: i64,
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub nsfw_level: Option<i64>,
    #[serde(default)]
    pub blurhash: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

/// A page of results following `metadata.nextPage` (§4.6, §6.4).
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub metadata: PageMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageMetadata {
    #[serde(default)]
    pub next_page: Option<String>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Kind of work a [`crate::queue::TaskRecord`] represents (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    MetadataFetch,
    ModelFile,
    PreviewImage,
    GalleryImage,
    UserImage,
}

impl TaskKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MetadataFetch => "metadata_fetch",
            Self::ModelFile => "model_file",
            Self::PreviewImage => "preview_image",
            Self::GalleryImage => "gallery_image",
            Self::UserImage => "user_image",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metadata_fetch" => Ok(Self::MetadataFetch),
            "model_file" => Ok(Self::ModelFile),
            "preview_image" => Ok(Self::PreviewImage),
            "gallery_image" => Ok(Self::GalleryImage),
            "user_image" => Ok(Self::UserImage),
            other => Err(format!("invalid task kind: {other}")),
        }
    }
}

/// Which scheduling pipeline a [`TaskKind`] is drawn by (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    Model,
    Image,
}

impl TaskKind {
    #[must_use]
    pub fn pipeline(self) -> Pipeline {
        match self {
            Self::MetadataFetch | Self::ModelFile => Pipeline::Model,
            Self::PreviewImage | Self::GalleryImage | Self::UserImage => Pipeline::Image,
        }
    }
}
