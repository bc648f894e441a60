//! Enumerator (C6, §4.6): walks paginated catalog endpoints and persists discovered work.

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Target;
use crate::filter::BaseModelFilter;
use crate::http::{FailureType, HttpClient, HttpError, RetryDecision, RetryPolicy};
use crate::model::{Image, Model, Page, TaskKind, Version};
use crate::pathplan::{
    gallery_image_path, preview_image_path, primary_file_path, unattached_image_directory,
    version_directory,
};
use crate::queue::{QueueError, TaskStatus, TaskStore};
use crate::rate::{Channel, RateGovernor};
use crate::scheduler::TaskPayload;

const API_BASE: &str = "https://civitai.com/api/v1";

/// Default cap on enumerated standalone user images (§6.1 `max_user_images`).
pub const DEFAULT_MAX_USER_IMAGES: usize = 1000;

#[derive(Debug, Error)]
pub enum EnumeratorError {
    #[error("transport error: {0}")]
    Http(#[from] HttpError),
    #[error("task store error: {0}")]
    Queue(#[from] QueueError),
    #[error("io error writing image metadata: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize image metadata: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Tally of discovered and filtered work, reported back to the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnumerationStats {
    pub models_seen: u64,
    pub versions_accepted: u64,
    pub versions_rejected: u64,
    pub tasks_enqueued: u64,
}

/// Walks a user's or model's catalog and persists discovered download work (§4.6).
pub struct Enumerator {
    client: Arc<HttpClient>,
    rate: RateGovernor,
    store: TaskStore,
    root: std::path::PathBuf,
    filter: BaseModelFilter,
    retry_policy: RetryPolicy,
    max_user_images: usize,
    api_base: String,
    stats: EnumerationStats,
}

impl Enumerator {
    #[must_use]
    pub fn new(
        client: Arc<HttpClient>,
        rate: RateGovernor,
        store: TaskStore,
        root: std::path::PathBuf,
        filter: BaseModelFilter,
    ) -> Self {
        Self {
            client,
            rate,
            store,
            root,
            filter,
            retry_policy: RetryPolicy::default(),
            max_user_images: DEFAULT_MAX_USER_IMAGES,
            api_base: API_BASE.to_string(),
            stats: EnumerationStats::default(),
        }
    }

    #[must_use]
    pub fn with_max_user_images(mut self, max: usize) -> Self {
        self.max_user_images = max;
        self
    }

    /// Overrides the catalog API base URL, for tests driving the enumerator against a mock
    /// server end to end.
    #[must_use]
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// Enumerates the given target, persisting every piece of discovered work before
    /// returning (§4.6: "Persists enumerated work in the Task Store before scheduling any
    /// download").
    ///
    /// # Errors
    /// Returns [`EnumeratorError`] if the underlying transport or Task Store fails.
    pub async fn run(&mut self, target: &Target) -> Result<EnumerationStats, EnumeratorError> {
        match target {
            Target::Model(id) => self.enumerate_model(*id).await?,
            Target::User(handle) => self.enumerate_user(handle).await?,
        }
        Ok(self.stats)
    }

    async fn enumerate_model(&mut self, model_id: i64) -> Result<(), EnumeratorError> {
        let url = format!("{}/models/{model_id}", self.api_base);
        let model: Model = self.fetch_with_retry(&url).await?;
        self.process_model(&model).await
    }

    async fn enumerate_user(&mut self, handle: &str) -> Result<(), EnumeratorError> {
        let mut next: Option<String> = Some(format!("{}/models?username={handle}&limit=100", self.api_base));
        while let Some(url) = next {
            let page: Page<Model> = self.fetch_with_retry(&url).await?;
            for model in &page.items {
                self.process_model(model).await?;
            }
            next = page.metadata.next_page;
        }

        self.enumerate_user_images(handle).await
    }

    async fn process_model(&mut self, model: &Model) -> Result<(), EnumeratorError> {
        self.stats.models_seen += 1;
        let remote_id = model.id.to_string();
        let metadata_task = self
            .store
            .enqueue(
                TaskKind::MetadataFetch,
                &remote_id,
                None,
                &json!({ "model_id": model.id }),
            )
            .await?;

        if metadata_task.status() == TaskStatus::Done {
            debug!(model_id = model.id, "model already fully enumerated, skipping");
            return Ok(());
        }

        for version in &model.model_versions {
            if self.filter.admits(version) {
                self.stats.versions_accepted += 1;
                self.enqueue_version_tasks(model, version).await?;
            } else {
                self.stats.versions_rejected += 1;
            }
        }

        self.store
            .complete(&metadata_task.id, TaskStatus::Done, None, None)
            .await?;
        Ok(())
    }

    async fn enqueue_version_tasks(
        &mut self,
        model: &Model,
        version: &Version,
    ) -> Result<(), EnumeratorError> {
        let version_dir = version_directory(&self.root, model, version);

        for file in &version.files {
            let destination = primary_file_path(&version_dir, file);
            let payload = TaskPayload {
                url: file.download_url.clone(),
                destination,
                declared_sha256: file.sha256().map(str::to_string),
                declared_size: file.size_kb.map(|kb| (kb * 1024.0) as u64),
                skip_existing: true,
            };
            self.enqueue_download(
                TaskKind::ModelFile,
                &file.download_url,
                &version_dir,
                &payload,
            )
            .await?;
        }

        // `Version.images` is exclusively the ordered preview set (§3); there is no gallery
        // data in it. Every entry gets a numbered preview task against the primary file's
        // stem (§4.4: `<stem>.preview.<ext>`, then `.preview.<N>.<ext>` for N >= 2).
        if let Some(primary) = select_primary_file(version) {
            for (index, image) in version.images.iter().enumerate() {
                let ext = extension_of(&image.url);
                let destination = preview_image_path(&version_dir, primary, index + 1, &ext);
                let payload = TaskPayload {
                    url: image.url.clone(),
                    destination,
                    declared_sha256: None,
                    declared_size: None,
                    skip_existing: true,
                };
                self.enqueue_download(TaskKind::PreviewImage, &image.url, &version_dir, &payload)
                    .await?;
            }
        }

        self.enumerate_version_gallery_images(version, &version_dir).await
    }

    /// Paginates the gallery/images endpoint for one version's actual gallery uploads,
    /// distinct from the preview set carried inline on the version payload (§3, §4.6).
    async fn enumerate_version_gallery_images(
        &mut self,
        version: &Version,
        version_dir: &Path,
    ) -> Result<(), EnumeratorError> {
        let mut next = Some(format!("{}/images?modelVersionId={}&limit=100", self.api_base, version.id));
        while let Some(url) = next {
            let page: Page<Image> = self.fetch_with_retry(&url).await?;
            let following = page.metadata.next_page;
            for image in &page.items {
                let ext = extension_of(&image.url);
                let destination = gallery_image_path(version_dir, image, &ext);
                let payload = TaskPayload {
                    url: image.url.clone(),
                    destination,
                    declared_sha256: None,
                    declared_size: None,
                    skip_existing: true,
                };
                self.enqueue_download(TaskKind::GalleryImage, &image.url, version_dir, &payload)
                    .await?;
            }
            next = following;
        }
        Ok(())
    }

    async fn enqueue_download(
        &mut self,
        kind: crate::model::TaskKind,
        remote_id: &str,
        version_dir: &Path,
        payload: &TaskPayload,
    ) -> Result<(), EnumeratorError> {
        let target_path = payload.destination.to_string_lossy().into_owned();
        self.store
            .enqueue(
                kind,
                remote_id,
                Some(&target_path),
                &serde_json::to_value(payload)?,
            )
            .await?;
        self.stats.tasks_enqueued += 1;
        debug!(dir = %version_dir.display(), kind = kind.as_str(), "enqueued task");
        Ok(())
    }

    async fn enumerate_user_images(&mut self, handle: &str) -> Result<(), EnumeratorError> {
        let dest_dir = unattached_image_directory(&self.root, handle);
        let mut collected: Vec<Image> = Vec::new();
        let mut next = Some(format!("{}/images?username={handle}&limit=100", self.api_base));

        while let Some(url) = next {
            if collected.len() >= self.max_user_images {
                break;
            }
            let page: Page<Image> = self.fetch_with_retry(&url).await?;
            let following = page.metadata.next_page;
            for image in page.items {
                if collected.len() >= self.max_user_images {
                    break;
                }
                let ext = extension_of(&image.url);
                let destination = dest_dir.join(format!("{}.{ext}", image.id));
                let payload = TaskPayload {
                    url: image.url.clone(),
                    destination,
                    declared_sha256: None,
                    declared_size: None,
                    skip_existing: true,
                };
                let remote_id = image.id.to_string();
                self.store
                    .enqueue(
                        TaskKind::UserImage,
                        &remote_id,
                        Some(&payload.destination.to_string_lossy()),
                        &serde_json::to_value(&payload)?,
                    )
                    .await?;
                self.stats.tasks_enqueued += 1;
                collected.push(image);
            }
            next = following;
        }

        if !collected.is_empty() {
            self.write_images_metadata_snapshot(&dest_dir, &collected).await?;
        }
        Ok(())
    }

    async fn write_images_metadata_snapshot(
        &self,
        dest_dir: &Path,
        images: &[Image],
    ) -> Result<(), EnumeratorError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let snapshot = serde_json::to_vec_pretty(images)?;
        tokio::fs::write(dest_dir.join("images_metadata.json"), snapshot).await?;
        Ok(())
    }

    async fn fetch_with_retry<T: DeserializeOwned>(&self, url: &str) -> Result<T, EnumeratorError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.rate.acquire(Channel::ModelApi).await;
            match self.client.get_json::<T>(url).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let failure_type = FailureType::from_http_error(&err);
                    match self.retry_policy.decide(failure_type, attempt, err.retry_after()) {
                        RetryDecision::Retry(delay) => {
                            warn!(url, attempt, error = %err, "retrying paginated fetch");
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => return Err(err.into()),
                    }
                }
            }
        }
    }
}

fn select_primary_file(version: &Version) -> Option<&crate::model::RemoteFile> {
    version.files.iter().find(|f| f.primary).or_else(|| version.files.first())
}

fn extension_of(url: &str) -> String {
    url.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.split(['?', '#']).next().unwrap_or("jpg").to_string())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5)
        .unwrap_or_else(|| "jpg".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_of_strips_query_string() {
        assert_eq!(extension_of("https://example.com/img/42.jpeg?width=450"), "jpeg");
    }

    #[test]
    fn test_extension_of_defaults_to_jpg() {
        assert_eq!(extension_of("https://example.com/img/42"), "jpg");
    }

    #[tokio::test]
    async fn test_enumerate_model_is_idempotent_on_rerun() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = serde_json::json!({
            "id": 1,
            "creator": "alice",
            "tags": ["character"],
            "modelVersions": [{
                "id": 10,
                "name": "v1",
                "baseModel": "SDXL 1.0",
                "files": [{
                    "name": "model.safetensors",
                    "downloadUrl": format!("{}/files/1", server.uri()),
                    "hashes": {"SHA256": "abc"}
                }],
                "images": []
            }]
        });

        Mock::given(method("GET"))
            .and(path("/models/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/images"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "items": [], "metadata": {} })),
            )
            .mount(&server)
            .await;

        let db = crate::db::Database::new_in_memory().await.unwrap();
        let store = TaskStore::new(db);
        let client = Arc::new(HttpClient::new(None).unwrap());
        let rate = RateGovernor::new(&[]);
        let filter = BaseModelFilter::new(&[]);
        let tmp = tempfile::tempdir().unwrap();

        let mut enumerator = Enumerator::new(
            client,
            rate,
            store.clone(),
            tmp.path().to_path_buf(),
            filter,
        )
        .with_api_base(server.uri());

        let api_base_override = format!("{}/models/1", server.uri());
        let model: Model = enumerator.fetch_with_retry(&api_base_override).await.unwrap();
        enumerator.process_model(&model).await.unwrap();
        let first_run_tasks = enumerator.stats.tasks_enqueued;
        assert_eq!(first_run_tasks, 1);

        enumerator.process_model(&model).await.unwrap();
        assert_eq!(enumerator.stats.tasks_enqueued, first_run_tasks);
    }

    #[tokio::test]
    async fn test_whitelist_accepts_two_of_three_versions() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn version(id: i64, base_model: &str) -> serde_json::Value {
            serde_json::json!({
                "id": id,
                "name": format!("v{id}"),
                "baseModel": base_model,
                "files": [{
                    "name": "model.safetensors",
                    "downloadUrl": format!("https://example.com/files/{id}"),
                }],
                "images": []
            })
        }

        let server = MockServer::start().await;
        let body = serde_json::json!({
            "id": 1,
            "creator": "alice",
            "modelVersions": [
                version(10, "SDXL 1.0"),
                version(11, "Pony Diffusion V6 XL"),
                version(12, "Illustrious"),
            ]
        });

        Mock::given(method("GET"))
            .and(path("/models/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/images"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "items": [], "metadata": {} })),
            )
            .mount(&server)
            .await;

        let db = crate::db::Database::new_in_memory().await.unwrap();
        let store = TaskStore::new(db);
        let client = Arc::new(HttpClient::new(None).unwrap());
        let rate = RateGovernor::new(&[]);
        let filter = BaseModelFilter::new(&["Illustrious".to_string(), "Pony".to_string()]);
        let tmp = tempfile::tempdir().unwrap();

        let mut enumerator = Enumerator::new(client, rate, store.clone(), tmp.path().to_path_buf(), filter)
            .with_api_base(server.uri());

        let url = format!("{}/models/1", server.uri());
        let model: Model = enumerator.fetch_with_retry(&url).await.unwrap();
        enumerator.process_model(&model).await.unwrap();

        assert_eq!(enumerator.stats.versions_accepted, 2);
        assert_eq!(enumerator.stats.versions_rejected, 1);
        assert_eq!(enumerator.stats.tasks_enqueued, 2);

        let pending = store.count_by_status(TaskStatus::Pending).await.unwrap();
        // Two accepted model-file downloads plus the metadata-fetch bookkeeping task,
        // which is completed in-line by `process_model` and so no longer pending.
        assert_eq!(pending, 2);
    }

    #[tokio::test]
    async fn test_paginated_fetch_retries_past_429_then_succeeds() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

        struct FlakyThenOk {
            calls: AtomicU32,
            body: serde_json::Value,
        }

        impl Respond for FlakyThenOk {
            fn respond(&self, _request: &Request) -> ResponseTemplate {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < 2 {
                    ResponseTemplate::new(429).insert_header("retry-after", "1")
                } else {
                    ResponseTemplate::new(200).set_body_json(&self.body)
                }
            }
        }

        let server = MockServer::start().await;
        let body = serde_json::json!({
            "id": 1,
            "creator": "alice",
            "modelVersions": []
        });
        Mock::given(wiremock::matchers::method("GET"))
            .respond_with(FlakyThenOk { calls: AtomicU32::new(0), body })
            .mount(&server)
            .await;

        let db = crate::db::Database::new_in_memory().await.unwrap();
        let store = TaskStore::new(db);
        let client = Arc::new(HttpClient::new(None).unwrap());
        let rate = RateGovernor::new(&[]);
        let filter = BaseModelFilter::new(&[]);
        let tmp = tempfile::tempdir().unwrap();
        let enumerator = Enumerator::new(client, rate, store, tmp.path().to_path_buf(), filter);

        let url = format!("{}/models/1", server.uri());
        let model: Model = enumerator.fetch_with_retry(&url).await.unwrap();

        assert_eq!(model.id, 1);
    }
}
