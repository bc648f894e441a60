//! Resume after network interruption: a partial `.tmp` file from a prior attempt is
//! continued with a `Range` request rather than restarted from zero.

mod support;

use modelvault_core::model::TaskKind;
use modelvault_core::queue::TaskStatus;
use modelvault_core::scheduler::TaskPayload;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_scheduler_resumes_partial_tmp_file_via_range_request() {
    let first_half = vec![b'a'; 4_194_304];
    let second_half = vec![b'b'; 4_194_304];
    let full = [first_half.clone(), second_half.clone()].concat();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/f.bin"))
        .and(header("range", "bytes=4194304-"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(second_half.clone())
                .insert_header("content-range", "bytes 4194304-8388607/8388608"),
        )
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    let destination = root.path().join("f.bin");
    std::fs::write(destination.with_extension("bin.tmp"), &first_half).unwrap();

    let harness = support::harness(root.path(), 1).await;
    let payload = TaskPayload {
        url: format!("{}/f.bin", server.uri()),
        destination: destination.clone(),
        declared_sha256: None,
        declared_size: Some(full.len() as u64),
        skip_existing: false,
    };
    let task = harness
        .store
        .enqueue(
            TaskKind::ModelFile,
            "1",
            Some(destination.to_string_lossy().as_ref()),
            &serde_json::to_value(&payload).unwrap(),
        )
        .await
        .unwrap();

    let stats = harness.scheduler.run().await;

    assert_eq!(stats.completed, 1);
    assert_eq!(std::fs::read(&destination).unwrap(), full);

    let reloaded = harness.store.get(&task.id).await.unwrap();
    assert_eq!(reloaded.status(), TaskStatus::Done);
}
