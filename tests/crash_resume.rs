//! Crash/resume (10 in-flight, 20 pending, 5 done): restart moves in-flight back to
//! pending, done tasks are left alone, and no task is duplicated.

use modelvault_core::db::Database;
use modelvault_core::model::TaskKind;
use modelvault_core::queue::{TaskStatus, TaskStore};
use serde_json::json;

#[tokio::test]
async fn test_restart_moves_in_flight_back_to_pending_without_touching_done() {
    let db = Database::new_in_memory().await.unwrap();
    let store = TaskStore::new(db);

    for i in 0..5 {
        let task = store
            .enqueue(TaskKind::ModelFile, &format!("done-{i}"), None, &json!({}))
            .await
            .unwrap();
        store
            .complete(&task.id, TaskStatus::Done, None, None)
            .await
            .unwrap();
    }

    for i in 0..10 {
        store
            .enqueue(TaskKind::ModelFile, &format!("inflight-{i}"), None, &json!({}))
            .await
            .unwrap();
    }
    store.claim(10, &[TaskKind::ModelFile]).await.unwrap();

    for i in 0..20 {
        store
            .enqueue(TaskKind::ModelFile, &format!("pending-{i}"), None, &json!({}))
            .await
            .unwrap();
    }

    assert_eq!(store.count_by_status(TaskStatus::Done).await.unwrap(), 5);
    assert_eq!(store.count_by_status(TaskStatus::InFlight).await.unwrap(), 10);
    assert_eq!(store.count_by_status(TaskStatus::Pending).await.unwrap(), 20);

    // Simulate a process restart: a fresh TaskStore handle over the same pool,
    // then the startup resume scan.
    let moved = store.resume().await.unwrap();

    assert_eq!(moved, 10);
    assert_eq!(store.count_by_status(TaskStatus::Done).await.unwrap(), 5);
    assert_eq!(store.count_by_status(TaskStatus::InFlight).await.unwrap(), 0);
    assert_eq!(store.count_by_status(TaskStatus::Pending).await.unwrap(), 30);
}
