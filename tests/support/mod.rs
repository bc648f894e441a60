//! Shared helpers for end-to-end scenario tests.

use std::sync::Arc;

use modelvault_core::db::Database;
use modelvault_core::events::{self, EventSink};
use modelvault_core::http::HttpClient;
use modelvault_core::queue::TaskStore;
use modelvault_core::rate::RateGovernor;
use modelvault_core::scheduler::{Scheduler, SchedulerConfig};
use tokio::sync::mpsc::UnboundedReceiver;

/// A freshly wired scheduler over an in-memory Task Store, for scenario tests that
/// exercise real dispatch rather than individual components in isolation.
pub struct Harness {
    pub store: TaskStore,
    pub scheduler: Scheduler,
    pub events: UnboundedReceiver<events::Event>,
}

#[allow(dead_code)]
pub async fn harness(root: &std::path::Path, concurrency: usize) -> Harness {
    let db = Database::new_in_memory().await.expect("in-memory db");
    let store = TaskStore::new(db);
    let client = Arc::new(HttpClient::new(None).expect("http client"));
    let rate = RateGovernor::new(&[]);
    let (sink, events): (EventSink, _) = events::channel();

    let scheduler = Scheduler::new(
        store.clone(),
        client,
        rate,
        root.to_path_buf(),
        SchedulerConfig::from_max_concurrent_downloads(concurrency),
        sink,
    );

    Harness {
        store,
        scheduler,
        events,
    }
}
