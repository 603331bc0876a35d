//! Integration tests for the pipeline
//!
//! These tests use wiremock to create mock HTTP servers and run the full
//! fetch, extract and persist cycle end-to-end.

use lurker::config::{Config, ExtractRule};
use lurker::crawler::{Orchestrator, PipelineEvent};
use lurker::state::{FailureClass, ItemState};
use lurker::storage::{
    EntityRecord, EntityStore, RunStatus, SqliteStorage, StorageError, StorageResult, Transition,
    UpsertOutcome, WorkLog,
};
use lurker::LurkerError;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a fast test configuration with a `topic` extraction rule
fn create_test_config() -> Config {
    let mut config = Config::default();
    config.pipeline.workers = 4;
    config.pipeline.requests_per_second = 1000;
    config.pipeline.shutdown_timeout_secs = 5;
    config.fetch.timeout_ms = 2_000;
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 10;
    config.retry.multiplier = 2.0;
    config.retry.jitter_ms = 0;
    config.retry.max_delay_ms = 100;
    config.circuit_breaker.failure_threshold = 100;
    config.circuit_breaker.cooldown_ms = 200;
    config.extract.assets = false;

    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), "span.title".to_string());
    config.extract.rules = vec![ExtractRule {
        kind: "topic".to_string(),
        selector: "li.topic".to_string(),
        key: "data-id".to_string(),
        fields,
    }];
    config
}

fn memory_pipeline(config: Config) -> (Arc<SqliteStorage>, Orchestrator) {
    let storage = Arc::new(SqliteStorage::new_in_memory().expect("Failed to open storage"));
    let orchestrator = Orchestrator::new(config, storage.clone(), storage.clone())
        .expect("Failed to create orchestrator");
    (storage, orchestrator)
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(
        format!("<html><head><title>Test</title></head><body>{}</body></html>", body),
        "text/html",
    )
}

async fn mount_page(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(html(body))
        .mount(server)
        .await;
}

fn state_of(storage: &SqliteStorage, identifier: &str) -> ItemState {
    storage
        .get_item(identifier)
        .expect("Failed to read work item")
        .unwrap_or_else(|| panic!("{} was never admitted", identifier))
        .state
}

#[tokio::test]
async fn test_persistent_failure_is_dead_lettered() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let (storage, orchestrator) = memory_pipeline(create_test_config());
    let identifier = format!("{}/flaky", mock_server.uri());
    orchestrator.seed([&identifier]).unwrap();

    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.persisted, 0);
    assert_eq!(summary.entities, 0);
    let dead = &summary.dead_letters[0];
    assert_eq!(dead.identifier, identifier);
    assert_eq!(dead.failure_class, Some(FailureClass::RetryableFetch));
    assert_eq!(dead.attempts, 3);
    assert_eq!(state_of(&storage, &identifier), ItemState::DeadLettered);
}

#[tokio::test]
async fn test_transient_failures_recover() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/board"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    mount_page(&mock_server, "/board", "<p>recovered</p>").await;

    let (storage, orchestrator) = memory_pipeline(create_test_config());
    let identifier = format!("{}/board", mock_server.uri());
    orchestrator.seed([&identifier]).unwrap();

    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.persisted, 1);
    assert_eq!(summary.dead_lettered, 0);
    let item = storage.get_item(&identifier).unwrap().unwrap();
    assert_eq!(item.state, ItemState::Persisted);
    assert_eq!(item.attempt_count, 2);
}

#[tokio::test]
async fn test_entities_persisted_and_links_followed() {
    let mock_server = MockServer::start().await;
    let base = mock_server.uri();

    mount_page(
        &mock_server,
        "/",
        r#"<ul><li class="topic" data-id="1"><span class="title">Welcome</span></li></ul>
           <a href="/c">Next</a>"#,
    )
    .await;
    mount_page(&mock_server, "/c", "<p>leaf</p>").await;

    let (storage, orchestrator) = memory_pipeline(create_test_config());
    orchestrator.seed([format!("{}/", base)]).unwrap();

    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.persisted, 2);
    // Two page entities plus the topic
    assert_eq!(summary.entities, 3);

    let topic = storage.get_entity("topic:1").unwrap().expect("topic missing");
    assert!(topic.content.contains("Welcome"));

    let leaf = storage.get_item(&format!("{}/c", base)).unwrap().unwrap();
    assert_eq!(leaf.state, ItemState::Persisted);
    assert_eq!(leaf.source_hint, Some(format!("{}/", base)));
}

#[tokio::test]
async fn test_shared_link_fetched_once() {
    let mock_server = MockServer::start().await;

    mount_page(&mock_server, "/a", r#"<a href="/d">D</a>"#).await;
    mount_page(&mock_server, "/b", r#"<a href="/d?PHPSESSID=x">D</a>"#).await;
    Mock::given(method("GET"))
        .and(path("/d"))
        .respond_with(html("<p>shared</p>"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (_, orchestrator) = memory_pipeline(create_test_config());
    orchestrator
        .seed([
            format!("{}/a", mock_server.uri()),
            format!("{}/b", mock_server.uri()),
        ])
        .unwrap();

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.persisted, 3);
}

#[tokio::test]
async fn test_duplicate_entities_stored_once() {
    let mock_server = MockServer::start().await;
    let topic = r#"<li class="topic" data-id="7"><span class="title">Same</span></li>"#;

    mount_page(&mock_server, "/a", topic).await;
    mount_page(&mock_server, "/b", topic).await;

    let (storage, orchestrator) = memory_pipeline(create_test_config());
    let mut events = orchestrator.subscribe();
    orchestrator
        .seed([
            format!("{}/a", mock_server.uri()),
            format!("{}/b", mock_server.uri()),
        ])
        .unwrap();

    orchestrator.run().await.unwrap();

    // Two pages plus one topic
    assert_eq!(storage.count_entities().unwrap(), 3);

    let mut inserted = 0;
    let mut unchanged = 0;
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::Persisted {
            inserted: i,
            unchanged: u,
            ..
        } = event
        {
            inserted += i;
            unchanged += u;
        }
    }
    assert_eq!(inserted, 3);
    assert_eq!(unchanged, 1);
}

#[tokio::test]
async fn test_not_found_is_dead_lettered_without_retry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (_, orchestrator) = memory_pipeline(create_test_config());
    orchestrator
        .seed([format!("{}/missing", mock_server.uri())])
        .unwrap();

    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(
        summary.dead_letters[0].failure_class,
        Some(FailureClass::PermanentFetch)
    );
}

#[tokio::test]
async fn test_malformed_document_is_dead_lettered() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("", "text/html"))
        .mount(&mock_server)
        .await;

    let (_, orchestrator) = memory_pipeline(create_test_config());
    orchestrator
        .seed([format!("{}/empty", mock_server.uri())])
        .unwrap();

    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(
        summary.dead_letters[0].failure_class,
        Some(FailureClass::Extraction)
    );
}

#[tokio::test]
async fn test_unsupported_content_passes_through() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/feed.json"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .mount(&mock_server)
        .await;

    let (_, orchestrator) = memory_pipeline(create_test_config());
    orchestrator
        .seed([format!("{}/feed.json", mock_server.uri())])
        .unwrap();

    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.persisted, 1);
    assert_eq!(summary.entities, 0);
}

fn entity_fields(storage: &SqliteStorage, key: &str) -> BTreeMap<String, String> {
    let record = storage
        .get_entity(key)
        .expect("Failed to read entity")
        .unwrap_or_else(|| panic!("{} was never stored", key));
    serde_json::from_str(&record.content).expect("Entity content is not a field map")
}

#[tokio::test]
async fn test_images_downloaded_as_assets() {
    let mock_server = MockServer::start().await;
    let png: &[u8] = b"\x89PNG\r\n\x1a\n";

    mount_page(
        &mock_server,
        "/",
        r#"<img src="/img/logo.png" alt="logo"><a href="/other">Other</a>"#,
    )
    .await;
    mount_page(&mock_server, "/other", r#"<img src="img/../img/logo.png">"#).await;
    Mock::given(method("GET"))
        .and(path("/img/logo.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png.to_vec(), "image/png"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut config = create_test_config();
    config.extract.assets = true;
    let (storage, orchestrator) = memory_pipeline(config);
    orchestrator
        .seed([format!("{}/", mock_server.uri())])
        .unwrap();

    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.persisted, 3);
    let asset_url = format!("{}/img/logo.png", mock_server.uri());
    let fields = entity_fields(&storage, &format!("asset:{}", asset_url));
    assert_eq!(fields["url"], asset_url);
    assert_eq!(fields["name"], "logo.png");
    assert_eq!(fields["content-type"], "image/png");
    assert_eq!(fields["size"], png.len().to_string());
    assert_eq!(fields["sha256"], hex::encode(Sha256::digest(png)));
    assert!(!fields.contains_key("path"));

    let item = storage.get_item(&asset_url).unwrap().unwrap();
    assert_eq!(item.source_hint.as_deref(), Some(format!("{}/", mock_server.uri()).as_str()));
}

#[tokio::test]
async fn test_asset_bytes_written_to_asset_dir() {
    let mock_server = MockServer::start().await;
    let temp_dir = tempfile::tempdir().unwrap();
    let asset_dir = temp_dir.path().join("assets");

    Mock::given(method("GET"))
        .and(path("/file.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("%PDF-1.4", "application/pdf"))
        .mount(&mock_server)
        .await;

    let mut config = create_test_config();
    config.storage.asset_dir = Some(asset_dir.to_string_lossy().into_owned());
    let (storage, orchestrator) = memory_pipeline(config);
    let identifier = format!("{}/file.pdf", mock_server.uri());
    orchestrator.seed([&identifier]).unwrap();

    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.persisted, 1);
    assert_eq!(summary.entities, 1);
    let fields = entity_fields(&storage, &format!("asset:{}", identifier));
    let digest = hex::encode(Sha256::digest(b"%PDF-1.4"));
    assert_eq!(fields["path"], format!("{}.pdf", digest));
    let written = std::fs::read(asset_dir.join(&fields["path"])).unwrap();
    assert_eq!(written, b"%PDF-1.4");
}

#[tokio::test]
async fn test_unwritable_asset_dir_fails_run() {
    let mock_server = MockServer::start().await;
    let blocker = tempfile::NamedTempFile::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/file.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("%PDF-1.4", "application/pdf"))
        .mount(&mock_server)
        .await;

    let mut config = create_test_config();
    // A regular file where the directory should be
    config.storage.asset_dir = Some(blocker.path().join("assets").to_string_lossy().into_owned());
    let (storage, orchestrator) = memory_pipeline(config);
    let identifier = format!("{}/file.pdf", mock_server.uri());
    orchestrator.seed([&identifier]).unwrap();

    let result = orchestrator.run().await;

    assert!(matches!(result, Err(LurkerError::PersistenceFatal { .. })));
    assert_eq!(state_of(&storage, &identifier), ItemState::Queued);
    assert_eq!(storage.count_entities().unwrap(), 0);
}

#[tokio::test]
async fn test_out_of_scope_links_not_admitted() {
    let mock_server = MockServer::start().await;

    mount_page(
        &mock_server,
        "/",
        r#"<a href="http://elsewhere.invalid/x">Away</a><a href="/local">Local</a>"#,
    )
    .await;
    mount_page(&mock_server, "/local", "<p>local</p>").await;

    let mut config = create_test_config();
    config.scope.allow = vec!["127.0.0.1".to_string()];
    let (storage, orchestrator) = memory_pipeline(config);
    orchestrator
        .seed([format!("{}/", mock_server.uri())])
        .unwrap();

    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.persisted, 2);
    assert!(storage
        .get_item("http://elsewhere.invalid/x")
        .unwrap()
        .is_none());
}

/// Entity store whose database is always unreachable
struct UnavailableStore;

impl EntityStore for UnavailableStore {
    fn upsert_entity(&self, _entity: &EntityRecord) -> StorageResult<UpsertOutcome> {
        Err(StorageError::Unavailable("unable to open database file".into()))
    }

    fn get_entity(&self, _key: &str) -> StorageResult<Option<EntityRecord>> {
        Err(StorageError::Unavailable("unable to open database file".into()))
    }

    fn count_entities(&self) -> StorageResult<u64> {
        Err(StorageError::Unavailable("unable to open database file".into()))
    }
}

#[tokio::test]
async fn test_unreachable_storage_fails_run() {
    let mock_server = MockServer::start().await;
    mount_page(&mock_server, "/", "<p>content</p>").await;

    let storage = Arc::new(SqliteStorage::new_in_memory().unwrap());
    let orchestrator = Orchestrator::new(
        create_test_config(),
        storage.clone(),
        Arc::new(UnavailableStore),
    )
    .unwrap();
    let identifier = format!("{}/", mock_server.uri());
    orchestrator.seed([&identifier]).unwrap();

    let result = orchestrator.run().await;

    match result {
        Err(LurkerError::PersistenceFatal { identifier: id, .. }) => assert_eq!(id, identifier),
        other => panic!("expected PersistenceFatal, got {:?}", other),
    }
    assert_eq!(state_of(&storage, &identifier), ItemState::Queued);
    let run = storage.get_latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_resume_after_interruption() {
    let mock_server = MockServer::start().await;
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("lurker.db");

    mount_page(&mock_server, "/pending", "<p>pending</p>").await;
    Mock::given(method("GET"))
        .and(path("/done"))
        .respond_with(html("<p>done</p>"))
        .expect(0)
        .mount(&mock_server)
        .await;

    let host = mock_server.uri().trim_start_matches("http://").to_string();
    let pending = format!("{}/pending", mock_server.uri());
    let done = format!("{}/done", mock_server.uri());

    // A previous process died mid-fetch
    {
        let storage = SqliteStorage::new(&db_path).unwrap();
        storage
            .record_discovered(&pending, &host, None, ItemState::Queued)
            .unwrap();
        storage
            .update_state(&pending, &Transition::to(ItemState::Fetching, 1))
            .unwrap();
        storage
            .record_discovered(&done, &host, None, ItemState::Persisted)
            .unwrap();
    }

    let storage = Arc::new(SqliteStorage::new(&db_path).unwrap());
    let orchestrator =
        Orchestrator::new(create_test_config(), storage.clone(), storage.clone()).unwrap();
    assert_eq!(orchestrator.seed([&done]).unwrap(), 0);

    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.persisted, 2);
    assert_eq!(summary.pending, 0);
    assert_eq!(state_of(&storage, &pending), ItemState::Persisted);
}

#[tokio::test]
async fn test_open_circuit_defers_host() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/unstable"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&mock_server)
        .await;
    mount_page(&mock_server, "/unstable", "<p>back</p>").await;

    let mut config = create_test_config();
    config.retry.max_attempts = 10;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.cooldown_ms = 100;
    let (storage, orchestrator) = memory_pipeline(config);
    let mut events = orchestrator.subscribe();
    let identifier = format!("{}/unstable", mock_server.uri());
    orchestrator.seed([&identifier]).unwrap();

    orchestrator.run().await.unwrap();

    assert_eq!(state_of(&storage, &identifier), ItemState::Persisted);
    let mut deferred = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PipelineEvent::Deferred { .. }) {
            deferred += 1;
        }
    }
    assert!(deferred >= 1, "expected the open circuit to defer the host");
}

#[tokio::test]
async fn test_shutdown_leaves_work_queued() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(html("<p>slow</p>").set_delay(Duration::from_millis(300)))
        .mount(&mock_server)
        .await;

    let mut config = create_test_config();
    config.pipeline.workers = 1;
    let (storage, orchestrator) = memory_pipeline(config);
    orchestrator
        .seed([
            format!("{}/one", mock_server.uri()),
            format!("{}/two", mock_server.uri()),
            format!("{}/three", mock_server.uri()),
        ])
        .unwrap();

    let (summary, _) = tokio::join!(orchestrator.run(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.shutdown();
    });
    let summary = summary.unwrap();

    // The worker finishes the item it holds, the rest wait for the next run
    assert_eq!(summary.persisted, 1);
    assert_eq!(summary.pending, 2);
    assert_eq!(storage.count_by_state(ItemState::Queued).unwrap(), 2);
    let run = storage.get_latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Interrupted);
}
