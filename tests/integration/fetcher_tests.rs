//! Integration tests for the fetcher
//!
//! These tests use wiremock to check how responses and transport failures
//! are classified.

use lurker::config::FetchConfig;
use lurker::crawler::{FetchError, FetchOutcome, Fetcher, StatusClass};
use std::time::{Duration, Instant};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn create_test_config() -> FetchConfig {
    FetchConfig {
        timeout_ms: 2_000,
        connect_timeout_ms: 1_000,
        user_agent: "lurker-test/1.0".to_string(),
    }
}

fn fetcher() -> Fetcher {
    Fetcher::new(&create_test_config(), 1000).expect("Failed to build fetcher")
}

#[tokio::test]
async fn test_fetch_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/index.php"))
        .and(header("user-agent", "lurker-test/1.0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("<html><body>Board</body></html>", "text/html"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let identifier = format!("{}/index.php", mock_server.uri());
    let result = fetcher().fetch(&identifier).await;

    assert_eq!(result.status_class(), StatusClass::Success);
    assert_eq!(
        result.origin_host,
        mock_server.uri().trim_start_matches("http://")
    );
    match result.outcome {
        FetchOutcome::Success(document) => {
            assert_eq!(document.identifier, identifier);
            assert!(document
                .content_type
                .as_deref()
                .unwrap_or_default()
                .starts_with("text/html"));
            assert!(String::from_utf8_lossy(&document.body).contains("Board"));
        }
        FetchOutcome::Failed(e) => panic!("expected success, got {}", e),
    }
}

#[tokio::test]
async fn test_server_errors_are_retryable() {
    let mock_server = MockServer::start().await;

    for (route, status) in [("/503", 503u16), ("/500", 500), ("/429", 429), ("/408", 408)] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&mock_server)
            .await;
    }

    let fetcher = fetcher();
    for (route, status) in [("/503", 503u16), ("/500", 500), ("/429", 429), ("/408", 408)] {
        let result = fetcher
            .fetch(&format!("{}{}", mock_server.uri(), route))
            .await;
        match result.outcome {
            FetchOutcome::Failed(FetchError::Retryable { status: got, .. }) => {
                assert_eq!(got, Some(status))
            }
            other => panic!("{} should be retryable, got {:?}", route, other),
        }
    }
}

#[tokio::test]
async fn test_client_errors_are_permanent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&mock_server)
        .await;

    let fetcher = fetcher();
    let missing = fetcher
        .fetch(&format!("{}/missing", mock_server.uri()))
        .await;
    let gone = fetcher.fetch(&format!("{}/gone", mock_server.uri())).await;

    assert_eq!(missing.status_class(), StatusClass::Permanent);
    assert_eq!(gone.status_class(), StatusClass::Permanent);
}

#[tokio::test]
async fn test_redirect_is_followed() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(
            ResponseTemplate::new(301)
                .insert_header("location", format!("{}/new", mock_server.uri()).as_str()),
        )
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
        .mount(&mock_server)
        .await;

    let result = fetcher().fetch(&format!("{}/old", mock_server.uri())).await;

    match result.outcome {
        FetchOutcome::Success(document) => {
            assert_eq!(document.final_url.path(), "/new");
            assert!(document.identifier.ends_with("/old"));
        }
        FetchOutcome::Failed(e) => panic!("expected success, got {}", e),
    }
}

#[tokio::test]
async fn test_timeout_is_retryable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1_000)))
        .mount(&mock_server)
        .await;

    let config = FetchConfig {
        timeout_ms: 100,
        ..create_test_config()
    };
    let fetcher = Fetcher::new(&config, 1000).unwrap();
    let result = fetcher.fetch(&format!("{}/slow", mock_server.uri())).await;

    assert_eq!(result.status_class(), StatusClass::Retryable);
}

#[tokio::test]
async fn test_connection_refused_is_retryable() {
    // Bind then drop a listener so the port is known to be closed
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = fetcher()
        .fetch(&format!("http://127.0.0.1:{}/", port))
        .await;

    assert_eq!(result.status_class(), StatusClass::Retryable);
}

#[tokio::test]
async fn test_rate_limit_spaces_requests() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
        .expect(4)
        .mount(&mock_server)
        .await;

    let fetcher = Fetcher::new(&create_test_config(), 2).unwrap();
    let start = Instant::now();
    for i in 0..4 {
        fetcher
            .fetch(&format!("{}/page{}", mock_server.uri(), i))
            .await;
    }

    // Two requests burst through, the other two wait half a second each
    assert!(start.elapsed() >= Duration::from_millis(900));
}
