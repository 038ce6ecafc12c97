//! Tests for the HTTP row-range client against a mock server

use gridstream_common::GridError;
use gridstream_window::{
    CacheConfig, FetchOutcome, HttpRowRangeService, RowRangeRequest, RowRangeService, WindowCache,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::{
    matchers::{body_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn request(offset: u64, limit: u64) -> RowRangeRequest {
    RowRangeRequest {
        table: "trips".to_string(),
        offset,
        limit,
        filters: Vec::new(),
        sort: Vec::new(),
    }
}

fn page_response(rows: serde_json::Value, row_count: u64) -> serde_json::Value {
    json!({
        "success": true,
        "data": {
            "columns": [{"name": "id", "type": "BIGINT"}],
            "rows": rows,
            "row_count": row_count
        }
    })
}

fn service(server: &MockServer) -> HttpRowRangeService {
    HttpRowRangeService::new(server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_fetch_page_with_etag() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/rows"))
        .and(body_json(json!({"table": "trips", "offset": 0, "limit": 2})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"rev-1\"")
                .set_body_json(page_response(json!([["1"], ["2"]]), 2)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let outcome = service(&mock_server)
        .fetch_range(&request(0, 2), None)
        .await
        .unwrap();

    match outcome {
        FetchOutcome::Page { page, etag } => {
            assert_eq!(etag.as_deref(), Some("\"rev-1\""));
            assert_eq!(page.rows, vec![vec!["1".to_string()], vec!["2".to_string()]]);
            assert_eq!(page.row_count, Some(2));
            assert!(page.columns[0].is_numeric());
        },
        FetchOutcome::NotModified => panic!("expected a page"),
    }
}

#[tokio::test]
async fn test_conditional_fetch_not_modified() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/rows"))
        .and(header("If-None-Match", "\"rev-1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&mock_server)
        .await;

    let outcome = service(&mock_server)
        .fetch_range(&request(0, 2), Some("\"rev-1\""))
        .await
        .unwrap();

    assert_eq!(outcome, FetchOutcome::NotModified);
}

#[tokio::test]
async fn test_server_error_is_transport_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/rows"))
        .respond_with(ResponseTemplate::new(500).set_body_string("engine unavailable"))
        .mount(&mock_server)
        .await;

    let result = service(&mock_server).fetch_range(&request(0, 2), None).await;

    match result {
        Err(GridError::Transport(msg)) => assert!(msg.contains("engine unavailable")),
        other => panic!("expected transport failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rejected_request_carries_server_message() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/rows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "data": null,
            "error": "table 'trips' not found"
        })))
        .mount(&mock_server)
        .await;

    let result = service(&mock_server).fetch_range(&request(0, 2), None).await;

    match result {
        Err(GridError::Transport(msg)) => assert_eq!(msg, "table 'trips' not found"),
        other => panic!("expected transport failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_body_is_malformed_input() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/rows"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&mock_server)
        .await;

    let result = service(&mock_server).fetch_range(&request(0, 2), None).await;

    assert!(matches!(result, Err(GridError::MalformedInput(_))));
}

#[tokio::test]
async fn test_cache_over_http_fetches_each_chunk_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/rows"))
        .and(body_json(json!({"table": "trips", "offset": 0, "limit": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_response(json!([["0"], ["1"]]), 4)))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/v1/rows"))
        .and(body_json(json!({"table": "trips", "offset": 2, "limit": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_response(json!([["2"], ["3"]]), 4)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = CacheConfig {
        chunk_size: 2,
        server_url: mock_server.uri(),
        ..CacheConfig::default()
    };
    let service = HttpRowRangeService::from_config(&config).unwrap();
    let cache = WindowCache::spawn(Arc::new(service), "trips", &config);

    let window = cache.ensure_range(0, 3).await.unwrap();
    let indices: Vec<u64> = window.rows.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(window.rows[3].values, vec!["3".to_string()]);
    assert_eq!(window.row_count, 4);

    let window = cache.ensure_range(1, 2).await.unwrap();
    assert_eq!(window.rows.len(), 2);
}
