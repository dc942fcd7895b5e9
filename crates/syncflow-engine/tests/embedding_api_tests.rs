//! OpenAI-compatible embedding client against a mock server

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use syncflow_engine::config::EmbeddingConfig;
use syncflow_engine::embedding::{Embedder, OpenAiEmbedder};
use syncflow_engine::SyncError;

fn embedder(server: &MockServer, dimensions: usize) -> OpenAiEmbedder {
    OpenAiEmbedder::from_config(&EmbeddingConfig {
        dimensions: Some(dimensions),
        model: None,
        api_key: Some("sk-test".to_string()),
        api_base: Some(format!("{}/v1", server.uri())),
        batch_size: Some(8),
    })
    .unwrap()
}

#[tokio::test]
async fn test_embeddings_are_returned_in_input_order() {
    let server = MockServer::start().await;
    let one = vec![0.5_f32; 1536];
    let two = vec![-0.5_f32; 1536];

    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "text-embedding-3-small",
            "dimensions": 1536,
            "input": ["first", "second"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"index": 1, "embedding": two},
                {"index": 0, "embedding": one},
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let embedder = embedder(&server, 1536);
    let vectors = embedder
        .embed(&["first".to_string(), "second".to_string()])
        .await
        .unwrap();

    assert_eq!(embedder.model(), "text-embedding-3-small");
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0][0], 0.5);
    assert_eq!(vectors[1][0], -0.5);
}

#[tokio::test]
async fn test_http_errors_map_to_sync_errors() {
    let cases = [
        (429, "transient"),
        (503, "transient"),
        (401, "auth_refreshable"),
        (403, "auth_fatal"),
        (400, "validation"),
    ];

    for (status, kind) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let err = embedder(&server, 3072).embed(&["text".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), kind, "status {status}");
    }
}

#[tokio::test]
async fn test_wrong_dimension_count_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [0.1, 0.2]}]
        })))
        .mount(&server)
        .await;

    let err = embedder(&server, 1536).embed(&["text".to_string()]).await.unwrap_err();
    assert!(matches!(err, SyncError::Configuration(_)));
}

#[test]
fn test_unsupported_size_needs_explicit_model() {
    let config = EmbeddingConfig {
        dimensions: Some(768),
        api_key: Some("sk-test".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        OpenAiEmbedder::from_config(&config),
        Err(SyncError::Configuration(_))
    ));
}
