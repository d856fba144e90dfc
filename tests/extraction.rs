use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use faturas_sync::error::ServiceError;
use faturas_sync::models::RateLimit;
use faturas_sync::services::extraction::{to_candidate, ExtractionOracle, OpenAiExtractor};
use faturas_sync::services::rate_limiter::{ApiFamily, RateLimiter};

fn extractor(server: &MockServer) -> OpenAiExtractor {
    let limiter = Arc::new(RateLimiter::new(Vec::<(ApiFamily, RateLimit)>::new()));
    OpenAiExtractor::new(reqwest::Client::new(), "sk-test", server.uri(), "gpt-4o-mini", limiter)
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "chatcmpl-1",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
    }))
}

#[tokio::test]
async fn fenced_json_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "response_format": { "type": "json_object" }
        })))
        .respond_with(completion(
            "```json\n{\"supplier_name\": \"Galp Energia\", \"doc_date\": \"14/03/2025\", \
             \"total_amount\": 42.5, \"doc_number\": \"FT 2025/118\", \
             \"cost_classification\": \"variável\", \"confidence\": 88}\n```",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let data = extractor(&server).extract(b"%PDF-1.7", "application/pdf").await.unwrap();
    assert_eq!(data.supplier_name.as_deref(), Some("Galp Energia"));
    assert_eq!(data.confidence, Some(88.0));

    let candidate = to_candidate(data).unwrap();
    assert_eq!(candidate.supplier_name, "GALP ENERGIA");
    assert_eq!(candidate.doc_date, "2025-03-14");
    assert_eq!(candidate.doc_year, 2025);
    assert_eq!(candidate.confidence_score, 88);
}

#[tokio::test]
async fn missing_confidence_is_computed_from_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion(
            r#"{"supplier_name": "EDP", "doc_date": "2025-02-01",
                "total_amount": 61.2, "doc_number": null}"#,
        ))
        .mount(&server)
        .await;

    let data = extractor(&server).extract(b"\x89PNG", "image/png").await.unwrap();
    assert_eq!(data.confidence, Some(70.0));
}

#[tokio::test]
async fn off_schema_output_gets_one_fix_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion("Aqui está a fatura: fornecedor GALP"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(completion(
            r#"{"supplier_name": "GALP", "doc_date": "2025-03-14",
                "total_amount": 42.5, "confidence": 60}"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let data = extractor(&server).extract(b"%PDF-1.7", "application/pdf").await.unwrap();
    assert_eq!(data.supplier_name.as_deref(), Some("GALP"));
}

#[tokio::test]
async fn output_still_invalid_after_fix_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion(r#"{"supplier_name": "GALP"}"#))
        .expect(2)
        .mount(&server)
        .await;

    let err = extractor(&server).extract(b"%PDF-1.7", "application/pdf").await.unwrap_err();
    assert!(matches!(err, ServiceError::Decode { .. }));
}

#[tokio::test]
async fn api_errors_surface_with_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let err = extractor(&server).extract(b"%PDF-1.7", "application/pdf").await.unwrap_err();
    assert!(matches!(err, ServiceError::Status { status: 429, .. }));
}
