//! End-to-end flows against a real HTTP upstream: forwarding, streaming,
//! cross-dialect translation, and retry-with-fallback.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use httpmock::{Method::POST, MockServer};
use serde_json::{Value, json};
use tower::util::ServiceExt;

use prism_llm::governance::persistence::MemoryConfigStore;
use prism_llm::{
    CredentialKeyConfig, Gateway, GatewayHttpState, Governance, OpenAiCompatibleProvider,
    ProviderRegistry, ProviderRuntimeConfig, SessionManager, SystemClock,
};

const ADMIN_TOKEN: &str = "admin-secret";

struct ProviderSpec {
    name: &'static str,
    base_url: String,
}

async fn app(providers: Vec<ProviderSpec>) -> Router {
    let clock = Arc::new(SystemClock);
    let config_store = Arc::new(MemoryConfigStore::new());
    let governance = Arc::new(
        Governance::load(config_store.clone(), clock.clone(), Duration::from_millis(50))
            .await
            .unwrap(),
    );

    let mut registry = ProviderRegistry::new();
    for spec in providers {
        let runtime = ProviderRuntimeConfig {
            base_url: spec.base_url,
            default_request_timeout_in_seconds: 5,
            ..ProviderRuntimeConfig::default()
        };
        registry
            .register(
                spec.name,
                Arc::new(OpenAiCompatibleProvider::new(spec.name, &runtime)),
                runtime.clone(),
                vec![CredentialKeyConfig::new(
                    format!("{}-key", spec.name),
                    format!("sk-{}", spec.name),
                )],
            )
            .unwrap();
    }

    let gateway = Arc::new(Gateway::with_default_plugins(
        Arc::new(registry),
        governance.clone(),
    ));
    let sessions = Arc::new(SessionManager::new(config_store, clock, None));
    let state =
        GatewayHttpState::new(gateway, governance, sessions).with_admin_token(ADMIN_TOKEN);
    prism_llm::router(state)
}

async fn create_vk(app: &Router, value: &str) {
    let request = Request::builder()
        .method("POST")
        .uri("/api/governance/virtual-keys")
        .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "name": value, "value": value }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

fn chat_completion_body() -> Value {
    json!({
        "id": "cmpl-up",
        "object": "chat.completion",
        "created": 1,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": "upstream says hi" },
            "finish_reason": "stop",
        }],
        "usage": { "prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12 },
    })
}

#[tokio::test]
async fn chat_completion_forwards_upstream_and_returns_openai_shape() {
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-openai")
                .json_body_partial(r#"{"model":"gpt-4o"}"#);
            then.status(200).json_body(chat_completion_body());
        })
        .await;

    let app = app(vec![ProviderSpec {
        name: "openai",
        base_url: upstream.url("/v1"),
    }])
    .await;
    create_vk(&app, "vk-e2e").await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-api-key", "vk-e2e")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "openai/gpt-4o",
                "messages": [{ "role": "user", "content": "hi" }],
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["object"], json!("chat.completion"));
    assert_eq!(body["choices"][0]["message"]["content"], json!("upstream says hi"));
    assert_eq!(body["usage"]["total_tokens"], json!(12));
    mock.assert_async().await;
}

#[tokio::test]
async fn streaming_chat_relays_sse_with_done_sentinel() {
    let upstream = MockServer::start_async().await;
    let sse = concat!(
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n\n",
        "data: [DONE]\n\n",
    );
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse);
        })
        .await;

    let app = app(vec![ProviderSpec {
        name: "openai",
        base_url: upstream.url("/v1"),
    }])
    .await;
    create_vk(&app, "vk-stream").await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer vk-stream")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "openai/gpt-4o",
                "messages": [{ "role": "user", "content": "hi" }],
                "stream": true,
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    let frames: Vec<Value> = raw
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();

    assert!(raw.trim_end().ends_with("data: [DONE]"));
    let text: String = frames
        .iter()
        .filter_map(|frame| {
            frame
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
        })
        .collect();
    assert_eq!(text, "Hello");
    assert!(
        frames
            .iter()
            .any(|frame| frame.pointer("/choices/0/finish_reason") == Some(&json!("stop")))
    );
    let usage_frame = frames.last().unwrap();
    assert_eq!(usage_frame["usage"]["total_tokens"], json!(3));
    assert!(
        frames
            .iter()
            .all(|frame| frame["object"] == json!("chat.completion.chunk"))
    );
}

#[tokio::test]
async fn responses_dialect_stream_over_chat_upstream_splits_combined_chunk() {
    let upstream = MockServer::start_async().await;
    // The final upstream chunk carries BOTH a content delta and the usage
    // payload in one frame.
    let sse = concat!(
        "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo!\"}}],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":4,\"total_tokens\":6}}\n\n",
        "data: [DONE]\n\n",
    );
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse);
        })
        .await;

    let app = app(vec![ProviderSpec {
        name: "openai",
        base_url: upstream.url("/v1"),
    }])
    .await;
    create_vk(&app, "vk-xd").await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/responses")
        .header("authorization", "Bearer vk-xd")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "openai/gpt-4o",
                "input": "hi",
                "stream": true,
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    let frames: Vec<Value> = raw
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();

    let types: Vec<&str> = frames
        .iter()
        .map(|frame| frame["type"].as_str().unwrap())
        .collect();
    // The combined upstream chunk surfaces as a content event first; usage
    // arrives strictly after it, on the terminal completed event.
    assert_eq!(
        types,
        [
            "response.created",
            "response.output_text.delta",
            "response.output_text.delta",
            "response.completed",
        ]
    );
    assert_eq!(frames[2]["delta"], json!("lo!"));
    assert_eq!(
        frames[3].pointer("/response/usage/total_tokens"),
        Some(&json!(6))
    );
}

#[tokio::test]
async fn transient_upstream_error_falls_back_to_sibling_provider() {
    let primary = MockServer::start_async().await;
    let failing = primary
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(503).body("overloaded");
        })
        .await;

    let backup = MockServer::start_async().await;
    let rescued = backup
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-backup")
                .json_body_partial(r#"{"model":"llama-3"}"#);
            then.status(200).json_body(chat_completion_body());
        })
        .await;

    let app = app(vec![
        ProviderSpec {
            name: "openai",
            base_url: primary.url("/v1"),
        },
        ProviderSpec {
            name: "backup",
            base_url: backup.url("/v1"),
        },
    ])
    .await;
    create_vk(&app, "vk-fallback").await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer vk-fallback")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "openai/gpt-4o",
                "messages": [{ "role": "user", "content": "hi" }],
                "fallbacks": [{ "provider": "backup", "model": "llama-3" }],
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    failing.assert_async().await;
    rescued.assert_async().await;
}

#[tokio::test]
async fn permanent_upstream_error_is_surfaced_without_fallback() {
    let primary = MockServer::start_async().await;
    primary
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(422).body(r#"{"error":{"message":"bad tool schema"}}"#);
        })
        .await;

    let backup = MockServer::start_async().await;
    let never_called = backup
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(chat_completion_body());
        })
        .await;

    let app = app(vec![
        ProviderSpec {
            name: "openai",
            base_url: primary.url("/v1"),
        },
        ProviderSpec {
            name: "backup",
            base_url: backup.url("/v1"),
        },
    ])
    .await;
    create_vk(&app, "vk-permanent").await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer vk-permanent")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "openai/gpt-4o",
                "messages": [{ "role": "user", "content": "hi" }],
                "fallbacks": [{ "provider": "backup", "model": "llama-3" }],
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(never_called.hits_async().await, 0);
}

#[tokio::test]
async fn raw_body_header_forwards_bytes_unchanged() {
    let upstream = MockServer::start_async().await;
    let raw_body =
        r#"{"model":"openai/gpt-4o","messages":[{"role":"user","content":"hi"}],"zz_custom":1}"#;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body(raw_body);
            then.status(200).json_body(chat_completion_body());
        })
        .await;

    let app = app(vec![ProviderSpec {
        name: "openai",
        base_url: upstream.url("/v1"),
    }])
    .await;
    create_vk(&app, "vk-raw").await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer vk-raw")
        .header("x-gateway-raw-request-body", "true")
        .header("content-type", "application/json")
        .body(Body::from(raw_body))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    mock.assert_async().await;
}

#[tokio::test]
async fn missing_virtual_key_is_rejected_before_upstream() {
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(chat_completion_body());
        })
        .await;

    let app = app(vec![ProviderSpec {
        name: "openai",
        base_url: upstream.url("/v1"),
    }])
    .await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "openai/gpt-4o",
                "messages": [{ "role": "user", "content": "hi" }],
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(mock.hits_async().await, 0);
}
