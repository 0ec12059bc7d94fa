use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use plexus_core::config::{ConfigHandle, ConfigSnapshot};
use plexus_core::cooldown::{CooldownConfig, CooldownManager};
use plexus_core::credential::{CredentialPool, OAuthError, OAuthKind, TokenRefresher, TokenResponse};
use plexus_core::dispatch::{DispatchReply, Dispatcher, IngressRequest};
use plexus_core::pricing::StaticPricingOracle;
use plexus_core::router::Router;
use plexus_core::upstream::{
    UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamRequest, UpstreamResponse,
};
use plexus_core::usage::UsageRecorder;
use plexus_storage::{
    MemoryCooldownStore, MemoryCredentialStore, MemoryUsageStore, RollingStats,
};
use plexus_transform::Dialect;

enum Scripted {
    Json(u16, String),
    Stream(Vec<Result<Bytes, String>>),
    Failure(UpstreamFailure),
}

#[derive(Default)]
struct MockUpstream {
    script: Mutex<VecDeque<Scripted>>,
    seen: Mutex<Vec<UpstreamRequest>>,
}

impl MockUpstream {
    fn push(&self, item: Scripted) {
        self.script.lock().unwrap().push_back(item);
    }

    fn requests(&self) -> Vec<UpstreamRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl UpstreamClient for MockUpstream {
    fn send<'a>(
        &'a self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamFailure>> + Send + 'a>> {
        self.seen.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match next.expect("mock upstream script exhausted") {
                Scripted::Json(status, body) => Ok(UpstreamResponse {
                    status,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from(body)),
                }),
                Scripted::Stream(chunks) => {
                    let (tx, rx) = tokio::sync::mpsc::channel(16);
                    tokio::spawn(async move {
                        for chunk in chunks {
                            if tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                    });
                    Ok(UpstreamResponse {
                        status: 200,
                        headers: Vec::new(),
                        body: UpstreamBody::Stream(rx),
                    })
                }
                Scripted::Failure(failure) => Err(failure),
            }
        })
    }
}

struct NoRefresh;

#[async_trait::async_trait]
impl TokenRefresher for NoRefresh {
    async fn refresh_token(
        &self,
        _kind: OAuthKind,
        _refresh_token: &str,
    ) -> Result<TokenResponse, OAuthError> {
        Err(OAuthError::Transport("not expected in this test".into()))
    }
}

struct Harness {
    dispatcher: Dispatcher,
    upstream: Arc<MockUpstream>,
    usage: Arc<MemoryUsageStore>,
}

async fn harness(config: serde_json::Value) -> Harness {
    harness_with_credentials(config, Vec::new()).await
}

async fn harness_with_credentials(
    config: serde_json::Value,
    credentials: Vec<plexus_storage::CredentialRecord>,
) -> Harness {
    let snapshot: ConfigSnapshot = serde_json::from_value(config).unwrap();
    let oauth_pools: Vec<(String, Vec<String>)> = snapshot
        .providers
        .iter()
        .filter_map(|provider| match &provider.auth {
            plexus_core::config::AuthConfig::Oauth {
                provider_kind,
                account_pool,
            } => Some((provider_kind.clone(), account_pool.clone())),
            _ => None,
        })
        .collect();
    let config = Arc::new(ConfigHandle::new(snapshot));
    let cooldowns = Arc::new(
        CooldownManager::load(
            CooldownConfig::default(),
            Arc::new(MemoryCooldownStore::new()),
        )
        .await,
    );
    let stats = Arc::new(RollingStats::default());
    let oracle = Arc::new(StaticPricingOracle::default());
    let router = Router::with_seed(cooldowns.clone(), stats.clone(), oracle.clone(), 11);
    let credential_store = Arc::new(MemoryCredentialStore::new());
    credential_store.seed(credentials).await;
    let pool = Arc::new(CredentialPool::new(
        credential_store,
        cooldowns.clone(),
        Arc::new(NoRefresh),
    ));
    for (kind, accounts) in &oauth_pools {
        pool.load_accounts(kind, accounts).await;
    }
    let usage = Arc::new(MemoryUsageStore::new());
    let upstream = Arc::new(MockUpstream::default());
    let dispatcher = Dispatcher::new(
        config,
        router,
        cooldowns,
        pool,
        upstream.clone(),
        UsageRecorder::new(usage.clone(), stats),
        oracle,
    );
    Harness {
        dispatcher,
        upstream,
        usage,
    }
}

fn openai_config() -> serde_json::Value {
    serde_json::json!({
        "providers": [{
            "id": "openai",
            "supported_dialects": ["chat", "responses"],
            "api_base_url": "https://api.openai.com",
            "auth": {"kind": "api_key", "value": "sk-upstream"},
            "models": {"gpt-4": {"pricing": {"kind": "simple",
                "input_per_m": 30.0, "output_per_m": 60.0}}}
        }],
        "models": [{
            "id": "gpt-4",
            "selector": "in_order",
            "targets": [{"provider_id": "openai", "model_slug": "gpt-4"}]
        }]
    })
}

fn chat_ingress(body: serde_json::Value) -> IngressRequest {
    IngressRequest {
        dialect: Dialect::Chat,
        body: Bytes::from(body.to_string()),
        path_model: None,
        path_stream: false,
        api_key_id: Some("key-1".into()),
        source_ip: Some("10.0.0.9".into()),
    }
}

#[tokio::test]
async fn unary_chat_passes_through_verbatim_and_records_usage() {
    let harness = harness(openai_config()).await;
    let upstream_body = serde_json::json!({
        "id": "chatcmpl-1", "object": "chat.completion", "created": 1, "model": "gpt-4",
        "choices": [{"index": 0, "finish_reason": "stop",
            "message": {"role": "assistant", "content": "hi back"}}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
    .to_string();
    harness
        .upstream
        .push(Scripted::Json(200, upstream_body.clone()));

    let reply = harness
        .dispatcher
        .dispatch(chat_ingress(serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await;

    let DispatchReply::Json { status, body, .. } = reply else {
        panic!("expected unary reply");
    };
    assert_eq!(status.as_u16(), 200);
    // Pass-through: the upstream document comes back byte-identical.
    assert_eq!(body, Bytes::from(upstream_body));

    let sent = harness.upstream.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].url, "https://api.openai.com/v1/chat/completions");
    assert!(sent[0]
        .headers
        .iter()
        .any(|(k, v)| k == "Authorization" && v == "Bearer sk-upstream"));

    let rows = harness.usage.all().await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.incoming_dialect, "chat");
    assert_eq!(row.outgoing_dialect.as_deref(), Some("chat"));
    assert_eq!(row.selected_provider.as_deref(), Some("openai"));
    assert_eq!(row.input_tokens, Some(10));
    assert_eq!(row.response_status, "200");
    // 10/1e6*30 + 5/1e6*60
    assert!((row.cost_usd.unwrap() - 0.0006).abs() < 1e-9);
}

fn cross_dialect_config() -> serde_json::Value {
    serde_json::json!({
        "providers": [{
            "id": "openai-style",
            "supported_dialects": ["chat"],
            "api_base_url": "https://mirror.example",
            "auth": {"kind": "api_key", "value": "sk-m"},
            "models": {"sonnet-mirror": {"pricing": {"kind": "simple",
                "input_per_m": 3.0, "output_per_m": 15.0}}}
        }],
        "models": [{
            "id": "claude-sonnet",
            "selector": "in_order",
            "targets": [{"provider_id": "openai-style", "model_slug": "sonnet-mirror"}]
        }]
    })
}

fn chat_sse(frames: &[&str]) -> Vec<Result<Bytes, String>> {
    frames
        .iter()
        .map(|frame| Ok(Bytes::from(format!("data: {frame}\n\n"))))
        .collect()
}

#[tokio::test]
async fn messages_client_streams_through_a_chat_provider() {
    let harness = harness(cross_dialect_config()).await;
    harness.upstream.push(Scripted::Stream(chat_sse(&[
        r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
        r#"{"choices":[{"index":0,"delta":{"content":"lo"}}]}"#,
        r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":9,"completion_tokens":2,"total_tokens":11}}"#,
        "[DONE]",
    ])));

    let reply = harness
        .dispatcher
        .dispatch(IngressRequest {
            dialect: Dialect::Messages,
            body: Bytes::from(
                serde_json::json!({
                    "model": "claude-sonnet",
                    "max_tokens": 128,
                    "stream": true,
                    "messages": [{"role": "user", "content": "hello?"}]
                })
                .to_string(),
            ),
            path_model: None,
            path_stream: false,
            api_key_id: None,
            source_ip: None,
        })
        .await;

    let DispatchReply::Stream { mut frames, .. } = reply else {
        panic!("expected stream reply");
    };
    let mut wire = Vec::new();
    while let Some(frame) = frames.recv().await {
        wire.extend_from_slice(&frame.unwrap());
    }
    let wire = String::from_utf8(wire).unwrap();
    assert!(wire.contains("event: message_start"));
    assert!(wire.contains("\"text\":\"Hel\""));
    assert!(wire.contains("event: message_delta"));
    assert!(wire.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
    // The upstream stream was OpenAI chat SSE against the chat endpoint.
    let sent = harness.upstream.requests();
    assert_eq!(sent[0].url, "https://mirror.example/v1/chat/completions");
    assert!(sent[0].want_stream);

    let rows = harness.usage.all().await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert!(row.is_streamed);
    assert!(row.ttft_ms.is_some());
    assert_eq!(row.input_tokens, Some(9));
    assert_eq!(row.incoming_dialect, "messages");
    assert_eq!(row.outgoing_dialect.as_deref(), Some("chat"));
    assert_eq!(row.response_status, "200");
}

fn failover_config() -> serde_json::Value {
    serde_json::json!({
        "providers": [
            {"id": "a", "supported_dialects": ["chat"],
             "api_base_url": "https://a.example",
             "auth": {"kind": "api_key", "value": "ka"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 1.0}}}},
            {"id": "b", "supported_dialects": ["chat"],
             "api_base_url": "https://b.example",
             "auth": {"kind": "api_key", "value": "kb"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 1.0}}}}
        ],
        "models": [{
            "id": "m",
            "selector": "in_order",
            "targets": [
                {"provider_id": "a", "model_slug": "m"},
                {"provider_id": "b", "model_slug": "m"}
            ]
        }]
    })
}

fn ok_chat_body() -> String {
    serde_json::json!({
        "id": "c", "object": "chat.completion", "created": 1, "model": "m",
        "choices": [{"index": 0, "finish_reason": "stop",
            "message": {"role": "assistant", "content": "ok"}}],
        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
    })
    .to_string()
}

#[tokio::test]
async fn a_500_parks_the_provider_and_the_next_request_fails_over() {
    let harness = harness(failover_config()).await;
    harness.upstream.push(Scripted::Json(500, "boom".into()));
    harness.upstream.push(Scripted::Json(200, ok_chat_body()));

    let request = serde_json::json!({
        "model": "m",
        "messages": [{"role": "user", "content": "x"}]
    });

    let DispatchReply::Json { status, .. } =
        harness.dispatcher.dispatch(chat_ingress(request.clone())).await
    else {
        panic!()
    };
    assert_eq!(status.as_u16(), 502);

    let DispatchReply::Json { status, .. } =
        harness.dispatcher.dispatch(chat_ingress(request)).await
    else {
        panic!()
    };
    assert_eq!(status.as_u16(), 200);

    let sent = harness.upstream.requests();
    assert!(sent[0].url.starts_with("https://a.example"));
    assert!(sent[1].url.starts_with("https://b.example"));

    let rows = harness.usage.all().await;
    assert_eq!(rows[0].response_status, "502");
    assert_eq!(rows[0].error_code.as_deref(), Some("upstream_server_error"));
    assert_eq!(rows[1].selected_provider.as_deref(), Some("b"));
}

#[tokio::test]
async fn all_targets_parked_yields_503_with_a_usage_row() {
    let harness = harness(failover_config()).await;
    harness.dispatcher.cooldowns().mark_failure("a", "server_error");
    harness.dispatcher.cooldowns().mark_failure("b", "server_error");

    let DispatchReply::Json { status, body, .. } = harness
        .dispatcher
        .dispatch(chat_ingress(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}]
        })))
        .await
    else {
        panic!()
    };
    assert_eq!(status.as_u16(), 503);
    assert!(String::from_utf8_lossy(&body).contains("no_healthy_target"));

    let rows = harness.usage.all().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].response_status, "503");
    assert_eq!(rows[0].error_code.as_deref(), Some("no_healthy_target"));
}

#[tokio::test]
async fn upstream_4xx_passes_through_without_cooldown() {
    let harness = harness(openai_config()).await;
    harness.upstream.push(Scripted::Json(
        422,
        r#"{"error":{"message":"bad tool schema"}}"#.into(),
    ));

    let DispatchReply::Json { status, body, .. } = harness
        .dispatcher
        .dispatch(chat_ingress(serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "x"}]
        })))
        .await
    else {
        panic!()
    };
    assert_eq!(status.as_u16(), 422);
    assert!(String::from_utf8_lossy(&body).contains("bad tool schema"));
    assert!(harness.dispatcher.cooldowns().healthy("openai"));
}

#[tokio::test]
async fn malformed_client_body_is_a_400_and_touches_nothing() {
    let harness = harness(openai_config()).await;
    let DispatchReply::Json { status, .. } = harness
        .dispatcher
        .dispatch(IngressRequest {
            dialect: Dialect::Chat,
            body: Bytes::from_static(b"{not json"),
            path_model: None,
            path_stream: false,
            api_key_id: None,
            source_ip: None,
        })
        .await
    else {
        panic!()
    };
    assert_eq!(status.as_u16(), 400);
    assert!(harness.upstream.requests().is_empty());
    assert!(harness.dispatcher.cooldowns().healthy("openai"));

    let rows = harness.usage.all().await;
    assert_eq!(rows[0].response_status, "400");
    assert_eq!(rows[0].error_code.as_deref(), Some("parse_error"));
}

#[tokio::test]
async fn unknown_model_is_a_404() {
    let harness = harness(openai_config()).await;
    let DispatchReply::Json { status, .. } = harness
        .dispatcher
        .dispatch(chat_ingress(serde_json::json!({
            "model": "gpt-nope",
            "messages": [{"role": "user", "content": "x"}]
        })))
        .await
    else {
        panic!()
    };
    assert_eq!(status.as_u16(), 404);
}

#[tokio::test]
async fn upstream_timeout_surfaces_as_408_and_parks_the_provider() {
    let harness = harness(openai_config()).await;
    harness.upstream.push(Scripted::Failure(UpstreamFailure::Timeout));

    let DispatchReply::Json { status, .. } = harness
        .dispatcher
        .dispatch(chat_ingress(serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "x"}]
        })))
        .await
    else {
        panic!()
    };
    assert_eq!(status.as_u16(), 408);
    assert!(!harness.dispatcher.cooldowns().healthy("openai"));
}

#[tokio::test]
async fn client_disconnect_aborts_upstream_and_records_a_row() {
    let harness = harness(cross_dialect_config()).await;
    // An effectively endless upstream: the client hangs up first.
    let mut frames: Vec<&str> = Vec::new();
    let chunk = r#"{"choices":[{"index":0,"delta":{"content":"x"}}]}"#;
    for _ in 0..5000 {
        frames.push(chunk);
    }
    harness.upstream.push(Scripted::Stream(chat_sse(&frames)));

    let reply = harness
        .dispatcher
        .dispatch(IngressRequest {
            dialect: Dialect::Messages,
            body: Bytes::from(
                serde_json::json!({
                    "model": "claude-sonnet", "max_tokens": 16, "stream": true,
                    "messages": [{"role": "user", "content": "go"}]
                })
                .to_string(),
            ),
            path_model: None,
            path_stream: false,
            api_key_id: None,
            source_ip: None,
        })
        .await;
    let DispatchReply::Stream { mut frames, .. } = reply else {
        panic!()
    };
    // Read one frame, then hang up.
    let _ = frames.recv().await;
    drop(frames);

    // The pipeline notices the dead channel and still accounts.
    let mut rows = Vec::new();
    for _ in 0..50 {
        rows = harness.usage.all().await;
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].response_status, "client_disconnect");
    assert!(rows[0].is_streamed);
}

#[tokio::test]
async fn claude_code_oauth_carries_the_provider_contract() {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let harness = harness_with_credentials(
        serde_json::json!({
            "providers": [{
                "id": "claude-max",
                "supported_dialects": ["messages"],
                "api_base_url": "https://api.anthropic.com",
                "auth": {"kind": "oauth", "provider_kind": "claude-code",
                         "account_pool": ["dev@example.com"]},
                "models": {"claude-sonnet-4": {"pricing": {"kind": "simple",
                    "input_per_m": 3.0, "output_per_m": 15.0}}}
            }],
            "models": [{
                "id": "sonnet",
                "selector": "in_order",
                "targets": [{"provider_id": "claude-max", "model_slug": "claude-sonnet-4"}]
            }]
        }),
        vec![plexus_storage::CredentialRecord {
            provider_kind: "claude-code".into(),
            user_identifier: "dev@example.com".into(),
            access_token: "oat-123".into(),
            refresh_token: "ort-456".into(),
            expires_at: now + 7200,
            metadata: serde_json::Value::Null,
        }],
    )
    .await;
    harness.upstream.push(Scripted::Json(
        200,
        serde_json::json!({
            "id": "msg_1", "type": "message", "role": "assistant",
            "model": "claude-sonnet-4",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 1}
        })
        .to_string(),
    ));

    let reply = harness
        .dispatcher
        .dispatch(IngressRequest {
            dialect: Dialect::Messages,
            body: Bytes::from(
                serde_json::json!({
                    "model": "sonnet", "max_tokens": 32,
                    "messages": [{"role": "user", "content": "hello"}]
                })
                .to_string(),
            ),
            path_model: None,
            path_stream: false,
            api_key_id: None,
            source_ip: None,
        })
        .await;
    let DispatchReply::Json { status, .. } = reply else {
        panic!()
    };
    assert_eq!(status.as_u16(), 200);

    let sent = harness.upstream.requests();
    let headers = &sent[0].headers;
    assert!(headers
        .iter()
        .any(|(k, v)| k == "Authorization" && v == "Bearer oat-123"));
    assert!(headers
        .iter()
        .any(|(k, v)| k == "Anthropic-Beta" && v.contains("oauth-2025-04-20")));
    assert!(headers.iter().any(|(k, v)| k == "X-App" && v == "cli"));
    assert!(headers
        .iter()
        .any(|(k, v)| k == "User-Agent" && v.starts_with("claude-cli/")));

    let body: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
    // Fixed leading system block plus the account-derived metadata id.
    assert_eq!(
        body["system"],
        "You are Claude Code, Anthropic's official CLI for Claude."
    );
    let user_id = body["metadata"]["user_id"].as_str().unwrap();
    assert!(user_id.starts_with("user_"));
    assert!(user_id.contains("_account_"));
    assert!(user_id.contains("_session_"));
}

#[tokio::test]
async fn chat_client_against_messages_provider_gets_chat_back() {
    let harness = harness(serde_json::json!({
        "providers": [{
            "id": "anthropic",
            "supported_dialects": ["messages"],
            "api_base_url": "https://api.anthropic.com",
            "auth": {"kind": "api_key", "value": "sk-ant"},
            "models": {"claude-sonnet-4": {"pricing": {"kind": "simple",
                "input_per_m": 3.0, "output_per_m": 15.0}}}
        }],
        "models": [{
            "id": "sonnet",
            "selector": "in_order",
            "targets": [{"provider_id": "anthropic", "model_slug": "claude-sonnet-4"}]
        }]
    }))
    .await;
    harness.upstream.push(Scripted::Json(
        200,
        serde_json::json!({
            "id": "msg_1", "type": "message", "role": "assistant",
            "model": "claude-sonnet-4",
            "content": [{"type": "text", "text": "salut"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 4, "output_tokens": 2}
        })
        .to_string(),
    ));

    let DispatchReply::Json { status, body, .. } = harness
        .dispatcher
        .dispatch(chat_ingress(serde_json::json!({
            "model": "sonnet",
            "messages": [{"role": "user", "content": "salut?"}]
        })))
        .await
    else {
        panic!()
    };
    assert_eq!(status.as_u16(), 200);
    let document: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(document["object"], "chat.completion");
    assert_eq!(document["choices"][0]["message"]["content"], "salut");
    // The client sees the alias it asked for, not the canonical slug.
    assert_eq!(document["model"], "sonnet");

    let sent = harness.upstream.requests();
    assert_eq!(sent[0].url, "https://api.anthropic.com/v1/messages");
    assert!(sent[0]
        .headers
        .iter()
        .any(|(k, v)| k == "x-api-key" && v == "sk-ant"));
    let upstream_doc: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(upstream_doc["model"], "claude-sonnet-4");
}
