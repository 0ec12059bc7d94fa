//! The dispatcher: one `dispatch()` per client request, owning its whole
//! lifetime from parse to usage row.

pub mod stream;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::StatusCode;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tracing::{info, warn};

use plexus_common::{GatewayError, RequestId};
use plexus_storage::UsageRecord;
use plexus_transform::dialect::StreamIds;
use plexus_transform::{Dialect, RawRequest, UnifiedRequest};

use crate::claudecode;
use crate::config::{AuthConfig, ConfigHandle, Pricing, ProviderRecord};
use crate::cooldown::{CooldownManager, account_key};
use crate::credential::CredentialPool;
use crate::pricing::{PricingOracle, compute_cost};
use crate::router::{Router, Selection};
use crate::upstream::{UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamRequest};
use crate::usage::{UsageRecorder, apply_usage};

pub struct Dispatcher {
    config: Arc<ConfigHandle>,
    router: Router,
    cooldowns: Arc<CooldownManager>,
    pool: Arc<CredentialPool>,
    client: Arc<dyn UpstreamClient>,
    recorder: UsageRecorder,
    oracle: Arc<dyn PricingOracle>,
}

/// Ingress payload as tagged by the HTTP layer.
#[derive(Debug, Clone)]
pub struct IngressRequest {
    pub dialect: Dialect,
    pub body: Bytes,
    /// Model from the URL path (gemini routes).
    pub path_model: Option<String>,
    /// Streaming switched by the route (gemini `:streamGenerateContent`).
    pub path_stream: bool,
    pub api_key_id: Option<String>,
    pub source_ip: Option<String>,
}

pub enum DispatchReply {
    Json {
        request_id: RequestId,
        status: StatusCode,
        body: Bytes,
    },
    Stream {
        request_id: RequestId,
        frames: tokio::sync::mpsc::Receiver<Result<Bytes, std::io::Error>>,
    },
}

/// Everything one request carries down the pipeline.
struct DispatchContext {
    request_id: RequestId,
    client_dialect: Dialect,
    provider_dialect: Dialect,
    alias: String,
    start: Instant,
    oauth_account: Option<String>,
}

enum Outcome {
    Json {
        status: StatusCode,
        body: Bytes,
        record: UsageRecord,
    },
    /// The pipeline task owns the usage record from here on.
    Stream(tokio::sync::mpsc::Receiver<Result<Bytes, std::io::Error>>),
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigHandle>,
        router: Router,
        cooldowns: Arc<CooldownManager>,
        pool: Arc<CredentialPool>,
        client: Arc<dyn UpstreamClient>,
        recorder: UsageRecorder,
        oracle: Arc<dyn PricingOracle>,
    ) -> Self {
        Self {
            config,
            router,
            cooldowns,
            pool,
            client,
            recorder,
            oracle,
        }
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub fn cooldowns(&self) -> &Arc<CooldownManager> {
        &self.cooldowns
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Process one client request. Every path, error included, writes a
    /// usage row; only the streaming path defers it to the pipeline.
    pub async fn dispatch(&self, ingress: IngressRequest) -> DispatchReply {
        let request_id = RequestId::generate();
        let start = Instant::now();
        let mut record = base_record(&request_id, &ingress);

        info!(
            event = "downstream_received",
            request_id = %request_id,
            dialect = %ingress.dialect,
            is_stream_hint = ingress.path_stream,
        );

        match self.run(&ingress, &request_id, start, &mut record).await {
            Ok(Outcome::Json {
                status,
                body,
                record: mut finished,
            }) => {
                finished.duration_ms = start.elapsed().as_millis() as i64;
                finished.response_status = status.as_u16().to_string();
                info!(
                    event = "downstream_responded",
                    request_id = %request_id,
                    status = status.as_u16(),
                    elapsed_ms = finished.duration_ms,
                    is_stream = false,
                );
                self.recorder.record(finished).await;
                DispatchReply::Json {
                    request_id,
                    status,
                    body,
                }
            }
            Ok(Outcome::Stream(frames)) => DispatchReply::Stream { request_id, frames },
            Err(err) => {
                record.duration_ms = start.elapsed().as_millis() as i64;
                record.response_status = err.status().as_u16().to_string();
                record.error_code = Some(err.code().to_string());
                record.error_message = Some(err.to_string());
                warn!(
                    event = "downstream_responded",
                    request_id = %request_id,
                    code = err.code(),
                    status = err.status().as_u16(),
                    error = %err,
                );
                let reply = DispatchReply::Json {
                    request_id,
                    status: err.status(),
                    body: err.client_body(),
                };
                self.recorder.record(record).await;
                reply
            }
        }
    }

    async fn run(
        &self,
        ingress: &IngressRequest,
        request_id: &RequestId,
        start: Instant,
        record: &mut UsageRecord,
    ) -> Result<Outcome, GatewayError> {
        let snapshot = self.config.load();

        // 1-2. Parse the client body in its own dialect.
        let mut unified = ingress
            .dialect
            .parse_request(RawRequest {
                body: &ingress.body,
                path_model: ingress.path_model.as_deref(),
                path_stream: ingress.path_stream,
            })
            .map_err(map_parse_error)?;
        record.incoming_model_alias = unified.model.clone();
        record.is_streamed = unified.stream;

        // 3. Route.
        let Selection {
            provider,
            model_slug,
        } = self
            .router
            .resolve(&snapshot, &unified.model, ingress.dialect)?;
        record.selected_provider = Some(provider.id.clone());
        record.selected_model_slug = Some(model_slug.to_string());

        // 6 (choice only). Outgoing dialect policy.
        let provider_dialect = choose_provider_dialect(provider, model_slug, ingress.dialect)?;
        record.outgoing_dialect = Some(provider_dialect.as_str().to_string());

        // 4. Credential.
        let auth = self.acquire_auth(provider).await?;

        // 5. Rewrite under the canonical slug plus provider contract
        // injections.
        let alias = std::mem::replace(&mut unified.model, model_slug.to_string());
        if provider_dialect == Dialect::Messages
            && let AuthMaterial::OAuth { kind, .. } = &auth
            && claudecode::is_claude_code(kind)
        {
            claudecode::inject_system_prelude(&mut unified);
        }

        let ctx = DispatchContext {
            request_id: request_id.clone(),
            client_dialect: ingress.dialect,
            provider_dialect,
            alias,
            start,
            oauth_account: match &auth {
                AuthMaterial::OAuth { account, .. } => Some(account.clone()),
                AuthMaterial::ApiKey(_) => None,
            },
        };

        // 6-7. Emit wire bytes and issue the upstream call.
        let body = self.emit_body(&unified, provider, &ctx, &auth)?;
        let request = UpstreamRequest {
            url: upstream_url(provider, provider_dialect, &unified)?,
            headers: build_headers(provider, provider_dialect, &auth),
            body,
            want_stream: unified.stream,
        };
        info!(
            event = "upstream_attempt",
            request_id = %ctx.request_id,
            provider = %provider.id,
            slug = %model_slug,
            dialect = %provider_dialect,
            url = %request.url,
            is_stream = request.want_stream,
        );
        let response = self.client.send(request).await;

        // 9. Classify, cooldown, branch.
        self.complete(ctx, &snapshot_pricing(provider, model_slug), provider, unified, response, record)
            .await
    }

    async fn acquire_auth(&self, provider: &ProviderRecord) -> Result<AuthMaterial, GatewayError> {
        match &provider.auth {
            AuthConfig::ApiKey { value } => Ok(AuthMaterial::ApiKey(value.clone())),
            AuthConfig::Oauth { provider_kind, .. } => {
                let credential = self.pool.take(&provider.id, provider_kind).await?;
                let token = self.pool.refresh_if_needed(&credential).await?;
                Ok(AuthMaterial::OAuth {
                    token,
                    account: credential.user().to_string(),
                    kind: provider_kind.clone(),
                })
            }
        }
    }

    fn emit_body(
        &self,
        unified: &UnifiedRequest,
        provider: &ProviderRecord,
        ctx: &DispatchContext,
        auth: &AuthMaterial,
    ) -> Result<Bytes, GatewayError> {
        let bytes = ctx
            .provider_dialect
            .emit_request(unified)
            .map_err(map_parse_error)?;

        let needs_metadata = ctx.provider_dialect == Dialect::Messages
            && matches!(auth, AuthMaterial::OAuth { kind, .. } if claudecode::is_claude_code(kind));
        if provider.extra_body.is_none() && !needs_metadata {
            return Ok(Bytes::from(bytes));
        }

        let mut document: JsonValue = serde_json::from_slice(&bytes)
            .map_err(|err| GatewayError::Internal(format!("emitted body not json: {err}")))?;
        if let Some(extra) = &provider.extra_body {
            deep_merge(&mut document, extra);
        }
        if needs_metadata && let Some(account) = &ctx.oauth_account {
            claudecode::apply_metadata_user_id(&mut document, &claudecode::metadata_user_id(account));
        }
        serde_json::to_vec(&document)
            .map(Bytes::from)
            .map_err(|err| GatewayError::Internal(format!("body rewrite failed: {err}")))
    }

    async fn complete(
        &self,
        ctx: DispatchContext,
        pricing: &Option<(Pricing, f64)>,
        provider: &ProviderRecord,
        unified: UnifiedRequest,
        response: Result<crate::upstream::UpstreamResponse, UpstreamFailure>,
        record: &mut UsageRecord,
    ) -> Result<Outcome, GatewayError> {
        let provider_key = provider.id.clone();
        let auth_key = ctx
            .oauth_account
            .as_ref()
            .map(|account| account_key(&provider_key, account))
            .unwrap_or_else(|| provider_key.clone());

        let response = match response {
            Ok(response) => response,
            Err(UpstreamFailure::Timeout) => {
                self.cooldowns.mark_failure(&provider_key, "timeout");
                return Err(GatewayError::UpstreamTimeout {
                    provider: provider_key,
                });
            }
            Err(err) => {
                self.cooldowns.mark_failure(&provider_key, "network");
                return Err(GatewayError::UpstreamServerError {
                    provider: provider_key,
                    detail: err.to_string(),
                });
            }
        };

        match response.status {
            200..=299 => {
                self.cooldowns.mark_success(&provider_key);
                if auth_key != provider_key {
                    self.cooldowns.mark_success(&auth_key);
                }
            }
            401 | 403 => {
                self.cooldowns.mark_failure(&auth_key, "auth");
                return Err(GatewayError::UpstreamAuth {
                    provider: provider_key,
                    status: response.status,
                });
            }
            429 => {
                self.cooldowns.mark_failure(&auth_key, "rate_limit");
                return Err(GatewayError::UpstreamRateLimited {
                    provider: provider_key,
                });
            }
            408 | 500..=599 => {
                self.cooldowns.mark_failure(&provider_key, "server_error");
                return Err(GatewayError::UpstreamServerError {
                    provider: provider_key,
                    detail: format!("upstream status {}", response.status),
                });
            }
            status => {
                let body = match response.body {
                    UpstreamBody::Bytes(bytes) => bytes,
                    UpstreamBody::Stream(_) => Bytes::new(),
                };
                return Err(GatewayError::UpstreamClientError {
                    provider: provider_key,
                    status,
                    body,
                });
            }
        }

        if unified.stream {
            let upstream = match response.body {
                UpstreamBody::Stream(rx) => rx,
                UpstreamBody::Bytes(bytes) => {
                    // A provider answering a stream request unary still
                    // flows through the pipeline as a single chunk.
                    let (tx, rx) = tokio::sync::mpsc::channel(1);
                    let _ = tx.try_send(Ok(bytes));
                    rx
                }
            };
            let frames = stream::spawn_pipeline(stream::StreamPipeline {
                upstream,
                provider_dialect: ctx.provider_dialect,
                client_dialect: ctx.client_dialect,
                ids: StreamIds {
                    response_id: ctx.request_id.to_string(),
                    model: ctx.alias.clone(),
                    created: OffsetDateTime::now_utc().unix_timestamp(),
                },
                pass_through: ctx.client_dialect == ctx.provider_dialect,
                recorder: self.recorder.clone(),
                record: record.clone(),
                pricing: pricing.clone(),
                oracle: self.oracle.clone(),
                start: ctx.start,
            });
            return Ok(Outcome::Stream(frames));
        }

        // 8 unary. Read, reshape, account.
        let bytes = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(rx) => collect_stream(rx).await,
        };

        let parsed = ctx.provider_dialect.parse_response(&bytes);
        let (client_body, usage) = if ctx.client_dialect == ctx.provider_dialect {
            // Pass-through: the upstream document goes back verbatim;
            // parsing is only for accounting.
            let usage = parsed.as_ref().map(|resp| resp.usage).unwrap_or_default();
            (bytes, usage)
        } else {
            let mut parsed = parsed.map_err(|err| {
                self.cooldowns.mark_failure(&provider_key, "malformed_response");
                GatewayError::UpstreamServerError {
                    provider: provider_key.clone(),
                    detail: format!("unparsable upstream body: {err}"),
                }
            })?;
            parsed.model = ctx.alias.clone();
            if parsed.created.is_none() {
                parsed.created = Some(OffsetDateTime::now_utc().unix_timestamp());
            }
            if parsed.id.is_empty() {
                parsed.id = ctx.request_id.to_string();
            }
            let usage = parsed.usage;
            let body = ctx
                .client_dialect
                .emit_response(&parsed)
                .map_err(map_parse_error)?;
            (Bytes::from(body), usage)
        };

        apply_usage(record, &usage);
        if let Some((pricing, discount)) = pricing {
            let outcome = compute_cost(pricing, *discount, &usage, self.oracle.as_ref());
            record.cost_usd = Some(outcome.cost_usd);
            record.pricing_unknown = outcome.pricing_unknown;
        }
        Ok(Outcome::Json {
            status: StatusCode::OK,
            body: client_body,
            record: record.clone(),
        })
    }
}

enum AuthMaterial {
    ApiKey(String),
    OAuth {
        token: String,
        account: String,
        kind: String,
    },
}

fn base_record(request_id: &RequestId, ingress: &IngressRequest) -> UsageRecord {
    UsageRecord {
        request_id: request_id.to_string(),
        at: OffsetDateTime::now_utc(),
        source_ip: ingress.source_ip.clone(),
        api_key_id: ingress.api_key_id.clone(),
        incoming_dialect: ingress.dialect.as_str().to_string(),
        outgoing_dialect: None,
        incoming_model_alias: ingress.path_model.clone().unwrap_or_default(),
        selected_provider: None,
        selected_model_slug: None,
        input_tokens: None,
        output_tokens: None,
        reasoning_tokens: None,
        cache_read_tokens: None,
        cache_creation_tokens: None,
        total_tokens: None,
        cost_usd: None,
        pricing_unknown: false,
        duration_ms: 0,
        ttft_ms: None,
        is_streamed: false,
        response_status: "0".to_string(),
        error_code: None,
        error_message: None,
    }
}

fn map_parse_error(err: plexus_transform::ParseError) -> GatewayError {
    GatewayError::Parse {
        dialect: err.dialect.as_str(),
        field: err.field,
        reason: err.reason,
    }
}

/// Outgoing-dialect policy: within the dialects the model is reachable
/// through, prefer the client's (minimal transformation), then config
/// order.
fn choose_provider_dialect(
    provider: &ProviderRecord,
    slug: &str,
    client_dialect: Dialect,
) -> Result<Dialect, GatewayError> {
    let allowed = provider.dialects_for_model(slug);
    if allowed.contains(&client_dialect) {
        return Ok(client_dialect);
    }
    allowed
        .first()
        .copied()
        .ok_or_else(|| GatewayError::Internal(format!("provider {} exposes no dialect", provider.id)))
}

fn upstream_url(
    provider: &ProviderRecord,
    dialect: Dialect,
    unified: &UnifiedRequest,
) -> Result<String, GatewayError> {
    let base = provider.base_url(dialect).ok_or_else(|| {
        GatewayError::Internal(format!(
            "provider {} has no base url for {dialect}",
            provider.id
        ))
    })?;
    Ok(format!(
        "{}{}",
        base.trim_end_matches('/'),
        dialect.endpoint_path(unified)
    ))
}

fn build_headers(
    provider: &ProviderRecord,
    dialect: Dialect,
    auth: &AuthMaterial,
) -> Vec<(String, String)> {
    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    for (name, value) in &provider.headers {
        headers.push((name.clone(), value.clone()));
    }
    match auth {
        AuthMaterial::ApiKey(key) => match dialect {
            Dialect::Messages => {
                headers.push(("x-api-key".to_string(), key.clone()));
                headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
            }
            Dialect::Gemini => headers.push(("x-goog-api-key".to_string(), key.clone())),
            Dialect::Chat | Dialect::Responses => {
                headers.push(("Authorization".to_string(), format!("Bearer {key}")));
            }
        },
        AuthMaterial::OAuth { token, kind, .. } => {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
            if dialect == Dialect::Messages {
                headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
            }
            if claudecode::is_claude_code(kind) {
                headers.extend(claudecode::required_headers());
            }
        }
    }
    headers
}

fn snapshot_pricing(provider: &ProviderRecord, slug: &str) -> Option<(Pricing, f64)> {
    provider
        .models
        .get(slug)
        .map(|entry| (entry.pricing.clone(), provider.discount))
}

/// Objects merge key-by-key, everything else overwrites.
fn deep_merge(document: &mut JsonValue, extra: &JsonValue) {
    match (document, extra) {
        (JsonValue::Object(base), JsonValue::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (document, extra) => *document = extra.clone(),
    }
}

async fn collect_stream(mut rx: tokio::sync::mpsc::Receiver<Result<Bytes, String>>) -> Bytes {
    let mut buffer = Vec::new();
    while let Some(Ok(bytes)) = rx.recv().await {
        buffer.extend_from_slice(&bytes);
    }
    Bytes::from(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_preserves_sibling_keys() {
        let mut document = serde_json::json!({"a": {"x": 1}, "b": 2});
        deep_merge(
            &mut document,
            &serde_json::json!({"a": {"y": 3}, "c": 4}),
        );
        assert_eq!(document, serde_json::json!({"a": {"x": 1, "y": 3}, "b": 2, "c": 4}));
    }
}
