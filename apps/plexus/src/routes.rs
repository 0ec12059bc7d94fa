//! The four dialect routes plus model listings; every handler tags the
//! dialect and hands off to the dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header::CONTENT_TYPE};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;

use plexus_core::dispatch::{DispatchReply, Dispatcher, IngressRequest};
use plexus_transform::Dialect;

use crate::auth::authenticate;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/v1/responses", post(responses))
        .route("/v1/models", get(list_models_openai))
        .route("/v1beta/models", get(list_models_gemini))
        .route("/v1beta/models/{model_action}", post(gemini_action))
        .route("/v1beta/{*rest}", post(gemini_action_prefixed))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Dialect::Chat, None, false, addr, headers, uri, body).await
}

async fn messages(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Dialect::Messages, None, false, addr, headers, uri, body).await
}

async fn responses(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Dialect::Responses, None, false, addr, headers, uri, body).await
}

async fn gemini_action(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    route_gemini(state, model_action, addr, headers, uri, body).await
}

/// `tunedModels/...` and other prefixed model paths arrive through the
/// wildcard; the prefix stays part of the model name.
async fn gemini_action_prefixed(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(rest): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    route_gemini(state, rest, addr, headers, uri, body).await
}

async fn route_gemini(
    state: AppState,
    model_action: String,
    addr: SocketAddr,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.rsplit_once(':') else {
        return plain_error(StatusCode::NOT_FOUND, "missing gemini action");
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => return plain_error(StatusCode::NOT_FOUND, "unknown gemini action"),
    };
    dispatch(
        state,
        Dialect::Gemini,
        Some(model.to_string()),
        stream,
        addr,
        headers,
        uri,
        body,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: AppState,
    dialect: Dialect,
    path_model: Option<String>,
    path_stream: bool,
    addr: SocketAddr,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let snapshot = state.dispatcher.config().load();
    let api_key_id = match authenticate(&snapshot, &headers, uri.query()) {
        Ok(id) => id,
        Err(err) => {
            return error_response(
                StatusCode::from_u16(err.status).unwrap_or(StatusCode::UNAUTHORIZED),
                err.body,
            );
        }
    };

    let reply = state
        .dispatcher
        .dispatch(IngressRequest {
            dialect,
            body,
            path_model,
            path_stream,
            api_key_id: Some(api_key_id),
            source_ip: Some(addr.ip().to_string()),
        })
        .await;

    match reply {
        DispatchReply::Json {
            request_id,
            status,
            body,
        } => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
                response.headers_mut().insert("x-plexus-request-id", value);
            }
            response
        }
        DispatchReply::Stream { request_id, frames } => {
            let mut response = Response::new(Body::from_stream(ReceiverStream::new(frames)));
            *response.status_mut() = StatusCode::OK;
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            response
                .headers_mut()
                .insert("cache-control", HeaderValue::from_static("no-cache"));
            if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
                response.headers_mut().insert("x-plexus-request-id", value);
            }
            response
        }
    }
}

async fn list_models_openai(State(state): State<AppState>) -> Response {
    let snapshot = state.dispatcher.config().load();
    let data: Vec<serde_json::Value> = snapshot
        .models
        .iter()
        .map(|alias| {
            serde_json::json!({
                "id": alias.id,
                "object": "model",
                "created": 0,
                "owned_by": "plexus",
            })
        })
        .collect();
    json_response(serde_json::json!({ "object": "list", "data": data }))
}

async fn list_models_gemini(State(state): State<AppState>) -> Response {
    let snapshot = state.dispatcher.config().load();
    let models: Vec<serde_json::Value> = snapshot
        .models
        .iter()
        .map(|alias| {
            serde_json::json!({
                "name": format!("models/{}", alias.id),
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    json_response(serde_json::json!({ "models": models }))
}

fn json_response(value: serde_json::Value) -> Response {
    let mut response = Response::new(Body::from(value.to_string()));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, body: String) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    error_response(
        status,
        serde_json::json!({ "error": { "message": message } }).to_string(),
    )
}
