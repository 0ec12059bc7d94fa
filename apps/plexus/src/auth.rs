//! Client-key authentication at the front door. The dispatcher only
//! ever sees the opaque key id.

use axum::http::HeaderMap;

use plexus_core::config::ConfigSnapshot;

#[derive(Debug)]
pub struct AuthError {
    pub status: u16,
    pub body: String,
}

/// Accepts `Authorization: Bearer`, Anthropic-style `x-api-key`,
/// Gemini-style `x-goog-api-key`, or a `key=` query parameter.
pub fn authenticate(
    snapshot: &ConfigSnapshot,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<String, AuthError> {
    let presented = bearer_token(headers)
        .or_else(|| header_value(headers, "x-api-key"))
        .or_else(|| header_value(headers, "x-goog-api-key"))
        .or_else(|| query_key(query));

    let Some(presented) = presented else {
        return Err(AuthError {
            status: 401,
            body: r#"{"error":{"code":"missing_api_key"}}"#.to_string(),
        });
    };
    match snapshot.client_key_id(&presented) {
        Some(id) => Ok(id.to_string()),
        None => Err(AuthError {
            status: 401,
            body: r#"{"error":{"code":"invalid_api_key"}}"#.to_string(),
        }),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|value| value.trim().to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

fn query_key(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("key="))
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ConfigSnapshot {
        serde_json::from_value(serde_json::json!({
            "client_keys": [{"id": "team-a", "key": "pk-123"}]
        }))
        .unwrap()
    }

    #[test]
    fn bearer_and_vendor_headers_resolve_the_same_key() {
        let snapshot = snapshot();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer pk-123".parse().unwrap());
        assert_eq!(authenticate(&snapshot, &headers, None).unwrap(), "team-a");

        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "pk-123".parse().unwrap());
        assert_eq!(authenticate(&snapshot, &headers, None).unwrap(), "team-a");

        let headers = HeaderMap::new();
        assert_eq!(
            authenticate(&snapshot, &headers, Some("alt=sse&key=pk-123")).unwrap(),
            "team-a"
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let snapshot = snapshot();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer nope".parse().unwrap());
        let err = authenticate(&snapshot, &headers, None).unwrap_err();
        assert_eq!(err.status, 401);
    }
}
