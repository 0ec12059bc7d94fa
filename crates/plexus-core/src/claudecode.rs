//! The claude-code provider family's behavioral contract. These
//! injections are part of that family's authentication protocol, not
//! general prompt rewriting: they apply only when the outgoing dialect
//! is `messages` and the credential kind is `claude-code`.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use plexus_transform::{Role, UnifiedMessage, UnifiedRequest};

pub const PROVIDER_KIND: &str = "claude-code";
pub const SYSTEM_PRELUDE: &str = "You are Claude Code, Anthropic's official CLI for Claude.";
pub const BETA_HEADER: &str = "claude-code-20250219,oauth-2025-04-20";
pub const USER_AGENT: &str = "claude-cli/1.0.83 (external, cli)";

pub fn is_claude_code(kind: &str) -> bool {
    kind == PROVIDER_KIND
}

/// Headers the upstream expects on every claude-code request.
pub fn required_headers() -> Vec<(String, String)> {
    vec![
        ("Anthropic-Beta".to_string(), BETA_HEADER.to_string()),
        ("User-Agent".to_string(), USER_AGENT.to_string()),
        ("X-App".to_string(), "cli".to_string()),
    ]
}

/// Prepend the fixed system block unless the request already leads with
/// it (pass-through traffic from a real CLI client).
pub fn inject_system_prelude(request: &mut UnifiedRequest) {
    let already_present = request
        .messages
        .first()
        .filter(|message| message.role == Role::System)
        .map(|message| message.joined_text().starts_with(SYSTEM_PRELUDE))
        .unwrap_or(false);
    if already_present {
        return;
    }
    request
        .messages
        .insert(0, UnifiedMessage::text(Role::System, SYSTEM_PRELUDE));
}

/// `user_<sha256_hex>_account_<uuid>_session_<uuid>`, where the hash
/// covers the pool account's email.
pub fn metadata_user_id(account_email: &str) -> String {
    let digest = Sha256::digest(account_email.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!(
        "user_{hex}_account_{}_session_{}",
        uuid::Uuid::new_v4(),
        uuid::Uuid::new_v4()
    )
}

/// Stamp `metadata.user_id` into an emitted messages-dialect document.
pub fn apply_metadata_user_id(document: &mut JsonValue, user_id: &str) {
    if let Some(object) = document.as_object_mut() {
        let metadata = object
            .entry("metadata")
            .or_insert_with(|| JsonValue::Object(Default::default()));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert(
                "user_id".to_string(),
                JsonValue::String(user_id.to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_is_not_duplicated() {
        let mut request = UnifiedRequest {
            model: "claude-sonnet-4".into(),
            messages: vec![
                UnifiedMessage::text(Role::System, SYSTEM_PRELUDE),
                UnifiedMessage::text(Role::User, "hi"),
            ],
            tools: Vec::new(),
            tool_choice: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: Vec::new(),
            stream: false,
            response_format: None,
            reasoning: None,
            modalities: Vec::new(),
            image_config: None,
        };
        inject_system_prelude(&mut request);
        assert_eq!(request.messages.len(), 2);

        request.messages.remove(0);
        inject_system_prelude(&mut request);
        assert_eq!(request.messages[0].joined_text(), SYSTEM_PRELUDE);
    }

    #[test]
    fn user_id_shape_matches_the_contract() {
        let id = metadata_user_id("a@example.com");
        assert!(id.starts_with("user_"));
        let hex = &id[5..69];
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.contains("_account_"));
        assert!(id.contains("_session_"));
    }

    #[test]
    fn metadata_is_stamped_without_clobbering() {
        let mut document = serde_json::json!({"model": "m", "metadata": {"other": 1}});
        apply_metadata_user_id(&mut document, "user_x");
        assert_eq!(document["metadata"]["user_id"], "user_x");
        assert_eq!(document["metadata"]["other"], 1);
    }
}
