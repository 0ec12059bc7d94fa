use std::sync::Arc;

use plexus_common::GatewayError;
use plexus_core::config::ConfigSnapshot;
use plexus_core::cooldown::{CooldownConfig, CooldownManager};
use plexus_core::pricing::StaticPricingOracle;
use plexus_core::router::Router;
use plexus_storage::{MemoryCooldownStore, RollingStats};
use plexus_transform::Dialect;

fn snapshot(config: serde_json::Value) -> ConfigSnapshot {
    serde_json::from_value(config).unwrap()
}

async fn router_with(
    stats: Arc<RollingStats>,
    seed: u64,
) -> (Router, Arc<CooldownManager>) {
    let cooldowns = Arc::new(
        CooldownManager::load(
            CooldownConfig::default(),
            Arc::new(MemoryCooldownStore::new()),
        )
        .await,
    );
    let router = Router::with_seed(
        cooldowns.clone(),
        stats,
        Arc::new(StaticPricingOracle::default()),
        seed,
    );
    (router, cooldowns)
}

fn two_target_config() -> ConfigSnapshot {
    snapshot(serde_json::json!({
        "providers": [
            {
                "id": "a",
                "supported_dialects": ["chat"],
                "api_base_url": "https://a.example",
                "auth": {"kind": "api_key", "value": "ka"},
                "models": {"m": {"pricing": {"kind": "simple",
                    "input_per_m": 1.0, "output_per_m": 10.0}}}
            },
            {
                "id": "b",
                "supported_dialects": ["messages"],
                "api_base_url": "https://b.example",
                "auth": {"kind": "api_key", "value": "kb"},
                "models": {"m": {"pricing": {"kind": "simple",
                    "input_per_m": 1.0, "output_per_m": 2.0}}}
            }
        ],
        "models": [{
            "id": "alias-m",
            "aliases": ["alias-m-latest"],
            "selector": "in_order",
            "targets": [
                {"provider_id": "a", "model_slug": "m"},
                {"provider_id": "b", "model_slug": "m"}
            ]
        }]
    }))
}

#[tokio::test]
async fn alias_and_secondary_names_resolve_in_order() {
    let (router, _) = router_with(Arc::new(RollingStats::default()), 7).await;
    let config = two_target_config();

    let selection = router.resolve(&config, "alias-m", Dialect::Chat).unwrap();
    assert_eq!(selection.provider.id, "a");
    assert_eq!(selection.model_slug, "m");

    let selection = router
        .resolve(&config, "alias-m-latest", Dialect::Chat)
        .unwrap();
    assert_eq!(selection.provider.id, "a");
}

#[tokio::test]
async fn unknown_models_are_not_found_and_direct_slugs_match() {
    let (router, _) = router_with(Arc::new(RollingStats::default()), 7).await;
    let config = two_target_config();

    assert!(matches!(
        router.resolve(&config, "nope", Dialect::Chat),
        Err(GatewayError::ModelNotFound { .. })
    ));

    // "m" is not an alias but both providers carry it directly.
    let selection = router.resolve(&config, "m", Dialect::Messages).unwrap();
    assert_eq!(selection.provider.id, "b");
}

#[tokio::test]
async fn cooldown_filters_targets_and_exhaustion_is_surfaced() {
    let (router, cooldowns) = router_with(Arc::new(RollingStats::default()), 7).await;
    let config = two_target_config();

    cooldowns.mark_failure("a", "server_error");
    let selection = router.resolve(&config, "alias-m", Dialect::Chat).unwrap();
    assert_eq!(selection.provider.id, "b");

    cooldowns.mark_failure("b", "server_error");
    match router.resolve(&config, "alias-m", Dialect::Chat) {
        Err(GatewayError::NoHealthyTarget { parked, .. }) => {
            assert_eq!(parked, vec!["a".to_string(), "b".to_string()]);
        }
        other => panic!("expected NoHealthyTarget, got {other:?}"),
    }
}

#[tokio::test]
async fn random_selection_is_deterministic_under_a_fixed_seed() {
    let config = snapshot(serde_json::json!({
        "providers": [
            {"id": "a", "supported_dialects": ["chat"],
             "api_base_url": "https://a.example",
             "auth": {"kind": "api_key", "value": "k"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 1.0}}}},
            {"id": "b", "supported_dialects": ["chat"],
             "api_base_url": "https://b.example",
             "auth": {"kind": "api_key", "value": "k"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 1.0}}}}
        ],
        "models": [{
            "id": "any",
            "selector": "random",
            "targets": [
                {"provider_id": "a", "model_slug": "m"},
                {"provider_id": "b", "model_slug": "m"}
            ]
        }]
    }));

    let picks = |seed| {
        let config = config.clone();
        async move {
            let (router, _) = router_with(Arc::new(RollingStats::default()), seed).await;
            let mut out = Vec::new();
            for _ in 0..8 {
                out.push(
                    router
                        .resolve(&config, "any", Dialect::Chat)
                        .unwrap()
                        .provider
                        .id
                        .clone(),
                );
            }
            out
        }
    };
    assert_eq!(picks(42).await, picks(42).await);
}

#[tokio::test]
async fn cost_selector_prefers_the_cheapest_output_rate() {
    let config = snapshot(serde_json::json!({
        "providers": [
            {"id": "pricey", "supported_dialects": ["chat"],
             "api_base_url": "https://a.example",
             "auth": {"kind": "api_key", "value": "k"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 30.0}}}},
            {"id": "cheap", "supported_dialects": ["chat"],
             "api_base_url": "https://b.example",
             "auth": {"kind": "api_key", "value": "k"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 2.0}}}}
        ],
        "models": [{
            "id": "balanced",
            "selector": "cost",
            "targets": [
                {"provider_id": "pricey", "model_slug": "m"},
                {"provider_id": "cheap", "model_slug": "m"}
            ]
        }]
    }));
    let (router, _) = router_with(Arc::new(RollingStats::default()), 1).await;
    let selection = router.resolve(&config, "balanced", Dialect::Chat).unwrap();
    assert_eq!(selection.provider.id, "cheap");
}

#[tokio::test]
async fn latency_selector_gives_unseen_targets_priority() {
    let stats = Arc::new(RollingStats::default());
    stats.observe(
        "a",
        "m",
        time::OffsetDateTime::now_utc(),
        500,
        Some(100),
        true,
    );

    let config = snapshot(serde_json::json!({
        "providers": [
            {"id": "a", "supported_dialects": ["chat"],
             "api_base_url": "https://a.example",
             "auth": {"kind": "api_key", "value": "k"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 1.0}}}},
            {"id": "fresh", "supported_dialects": ["chat"],
             "api_base_url": "https://b.example",
             "auth": {"kind": "api_key", "value": "k"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 1.0}}}}
        ],
        "models": [{
            "id": "fast",
            "selector": "latency",
            "targets": [
                {"provider_id": "a", "model_slug": "m"},
                {"provider_id": "fresh", "model_slug": "m"}
            ]
        }]
    }));
    let (router, _) = router_with(stats, 1).await;
    let selection = router.resolve(&config, "fast", Dialect::Chat).unwrap();
    assert_eq!(selection.provider.id, "fresh");
}

#[tokio::test]
async fn api_match_priority_puts_native_targets_first() {
    let config = snapshot(serde_json::json!({
        "providers": [
            {"id": "chat-only", "supported_dialects": ["chat"],
             "api_base_url": "https://a.example",
             "auth": {"kind": "api_key", "value": "k"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 1.0}}}},
            {"id": "native", "supported_dialects": ["messages"],
             "api_base_url": "https://b.example",
             "auth": {"kind": "api_key", "value": "k"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 1.0}}}}
        ],
        "models": [{
            "id": "alias-m",
            "selector": "in_order",
            "priority": "api_match",
            "targets": [
                {"provider_id": "chat-only", "model_slug": "m"},
                {"provider_id": "native", "model_slug": "m"}
            ]
        }]
    }));
    let (router, cooldowns) = router_with(Arc::new(RollingStats::default()), 1).await;

    // Messages client: the messages-native provider wins despite order.
    let selection = router.resolve(&config, "alias-m", Dialect::Messages).unwrap();
    assert_eq!(selection.provider.id, "native");

    // Gemini client: nobody is native, selector order stands.
    let selection = router.resolve(&config, "alias-m", Dialect::Gemini).unwrap();
    assert_eq!(selection.provider.id, "chat-only");

    // Non-native targets are reordered after, not dropped: with the
    // native provider parked, the chat-only one still serves.
    cooldowns.mark_failure("native", "server_error");
    let selection = router.resolve(&config, "alias-m", Dialect::Messages).unwrap();
    assert_eq!(selection.provider.id, "chat-only");
}

#[tokio::test]
async fn api_match_reorders_without_excluding_cheaper_targets() {
    // The messages-native provider is expensive; the chat-only one is
    // cheap. `api_match` only prefers native in ordering, so the cost
    // selector must still reach across and pick the cheap target.
    let config = snapshot(serde_json::json!({
        "providers": [
            {"id": "native-pricey", "supported_dialects": ["messages"],
             "api_base_url": "https://a.example",
             "auth": {"kind": "api_key", "value": "k"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 30.0}}}},
            {"id": "cheap-chat", "supported_dialects": ["chat"],
             "api_base_url": "https://b.example",
             "auth": {"kind": "api_key", "value": "k"},
             "models": {"m": {"pricing": {"kind": "simple",
                 "input_per_m": 1.0, "output_per_m": 2.0}}}}
        ],
        "models": [{
            "id": "alias-m",
            "selector": "cost",
            "priority": "api_match",
            "targets": [
                {"provider_id": "native-pricey", "model_slug": "m"},
                {"provider_id": "cheap-chat", "model_slug": "m"}
            ]
        }]
    }));
    let (router, _) = router_with(Arc::new(RollingStats::default()), 1).await;

    let selection = router.resolve(&config, "alias-m", Dialect::Messages).unwrap();
    assert_eq!(selection.provider.id, "cheap-chat");
}
