//! Alias → target resolution with cooldown filtering and pluggable
//! selection.

use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand::rngs::StdRng;

use plexus_common::GatewayError;
use plexus_storage::RollingStats;
use plexus_transform::Dialect;

use crate::config::{
    AliasTarget, ConfigSnapshot, PriorityMode, ProviderRecord, SelectorKind,
};
use crate::cooldown::CooldownManager;
use crate::pricing::PricingOracle;
use crate::selector::{Candidate, SelectorContext, select};

#[derive(Debug, Clone, Copy)]
pub struct Selection<'a> {
    pub provider: &'a ProviderRecord,
    pub model_slug: &'a str,
}

pub struct Router {
    cooldowns: Arc<CooldownManager>,
    stats: Arc<RollingStats>,
    oracle: Arc<dyn PricingOracle>,
    rng: Mutex<StdRng>,
}

impl Router {
    pub fn new(
        cooldowns: Arc<CooldownManager>,
        stats: Arc<RollingStats>,
        oracle: Arc<dyn PricingOracle>,
    ) -> Self {
        Self::with_rng(cooldowns, stats, oracle, StdRng::from_os_rng())
    }

    /// Fixed seed for deterministic resolution in tests.
    pub fn with_seed(
        cooldowns: Arc<CooldownManager>,
        stats: Arc<RollingStats>,
        oracle: Arc<dyn PricingOracle>,
        seed: u64,
    ) -> Self {
        Self::with_rng(cooldowns, stats, oracle, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        cooldowns: Arc<CooldownManager>,
        stats: Arc<RollingStats>,
        oracle: Arc<dyn PricingOracle>,
        rng: StdRng,
    ) -> Self {
        Self {
            cooldowns,
            stats,
            oracle,
            rng: Mutex::new(rng),
        }
    }

    /// Resolve a client-facing model name to one healthy
    /// `(provider, canonical_slug)` pair.
    pub fn resolve<'a>(
        &self,
        snapshot: &'a ConfigSnapshot,
        model: &str,
        client_dialect: Dialect,
    ) -> Result<Selection<'a>, GatewayError> {
        let (targets, selector, priority): (Vec<&AliasTarget>, SelectorKind, PriorityMode) =
            match snapshot.alias(model) {
                Some(alias) => (
                    alias.targets.iter().filter(|t| t.enabled).collect(),
                    alias.selector,
                    alias.priority,
                ),
                None => return self.resolve_direct(snapshot, model, client_dialect),
            };

        let configured: Vec<Candidate<'a>> = targets
            .into_iter()
            .filter_map(|target| {
                snapshot
                    .provider(&target.provider_id)
                    .filter(|provider| provider.enabled)
                    .map(|provider| Candidate { target, provider })
            })
            .collect();
        if configured.is_empty() {
            return Err(GatewayError::ModelNotFound {
                model: model.to_string(),
            });
        }

        self.pick(model, configured, selector, priority, client_dialect)
    }

    fn resolve_direct<'a>(
        &self,
        snapshot: &'a ConfigSnapshot,
        model: &str,
        client_dialect: Dialect,
    ) -> Result<Selection<'a>, GatewayError> {
        let mut healthy = Vec::new();
        let mut parked = Vec::new();
        let mut found = false;
        for provider in snapshot.providers.iter().filter(|p| p.enabled) {
            let Some((slug, _)) = provider.models.get_key_value(model) else {
                continue;
            };
            found = true;
            if self.cooldowns.healthy(&provider.id) {
                healthy.push((provider, slug.as_str()));
            } else {
                parked.push(provider.id.clone());
            }
        }
        if !found {
            return Err(GatewayError::ModelNotFound {
                model: model.to_string(),
            });
        }
        let Some(&default) = healthy.first() else {
            return Err(GatewayError::NoHealthyTarget {
                model: model.to_string(),
                parked,
            });
        };
        // Prefer a provider that speaks the client's dialect natively.
        let (provider, slug) = *healthy
            .iter()
            .find(|(p, _)| p.dialects_for_model(model).contains(&client_dialect))
            .unwrap_or(&default);
        Ok(Selection {
            provider,
            model_slug: slug,
        })
    }

    fn pick<'a>(
        &self,
        model: &str,
        configured: Vec<Candidate<'a>>,
        selector: SelectorKind,
        priority: PriorityMode,
        client_dialect: Dialect,
    ) -> Result<Selection<'a>, GatewayError> {
        let mut healthy = Vec::new();
        let mut parked = Vec::new();
        for candidate in configured {
            if self.cooldowns.healthy(&candidate.provider.id) {
                healthy.push(candidate);
            } else {
                parked.push(candidate.provider.id.clone());
            }
        }
        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyTarget {
                model: model.to_string(),
                parked,
            });
        }

        // `api_match` reorders so natively-capable targets come first,
        // keeping config order within each half; nothing is dropped, so
        // a selector may still prefer a non-native target.
        let candidates: Vec<Candidate<'a>> = if priority == PriorityMode::ApiMatch {
            let (mut native, non_native): (Vec<Candidate<'a>>, Vec<Candidate<'a>>) =
                healthy.into_iter().partition(|candidate| {
                    candidate
                        .provider
                        .dialects_for_model(&candidate.target.model_slug)
                        .contains(&client_dialect)
                });
            native.extend(non_native);
            native
        } else {
            healthy
        };

        let index = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| GatewayError::Internal("router rng lock poisoned".into()))?;
            let mut ctx = SelectorContext {
                stats: &self.stats,
                oracle: self.oracle.as_ref(),
                rng: &mut rng,
            };
            select(selector, &candidates, &mut ctx)
        };
        let chosen = candidates[index];
        Ok(Selection {
            provider: chosen.provider,
            model_slug: &chosen.target.model_slug,
        })
    }

    /// Reset the RNG to a known state (deterministic tests).
    pub fn reseed(&self, seed: u64) {
        if let Ok(mut rng) = self.rng.lock() {
            *rng = StdRng::seed_from_u64(seed);
        }
    }
}
