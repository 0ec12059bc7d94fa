//! Cost computation from normalized usage and the provider's pricing
//! entry.

use plexus_transform::UnifiedUsage;

use crate::config::{Pricing, PriceRange};

/// Dynamic rate lookup for `openrouter` pricing entries. Rates are USD
/// per million tokens.
pub trait PricingOracle: Send + Sync {
    fn rates_per_million(&self, slug: &str) -> Option<OracleRates>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OracleRates {
    pub input_per_m: f64,
    pub output_per_m: f64,
    pub cached_per_m: Option<f64>,
}

/// Fixed rate table; the default (empty) oracle misses on every slug.
#[derive(Debug, Default)]
pub struct StaticPricingOracle {
    rates: std::collections::HashMap<String, OracleRates>,
}

impl StaticPricingOracle {
    pub fn new(rates: std::collections::HashMap<String, OracleRates>) -> Self {
        Self { rates }
    }
}

impl PricingOracle for StaticPricingOracle {
    fn rates_per_million(&self, slug: &str) -> Option<OracleRates> {
        self.rates.get(slug).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostOutcome {
    pub cost_usd: f64,
    /// The pricing source had no entry for the slug; cost is zero and
    /// the usage record is tagged.
    pub pricing_unknown: bool,
}

/// `cost = in/1e6·in_rate + out/1e6·out_rate + cached/1e6·cached_rate`,
/// then the provider discount. Range pricing picks the tier whose
/// `[lower, upper)` holds the input-token count.
pub fn compute_cost(
    pricing: &Pricing,
    discount: f64,
    usage: &UnifiedUsage,
    oracle: &dyn PricingOracle,
) -> CostOutcome {
    let outcome = match pricing {
        Pricing::Simple {
            input_per_m,
            output_per_m,
            cached_per_m,
        } => CostOutcome {
            cost_usd: linear_cost(usage, *input_per_m, *output_per_m, *cached_per_m),
            pricing_unknown: false,
        },
        Pricing::Ranges { ranges } => match pick_range(ranges, usage.input_tokens) {
            Some(range) => CostOutcome {
                cost_usd: linear_cost(
                    usage,
                    range.input_per_m,
                    range.output_per_m,
                    range.cached_per_m,
                ),
                pricing_unknown: false,
            },
            None => CostOutcome {
                cost_usd: 0.0,
                pricing_unknown: true,
            },
        },
        Pricing::Openrouter { slug } => match oracle.rates_per_million(slug) {
            Some(rates) => CostOutcome {
                cost_usd: linear_cost(
                    usage,
                    rates.input_per_m,
                    rates.output_per_m,
                    rates.cached_per_m,
                ),
                pricing_unknown: false,
            },
            None => CostOutcome {
                cost_usd: 0.0,
                pricing_unknown: true,
            },
        },
    };
    CostOutcome {
        cost_usd: (outcome.cost_usd * (1.0 - discount.clamp(0.0, 1.0))).max(0.0),
        pricing_unknown: outcome.pricing_unknown,
    }
}

/// Projected USD per 1000 output tokens, the quantity the `cost`
/// selector minimizes. Openrouter entries without an oracle rate are
/// unknown and lose to any priced target.
pub fn cost_per_1k_output(
    pricing: &Pricing,
    discount: f64,
    oracle: &dyn PricingOracle,
) -> Option<f64> {
    let output_per_m = match pricing {
        Pricing::Simple { output_per_m, .. } => Some(*output_per_m),
        Pricing::Ranges { ranges } => pick_range(ranges, 0)
            .or_else(|| ranges.first())
            .map(|range| range.output_per_m),
        Pricing::Openrouter { slug } => oracle.rates_per_million(slug).map(|r| r.output_per_m),
    }?;
    Some(output_per_m / 1000.0 * (1.0 - discount.clamp(0.0, 1.0)))
}

fn linear_cost(
    usage: &UnifiedUsage,
    input_per_m: f64,
    output_per_m: f64,
    cached_per_m: Option<f64>,
) -> f64 {
    let input = usage.input_tokens as f64 / 1e6 * input_per_m;
    let output = usage.output_tokens as f64 / 1e6 * output_per_m;
    let cached = usage.cache_read_tokens as f64 / 1e6 * cached_per_m.unwrap_or(0.0);
    input + output + cached
}

fn pick_range(ranges: &[PriceRange], input_tokens: u64) -> Option<&PriceRange> {
    ranges.iter().find(|range| range.contains(input_tokens))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64, cached: u64) -> UnifiedUsage {
        UnifiedUsage {
            input_tokens: input,
            output_tokens: output,
            cache_read_tokens: cached,
            ..Default::default()
        }
    }

    #[test]
    fn simple_pricing_with_discount() {
        let pricing = Pricing::Simple {
            input_per_m: 3.0,
            output_per_m: 15.0,
            cached_per_m: Some(0.3),
        };
        let outcome = compute_cost(
            &pricing,
            0.5,
            &usage(1_000_000, 100_000, 2_000_000),
            &StaticPricingOracle::default(),
        );
        // (3.0 + 1.5 + 0.6) * 0.5
        assert!((outcome.cost_usd - 2.55).abs() < 1e-9);
        assert!(!outcome.pricing_unknown);
    }

    #[test]
    fn range_pricing_picks_the_matching_tier() {
        let pricing = Pricing::Ranges {
            ranges: vec![
                PriceRange {
                    lower_bound: 0,
                    upper_bound: Some(200_000),
                    input_per_m: 1.25,
                    output_per_m: 10.0,
                    cached_per_m: None,
                },
                PriceRange {
                    lower_bound: 200_000,
                    upper_bound: Some(0),
                    input_per_m: 2.5,
                    output_per_m: 15.0,
                    cached_per_m: None,
                },
            ],
        };
        let oracle = StaticPricingOracle::default();
        let small = compute_cost(&pricing, 0.0, &usage(100_000, 0, 0), &oracle);
        assert!((small.cost_usd - 0.125).abs() < 1e-9);
        let large = compute_cost(&pricing, 0.0, &usage(300_000, 0, 0), &oracle);
        assert!((large.cost_usd - 0.75).abs() < 1e-9);
    }

    #[test]
    fn openrouter_miss_costs_zero_and_is_tagged() {
        let pricing = Pricing::Openrouter {
            slug: "vendor/unknown".into(),
        };
        let outcome = compute_cost(
            &pricing,
            0.0,
            &usage(1000, 1000, 0),
            &StaticPricingOracle::default(),
        );
        assert_eq!(outcome.cost_usd, 0.0);
        assert!(outcome.pricing_unknown);
    }

    #[test]
    fn cost_never_goes_negative() {
        let pricing = Pricing::Simple {
            input_per_m: 1.0,
            output_per_m: 1.0,
            cached_per_m: None,
        };
        let outcome = compute_cost(
            &pricing,
            1.0,
            &usage(10, 10, 0),
            &StaticPricingOracle::default(),
        );
        assert_eq!(outcome.cost_usd, 0.0);
    }
}
