//! Quota pricing.
//!
//! Quota is an integer unit. A fixed-price model costs
//! `price × quota_per_unit × group_ratio` per call; a ratio-priced model costs
//! `(prompt + completion × completion_ratio) × model_ratio × group_ratio`.

use gateway_config::{PricingConfig, QuotaConfig};
use gateway_core::{PricingBasis, Usage};
use tracing::debug;

/// Pricing tables plus the unit scale
#[derive(Debug, Clone)]
pub struct Pricing {
    tables: PricingConfig,
    quota_per_unit: f64,
    pre_consumed_tokens: u32,
}

impl Default for Pricing {
    fn default() -> Self {
        Self::new(PricingConfig::default(), &QuotaConfig::default())
    }
}

impl Pricing {
    /// Create pricing from config
    #[must_use]
    pub fn new(tables: PricingConfig, quota: &QuotaConfig) -> Self {
        Self {
            tables,
            quota_per_unit: quota.quota_per_unit,
            pre_consumed_tokens: quota.pre_consumed_tokens,
        }
    }

    /// Quota units per currency unit
    #[must_use]
    pub fn quota_per_unit(&self) -> f64 {
        self.quota_per_unit
    }

    /// Group discount ratio, 1.0 for unknown groups
    #[must_use]
    pub fn group_ratio(&self, group: &str) -> f64 {
        self.tables.group_ratios.get(group).copied().unwrap_or(1.0)
    }

    /// Pricing basis for `model` in `group`.
    ///
    /// A fixed price wins over a ratio when both are configured.
    #[must_use]
    pub fn basis_for(&self, model: &str, group: &str) -> PricingBasis {
        let group_ratio = self.group_ratio(group);

        if let Some(price) = self.tables.model_prices.get(model) {
            return PricingBasis::Fixed {
                price: *price,
                group_ratio,
            };
        }

        let model_ratio = match self.tables.model_ratios.get(model) {
            Some(ratio) => *ratio,
            None => {
                debug!(model = %model, ratio = self.tables.default_model_ratio, "Model ratio not configured, using default");
                self.tables.default_model_ratio
            }
        };
        let completion_ratio = self
            .tables
            .completion_ratios
            .get(model)
            .copied()
            .unwrap_or(1.0);

        PricingBasis::Ratio {
            model_ratio,
            completion_ratio,
            group_ratio,
        }
    }

    /// Tokens assumed for a reservation: prompt plus `max_tokens` when the
    /// caller bounded the completion, the configured default otherwise
    #[must_use]
    pub fn assumed_tokens(&self, prompt_tokens: u32, max_tokens: Option<u32>) -> u32 {
        match max_tokens {
            Some(max) if max > 0 => prompt_tokens.saturating_add(max),
            _ => self.pre_consumed_tokens,
        }
    }

    /// Quota to reserve before dispatch
    #[must_use]
    pub fn estimate(&self, basis: &PricingBasis, assumed_tokens: u32) -> i64 {
        match *basis {
            PricingBasis::Fixed { price, group_ratio } => {
                (price * self.quota_per_unit * group_ratio).round() as i64
            }
            PricingBasis::Ratio {
                model_ratio,
                group_ratio,
                ..
            } => (f64::from(assumed_tokens) * model_ratio * group_ratio) as i64,
        }
    }

    /// Quota owed for reported usage.
    ///
    /// A non-zero ratio with non-zero usage always costs at least one unit.
    #[must_use]
    pub fn cost(&self, basis: &PricingBasis, usage: &Usage) -> i64 {
        match *basis {
            PricingBasis::Fixed { price, group_ratio } => {
                (price * self.quota_per_unit * group_ratio).round() as i64
            }
            PricingBasis::Ratio {
                model_ratio,
                completion_ratio,
                group_ratio,
            } => {
                if usage.is_empty() {
                    return 0;
                }
                let ratio = model_ratio * group_ratio;
                let weighted_tokens = f64::from(usage.prompt_tokens)
                    + f64::from(usage.completion_tokens) * completion_ratio;
                let quota = (weighted_tokens * ratio) as i64;
                if ratio > 0.0 && quota <= 0 {
                    1
                } else {
                    quota
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pricing() -> Pricing {
        let mut tables = PricingConfig::default();
        tables.model_prices = HashMap::from([("flat-model".to_string(), 0.002)]);
        tables.model_ratios.insert("gpt-4".to_string(), 15.0);
        tables.completion_ratios.insert("gpt-4".to_string(), 2.0);
        tables.group_ratios.insert("vip".to_string(), 0.5);
        Pricing::new(tables, &QuotaConfig::default())
    }

    #[test]
    fn test_fixed_price_reservation_and_settlement_match() {
        let pricing = pricing();
        let basis = pricing.basis_for("flat-model", "default");
        assert!(matches!(basis, PricingBasis::Fixed { .. }));

        let estimate = pricing.estimate(&basis, 500);
        assert_eq!(estimate, 1_000);

        let actual = pricing.cost(&basis, &Usage::new(123, 456));
        assert_eq!(actual - estimate, 0);
    }

    #[test]
    fn test_ratio_estimate() {
        let pricing = pricing();
        let basis = pricing.basis_for("gpt-4", "default");
        assert_eq!(pricing.estimate(&basis, 500), 7_500);

        let vip = pricing.basis_for("gpt-4", "vip");
        assert_eq!(pricing.estimate(&vip, 500), 3_750);
    }

    #[test]
    fn test_ratio_cost_uses_completion_ratio() {
        let pricing = pricing();
        let basis = pricing.basis_for("gpt-4", "default");
        // (100 + 50 * 2) * 15
        assert_eq!(pricing.cost(&basis, &Usage::new(100, 50)), 3_000);
        assert_eq!(pricing.cost(&basis, &Usage::default()), 0);
    }

    #[test]
    fn test_minimum_charge_of_one() {
        let mut tables = PricingConfig::default();
        tables.model_ratios.insert("cheap".to_string(), 0.0001);
        let pricing = Pricing::new(tables, &QuotaConfig::default());
        let basis = pricing.basis_for("cheap", "default");
        assert_eq!(pricing.cost(&basis, &Usage::new(1, 1)), 1);
    }

    #[test]
    fn test_unknown_model_uses_default_ratio() {
        let pricing = pricing();
        match pricing.basis_for("never-heard-of-it", "nogroup") {
            PricingBasis::Ratio {
                model_ratio,
                completion_ratio,
                group_ratio,
            } => {
                assert!((model_ratio - 30.0).abs() < f64::EPSILON);
                assert!((completion_ratio - 1.0).abs() < f64::EPSILON);
                assert!((group_ratio - 1.0).abs() < f64::EPSILON);
            }
            PricingBasis::Fixed { .. } => panic!("expected ratio pricing"),
        }
    }

    #[test]
    fn test_assumed_tokens() {
        let pricing = pricing();
        assert_eq!(pricing.assumed_tokens(40, Some(100)), 140);
        assert_eq!(pricing.assumed_tokens(40, None), 500);
        assert_eq!(pricing.assumed_tokens(40, Some(0)), 500);
    }
}
