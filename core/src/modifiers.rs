//! Time and probability multipliers for one attempt.
//!
//! Two independent products, each combined in a fixed order:
//!   1. group-size band matching the acting group (first match, else 1.0)
//!   2. every capability modifier the player holds, in listed order
//! The band product is multiplied by the modifier product, never the reverse.

use crate::snapshot::{CapabilityModifier, GroupSizeBand};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Multipliers {
    pub time: f64,
    pub probability: f64,
}

impl Multipliers {
    pub const NEUTRAL: Multipliers = Multipliers {
        time: 1.0,
        probability: 1.0,
    };
}

pub struct GroupScalingBandSelector;

impl GroupScalingBandSelector {
    pub fn select(bands: &[GroupSizeBand], group_size: u32) -> Option<&GroupSizeBand> {
        bands
            .iter()
            .find(|b| b.min_size <= group_size && group_size <= b.max_size)
    }
}

pub struct ModifierApplicator;

impl ModifierApplicator {
    /// Product of every modifier whose capability the player holds.
    pub fn capability_product(
        modifiers: &[CapabilityModifier],
        capabilities: &[String],
    ) -> Multipliers {
        let mut product = Multipliers::NEUTRAL;
        for modifier in modifiers {
            if !capabilities.iter().any(|c| c == &modifier.capability_key) {
                continue;
            }
            if let Some(t) = modifier.time_multiplier {
                product.time *= t;
            }
            if let Some(p) = modifier.probability_multiplier {
                product.probability *= p;
            }
        }
        product
    }

    pub fn combine(
        bands: &[GroupSizeBand],
        group_size: u32,
        modifiers: &[CapabilityModifier],
        capabilities: &[String],
    ) -> Multipliers {
        let group = GroupScalingBandSelector::select(bands, group_size)
            .map(|b| Multipliers {
                time: b.time_multiplier,
                probability: b.probability_multiplier,
            })
            .unwrap_or(Multipliers::NEUTRAL);
        let capability = Self::capability_product(modifiers, capabilities);
        Multipliers {
            time: group.time * capability.time,
            probability: group.probability * capability.probability,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(min: u32, max: u32, time: f64, prob: f64) -> GroupSizeBand {
        GroupSizeBand {
            min_size: min,
            max_size: max,
            time_multiplier: time,
            probability_multiplier: prob,
        }
    }

    fn modifier(cap: &str, time: Option<f64>, prob: Option<f64>) -> CapabilityModifier {
        CapabilityModifier {
            capability_key: cap.into(),
            time_multiplier: time,
            probability_multiplier: prob,
        }
    }

    #[test]
    fn first_matching_band_wins() {
        let bands = vec![band(1, 2, 1.0, 1.0), band(2, 4, 0.8, 1.2), band(5, 8, 0.6, 1.5)];
        assert_eq!(GroupScalingBandSelector::select(&bands, 2).unwrap().time_multiplier, 1.0);
        assert_eq!(GroupScalingBandSelector::select(&bands, 3).unwrap().time_multiplier, 0.8);
        assert!(GroupScalingBandSelector::select(&bands, 9).is_none());
    }

    #[test]
    fn only_held_capabilities_apply() {
        let mods = vec![
            modifier("quest_a", Some(0.5), None),
            modifier("item_b", None, Some(2.0)),
        ];
        let held = vec!["item_b".to_string()];
        let m = ModifierApplicator::capability_product(&mods, &held);
        assert_eq!(m.time, 1.0);
        assert_eq!(m.probability, 2.0);
    }

    #[test]
    fn band_and_capability_products_multiply() {
        let bands = vec![band(2, 4, 0.8, 1.25)];
        let mods = vec![modifier("a", Some(0.5), Some(2.0))];
        let held = vec!["a".to_string()];
        let m = ModifierApplicator::combine(&bands, 3, &mods, &held);
        assert!((m.time - 0.4).abs() < 1e-12);
        assert!((m.probability - 2.5).abs() < 1e-12);

        let solo = ModifierApplicator::combine(&bands, 1, &mods, &[]);
        assert_eq!(solo, Multipliers::NEUTRAL);
    }
}
