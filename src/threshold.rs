use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

pub const APPROACHING_PERCENT: f64 = 80.0;
pub const NEAR_PERCENT: f64 = 95.0;
pub const REACHED_PERCENT: f64 = 100.0;

/// Usage relative to the daily limit. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Normal,
    Approaching,
    Near,
    Reached,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Normal => "normal",
            Tier::Approaching => "approaching",
            Tier::Near => "near",
            Tier::Reached => "reached",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(Tier::Normal),
            "approaching" => Some(Tier::Approaching),
            "near" => Some(Tier::Near),
            "reached" => Some(Tier::Reached),
            _ => None,
        }
    }

    pub fn is_warning(&self) -> bool {
        *self != Tier::Normal
    }
}

/// Classifies usage against a limit. Returns the percentage used and its tier.
pub fn classify(usage_minutes: u32, limit_minutes: NonZeroU32) -> (f64, Tier) {
    let percent = 100.0 * f64::from(usage_minutes) / f64::from(limit_minutes.get());
    let tier = if percent >= REACHED_PERCENT {
        Tier::Reached
    } else if percent >= NEAR_PERCENT {
        Tier::Near
    } else if percent >= APPROACHING_PERCENT {
        Tier::Approaching
    } else {
        Tier::Normal
    };
    (percent, tier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(minutes: u32) -> NonZeroU32 {
        NonZeroU32::new(minutes).unwrap()
    }

    #[test]
    fn test_boundaries() {
        assert_eq!(classify(0, limit(100)).1, Tier::Normal);
        assert_eq!(classify(79, limit(100)).1, Tier::Normal);
        assert_eq!(classify(80, limit(100)).1, Tier::Approaching);
        assert_eq!(classify(94, limit(100)).1, Tier::Approaching);
        assert_eq!(classify(95, limit(100)).1, Tier::Near);
        assert_eq!(classify(99, limit(100)).1, Tier::Near);
        assert_eq!(classify(100, limit(100)).1, Tier::Reached);
        assert_eq!(classify(250, limit(100)).1, Tier::Reached);
    }

    #[test]
    fn test_approaching_at_fifty_of_sixty() {
        let (percent, tier) = classify(50, limit(60));
        assert_eq!(tier, Tier::Approaching);
        assert!((percent - 83.333).abs() < 0.01);
    }

    #[test]
    fn test_percent_is_exact_ratio() {
        for limit_minutes in [1u32, 7, 60, 90, 600] {
            for usage in 0..=limit_minutes * 2 {
                let (percent, _) = classify(usage, limit(limit_minutes));
                assert_eq!(percent, 100.0 * usage as f64 / limit_minutes as f64);
            }
        }
    }

    #[test]
    fn test_tier_monotonic_in_usage() {
        for limit_minutes in [1u32, 3, 20, 60, 121] {
            let mut previous = Tier::Normal;
            for usage in 0..=limit_minutes * 3 {
                let (_, tier) = classify(usage, limit(limit_minutes));
                assert!(tier >= previous, "tier fell from {previous:?} to {tier:?}");
                previous = tier;
            }
        }
    }

    #[test]
    fn test_tier_names_round_trip() {
        for tier in [Tier::Normal, Tier::Approaching, Tier::Near, Tier::Reached] {
            assert_eq!(Tier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(Tier::parse("unknown"), None);
    }
}
