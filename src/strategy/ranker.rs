//! Coin ranking and switch hysteresis.
//!
//! Ranks the configured coins by estimated USD/MH and decides whether a
//! running instance should move to a better coin. The switch gate compares
//! static `usd_per_mh` estimates only; live profit is accepted for logging
//! but deliberately not part of the rule.

use tracing::debug;

use crate::types::CoinProfile;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Absorbs float representation error so a delta that is exactly
/// `min_delta` on paper (e.g. 0.03 - 0.01) still passes the gate.
const DELTA_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// Minimum USD/MH advantage the best coin needs over the current one.
    pub min_delta: f64,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self { min_delta: 0.02 }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Outcome of a switch check.
#[derive(Debug, Clone, PartialEq)]
pub enum SwitchDecision {
    /// Keep mining the current coin (or nothing to compare against).
    Keep,
    /// Move the instance to this coin.
    SwitchTo(CoinProfile),
}

// ---------------------------------------------------------------------------
// Ranker
// ---------------------------------------------------------------------------

pub struct CoinRanker {
    coins: Vec<CoinProfile>,
    config: SwitchConfig,
}

impl CoinRanker {
    /// `coins` keeps configuration order, which is the tie-break order.
    pub fn new(coins: Vec<CoinProfile>, config: SwitchConfig) -> Self {
        Self { coins, config }
    }

    pub fn coins(&self) -> &[CoinProfile] {
        &self.coins
    }

    /// Replace the coin set with freshly loaded profiles.
    pub fn set_coins(&mut self, coins: Vec<CoinProfile>) {
        self.coins = coins;
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    /// The coin with the highest `usd_per_mh`; the first one wins ties.
    /// `None` when no coins are configured.
    pub fn rank(&self) -> Option<&CoinProfile> {
        let mut best: Option<&CoinProfile> = None;
        for coin in &self.coins {
            match best {
                Some(b) if coin.usd_per_mh <= b.usd_per_mh => {}
                _ => best = Some(coin),
            }
        }
        best
    }

    /// Decide whether an instance mining `current` should switch.
    ///
    /// Never switches without a current coin. Otherwise switches only when
    /// the ranked best coin has a different name and beats the current
    /// `usd_per_mh` by at least `min_delta`.
    pub fn should_switch(&self, current: Option<&CoinProfile>, current_profit: f64) -> SwitchDecision {
        let (Some(current), Some(best)) = (current, self.rank()) else {
            return SwitchDecision::Keep;
        };

        if best.name == current.name {
            return SwitchDecision::Keep;
        }

        let delta = best.usd_per_mh - current.usd_per_mh;
        if delta + DELTA_TOLERANCE >= self.config.min_delta {
            debug!(
                current = %current.name,
                best = %best.name,
                delta,
                current_profit,
                "Switch gate passed"
            );
            SwitchDecision::SwitchTo(best.clone())
        } else {
            debug!(
                current = %current.name,
                best = %best.name,
                delta,
                min_delta = self.config.min_delta,
                "Best coin below switch margin"
            );
            SwitchDecision::Keep
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ranker(coins: &[(&str, f64)], min_delta: f64) -> CoinRanker {
        CoinRanker::new(
            coins.iter().map(|(n, u)| CoinProfile::sample(n, *u)).collect(),
            SwitchConfig { min_delta },
        )
    }

    #[test]
    fn test_rank_picks_highest() {
        let r = ranker(&[("A", 0.002), ("B", 0.0025), ("C", 0.001)], 0.02);
        assert_eq!(r.rank().unwrap().name, "B");
    }

    #[test]
    fn test_rank_empty_is_none() {
        let r = ranker(&[], 0.02);
        assert!(r.rank().is_none());
    }

    #[test]
    fn test_rank_tie_keeps_first() {
        let r = ranker(&[("A", 0.003), ("B", 0.003), ("C", 0.001)], 0.02);
        assert_eq!(r.rank().unwrap().name, "A");
    }

    #[test]
    fn test_small_delta_does_not_switch() {
        let r = ranker(&[("A", 0.002), ("B", 0.0025)], 0.02);
        let current = CoinProfile::sample("A", 0.002);
        assert_eq!(r.rank().unwrap().name, "B");
        assert_eq!(r.should_switch(Some(&current), 1.0), SwitchDecision::Keep);
    }

    #[test]
    fn test_large_delta_switches() {
        let r = ranker(&[("A", 0.002), ("B", 0.03)], 0.02);
        let current = CoinProfile::sample("A", 0.002);
        match r.should_switch(Some(&current), 0.0) {
            SwitchDecision::SwitchTo(target) => assert_eq!(target.name, "B"),
            other => panic!("expected switch, got {other:?}"),
        }
    }

    #[test]
    fn test_same_name_never_switches() {
        // Current profile is stale: same name, much lower estimate.
        let r = ranker(&[("A", 0.5), ("B", 0.001)], 0.02);
        let current = CoinProfile::sample("A", 0.0);
        assert_eq!(r.should_switch(Some(&current), -5.0), SwitchDecision::Keep);
    }

    #[test]
    fn test_no_current_never_switches() {
        let r = ranker(&[("A", 0.5)], 0.02);
        assert_eq!(r.should_switch(None, 0.0), SwitchDecision::Keep);
    }

    #[test]
    fn test_delta_equal_to_min_switches() {
        let r = ranker(&[("A", 0.01), ("B", 0.03)], 0.02);
        let current = CoinProfile::sample("A", 0.01);
        assert!(matches!(r.should_switch(Some(&current), 0.0), SwitchDecision::SwitchTo(_)));
    }

    #[test]
    fn test_delta_just_below_min_keeps() {
        let r = ranker(&[("A", 0.01), ("B", 0.0299)], 0.02);
        let current = CoinProfile::sample("A", 0.01);
        assert_eq!(r.should_switch(Some(&current), 0.0), SwitchDecision::Keep);
    }

    #[test]
    fn test_current_profit_ignored_by_gate() {
        let r = ranker(&[("A", 0.002), ("B", 0.03)], 0.02);
        let current = CoinProfile::sample("A", 0.002);
        assert!(matches!(r.should_switch(Some(&current), 1000.0), SwitchDecision::SwitchTo(_)));
        assert!(matches!(r.should_switch(Some(&current), -1000.0), SwitchDecision::SwitchTo(_)));
    }
}
