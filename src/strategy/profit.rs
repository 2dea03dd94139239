//! Profit estimation.
//!
//! Expected profit is derived from a coin's configured estimates; actual
//! profit from live telemetry. Live telemetry carries no coin identity, so
//! actual profit uses a flat `assumed_usd_per_mh` and `pool_fee` from this
//! estimator's own configuration rather than the coin profile.

use tracing::debug;

use crate::types::{CoinProfile, GpuOffer, LivePerformance, ProfitSnapshot};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProfitConfig {
    /// Electricity price in USD per kWh.
    pub energy_cost_per_kwh: f64,
    /// Fallback revenue rate applied to live hashrate.
    pub assumed_usd_per_mh: f64,
    /// Fallback pool fee applied to live revenue.
    pub pool_fee: f64,
}

impl Default for ProfitConfig {
    fn default() -> Self {
        Self {
            energy_cost_per_kwh: 0.10,
            assumed_usd_per_mh: 0.001,
            pool_fee: 0.01,
        }
    }
}

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

pub struct ProfitEstimator {
    config: ProfitConfig,
}

impl ProfitEstimator {
    pub fn new(config: ProfitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProfitConfig {
        &self.config
    }

    /// Expected hourly economics of mining `coin` on `offer` at `rental_price`.
    pub fn expected_profit(&self, offer: &GpuOffer, coin: &CoinProfile, rental_price: f64) -> ProfitSnapshot {
        let snapshot = self.snapshot(
            coin.expected_hashrate_mh,
            coin.usd_per_mh,
            coin.expected_power_w,
            coin.pool_fee,
            rental_price,
        );

        debug!(
            offer_id = %offer.id,
            gpu = %offer.gpu_name,
            coin = %coin.name,
            net = format!("${:.4}", snapshot.net_profit_per_hour),
            "Expected profit"
        );

        snapshot
    }

    /// Actual hourly economics from live telemetry.
    pub fn actual_profit(&self, instance_id: &str, performance: &LivePerformance, rental_cost: f64) -> ProfitSnapshot {
        let snapshot = self.snapshot(
            performance.hashrate_mh,
            self.config.assumed_usd_per_mh,
            performance.power_w,
            self.config.pool_fee,
            rental_cost,
        );

        debug!(
            instance_id,
            performance = %performance,
            net = format!("${:.4}", snapshot.net_profit_per_hour),
            "Actual profit"
        );

        snapshot
    }

    fn snapshot(
        &self,
        hashrate_mh: f64,
        usd_per_mh: f64,
        power_w: f64,
        pool_fee: f64,
        rental_cost: f64,
    ) -> ProfitSnapshot {
        let revenue_per_hour = hashrate_mh * usd_per_mh;
        let energy_cost_per_hour = (power_w / 1000.0) * self.config.energy_cost_per_kwh;
        let net_profit_per_hour = revenue_per_hour * (1.0 - pool_fee) - energy_cost_per_hour - rental_cost;

        ProfitSnapshot {
            revenue_per_hour,
            energy_cost_per_hour,
            rental_cost_per_hour: rental_cost,
            net_profit_per_hour,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
