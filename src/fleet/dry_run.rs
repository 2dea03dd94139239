//! In-memory fleet for dry runs.
//!
//! Returns one fixed offer, rents instantly with generated ids, reports every
//! rented instance as running until terminated, and answers every exec with
//! simulated miner telemetry. Nothing leaves the process.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::info;

use super::FleetGateway;
use crate::types::{GpuOffer, InstanceStatus, LivePerformance, MiningInstance};

pub struct DryRunFleet {
    offer: GpuOffer,
    performance: LivePerformance,
    live: Mutex<HashSet<String>>,
}

impl DryRunFleet {
    pub fn new(performance: LivePerformance) -> Self {
        Self {
            offer: GpuOffer {
                id: "mock-offer-1".to_string(),
                gpu_name: "RTX 3080".to_string(),
                vram_gb: 10.0,
                price_per_hour: 0.35,
            },
            performance,
            live: Mutex::new(HashSet::new()),
        }
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // A poisoned set is still a valid set of ids.
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for DryRunFleet {
    fn default() -> Self {
        Self::new(LivePerformance { hashrate_mh: 50.0, power_w: 150.0 })
    }
}

#[async_trait]
impl FleetGateway for DryRunFleet {
    async fn find_offers(&self, min_ram_gb: f64, max_price: f64) -> Result<Vec<GpuOffer>> {
        if self.offer.vram_gb >= min_ram_gb && self.offer.price_per_hour <= max_price {
            Ok(vec![self.offer.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn rent(&self, offer: &GpuOffer) -> Result<MiningInstance> {
        let id = format!("dry-run-{}", uuid::Uuid::new_v4());
        self.live().insert(id.clone());
        info!(instance_id = %id, offer_id = %offer.id, "[DRY RUN] Rented instance");
        Ok(MiningInstance::renting(id, offer.id.clone()))
    }

    async fn exec(&self, instance_id: &str, command: &str) -> Result<serde_json::Value> {
        if !self.live().contains(instance_id) {
            bail!("dry-run instance {instance_id} does not exist");
        }
        info!(instance_id, command, "[DRY RUN] exec");
        Ok(serde_json::json!({
            "ok": true,
            "hashrate": self.performance.hashrate_mh,
            "power": self.performance.power_w,
        }))
    }

    async fn get_status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let state = if self.live().contains(instance_id) { "running" } else { "exited" };
        Ok(InstanceStatus { state: state.to_string() })
    }

    async fn terminate(&self, instance_id: &str) -> Result<bool> {
        let removed = self.live().remove(instance_id);
        info!(instance_id, removed, "[DRY RUN] terminate");
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_respects_limits() {
        let fleet = DryRunFleet::default();
        assert_eq!(fleet.find_offers(8.0, 0.5).await.unwrap().len(), 1);
        assert!(fleet.find_offers(16.0, 0.5).await.unwrap().is_empty());
        assert!(fleet.find_offers(8.0, 0.2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rent_exec_terminate_cycle() {
        let fleet = DryRunFleet::default();
        let offer = fleet.find_offers(8.0, 0.5).await.unwrap().remove(0);
        let inst = fleet.rent(&offer).await.unwrap();
        assert!(inst.id.starts_with("dry-run-"));
        assert!(fleet.get_status(&inst.id).await.unwrap().is_running());

        let out = fleet.exec(&inst.id, "echo hi").await.unwrap();
        let perf = LivePerformance::from_exec_output(&out).unwrap();
        assert_eq!(perf.hashrate_mh, 50.0);

        assert!(fleet.terminate(&inst.id).await.unwrap());
        assert!(!fleet.get_status(&inst.id).await.unwrap().is_running());
        assert!(fleet.exec(&inst.id, "echo hi").await.is_err());
    }
}
