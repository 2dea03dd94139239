//! In-memory gateways for integration testing.
//!
//! Deterministic `FleetGateway`, `PoolStatsGateway` and `Notifier`
//! implementations that record every call. State lives behind
//! `Arc<Mutex<..>>` so tests can steer and inspect it while the
//! orchestrator owns the gateway.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rigswitch::engine::{ControllerConfig, InstanceOrchestrator, MiningController, OrchestratorConfig};
use rigswitch::fleet::FleetGateway;
use rigswitch::notify::{Notifications, Notifier};
use rigswitch::pool::PoolStatsGateway;
use rigswitch::strategy::{CoinRanker, ProfitConfig, ProfitEstimator, SwitchConfig};
use rigswitch::types::*;

pub const STOP_COMMAND: &str = "pkill -f miner || true";

pub fn coin(name: &str, usd_per_mh: f64) -> CoinProfile {
    CoinProfile {
        name: name.to_string(),
        algorithm: "kawpow".to_string(),
        usd_per_mh,
        expected_hashrate_mh: 50.0,
        expected_power_w: 150.0,
        pool_fee: 0.01,
    }
}

pub fn offer(id: &str, price_per_hour: f64) -> GpuOffer {
    GpuOffer {
        id: id.to_string(),
        gpu_name: "RTX 3080".to_string(),
        vram_gb: 10.0,
        price_per_hour,
    }
}

// ---------------------------------------------------------------------------
// Fleet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FleetCall {
    FindOffers,
    Rent(String),
    Exec(String, String),
    Status(String),
    Terminate(String),
}

/// A fleet whose offers, statuses, and telemetry are set by the test.
#[derive(Clone, Default)]
pub struct FakeFleet {
    offers: Arc<Mutex<Vec<GpuOffer>>>,
    statuses: Arc<Mutex<HashMap<String, String>>>,
    telemetry: Arc<Mutex<(f64, f64)>>,
    calls: Arc<Mutex<Vec<FleetCall>>>,
    /// Exec commands containing this text fail.
    failing_exec: Arc<Mutex<Option<String>>>,
    next_id: Arc<Mutex<u32>>,
}

impl FakeFleet {
    pub fn new(offers: Vec<GpuOffer>) -> Self {
        let fleet = Self::default();
        *fleet.offers.lock().unwrap() = offers;
        fleet.set_telemetry(500.0, 150.0);
        fleet
    }

    pub fn set_offers(&self, offers: Vec<GpuOffer>) {
        *self.offers.lock().unwrap() = offers;
    }

    pub fn set_status(&self, instance_id: &str, state: &str) {
        self.statuses
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), state.to_string());
    }

    pub fn set_telemetry(&self, hashrate_mh: f64, power_w: f64) {
        *self.telemetry.lock().unwrap() = (hashrate_mh, power_w);
    }

    pub fn fail_exec_containing(&self, needle: &str) {
        *self.failing_exec.lock().unwrap() = Some(needle.to_string());
    }

    pub fn calls(&self) -> Vec<FleetCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn execs(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                FleetCall::Exec(id, cmd) => Some((id, cmd)),
                _ => None,
            })
            .collect()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                FleetCall::Terminate(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: FleetCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl FleetGateway for FakeFleet {
    async fn find_offers(&self, min_ram_gb: f64, max_price: f64) -> Result<Vec<GpuOffer>> {
        self.record(FleetCall::FindOffers);
        Ok(self
            .offers
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.vram_gb >= min_ram_gb && o.price_per_hour <= max_price)
            .cloned()
            .collect())
    }

    async fn rent(&self, offer: &GpuOffer) -> Result<MiningInstance> {
        self.record(FleetCall::Rent(offer.id.clone()));
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("inst-{}", *next)
        };
        self.set_status(&id, "running");
        Ok(MiningInstance::renting(id, offer.id.clone()))
    }

    async fn exec(&self, instance_id: &str, command: &str) -> Result<serde_json::Value> {
        self.record(FleetCall::Exec(instance_id.to_string(), command.to_string()));
        if let Some(needle) = self.failing_exec.lock().unwrap().as_deref() {
            if command.contains(needle) {
                return Err(anyhow!("exec failed: {command}"));
            }
        }
        let (hashrate, power) = *self.telemetry.lock().unwrap();
        Ok(serde_json::json!({ "hashrate": hashrate, "power": power }))
    }

    async fn get_status(&self, instance_id: &str) -> Result<InstanceStatus> {
        self.record(FleetCall::Status(instance_id.to_string()));
        let state = self
            .statuses
            .lock()
            .unwrap()
            .get(instance_id)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        Ok(InstanceStatus { state })
    }

    async fn terminate(&self, instance_id: &str) -> Result<bool> {
        self.record(FleetCall::Terminate(instance_id.to_string()));
        self.set_status(instance_id, "exited");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

pub struct FakePool;

#[async_trait]
impl PoolStatsGateway for FakePool {
    fn build_start_command(&self, coin: &CoinProfile) -> String {
        format!("start-miner {}", coin.name)
    }

    async fn get_pool_stats(&self, _coin_name: &str) -> Result<PoolStats> {
        Ok(PoolStats::default())
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<String>>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub fleet: FakeFleet,
    pub notifier: RecordingNotifier,
    pub orchestrator: InstanceOrchestrator,
}

pub fn harness(offers: Vec<GpuOffer>, coins: Vec<CoinProfile>) -> Harness {
    let fleet = FakeFleet::new(offers);
    let notifier = RecordingNotifier::default();
    let gateway: Arc<dyn FleetGateway> = Arc::new(fleet.clone());

    let orchestrator = InstanceOrchestrator::new(
        gateway.clone(),
        MiningController::new(gateway, Arc::new(FakePool), ControllerConfig::default()),
        CoinRanker::new(coins, SwitchConfig::default()),
        ProfitEstimator::new(ProfitConfig::default()),
        Notifications::new(Box::new(notifier.clone()), Duration::from_secs(1)),
        OrchestratorConfig::default(),
    );

    Harness { fleet, notifier, orchestrator }
}
