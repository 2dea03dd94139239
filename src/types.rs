//! Shared types for the rigswitch agent.
//!
//! These types form the data model used across all modules. Gateways
//! produce offers, instances and status payloads; the strategy layer turns
//! them into profit snapshots; the engine owns the active-instance records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Coins
// ---------------------------------------------------------------------------

/// Static economic and algorithmic parameters for a mineable coin.
///
/// Immutable for the duration of a cycle; sourced from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinProfile {
    pub name: String,
    pub algorithm: String,
    /// Estimated revenue in USD per MH/s per hour.
    #[serde(default)]
    pub usd_per_mh: f64,
    #[serde(default = "default_hashrate_mh")]
    pub expected_hashrate_mh: f64,
    #[serde(default = "default_power_w")]
    pub expected_power_w: f64,
    /// Pool fee as a fraction (0.01 = 1%).
    #[serde(default = "default_pool_fee")]
    pub pool_fee: f64,
}

fn default_hashrate_mh() -> f64 {
    50.0
}

fn default_power_w() -> f64 {
    150.0
}

fn default_pool_fee() -> f64 {
    0.01
}

impl fmt::Display for CoinProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) ${:.4}/MH {:.0}MH/s {:.0}W fee={:.1}%",
            self.name,
            self.algorithm,
            self.usd_per_mh,
            self.expected_hashrate_mh,
            self.expected_power_w,
            self.pool_fee * 100.0,
        )
    }
}

impl CoinProfile {
    /// Helper to build a test coin with the defaults used in configuration.
    #[cfg(test)]
    pub fn sample(name: &str, usd_per_mh: f64) -> Self {
        CoinProfile {
            name: name.to_string(),
            algorithm: "kawpow".to_string(),
            usd_per_mh,
            expected_hashrate_mh: 50.0,
            expected_power_w: 150.0,
            pool_fee: 0.01,
        }
    }
}

// ---------------------------------------------------------------------------
// Offers & instances
// ---------------------------------------------------------------------------

/// A rentable GPU listing, prior to being rented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuOffer {
    pub id: String,
    pub gpu_name: String,
    pub vram_gb: f64,
    /// Total rental price in USD per hour.
    pub price_per_hour: f64,
}

impl fmt::Display for GpuOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {:.0}GB ${:.4}/h",
            self.id, self.gpu_name, self.vram_gb, self.price_per_hour,
        )
    }
}

/// Lifecycle state of a rented mining instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Renting,
    Provisioning,
    Running,
    SwitchingCoin,
    Stopping,
    Terminated,
}

impl InstanceState {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Renting, Provisioning)
                | (Renting, Terminated)
                | (Provisioning, Running)
                | (Provisioning, Terminated)
                | (Running, SwitchingCoin)
                | (Running, Stopping)
                | (Running, Terminated)
                | (SwitchingCoin, Running)
                | (SwitchingCoin, Stopping)
                | (SwitchingCoin, Terminated)
                | (Stopping, Terminated)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Renting => write!(f, "renting"),
            InstanceState::Provisioning => write!(f, "provisioning"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::SwitchingCoin => write!(f, "switching-coin"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Terminated => write!(f, "terminated"),
        }
    }
}

/// A rented compute resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningInstance {
    pub id: String,
    pub offer_id: String,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
}

impl MiningInstance {
    /// A freshly rented instance, not yet provisioned.
    pub fn renting(id: impl Into<String>, offer_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            offer_id: offer_id.into(),
            state: InstanceState::Renting,
            started_at: Utc::now(),
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: InstanceState) -> Result<(), RigError> {
        if !self.state.can_transition_to(next) {
            return Err(RigError::IllegalTransition {
                instance_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

impl fmt::Display for MiningInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (offer {}) {} since {}",
            self.id,
            self.offer_id,
            self.state,
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        )
    }
}

/// Provider-reported status of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub state: String,
}

impl InstanceStatus {
    pub fn running() -> Self {
        Self { state: "running".to_string() }
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Live telemetry from a miner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivePerformance {
    pub hashrate_mh: f64,
    pub power_w: f64,
}

impl LivePerformance {
    /// Extract telemetry from the opaque result of a remote exec.
    ///
    /// Accepts `{"hashrate": .., "power": ..}` directly, or the same object
    /// serialised inside an `output`/`stdout` string field, or a bare string.
    pub fn from_exec_output(value: &serde_json::Value) -> Result<Self, RigError> {
        if let Some(perf) = Self::from_object(value) {
            return Ok(perf);
        }

        let text = match value {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Object(map) => map
                .get("output")
                .or_else(|| map.get("stdout"))
                .and_then(|v| v.as_str()),
            _ => None,
        };

        text.and_then(|t| serde_json::from_str::<serde_json::Value>(t.trim()).ok())
            .as_ref()
            .and_then(Self::from_object)
            .ok_or_else(|| RigError::Telemetry(format!("no hashrate/power in exec output: {value}")))
    }

    fn from_object(value: &serde_json::Value) -> Option<Self> {
        let hashrate_mh = value.get("hashrate")?.as_f64()?;
        let power_w = value.get("power")?.as_f64()?;
        Some(Self { hashrate_mh, power_w })
    }
}

impl fmt::Display for LivePerformance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}MH/s @ {:.0}W", self.hashrate_mh, self.power_w)
    }
}

// ---------------------------------------------------------------------------
// Profit
// ---------------------------------------------------------------------------

/// Hourly economics of one instance. Recomputed every cycle; never retained.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfitSnapshot {
    pub revenue_per_hour: f64,
    pub energy_cost_per_hour: f64,
    pub rental_cost_per_hour: f64,
    /// Negative values trigger a forced stop.
    pub net_profit_per_hour: f64,
}

impl ProfitSnapshot {
    pub fn is_loss(&self) -> bool {
        self.net_profit_per_hour < 0.0
    }
}

impl fmt::Display for ProfitSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rev=${:.4}/h energy=${:.4}/h rent=${:.4}/h net=${:.4}/h",
            self.revenue_per_hour,
            self.energy_cost_per_hour,
            self.rental_cost_per_hour,
            self.net_profit_per_hour,
        )
    }
}

/// Everything the orchestrator knows about one rented instance.
#[derive(Debug, Clone)]
pub struct ActiveInstanceRecord {
    pub instance: MiningInstance,
    pub offer: GpuOffer,
    pub coin: CoinProfile,
    pub start_time: DateTime<Utc>,
    pub expected_profit: ProfitSnapshot,
    pub actual_profit: Option<ProfitSnapshot>,
}

impl ActiveInstanceRecord {
    pub fn new(instance: MiningInstance, offer: GpuOffer, coin: CoinProfile, expected: ProfitSnapshot) -> Self {
        Self {
            instance,
            offer,
            coin,
            start_time: Utc::now(),
            expected_profit: expected,
            actual_profit: None,
        }
    }

    /// Time the instance has been under management.
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.start_time
    }
}

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

/// Connection info for a coin's mining pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConnection {
    #[serde(default = "default_pool_url")]
    pub url: String,
    #[serde(default = "default_wallet")]
    pub wallet: String,
    #[serde(default = "default_worker")]
    pub worker: String,
}

fn default_pool_url() -> String {
    "stratum+tcp://example.com:3333".to_string()
}

fn default_wallet() -> String {
    "WALLET_ADDRESS".to_string()
}

fn default_worker() -> String {
    "worker1".to_string()
}

impl Default for PoolConnection {
    fn default() -> Self {
        Self {
            url: default_pool_url(),
            wallet: default_wallet(),
            worker: default_worker(),
        }
    }
}

impl PoolConnection {
    /// The `wallet.worker` login most pools expect.
    pub fn user(&self) -> String {
        format!("{}.{}", self.wallet, self.worker)
    }
}

/// Account statistics reported by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Current hashrate as seen by the pool, in MH/s.
    pub reported_hashrate: f64,
    /// Unpaid balance in the pool's base unit for the coin.
    pub unpaid_balance: f64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reported={:.2}MH/s unpaid={}",
            self.reported_hashrate, self.unpaid_balance,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for rigswitch.
#[derive(Debug, thiserror::Error)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fleet error ({provider}): {message}")]
    Fleet { provider: String, message: String },

    #[error("Pool error ({coin}): {message}")]
    Pool { coin: String, message: String },

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Miner error: {0}")]
    Miner(String),

    #[error("Instance {instance_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        instance_id: String,
        from: InstanceState,
        to: InstanceState,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
