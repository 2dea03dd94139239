//! Mining controller.
//!
//! Drives a single instance through rent → provision → miner start, and
//! performs the per-instance actions the orchestrator decides on: reading
//! telemetry, stopping the miner, switching coins, and tearing down.

use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::fleet::FleetGateway;
use crate::pool::PoolStatsGateway;
use crate::types::{CoinProfile, GpuOffer, InstanceState, LivePerformance, MiningInstance};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Shell commands run on rented instances.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub provision_command: String,
    /// Must print `{"hashrate": <MH/s>, "power": <W>}`.
    pub telemetry_command: String,
    pub stop_miner_command: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            provision_command: "echo provisioning && sleep 1".to_string(),
            telemetry_command: "echo '{\"hashrate\": 50, \"power\": 150}'".to_string(),
            stop_miner_command: "pkill -f miner || true".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rent failures
// ---------------------------------------------------------------------------

/// Step of `rent_and_mine` that failed after the rental succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RentStage {
    Provisioning,
    MinerStart,
}

impl fmt::Display for RentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RentStage::Provisioning => write!(f, "provisioning"),
            RentStage::MinerStart => write!(f, "miner start"),
        }
    }
}

/// Why `rent_and_mine` did not produce a mining instance.
#[derive(Debug, thiserror::Error)]
pub enum RentFailure {
    /// Nothing was rented; nothing is billing.
    #[error("offer {offer_id} could not be rented: {reason}")]
    Rejected { offer_id: String, reason: String },

    /// The rental exists and is billing, but is not mining. Not cleaned up.
    #[error("instance {instance_id} (offer {offer_id}) is rented but {stage} failed: {reason}")]
    Orphaned {
        instance_id: String,
        offer_id: String,
        stage: RentStage,
        reason: String,
    },
}

/// Why `switch_coin` did not move the instance to the new coin.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SwitchFailure {
    /// The previous coin is still being mined.
    #[error("switch failed, previous coin kept: {reason}")]
    Kept { reason: String },

    /// The old miner was stopped and nothing could be started again.
    #[error("switch failed and no miner is running: {reason}")]
    MinerDown { reason: String },
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct MiningController {
    fleet: Arc<dyn FleetGateway>,
    pool: Arc<dyn PoolStatsGateway>,
    config: ControllerConfig,
}

impl MiningController {
    pub fn new(fleet: Arc<dyn FleetGateway>, pool: Arc<dyn PoolStatsGateway>, config: ControllerConfig) -> Self {
        Self { fleet, pool, config }
    }

    /// Rent `offer`, provision it, and start mining `coin`.
    ///
    /// A failure after the rental succeeded is reported as
    /// [`RentFailure::Orphaned`] and the rental is left in place.
    pub async fn rent_and_mine(&self, offer: &GpuOffer, coin: &CoinProfile) -> Result<MiningInstance, RentFailure> {
        info!(offer_id = %offer.id, coin = %coin.name, "Attempting to rent offer");

        let mut instance = self.fleet.rent(offer).await.map_err(|e| RentFailure::Rejected {
            offer_id: offer.id.clone(),
            reason: format!("{e:#}"),
        })?;

        let orphaned = |instance: &MiningInstance, stage: RentStage, e: anyhow::Error| RentFailure::Orphaned {
            instance_id: instance.id.clone(),
            offer_id: instance.offer_id.clone(),
            stage,
            reason: format!("{e:#}"),
        };

        instance
            .transition(InstanceState::Provisioning)
            .map_err(|e| orphaned(&instance, RentStage::Provisioning, e.into()))?;
        self.provision(&instance.id)
            .await
            .map_err(|e| orphaned(&instance, RentStage::Provisioning, e))?;

        self.start_miner(&instance.id, coin)
            .await
            .map_err(|e| orphaned(&instance, RentStage::MinerStart, e))?;
        instance
            .transition(InstanceState::Running)
            .map_err(|e| orphaned(&instance, RentStage::MinerStart, e.into()))?;

        info!(instance_id = %instance.id, coin = %coin.name, "Instance mining");
        Ok(instance)
    }

    async fn provision(&self, instance_id: &str) -> Result<()> {
        info!(instance_id, "Provisioning instance");
        self.fleet
            .exec(instance_id, &self.config.provision_command)
            .await
            .context("provision command failed")?;
        Ok(())
    }

    async fn start_miner(&self, instance_id: &str, coin: &CoinProfile) -> Result<()> {
        info!(instance_id, coin = %coin.name, "Starting miner");
        let command = self.pool.build_start_command(coin);
        self.fleet
            .exec(instance_id, &command)
            .await
            .context("miner start command failed")?;
        Ok(())
    }

    /// Read live hashrate and power draw from the instance.
    pub async fn get_mining_performance(&self, instance_id: &str) -> Result<LivePerformance> {
        let output = self
            .fleet
            .exec(instance_id, &self.config.telemetry_command)
            .await
            .context("telemetry command failed")?;
        Ok(LivePerformance::from_exec_output(&output)?)
    }

    /// Kill the miner process; the rental stays up.
    pub async fn stop_miner(&self, instance_id: &str) -> Result<()> {
        info!(instance_id, "Stopping miner process");
        self.fleet
            .exec(instance_id, &self.config.stop_miner_command)
            .await
            .context("stop miner command failed")?;
        Ok(())
    }

    /// Kill the miner and release the rental.
    ///
    /// Termination is attempted even if the miner could not be stopped.
    pub async fn stop_mining(&self, instance_id: &str) -> Result<()> {
        let stopped = self.stop_miner(instance_id).await;
        if let Err(ref e) = stopped {
            warn!(instance_id, error = %e, "Miner stop failed, terminating anyway");
        }

        let terminated = self
            .fleet
            .terminate(instance_id)
            .await
            .with_context(|| format!("terminate {instance_id} failed"))?;
        if !terminated {
            anyhow::bail!("provider refused to terminate {instance_id}");
        }

        info!(instance_id, "Instance terminated");
        stopped
    }

    /// Restart the miner on `to` without touching the rental.
    ///
    /// If the new miner does not start, the miner for `from` is started
    /// again. [`SwitchFailure::MinerDown`] means neither is running.
    pub async fn switch_coin(&self, instance_id: &str, from: &CoinProfile, to: &CoinProfile) -> Result<(), SwitchFailure> {
        info!(instance_id, from = %from.name, to = %to.name, "Switching coin");
        self.stop_miner(instance_id).await.map_err(|e| SwitchFailure::Kept {
            reason: format!("{e:#}"),
        })?;

        let Err(start_err) = self.start_miner(instance_id, to).await else {
            return Ok(());
        };
        warn!(instance_id, coin = %to.name, error = format!("{start_err:#}"), "New miner failed to start, restoring previous coin");

        match self.start_miner(instance_id, from).await {
            Ok(()) => Err(SwitchFailure::Kept {
                reason: format!("{start_err:#}"),
            }),
            Err(restore_err) => Err(SwitchFailure::MinerDown {
                reason: format!("{start_err:#}; restoring {}: {restore_err:#}", from.name),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
