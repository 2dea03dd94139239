//! Instance orchestrator: the scan → rent → monitor → switch/stop loop.
//!
//! Owns the set of active rentals. Each cycle runs sequentially: offers are
//! processed in the order the fleet returns them, then every active instance
//! is polled, re-priced from live telemetry, and either kept, switched to a
//! better coin, or stopped when it loses money.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::controller::{MiningController, RentFailure, RentStage, SwitchFailure};
use crate::fleet::FleetGateway;
use crate::notify::Notifications;
use crate::strategy::{CoinRanker, FinalReport, ProfitEstimator, ProfitLedger, SwitchDecision};
use crate::types::{ActiveInstanceRecord, CoinProfile, GpuOffer, InstanceState};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Sleep between successful cycles.
    pub check_interval: Duration,
    /// Sleep after a cycle failed at the cycle boundary.
    pub error_backoff: Duration,
    /// Offers expected to net less than this per hour are not rented.
    pub min_profit_per_hour: f64,
    pub min_gpu_ram: f64,
    pub max_price_per_hour: f64,
    /// Only used for the startup message.
    pub dry_run: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            error_backoff: Duration::from_secs(60),
            min_profit_per_hour: 0.05,
            min_gpu_ram: 8.0,
            max_price_per_hour: 0.5,
            dry_run: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub cycle_number: u64,
    pub offers_scanned: usize,
    pub offers_qualifying: usize,
    pub rented: usize,
    pub rent_failed: usize,
    pub orphaned: usize,
    pub stopped: usize,
    pub switched: usize,
    pub lost: usize,
    pub monitor_errors: usize,
    pub active: usize,
    pub total_profit: f64,
}

/// A rental that is billing but never reached the mining state.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanedRental {
    pub instance_id: String,
    pub offer_id: String,
    pub stage: RentStage,
    pub reason: String,
}

/// Reloads coin profiles at the start of every cycle.
pub type CoinSource = Box<dyn Fn() -> Result<Vec<CoinProfile>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorOutcome {
    Healthy,
    Lost,
    Stopped,
    Switched,
    SwitchFailed,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct InstanceOrchestrator {
    fleet: Arc<dyn FleetGateway>,
    controller: MiningController,
    ranker: CoinRanker,
    estimator: ProfitEstimator,
    ledger: ProfitLedger,
    notifier: Notifications,
    config: OrchestratorConfig,
    active: HashMap<String, ActiveInstanceRecord>,
    orphans: Vec<OrphanedRental>,
    coin_source: Option<CoinSource>,
    cycle_count: u64,
}

impl InstanceOrchestrator {
    pub fn new(
        fleet: Arc<dyn FleetGateway>,
        controller: MiningController,
        ranker: CoinRanker,
        estimator: ProfitEstimator,
        notifier: Notifications,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            fleet,
            controller,
            ranker,
            estimator,
            ledger: ProfitLedger::new(Utc::now()),
            notifier,
            config,
            active: HashMap::new(),
            orphans: Vec::new(),
            coin_source: None,
            cycle_count: 0,
        }
    }

    /// Refresh coin profiles from `source` before each cycle.
    pub fn with_coin_source(mut self, source: CoinSource) -> Self {
        self.coin_source = Some(source);
        self
    }

    /// Replace the coin profiles, including the copy each active instance
    /// holds for its current coin, so switch margins use fresh estimates.
    pub fn update_coins(&mut self, coins: Vec<CoinProfile>) {
        debug!(count = coins.len(), "Coin profiles updated");
        for record in self.active.values_mut() {
            match coins.iter().find(|c| c.name == record.coin.name) {
                Some(fresh) => record.coin = fresh.clone(),
                None => warn!(
                    instance_id = %record.instance.id,
                    coin = %record.coin.name,
                    "Mined coin missing from refreshed profiles, keeping last estimate"
                ),
            }
        }
        self.ranker.set_coins(coins);
    }

    pub fn active(&self) -> &HashMap<String, ActiveInstanceRecord> {
        &self.active
    }

    pub fn orphans(&self) -> &[OrphanedRental] {
        &self.orphans
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Run cycles until `shutdown` resolves, then stop every instance.
    ///
    /// The shutdown signal is observed between cycles; a running cycle is
    /// always completed first.
    pub async fn run<F>(&mut self, shutdown: F) -> FinalReport
    where
        F: Future<Output = ()>,
    {
        let mode = if self.config.dry_run { "dry-run" } else { "live" };
        info!(
            mode,
            interval_secs = self.config.check_interval.as_secs(),
            coins = self.ranker.coins().len(),
            min_delta = self.ranker.config().min_delta,
            energy_cost = self.estimator.config().energy_cost_per_kwh,
            "Orchestrator starting"
        );
        self.notifier
            .send(&format!(
                "🚀 rigswitch started\nTime: {}\nMode: {mode}",
                Utc::now().format("%Y-%m-%d %H:%M:%S")
            ))
            .await;

        tokio::pin!(shutdown);

        loop {
            let wait = match self.run_cycle().await {
                Ok(report) => {
                    log_cycle_report(&report);
                    self.config.check_interval
                }
                Err(e) => {
                    error!(cycle = self.cycle_count, error = format!("{e:#}"), "Cycle failed");
                    self.notifier
                        .send(&format!("⚠️ Error in cycle {}: {e:#}", self.cycle_count))
                        .await;
                    self.config.error_backoff
                }
            };

            debug!(secs = wait.as_secs(), "Sleeping until next cycle");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// One full scan → rent → monitor iteration.
    ///
    /// Offer-level and instance-level failures are handled inside; only a
    /// failed offer listing escapes to the caller.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.cycle_count += 1;
        let span = info_span!("cycle", n = self.cycle_count);
        self.cycle_inner().instrument(span).await
    }

    async fn cycle_inner(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport {
            cycle_number: self.cycle_count,
            ..Default::default()
        };

        match self.coin_source.as_ref().map(|source| source()) {
            Some(Ok(coins)) => self.update_coins(coins),
            Some(Err(e)) => warn!(error = format!("{e:#}"), "Coin refresh failed, keeping previous profiles"),
            None => {}
        }

        // 1. Offers
        let offers = self
            .fleet
            .find_offers(self.config.min_gpu_ram, self.config.max_price_per_hour)
            .await
            .context("Failed to list GPU offers")?;
        report.offers_scanned = offers.len();

        if offers.is_empty() {
            info!("No GPU offers within limits this cycle");
            return Ok(self.finish(report));
        }
        info!(count = offers.len(), "GPU offers within limits");

        // 2. Best coin
        let Some(best) = self.ranker.rank().cloned() else {
            warn!("No coins configured, skipping cycle");
            return Ok(self.finish(report));
        };
        info!(coin = %best.name, algorithm = %best.algorithm, "Most profitable coin");

        // 3-5. Rent
        self.rent_phase(&offers, &best, &mut report).await;

        // 6. Monitor
        self.monitor_active_instances(&mut report).await;

        Ok(self.finish(report))
    }

    fn finish(&self, mut report: CycleReport) -> CycleReport {
        report.active = self.active.len();
        report.total_profit = self.ledger.total_profit(Utc::now());
        report
    }

    async fn rent_phase(&mut self, offers: &[GpuOffer], coin: &CoinProfile, report: &mut CycleReport) {
        for offer in offers {
            if self.offer_in_use(&offer.id) {
                debug!(offer_id = %offer.id, "Offer already backs a rental, skipping");
                continue;
            }

            let expected = self.estimator.expected_profit(offer, coin, offer.price_per_hour);
            if expected.net_profit_per_hour < self.config.min_profit_per_hour {
                debug!(
                    offer_id = %offer.id,
                    net = format!("${:.4}", expected.net_profit_per_hour),
                    min = format!("${:.4}", self.config.min_profit_per_hour),
                    "Offer below profit threshold"
                );
                continue;
            }

            report.offers_qualifying += 1;
            info!(
                offer_id = %offer.id,
                gpu = %offer.gpu_name,
                net = format!("${:.4}", expected.net_profit_per_hour),
                "Offer qualifies"
            );

            match self.controller.rent_and_mine(offer, coin).await {
                Ok(instance) => {
                    report.rented += 1;
                    self.ledger.open(&instance.id, &expected, Utc::now());
                    let msg = format!(
                        "✅ Started mining on {} ({})\nInstance: {}\nCoin: {}\nExpected profit: ${:.4}/hour\nRental cost: ${:.4}/hour",
                        offer.gpu_name,
                        offer.id,
                        instance.id,
                        coin.name,
                        expected.net_profit_per_hour,
                        offer.price_per_hour,
                    );
                    self.active.insert(
                        instance.id.clone(),
                        ActiveInstanceRecord::new(instance, offer.clone(), coin.clone(), expected),
                    );
                    self.notifier.send(&msg).await;
                }
                Err(RentFailure::Rejected { offer_id, reason }) => {
                    report.rent_failed += 1;
                    warn!(offer_id = %offer_id, reason = %reason, "Rent failed");
                    self.notifier
                        .send(&format!("❌ rent_and_mine failed for offer {offer_id}: {reason}"))
                        .await;
                }
                Err(RentFailure::Orphaned { instance_id, offer_id, stage, reason }) => {
                    report.orphaned += 1;
                    error!(
                        instance_id = %instance_id,
                        offer_id = %offer_id,
                        stage = %stage,
                        reason = %reason,
                        "Rental orphaned: instance is billing but not mining"
                    );
                    self.ledger.record_orphan();
                    self.notifier
                        .send(&format!(
                            "❌ Instance {instance_id} (offer {offer_id}) is rented but {stage} failed: {reason}\nThe rental is still billing and needs manual cleanup."
                        ))
                        .await;
                    self.orphans.push(OrphanedRental { instance_id, offer_id, stage, reason });
                }
            }
        }
    }

    fn offer_in_use(&self, offer_id: &str) -> bool {
        self.active.values().any(|r| r.offer.id == offer_id)
            || self.orphans.iter().any(|o| o.offer_id == offer_id)
    }

    /// Poll, re-price, and act on every active instance.
    ///
    /// A failure on one instance is logged and does not affect the others.
    pub async fn monitor_active_instances(&mut self, report: &mut CycleReport) {
        if self.active.is_empty() {
            return;
        }

        let mut ids: Vec<String> = self.active.keys().cloned().collect();
        ids.sort();
        info!(count = ids.len(), "Monitoring active instances");

        for id in ids {
            match self.monitor_instance(&id).await {
                Ok(MonitorOutcome::Healthy) => {}
                Ok(MonitorOutcome::Lost) => report.lost += 1,
                Ok(MonitorOutcome::Stopped) => report.stopped += 1,
                Ok(MonitorOutcome::Switched) => report.switched += 1,
                Ok(MonitorOutcome::SwitchFailed) => report.monitor_errors += 1,
                Err(e) => {
                    report.monitor_errors += 1;
                    error!(instance_id = %id, error = format!("{e:#}"), "Error monitoring instance");
                }
            }
        }
    }

    async fn monitor_instance(&mut self, id: &str) -> Result<MonitorOutcome> {
        let status = self.fleet.get_status(id).await?;

        if !status.is_running() {
            warn!(instance_id = id, state = %status.state, "Instance is not running");
            if let Some(mut record) = self.active.remove(id) {
                if let Err(e) = record.instance.transition(InstanceState::Terminated) {
                    debug!(error = %e, "Lost instance already terminal");
                }
            }
            self.ledger.close(id, Utc::now());
            self.notifier
                .send(&format!("⚠️ Instance {id} stopped (state: {})", status.state))
                .await;
            return Ok(MonitorOutcome::Lost);
        }

        let (rental_cost, current_coin) = {
            let record = self.active.get(id).context("instance vanished from active set")?;
            (record.offer.price_per_hour, record.coin.clone())
        };

        let performance = self.controller.get_mining_performance(id).await?;
        let actual = self.estimator.actual_profit(id, &performance, rental_cost);
        self.ledger.record(id, &actual, Utc::now());

        if actual.is_loss() {
            let net = actual.net_profit_per_hour;
            warn!(instance_id = id, net = format!("${net:.4}"), "Instance no longer profitable");
            self.stop_instance(id, &format!("🛑 Stopped unprofitable instance {id}\nNet profit: ${net:.4}/hour"))
                .await;
            return Ok(MonitorOutcome::Stopped);
        }

        if let Some(record) = self.active.get_mut(id) {
            record.actual_profit = Some(actual);
        }

        match self.ranker.should_switch(Some(&current_coin), actual.net_profit_per_hour) {
            SwitchDecision::Keep => {
                debug!(
                    instance_id = id,
                    coin = %current_coin.name,
                    net = format!("${:.4}", actual.net_profit_per_hour),
                    "Instance healthy"
                );
                Ok(MonitorOutcome::Healthy)
            }
            SwitchDecision::SwitchTo(target) => self.switch_instance(id, &current_coin, target).await,
        }
    }

    /// Remove an instance from the active set, release it, and notify.
    ///
    /// The instance is dropped even if the provider calls fail.
    async fn stop_instance(&mut self, id: &str, notice: &str) {
        let mut record = self.active.remove(id);
        if let Some(r) = record.as_mut() {
            if let Err(e) = r.instance.transition(InstanceState::Stopping) {
                warn!(error = %e, "Unexpected state before stop");
            }
        }

        if let Err(e) = self.controller.stop_mining(id).await {
            error!(instance_id = id, error = format!("{e:#}"), "Failed to stop instance");
        }
        if let Some(r) = record.as_mut() {
            if let Err(e) = r.instance.transition(InstanceState::Terminated) {
                warn!(error = %e, "Unexpected state after stop");
            }
        }
        self.ledger.close(id, Utc::now());

        self.notifier.send(notice).await;
    }

    async fn switch_instance(&mut self, id: &str, from: &CoinProfile, to: CoinProfile) -> Result<MonitorOutcome> {
        info!(instance_id = id, from = %from.name, to = %to.name, "Switching coin");

        self.active
            .get_mut(id)
            .context("instance vanished from active set")?
            .instance
            .transition(InstanceState::SwitchingCoin)?;

        match self.controller.switch_coin(id, from, &to).await {
            Ok(()) => {
                let record = self.active.get_mut(id).context("instance vanished from active set")?;
                record.instance.transition(InstanceState::Running)?;
                record.coin = to;
                let msg = format!("🔄 Switched instance {id} from {} to {}", from.name, record.coin.name);
                self.notifier.send(&msg).await;
                Ok(MonitorOutcome::Switched)
            }
            Err(SwitchFailure::Kept { reason }) => {
                self.active
                    .get_mut(id)
                    .context("instance vanished from active set")?
                    .instance
                    .transition(InstanceState::Running)?;
                error!(instance_id = id, reason = %reason, "Coin switch failed, still mining {}", from.name);
                self.notifier
                    .send(&format!(
                        "⚠️ Switch of instance {id} to {} failed, still mining {}: {reason}",
                        to.name, from.name
                    ))
                    .await;
                Ok(MonitorOutcome::SwitchFailed)
            }
            Err(SwitchFailure::MinerDown { reason }) => {
                error!(instance_id = id, reason = %reason, "No miner running after failed switch, releasing instance");
                self.stop_instance(
                    id,
                    &format!("🛑 Stopped instance {id}: no miner could be started after switching to {}\n{reason}", to.name),
                )
                .await;
                Ok(MonitorOutcome::Stopped)
            }
        }
    }

    /// Stop every active instance (best effort), then report and notify.
    pub async fn shutdown(&mut self) -> FinalReport {
        info!(active = self.active.len(), "Stopping all active instances");

        let mut active: Vec<(String, ActiveInstanceRecord)> = std::mem::take(&mut self.active).into_iter().collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, mut record) in active {
            if let Err(e) = record.instance.transition(InstanceState::Stopping) {
                warn!(error = %e, "Unexpected state before shutdown stop");
            }
            match self.controller.stop_mining(&id).await {
                Ok(()) => info!(
                    instance_id = %id,
                    coin = %record.coin.name,
                    uptime_mins = record.uptime().num_minutes(),
                    "Stopped instance"
                ),
                Err(e) => error!(instance_id = %id, error = format!("{e:#}"), "Error stopping instance"),
            }
            self.ledger.close(&id, Utc::now());
        }

        let report = self.ledger.final_report(Utc::now());

        let mut msg = format!(
            "🛑 rigswitch stopped\nTime: {}\nTotal profit: ${:.2}\nTotal runtime: {}\nInstances started: {}\nInstances closed: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            report.total_profit,
            report.runtime_display(),
            report.instances_started,
            report.instances_closed,
        );
        if !self.orphans.is_empty() {
            let ids: Vec<&str> = self.orphans.iter().map(|o| o.instance_id.as_str()).collect();
            msg.push_str(&format!("\nOrphaned rentals (still billing): {}", ids.join(", ")));
        }
        self.notifier.send(&msg).await;

        info!("rigswitch stopped");
        report
    }
}

fn log_cycle_report(report: &CycleReport) {
    info!(
        cycle = report.cycle_number,
        scanned = report.offers_scanned,
        qualifying = report.offers_qualifying,
        rented = report.rented,
        rent_failed = report.rent_failed,
        orphaned = report.orphaned,
        stopped = report.stopped,
        switched = report.switched,
        lost = report.lost,
        errors = report.monitor_errors,
        active = report.active,
        profit = format!("${:.4}", report.total_profit),
        "Cycle complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
