//! Profit ledger: running totals and the final report.
//!
//! Integrates each instance's net profit per hour over the wall time between
//! monitor passes. Only running totals are kept; individual snapshots are
//! not retained.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

use crate::types::ProfitSnapshot;

// ---------------------------------------------------------------------------
// Final report
// ---------------------------------------------------------------------------

/// Summary produced when the agent shuts down.
#[derive(Debug, Clone)]
pub struct FinalReport {
    /// Estimated profit accrued across all instances, in USD.
    pub total_profit: f64,
    pub total_runtime: chrono::Duration,
    pub instances_started: u64,
    pub instances_closed: u64,
    pub orphaned_rentals: u64,
}

impl FinalReport {
    /// Runtime rendered as `HhMMm`.
    pub fn runtime_display(&self) -> String {
        let minutes = self.total_runtime.num_minutes().max(0);
        format!("{}h{:02}m", minutes / 60, minutes % 60)
    }
}

impl fmt::Display for FinalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "profit=${:.2} runtime={} started={} closed={} orphaned={}",
            self.total_profit,
            self.runtime_display(),
            self.instances_started,
            self.instances_closed,
            self.orphaned_rentals,
        )
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Accrual {
    last_seen: DateTime<Utc>,
    last_net_per_hour: f64,
}

pub struct ProfitLedger {
    started_at: DateTime<Utc>,
    open: HashMap<String, Accrual>,
    realised: f64,
    instances_started: u64,
    instances_closed: u64,
    orphaned_rentals: u64,
}

impl ProfitLedger {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            open: HashMap::new(),
            realised: 0.0,
            instances_started: 0,
            instances_closed: 0,
            orphaned_rentals: 0,
        }
    }

    /// Start accruing for a newly started instance at its expected rate.
    pub fn open(&mut self, instance_id: &str, expected: &ProfitSnapshot, at: DateTime<Utc>) {
        self.instances_started += 1;
        self.open.insert(
            instance_id.to_string(),
            Accrual {
                last_seen: at,
                last_net_per_hour: expected.net_profit_per_hour,
            },
        );
    }

    /// Accrue up to `at` at the previous rate, then adopt the new rate.
    pub fn record(&mut self, instance_id: &str, snapshot: &ProfitSnapshot, at: DateTime<Utc>) {
        let Some(accrual) = self.open.get_mut(instance_id) else {
            debug!(instance_id, "Ledger record for unknown instance ignored");
            return;
        };
        self.realised += accrue(accrual, at);
        accrual.last_seen = at;
        accrual.last_net_per_hour = snapshot.net_profit_per_hour;
    }

    /// Close an instance, accruing up to `at`.
    pub fn close(&mut self, instance_id: &str, at: DateTime<Utc>) {
        if let Some(accrual) = self.open.remove(instance_id) {
            self.realised += accrue(&accrual, at);
            self.instances_closed += 1;
        }
    }

    pub fn record_orphan(&mut self) {
        self.orphaned_rentals += 1;
    }

    /// Profit accrued so far, including open instances up to `at`.
    pub fn total_profit(&self, at: DateTime<Utc>) -> f64 {
        self.realised + self.open.values().map(|a| accrue(a, at)).sum::<f64>()
    }

    pub fn final_report(&self, at: DateTime<Utc>) -> FinalReport {
        let report = FinalReport {
            total_profit: self.total_profit(at),
            total_runtime: at - self.started_at,
            instances_started: self.instances_started,
            instances_closed: self.instances_closed,
            orphaned_rentals: self.orphaned_rentals,
        };
        info!(report = %report, "Final profit report");
        report
    }
}

fn accrue(accrual: &Accrual, at: DateTime<Utc>) -> f64 {
    let elapsed_ms = (at - accrual.last_seen).num_milliseconds().max(0);
    accrual.last_net_per_hour * (elapsed_ms as f64 / 3_600_000.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const EPS: f64 = 1e-9;

    fn snap(net: f64) -> ProfitSnapshot {
        ProfitSnapshot {
            net_profit_per_hour: net,
            ..Default::default()
        }
    }

    #[test]
    fn test_accrues_previous_rate_until_record() {
        let t0 = Utc::now();
        let mut ledger = ProfitLedger::new(t0);
        ledger.open("i-1", &snap(1.0), t0);
        ledger.record("i-1", &snap(-2.0), t0 + Duration::hours(2));
        // 2h at +1.0, new rate not yet applied
        assert!((ledger.total_profit(t0 + Duration::hours(2)) - 2.0).abs() < EPS);
        // plus 30m at -2.0
        assert!((ledger.total_profit(t0 + Duration::minutes(150)) - 1.0).abs() < EPS);
    }

    #[test]
    fn test_close_stops_accrual() {
        let t0 = Utc::now();
        let mut ledger = ProfitLedger::new(t0);
        ledger.open("i-1", &snap(0.5), t0);
        ledger.close("i-1", t0 + Duration::hours(1));
        let report = ledger.final_report(t0 + Duration::hours(10));
        assert!((report.total_profit - 0.5).abs() < EPS);
        assert_eq!(report.instances_started, 1);
        assert_eq!(report.instances_closed, 1);
        assert_eq!(report.total_runtime, Duration::hours(10));
    }

    #[test]
    fn test_unknown_instance_ignored() {
        let t0 = Utc::now();
        let mut ledger = ProfitLedger::new(t0);
        ledger.record("ghost", &snap(5.0), t0 + Duration::hours(1));
        ledger.close("ghost", t0 + Duration::hours(1));
        let report = ledger.final_report(t0 + Duration::hours(1));
        assert_eq!(report.total_profit, 0.0);
        assert_eq!(report.instances_closed, 0);
    }

    #[test]
    fn test_orphans_counted() {
        let t0 = Utc::now();
        let mut ledger = ProfitLedger::new(t0);
        ledger.record_orphan();
        ledger.record_orphan();
        assert_eq!(ledger.final_report(t0).orphaned_rentals, 2);
    }

    #[test]
    fn test_runtime_display() {
        let report = FinalReport {
            total_profit: 0.0,
            total_runtime: Duration::minutes(125),
            instances_started: 0,
            instances_closed: 0,
            orphaned_rentals: 0,
        };
        assert_eq!(report.runtime_display(), "2h05m");
    }
}
