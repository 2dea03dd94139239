//! Strategy layer: coin ranking, profit estimation, and profit accounting.
//!
//! Everything here is pure computation over configuration and the inputs
//! passed in; no network access and no ownership of instance state.

pub mod ledger;
pub mod profit;
pub mod ranker;

pub use ledger::{FinalReport, ProfitLedger};
pub use profit::{ProfitConfig, ProfitEstimator};
pub use ranker::{CoinRanker, SwitchConfig, SwitchDecision};
