//! GPU-rental providers.
//!
//! Defines the `FleetGateway` trait and provides implementations for:
//! - Vast.ai: live rentals over the v0 REST API
//! - Dry run: in-memory fleet for exercising the loop without spending money

pub mod dry_run;
pub mod vastai;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{GpuOffer, InstanceStatus, MiningInstance};

/// Abstraction over GPU-rental providers.
///
/// Implementors list offers, rent them, run shell commands on rented
/// instances, and tear them down. Every call is a network round-trip and
/// must be bounded by a timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FleetGateway: Send + Sync {
    /// Offers with at least `min_ram_gb` VRAM costing at most `max_price` per hour.
    async fn find_offers(&self, min_ram_gb: f64, max_price: f64) -> Result<Vec<GpuOffer>>;

    /// Rent an offer. The returned instance is in the `Renting` state.
    async fn rent(&self, offer: &GpuOffer) -> Result<MiningInstance>;

    /// Run a shell command on an instance. The result is provider-specific.
    async fn exec(&self, instance_id: &str, command: &str) -> Result<serde_json::Value>;

    /// Current provider-side status of an instance.
    async fn get_status(&self, instance_id: &str) -> Result<InstanceStatus>;

    /// Destroy an instance. `Ok(false)` when the provider refused.
    async fn terminate(&self, instance_id: &str) -> Result<bool>;
}
