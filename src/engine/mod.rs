//! Core engine: the rent → monitor → switch/stop loop.

pub mod controller;
pub mod orchestrator;

pub use controller::{ControllerConfig, MiningController, RentFailure, RentStage, SwitchFailure};
pub use orchestrator::{CoinSource, CycleReport, InstanceOrchestrator, OrchestratorConfig, OrphanedRental};
