//! rigswitch rents cloud GPUs, mines the most profitable coin, and
//! switches or stops rigs as profitability moves.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod fleet;
pub mod pool;
pub mod notify;
pub mod strategy;
pub mod engine;
pub mod miner;
