//! Mining pools and miner command lines.
//!
//! Defines the `PoolStatsGateway` trait, the `MinerKind` enum that owns each
//! miner's flag dialect, and the remote start-command builder. A new miner is
//! added as a new variant, never as a mutable lookup table.

pub mod twominers;

use anyhow::Result;
use async_trait::async_trait;
use shell_escape::unix::escape;
use std::borrow::Cow;
use std::fmt;

use crate::types::{CoinProfile, PoolConnection, PoolStats};

/// Command emitted when the configured miner is unknown.
pub const UNSUPPORTED_MINER_COMMAND: &str = "echo 'Unsupported miner'";

// ---------------------------------------------------------------------------
// Miner kinds
// ---------------------------------------------------------------------------

/// Supported miner binaries, each with its own flag dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinerKind {
    /// `--algo/--pool/--user`
    LolMiner,
    /// `-a/-o/-u`
    NbMiner,
    /// `--url/--user` (algorithm picked by the binary build)
    MiniZ,
    /// Anything else; builds a no-op command instead of failing.
    Unsupported(String),
}

impl MinerKind {
    /// Case-insensitive lookup by binary name.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "lolminer" => MinerKind::LolMiner,
            "nbminer" => MinerKind::NbMiner,
            "miniz" => MinerKind::MiniZ,
            _ => MinerKind::Unsupported(name.to_string()),
        }
    }

    /// Name of the binary, or `None` for unsupported miners.
    pub fn binary(&self) -> Option<&'static str> {
        match self {
            MinerKind::LolMiner => Some("lolMiner"),
            MinerKind::NbMiner => Some("nbminer"),
            MinerKind::MiniZ => Some("miniZ"),
            MinerKind::Unsupported(_) => None,
        }
    }

    /// Argument vector for this miner, or `None` for unsupported miners.
    pub fn args(&self, algorithm: &str, pool_url: &str, user: &str) -> Option<Vec<String>> {
        let args: Vec<&str> = match self {
            MinerKind::LolMiner => vec!["--algo", algorithm, "--pool", pool_url, "--user", user],
            MinerKind::NbMiner => vec!["-a", algorithm, "-o", pool_url, "-u", user],
            MinerKind::MiniZ => vec!["--url", pool_url, "--user", user],
            MinerKind::Unsupported(_) => return None,
        };
        Some(args.into_iter().map(String::from).collect())
    }
}

impl fmt::Display for MinerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinerKind::Unsupported(name) => write!(f, "unsupported({name})"),
            other => write!(f, "{}", other.binary().unwrap_or_default()),
        }
    }
}

/// Detached shell command that starts `miner` for `coin` on a remote instance.
///
/// Every argument is shell-escaped; output goes to `miner.log`.
pub fn build_start_command(miner: &MinerKind, coin: &CoinProfile, pool: &PoolConnection) -> String {
    let (Some(binary), Some(args)) = (miner.binary(), miner.args(&coin.algorithm, &pool.url, &pool.user()))
    else {
        return UNSUPPORTED_MINER_COMMAND.to_string();
    };

    let escaped: Vec<Cow<'_, str>> = args.iter().map(|a| escape(Cow::Borrowed(a.as_str()))).collect();
    format!("nohup ./{binary} {} > miner.log 2>&1 &", escaped.join(" "))
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// Abstraction over a mining pool's account API and command construction.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PoolStatsGateway: Send + Sync {
    /// Shell command that starts mining `coin` against its configured pool.
    fn build_start_command(&self, coin: &CoinProfile) -> String;

    /// Hashrate and unpaid balance the pool reports for `coin_name`'s wallet.
    async fn get_pool_stats(&self, coin_name: &str) -> Result<PoolStats>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
