//! 2Miners pool integration.
//!
//! Account stats: `GET https://{coin}.2miners.com/api/accounts/{wallet}`
//! Auth: none (wallet address is public).
//! Hashrates are reported in H/s; balances in the coin's pool base unit.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{build_start_command, MinerKind, PoolStatsGateway};
use crate::types::{CoinProfile, PoolConnection, PoolStats, RigError};

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    #[serde(default)]
    current_hashrate: f64,
    #[serde(default)]
    stats: Option<AccountStats>,
}

#[derive(Debug, Deserialize)]
struct AccountStats {
    #[serde(default)]
    balance: f64,
}

impl From<AccountResponse> for PoolStats {
    fn from(resp: AccountResponse) -> Self {
        PoolStats {
            reported_hashrate: resp.current_hashrate / 1_000_000.0,
            unpaid_balance: resp.stats.map(|s| s.balance).unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct TwoMinersClient {
    http: Client,
    miner: MinerKind,
    pools: HashMap<String, PoolConnection>,
}

impl TwoMinersClient {
    pub fn new(miner: MinerKind, pools: HashMap<String, PoolConnection>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("rigswitch/0.1.0")
            .build()
            .context("Failed to build HTTP client for 2Miners")?;

        Ok(Self { http, miner, pools })
    }

    /// Pool settings for a coin; unknown coins fall back to placeholders.
    fn pool_for(&self, coin_name: &str) -> PoolConnection {
        self.pools.get(coin_name).cloned().unwrap_or_else(|| {
            warn!(coin = coin_name, "No pool configured, using placeholder pool");
            PoolConnection::default()
        })
    }

    fn account_url(coin_name: &str, wallet: &str) -> String {
        format!(
            "https://{}.2miners.com/api/accounts/{}",
            coin_name.to_lowercase(),
            urlencoding::encode(wallet),
        )
    }
}

#[async_trait]
impl PoolStatsGateway for TwoMinersClient {
    fn build_start_command(&self, coin: &CoinProfile) -> String {
        build_start_command(&self.miner, coin, &self.pool_for(&coin.name))
    }

    async fn get_pool_stats(&self, coin_name: &str) -> Result<PoolStats> {
        let pool = self.pool_for(coin_name);
        let url = Self::account_url(coin_name, &pool.wallet);

        debug!(url = %url, "Fetching 2Miners account");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("2Miners API request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RigError::Pool {
                coin: coin_name.to_string(),
                message: format!("2Miners API error {status}: {body}"),
            }
            .into());
        }

        let account: AccountResponse = resp
            .json()
            .await
            .context("Failed to parse 2Miners account response")?;

        Ok(account.into())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn client(miner: &str) -> TwoMinersClient {
        let mut pools = HashMap::new();
        pools.insert(
            "RVN".to_string(),
            PoolConnection {
                url: "rvn.2miners.com".to_string(),
                wallet: "RWallet".to_string(),
                worker: "rig01".to_string(),
            },
        );
        TwoMinersClient::new(MinerKind::from_name(miner), pools, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_account_url() {
        assert_eq!(
            TwoMinersClient::account_url("RVN", "RWallet"),
            "https://rvn.2miners.com/api/accounts/RWallet"
        );
    }

    #[test]
    fn test_account_response_conversion() {
        let resp: AccountResponse =
            serde_json::from_str(r#"{"currentHashrate": 52000000, "stats": {"balance": 1234}}"#).unwrap();
        let stats: PoolStats = resp.into();
        assert_eq!(stats.reported_hashrate, 52.0);
        assert_eq!(stats.unpaid_balance, 1234.0);
    }

    #[test]
    fn test_account_response_empty() {
        let resp: AccountResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(PoolStats::from(resp), PoolStats::default());
    }

    #[test]
    fn test_command_uses_configured_pool() {
        let c = client("nbminer");
        let cmd = c.build_start_command(&CoinProfile::sample("RVN", 0.002));
        assert!(cmd.contains("-o rvn.2miners.com"));
        assert!(cmd.contains("-u RWallet.rig01"));
    }

    #[test]
    fn test_command_for_unconfigured_coin_uses_placeholder() {
        let c = client("lolMiner");
        let cmd = c.build_start_command(&CoinProfile::sample("ETC", 0.002));
        assert!(cmd.contains("--user WALLET_ADDRESS.worker1"));
    }
}
