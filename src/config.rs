//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys, bot tokens) are referenced by env-var name in the
//! config and resolved at runtime into `SecretString`s.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::engine::{ControllerConfig, OrchestratorConfig};
use crate::fleet::vastai::RentalTemplate;
use crate::strategy::{ProfitConfig, SwitchConfig};
use crate::types::{CoinProfile, PoolConnection, RigError};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub fleet: FleetSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub profit: ProfitSection,
    /// File order is the ranker's tie-break order.
    #[serde(default)]
    pub coins: Vec<CoinProfile>,
    /// Pool connection per coin name.
    #[serde(default)]
    pub pools: HashMap<String, PoolConnection>,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OrchestratorSection {
    pub check_interval_secs: u64,
    pub error_backoff_secs: u64,
    pub min_profit_per_hour: f64,
    pub min_gpu_ram: f64,
    pub max_price_per_hour: f64,
    pub min_delta_for_switch: f64,
    /// Upper bound on every outbound HTTP call.
    pub gateway_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,
            error_backoff_secs: 60,
            min_profit_per_hour: 0.05,
            min_gpu_ram: 8.0,
            max_price_per_hour: 0.5,
            min_delta_for_switch: 0.02,
            gateway_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FleetSection {
    pub dry_run: bool,
    pub api_key_env: String,
    pub image: String,
    pub disk_gb: u32,
    pub provision_command: String,
    pub telemetry_command: String,
    pub stop_miner_command: String,
}

impl Default for FleetSection {
    fn default() -> Self {
        let template = RentalTemplate::default();
        let commands = ControllerConfig::default();
        Self {
            dry_run: false,
            api_key_env: "VASTAI_API_KEY".to_string(),
            image: template.image,
            disk_gb: template.disk_gb,
            provision_command: commands.provision_command,
            telemetry_command: commands.telemetry_command,
            stop_miner_command: commands.stop_miner_command,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolSection {
    pub miner: String,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self { miner: "lolMiner".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProfitSection {
    pub energy_cost_per_kwh: f64,
    pub assumed_usd_per_mh: f64,
    pub pool_fee: f64,
}

impl Default for ProfitSection {
    fn default() -> Self {
        let d = ProfitConfig::default();
        Self {
            energy_cost_per_kwh: d.energy_cost_per_kwh,
            assumed_usd_per_mh: d.assumed_usd_per_mh,
            pool_fee: d.pool_fee,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertsConfig {
    pub telegram_bot_token_env: Option<String>,
    pub telegram_chat_id_env: Option<String>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Reject configurations the orchestrator cannot run with.
    ///
    /// The fleet API key is only required outside dry-run mode.
    pub fn validate(&self) -> Result<(), RigError> {
        let o = &self.orchestrator;
        let p = &self.profit;
        let numbers = [
            ("orchestrator.min_profit_per_hour", o.min_profit_per_hour),
            ("orchestrator.min_gpu_ram", o.min_gpu_ram),
            ("orchestrator.max_price_per_hour", o.max_price_per_hour),
            ("orchestrator.min_delta_for_switch", o.min_delta_for_switch),
            ("profit.energy_cost_per_kwh", p.energy_cost_per_kwh),
            ("profit.assumed_usd_per_mh", p.assumed_usd_per_mh),
            ("profit.pool_fee", p.pool_fee),
        ];
        for (name, value) in numbers {
            check_non_negative(name, value)?;
        }
        if o.check_interval_secs == 0 {
            return Err(RigError::Config("orchestrator.check_interval_secs must be positive".to_string()));
        }

        Self::validate_coins(&self.coins)?;

        if !self.fleet.dry_run && std::env::var(&self.fleet.api_key_env).map_or(true, |v| v.is_empty()) {
            return Err(RigError::Config(format!(
                "{} is not set (required unless fleet.dry_run = true)",
                self.fleet.api_key_env
            )));
        }

        Ok(())
    }

    /// Checks applied to every coin set, at startup and on reload.
    pub fn validate_coins(coins: &[CoinProfile]) -> Result<(), RigError> {
        if coins.is_empty() {
            return Err(RigError::Config("no [[coins]] configured".to_string()));
        }
        for coin in coins {
            if coin.name.trim().is_empty() {
                return Err(RigError::Config("coin with empty name".to_string()));
            }
            for (field, value) in [
                ("usd_per_mh", coin.usd_per_mh),
                ("expected_hashrate_mh", coin.expected_hashrate_mh),
                ("expected_power_w", coin.expected_power_w),
                ("pool_fee", coin.pool_fee),
            ] {
                check_non_negative(&format!("coins.{}.{field}", coin.name), value)?;
            }
        }
        Ok(())
    }

    /// Re-read `[[coins]]` from `path`, rejecting sets that fail validation.
    pub fn reload_coins(path: &str) -> Result<Vec<CoinProfile>> {
        let cfg = Self::load(path)?;
        Self::validate_coins(&cfg.coins).with_context(|| format!("Rejected coin profiles in {path}"))?;
        Ok(cfg.coins)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<SecretString> {
        let value = std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))?;
        Ok(SecretString::new(value))
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.gateway_timeout_secs)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let o = &self.orchestrator;
        OrchestratorConfig {
            check_interval: Duration::from_secs(o.check_interval_secs),
            error_backoff: Duration::from_secs(o.error_backoff_secs),
            min_profit_per_hour: o.min_profit_per_hour,
            min_gpu_ram: o.min_gpu_ram,
            max_price_per_hour: o.max_price_per_hour,
            dry_run: self.fleet.dry_run,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            provision_command: self.fleet.provision_command.clone(),
            telemetry_command: self.fleet.telemetry_command.clone(),
            stop_miner_command: self.fleet.stop_miner_command.clone(),
        }
    }

    pub fn rental_template(&self) -> RentalTemplate {
        RentalTemplate {
            image: self.fleet.image.clone(),
            disk_gb: self.fleet.disk_gb,
        }
    }

    pub fn profit_config(&self) -> ProfitConfig {
        ProfitConfig {
            energy_cost_per_kwh: self.profit.energy_cost_per_kwh,
            assumed_usd_per_mh: self.profit.assumed_usd_per_mh,
            pool_fee: self.profit.pool_fee,
        }
    }

    pub fn switch_config(&self) -> SwitchConfig {
        SwitchConfig {
            min_delta: self.orchestrator.min_delta_for_switch,
        }
    }
}

fn check_non_negative(name: &str, value: f64) -> Result<(), RigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(RigError::Config(format!("{name} must be a non-negative number, got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [orchestrator]
        check_interval_secs = 120
        min_delta_for_switch = 0.01

        [fleet]
        dry_run = true

        [pool]
        miner = "nbminer"

        [[coins]]
        name = "RVN"
        algorithm = "kawpow"
        usd_per_mh = 0.002

        [[coins]]
        name = "ETC"
        algorithm = "etchash"
        usd_per_mh = 0.0025
        expected_hashrate_mh = 60
        pool_fee = 0.02

        [pools.RVN]
        url = "stratum+tcp://rvn.2miners.com:6060"
        wallet = "RWallet"
        worker = "rig01"
    "#;

    #[test]
    fn test_parse_sample() {
        let cfg = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.orchestrator.check_interval_secs, 120);
        assert_eq!(cfg.orchestrator.error_backoff_secs, 60);
        assert_eq!(cfg.orchestrator.min_profit_per_hour, 0.05);
        assert!(cfg.fleet.dry_run);
        assert_eq!(cfg.fleet.api_key_env, "VASTAI_API_KEY");
        assert_eq!(cfg.fleet.stop_miner_command, "pkill -f miner || true");
        assert_eq!(cfg.pool.miner, "nbminer");

        let names: Vec<_> = cfg.coins.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["RVN", "ETC"]);
        assert_eq!(cfg.coins[0].expected_hashrate_mh, 50.0);
        assert_eq!(cfg.coins[0].expected_power_w, 150.0);
        assert_eq!(cfg.coins[1].pool_fee, 0.02);

        assert_eq!(cfg.pools["RVN"].user(), "RWallet.rig01");
        assert!(cfg.alerts.telegram_bot_token_env.is_none());
    }

    #[test]
    fn test_component_configs() {
        let cfg = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.switch_config().min_delta, 0.01);
        assert_eq!(cfg.orchestrator_config().check_interval, Duration::from_secs(120));
        assert!(cfg.orchestrator_config().dry_run);
        assert_eq!(cfg.profit_config().energy_cost_per_kwh, 0.10);
        assert_eq!(cfg.rental_template().disk_gb, 20);
        assert_eq!(cfg.gateway_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_dry_run_sample() {
        AppConfig::parse(SAMPLE).unwrap().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_coin_set() {
        let cfg = AppConfig::parse("[fleet]\ndry_run = true\n").unwrap();
        assert!(matches!(cfg.validate(), Err(RigError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_negative_numbers() {
        let mut cfg = AppConfig::parse(SAMPLE).unwrap();
        cfg.orchestrator.max_price_per_hour = -1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::parse(SAMPLE).unwrap();
        cfg.coins[1].usd_per_mh = -0.1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("coins.ETC.usd_per_mh"));
    }

    #[test]
    fn test_validate_coins_rejects_nan_estimate() {
        let toml = r#"
            [[coins]]
            name = "A"
            algorithm = "kawpow"
            usd_per_mh = 0.01

            [[coins]]
            name = "B"
            algorithm = "kawpow"
            usd_per_mh = nan
        "#;
        let cfg = AppConfig::parse(toml).unwrap();
        let err = AppConfig::validate_coins(&cfg.coins).unwrap_err();
        assert!(err.to_string().contains("coins.B.usd_per_mh"));
    }

    #[test]
    fn test_reload_coins_rejects_invalid_set() {
        let path = std::env::temp_dir().join(format!("rigswitch-reload-{}.toml", uuid::Uuid::new_v4()));
        let path_str = path.to_str().unwrap();

        fs::write(&path, "[[coins]]\nname = \"A\"\nalgorithm = \"kawpow\"\nusd_per_mh = -0.5\n").unwrap();
        assert!(AppConfig::reload_coins(path_str).is_err());

        fs::write(&path, "[[coins]]\nname = \"A\"\nalgorithm = \"kawpow\"\nusd_per_mh = 0.5\n").unwrap();
        let coins = AppConfig::reload_coins(path_str).unwrap();
        assert_eq!(coins[0].usd_per_mh, 0.5);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_validate_requires_api_key_when_live() {
        let mut cfg = AppConfig::parse(SAMPLE).unwrap();
        cfg.fleet.dry_run = false;
        cfg.fleet.api_key_env = "RIGSWITCH_TEST_KEY_THAT_IS_NEVER_SET".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("RIGSWITCH_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AppConfig::load("does-not-exist.toml").is_err());
    }

    #[test]
    fn test_load_repo_config() {
        // config.toml lives at the crate root; cargo runs tests from there.
        if let Ok(cfg) = AppConfig::load("config.toml") {
            assert!(!cfg.coins.is_empty());
            assert!(cfg.fleet.dry_run);
        }
    }
}
