//! Local miner supervisor.
//!
//! Runs a miner binary as a child process on the current host, classifies
//! its output, restarts it with a fixed backoff when it exits on its own,
//! and on shutdown sends SIGTERM before force-killing after a grace period.

use anyhow::{Context, Result};
use std::fmt;
use std::future::Future;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::pool::MinerKind;
use crate::types::RigError;

/// How long a miner gets to exit after SIGTERM before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

const DEFAULT_WORKER: &str = "worker01";
const DEFAULT_RESTART_BACKOFF_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Coins
// ---------------------------------------------------------------------------

/// Coins the local supervisor knows how to mine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedCoin {
    Rvn,
    Etc,
    Zec,
}

impl SupportedCoin {
    pub fn miner(self) -> MinerKind {
        match self {
            SupportedCoin::Rvn => MinerKind::NbMiner,
            SupportedCoin::Etc => MinerKind::LolMiner,
            SupportedCoin::Zec => MinerKind::MiniZ,
        }
    }

    /// Algorithm name in the spelling the coin's miner expects.
    pub fn algorithm(self) -> &'static str {
        match self {
            SupportedCoin::Rvn => "kawpow",
            SupportedCoin::Etc => "ETHASH",
            SupportedCoin::Zec => "equihash",
        }
    }

    pub fn default_pool(self) -> &'static str {
        match self {
            SupportedCoin::Rvn => "stratum+tcp://rvn.2miners.com:6060",
            SupportedCoin::Etc => "stratum+tcp://etc.2miners.com:1010",
            SupportedCoin::Zec => "stratum+tcp://zec.2miners.com:1010",
        }
    }
}

impl FromStr for SupportedCoin {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RVN" => Ok(SupportedCoin::Rvn),
            "ETC" => Ok(SupportedCoin::Etc),
            "ZEC" => Ok(SupportedCoin::Zec),
            other => Err(RigError::Miner(format!("Unsupported coin: {other}"))),
        }
    }
}

impl fmt::Display for SupportedCoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupportedCoin::Rvn => write!(f, "RVN"),
            SupportedCoin::Etc => write!(f, "ETC"),
            SupportedCoin::Zec => write!(f, "ZEC"),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct MinerSettings {
    pub coin: SupportedCoin,
    pub wallet: String,
    pub pool_url: String,
    pub worker: String,
    /// Overrides the miner's default binary name.
    pub miner_bin: Option<String>,
    pub restart_backoff: Duration,
}

impl MinerSettings {
    /// Read `COIN`, `WALLET_ADDRESS`, `POOL_URL`, `WORKER_NAME`, `MINER_BIN`
    /// and `RESTART_BACKOFF` from the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let coin: SupportedCoin = non_empty("COIN").as_deref().unwrap_or("RVN").parse()?;

        let wallet = non_empty("WALLET_ADDRESS").ok_or_else(|| {
            RigError::Config("WALLET_ADDRESS is required. Set it in .env or env vars.".to_string())
        })?;

        let restart_backoff = match non_empty("RESTART_BACKOFF") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("RESTART_BACKOFF must be whole seconds, got {raw:?}"))?,
            None => DEFAULT_RESTART_BACKOFF_SECS,
        };

        Ok(Self {
            coin,
            wallet,
            pool_url: non_empty("POOL_URL").unwrap_or_else(|| coin.default_pool().to_string()),
            worker: non_empty("WORKER_NAME").unwrap_or_else(|| DEFAULT_WORKER.to_string()),
            miner_bin: non_empty("MINER_BIN"),
            restart_backoff: Duration::from_secs(restart_backoff),
        })
    }

    /// Program and arguments for this coin's miner.
    pub fn command(&self) -> Result<(String, Vec<String>)> {
        let miner = self.coin.miner();
        let user = format!("{}.{}", self.wallet, self.worker);
        let args = miner
            .args(self.coin.algorithm(), &self.pool_url, &user)
            .ok_or_else(|| RigError::Miner(format!("no command template for {miner}")))?;
        let program = match &self.miner_bin {
            Some(bin) => bin.clone(),
            None => miner
                .binary()
                .ok_or_else(|| RigError::Miner(format!("no binary for {miner}")))?
                .to_string(),
        };
        Ok((program, args))
    }
}

// ---------------------------------------------------------------------------
// Output classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Share accepted, share found, or new job.
    Earning,
    Warning,
    Other,
}

pub fn classify_line(line: &str) -> LineClass {
    let lower = line.to_lowercase();
    if ["accepted", "share found", "new job"].iter().any(|k| lower.contains(k)) {
        LineClass::Earning
    } else if lower.contains("error") || lower.contains("fail") {
        LineClass::Warning
    } else {
        LineClass::Other
    }
}

fn log_line(line: &str) {
    match classify_line(line) {
        LineClass::Earning => info!(line, "EARNING_EVENT"),
        LineClass::Warning => warn!(line, "MINER_WARN"),
        LineClass::Other => debug!(line, "miner"),
    }
}

async fn pump<R: AsyncRead + Unpin>(stream: R) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log_line(line.trim()),
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Miner output stream closed");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct MinerSupervisor {
    settings: MinerSettings,
}

impl MinerSupervisor {
    pub fn new(settings: MinerSettings) -> Self {
        Self { settings }
    }

    fn spawn(&self) -> Result<Child> {
        let (program, args) = self.settings.command()?;
        info!(coin = %self.settings.coin, command = %format!("{program} {}", args.join(" ")), "Starting miner");

        let mut child = Command::new(&program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {program}"))?;

        if let Some(out) = child.stdout.take() {
            tokio::spawn(pump(out));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pump(err));
        }
        Ok(child)
    }

    /// Keep the miner running until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            match self.spawn() {
                Ok(mut child) => {
                    let exited = tokio::select! {
                        status = child.wait() => Some(status),
                        _ = shutdown.as_mut() => None,
                    };
                    match exited {
                        None => {
                            stop_child(&mut child, STOP_GRACE).await?;
                            info!("Miner stopped by user");
                            return Ok(());
                        }
                        Some(Ok(status)) => warn!(status = %status, "Miner exited unexpectedly. Restarting..."),
                        Some(Err(e)) => error!(error = %e, "Failed waiting on miner"),
                    }
                }
                Err(e) => error!(error = format!("{e:#}"), "Miner crashed"),
            }

            info!(secs = self.settings.restart_backoff.as_secs(), "Restarting miner after backoff");
            tokio::select! {
                _ = tokio::time::sleep(self.settings.restart_backoff) => {}
                _ = shutdown.as_mut() => {
                    info!("Miner stopped by user");
                    return Ok(());
                }
            }
        }
    }
}

/// SIGTERM the child, then kill it if it is still alive after `grace`.
pub async fn stop_child(child: &mut Child, grace: Duration) -> Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    info!("Stopping miner process...");
    if let Some(pid) = child.id() {
        let sent = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await;
        if let Err(e) = sent {
            warn!(pid, error = %e, "Could not deliver SIGTERM");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            debug!(status = ?status, "Miner exited");
            Ok(())
        }
        Err(_) => {
            info!("Force killing miner...");
            child.kill().await.context("failed to kill miner")
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_classify_line() {
        assert_eq!(classify_line("GPU0 share ACCEPTED (12 ms)"), LineClass::Earning);
        assert_eq!(classify_line("New job from pool"), LineClass::Earning);
        assert_eq!(classify_line("Connection failed, retrying"), LineClass::Warning);
        assert_eq!(classify_line("CUDA error 700"), LineClass::Warning);
        assert_eq!(classify_line("GPU0 61C 150W"), LineClass::Other);
    }

    #[test]
    fn test_settings_defaults() {
        let s = MinerSettings::from_lookup(env(&[("WALLET_ADDRESS", "RWallet")])).unwrap();
        assert_eq!(s.coin, SupportedCoin::Rvn);
        assert_eq!(s.pool_url, "stratum+tcp://rvn.2miners.com:6060");
        assert_eq!(s.worker, "worker01");
        assert_eq!(s.restart_backoff, Duration::from_secs(10));
        assert_eq!(s.miner_bin, None);
    }

    #[test]
    fn test_wallet_required() {
        assert!(MinerSettings::from_lookup(env(&[("COIN", "ETC")])).is_err());
        assert!(MinerSettings::from_lookup(env(&[("WALLET_ADDRESS", "  ")])).is_err());
    }

    #[test]
    fn test_unknown_coin_rejected() {
        let err = MinerSettings::from_lookup(env(&[("COIN", "DOGE"), ("WALLET_ADDRESS", "w")])).unwrap_err();
        assert!(err.to_string().contains("Unsupported coin"));
    }

    #[test]
    fn test_bad_backoff_rejected() {
        let lookup = env(&[("WALLET_ADDRESS", "w"), ("RESTART_BACKOFF", "soon")]);
        assert!(MinerSettings::from_lookup(lookup).is_err());
    }

    #[test]
    fn test_etc_command() {
        let s = MinerSettings::from_lookup(env(&[
            ("COIN", "etc"),
            ("WALLET_ADDRESS", "0xabc"),
            ("WORKER_NAME", "rig7"),
        ]))
        .unwrap();
        let (program, args) = s.command().unwrap();
        assert_eq!(program, "lolMiner");
        assert_eq!(
            args,
            vec!["--algo", "ETHASH", "--pool", "stratum+tcp://etc.2miners.com:1010", "--user", "0xabc.rig7"]
        );
    }

    #[test]
    fn test_zec_command_with_overrides() {
        let s = MinerSettings::from_lookup(env(&[
            ("COIN", "ZEC"),
            ("WALLET_ADDRESS", "t1xyz"),
            ("POOL_URL", "stratum+tcp://eu.zec:2020"),
            ("MINER_BIN", "/opt/miniZ/miniZ"),
        ]))
        .unwrap();
        let (program, args) = s.command().unwrap();
        assert_eq!(program, "/opt/miniZ/miniZ");
        assert_eq!(args, vec!["--url", "stratum+tcp://eu.zec:2020", "--user", "t1xyz.worker01"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_child_terminates_sleeping_process() {
        let mut child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        tokio::time::timeout(Duration::from_secs(5), stop_child(&mut child, Duration::from_secs(2)))
            .await
            .expect("stop should not hang")
            .unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervisor_stops_on_shutdown() {
        let settings = MinerSettings {
            coin: SupportedCoin::Rvn,
            wallet: "w".to_string(),
            pool_url: "p".to_string(),
            worker: "k".to_string(),
            miner_bin: Some("sleep".to_string()),
            restart_backoff: Duration::from_millis(50),
        };
        // `sleep -a kawpow ...` exits immediately with an error; the
        // supervisor keeps restarting until shutdown.
        let supervisor = MinerSupervisor::new(settings);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.run(tokio::time::sleep(Duration::from_millis(200))),
        )
        .await
        .expect("supervisor should honour shutdown");
        assert!(result.is_ok());
    }
}
