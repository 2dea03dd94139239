//! Vast.ai GPU marketplace integration.
//!
//! API base: https://console.vast.ai/api/v0
//! Auth: `Authorization: Bearer {key}` on every request.
//! Listing reads are retried with exponential backoff on 429/5xx; writes
//! (rent, exec, terminate) are single-shot so a retry can never double-rent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::FleetGateway;
use crate::types::{GpuOffer, InstanceStatus, MiningInstance, RigError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const API_BASE: &str = "https://console.vast.ai/api/v0";
const PROVIDER_NAME: &str = "vastai";

/// Maximum retries on rate limit / server errors for read calls.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 500;

/// Instance template used when renting.
#[derive(Debug, Clone)]
pub struct RentalTemplate {
    pub image: String,
    pub disk_gb: u32,
}

impl Default for RentalTemplate {
    fn default() -> Self {
        Self {
            image: "nvidia/cuda:12.2.2-base".to_string(),
            disk_gb: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListingsResponse {
    #[serde(default)]
    offers: Vec<VastOffer>,
}

/// Vast offer, reduced to the fields we read.
#[derive(Debug, Deserialize)]
struct VastOffer {
    id: serde_json::Value,
    #[serde(default)]
    gpu_name: String,
    /// Per-GPU memory in MB.
    #[serde(default)]
    gpu_ram: f64,
    /// Total price per hour including storage.
    #[serde(default = "unpriced")]
    dph_total: f64,
}

fn unpriced() -> f64 {
    f64::MAX
}

#[derive(Debug, Serialize)]
struct RentRequest<'a> {
    offer_id: &'a str,
    image: &'a str,
    disk: u32,
}

#[derive(Debug, Deserialize)]
struct RentResponse {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    new_contract: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    cmd: &'a str,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    actual_status: Option<String>,
    #[serde(default)]
    instances: Option<Box<StatusResponse>>,
}

impl StatusResponse {
    fn state(self) -> Option<String> {
        self.state
            .or(self.actual_status)
            .or_else(|| self.instances.and_then(|inner| inner.state()))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct VastAiClient {
    http: Client,
    api_key: SecretString,
    base_url: String,
    template: RentalTemplate,
}

impl VastAiClient {
    pub fn new(api_key: SecretString, template: RentalTemplate, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("rigswitch/0.1.0")
            .build()
            .context("Failed to build HTTP client for Vast.ai")?;

        Ok(Self {
            http,
            api_key,
            base_url: API_BASE.to_string(),
            template,
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(self.api_key.expose_secret())
    }

    /// GET with retry + backoff.
    async fn get_with_retry(&self, url: &str) -> Result<Response> {
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, "Retrying Vast.ai request");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.authed(self.http.get(url)).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(status = %status, attempt, "Retryable Vast.ai API error");
                        last_error = Some(format!("HTTP {status}: {body}"));
                        continue;
                    }
                    return Err(fleet_error(format!("API error {status}: {body}")));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Vast.ai request failed");
                    last_error = Some(format!("Request error: {e}"));
                }
            }
        }

        anyhow::bail!(
            "Vast.ai API failed after {} retries: {}",
            MAX_RETRIES,
            last_error.unwrap_or_default()
        )
    }

    async fn expect_success(resp: Response, what: &str) -> Result<Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(fleet_error(format!("{what} failed {status}: {body}")))
    }
}

fn fleet_error(message: String) -> anyhow::Error {
    RigError::Fleet {
        provider: PROVIDER_NAME.to_string(),
        message,
    }
    .into()
}

/// Convert a listings payload into offers within the RAM and price limits.
fn parse_offers(body: ListingsResponse, min_ram_gb: f64, max_price: f64) -> Vec<GpuOffer> {
    body.offers
        .into_iter()
        .map(|o| GpuOffer {
            id: json_id(&o.id),
            gpu_name: o.gpu_name,
            vram_gb: o.gpu_ram / 1024.0,
            price_per_hour: o.dph_total,
        })
        .filter(|o| o.price_per_hour <= max_price && o.vram_gb >= min_ram_gb)
        .collect()
}

/// Vast ids arrive as numbers or strings; normalise to a string.
fn json_id(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl FleetGateway for VastAiClient {
    async fn find_offers(&self, min_ram_gb: f64, max_price: f64) -> Result<Vec<GpuOffer>> {
        let query = format!("verified=true&cuda_vers=>=11&min_gpu_ram={min_ram_gb}");
        let url = format!(
            "{}/listings?q={}&order={}&type=on-demand",
            self.base_url,
            urlencoding::encode(&query),
            urlencoding::encode("dph_total+asc"),
        );

        debug!(url = %url, "Fetching Vast.ai listings");

        let body: ListingsResponse = self
            .get_with_retry(&url)
            .await?
            .json()
            .await
            .context("Failed to parse Vast.ai listings response")?;

        let offers = parse_offers(body, min_ram_gb, max_price);
        info!(count = offers.len(), provider = PROVIDER_NAME, "Offers within limits");
        Ok(offers)
    }

    async fn rent(&self, offer: &GpuOffer) -> Result<MiningInstance> {
        let request = RentRequest {
            offer_id: &offer.id,
            image: &self.template.image,
            disk: self.template.disk_gb,
        };

        let resp = self
            .authed(self.http.post(format!("{}/instances", self.base_url)))
            .json(&request)
            .send()
            .await
            .context("Vast.ai rent request failed")?;

        let body: RentResponse = Self::expect_success(resp, "rent")
            .await?
            .json()
            .await
            .context("Failed to parse Vast.ai rent response")?;

        let id = body
            .id
            .or(body.new_contract)
            .map(|v| json_id(&v))
            .context("Vast.ai rent response carried no instance id")?;

        info!(instance_id = %id, offer_id = %offer.id, "Instance rented");
        Ok(MiningInstance::renting(id, offer.id.clone()))
    }

    async fn exec(&self, instance_id: &str, command: &str) -> Result<serde_json::Value> {
        debug!(instance_id, command, "Vast.ai exec");

        let resp = self
            .authed(self.http.post(format!("{}/instances/{}/exec", self.base_url, instance_id)))
            .json(&ExecRequest { cmd: command })
            .send()
            .await
            .with_context(|| format!("Vast.ai exec on {instance_id} failed"))?;

        Self::expect_success(resp, "exec")
            .await?
            .json()
            .await
            .context("Failed to parse Vast.ai exec response")
    }

    async fn get_status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let url = format!("{}/instances/{}", self.base_url, instance_id);
        let body: StatusResponse = self
            .get_with_retry(&url)
            .await?
            .json()
            .await
            .context("Failed to parse Vast.ai instance response")?;

        Ok(InstanceStatus {
            state: body.state().unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn terminate(&self, instance_id: &str) -> Result<bool> {
        let resp = self
            .authed(self.http.delete(format!("{}/instances/{}", self.base_url, instance_id)))
            .send()
            .await
            .with_context(|| format!("Vast.ai terminate of {instance_id} failed"))?;

        let ok = resp.status().is_success();
        if !ok {
            warn!(instance_id, status = %resp.status(), "Vast.ai refused terminate");
        }
        Ok(ok)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
