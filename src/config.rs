use anyhow::Error;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub ice_servers: Option<Vec<IceServerItem>>,
    pub recovery: RecoveryConfig,
    pub media: MediaConfig,
}

#[derive(Debug, Deserialize, Default, Serialize, Clone)]
pub struct IceServerItem {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Declared capture quality tier. Device-level interpretation belongs to the
/// injected capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureProfile {
    Low,
    Standard,
    High,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MediaConfig {
    pub profile: CaptureProfile,
    /// 0 disables suppression, higher values mix more of the denoised signal
    pub noise_suppression_level: u8,
    pub zoom_min: f32,
    pub zoom_max: f32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            profile: CaptureProfile::Standard,
            noise_suppression_level: 1,
            zoom_min: 1.0,
            zoom_max: 4.0,
        }
    }
}

/// Recovery and quality-classification policy. These are observed tunables,
/// not invariants; deployments override them in the config file.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RecoveryConfig {
    /// cadence of connection-state sampling, milliseconds
    pub sample_interval_ms: u64,
    /// consecutive disconnected samples required before reconnecting
    pub disconnect_threshold: u32,
    /// renegotiation attempts before the call is failed
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// liveness write cadence while connected
    pub heartbeat_interval_ms: u64,
    pub negotiation_timeout_ms: u64,
    /// packet-loss tier boundaries, percent
    pub good_loss_pct: f32,
    pub fair_loss_pct: f32,
    pub poor_loss_pct: f32,
    /// round-trip tier boundaries, milliseconds
    pub good_rtt_ms: u32,
    pub fair_rtt_ms: u32,
    pub poor_rtt_ms: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2000,
            disconnect_threshold: 3,
            max_retries: 5,
            backoff_base_ms: 1000,
            backoff_cap_ms: 10000,
            heartbeat_interval_ms: 10000,
            negotiation_timeout_ms: 15000,
            good_loss_pct: 2.0,
            fair_loss_pct: 8.0,
            poor_loss_pct: 15.0,
            good_rtt_ms: 150,
            fair_rtt_ms: 400,
            poor_rtt_ms: 800,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn ice_urls(&self) -> Vec<String> {
        self.ice_servers
            .as_ref()
            .map(|servers| servers.iter().flat_map(|s| s.urls.clone()).collect())
            .unwrap_or_default()
    }
}
