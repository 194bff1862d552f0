use serde::Deserialize;
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use std::{collections::BTreeMap, env, path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "config/research.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path} unreadable: {message}")]
    Read { path: String, message: String },
    #[error("config file {path} invalid: {message}")]
    Parse { path: String, message: String },
    #[error("invalid setting `{0}`: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub fees: FeeConfig,
    pub sourcing: SourcingSettings,
    pub surface: SurfaceSettings,
    pub pipeline: PipelineSettings,
}

/// Inputs of the local profit formula. `fee_fixed` is expressed in the sell
/// currency; everything else in the local currency.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub fx_rate: f64,
    pub fee_percent: f64,
    pub fee_fixed: f64,
    pub outbound_shipping: f64,
    pub consumption_tax_rate: f64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            fx_rate: 150.0,
            fee_percent: 0.12,
            fee_fixed: 0.30,
            outbound_shipping: 800.0,
            consumption_tax_rate: 0.10,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourcingSettings {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "provider_timeout_ms")]
    pub provider_timeout: Duration,
    pub max_results_per_provider: usize,
    pub domestic_only: bool,
    pub max_unit_price: Option<f64>,
    /// Offers whose title scores below this against the query are dropped.
    /// Zero disables the filter.
    pub min_title_similarity: f64,
    /// Per-provider overrides of the documented minimum call interval.
    #[serde(rename = "min_interval_ms")]
    pub min_interval_overrides: BTreeMap<String, u64>,
}

impl Default for SourcingSettings {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(15),
            max_results_per_provider: 3,
            domestic_only: true,
            max_unit_price: None,
            min_title_similarity: 0.2,
            min_interval_overrides: BTreeMap::new(),
        }
    }
}

impl SourcingSettings {
    pub fn min_interval_for(&self, provider_id: &str, documented: Duration) -> Duration {
        self.min_interval_overrides
            .get(provider_id)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(documented)
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SurfaceSettings {
    pub sheet: String,
    /// Scratch rows available to the pool. One row reproduces a single shared slot.
    pub rows: Vec<u32>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_wait_ms")]
    pub max_wait: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "lock_wait_ms")]
    pub lock_wait: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "fence_ttl_ms")]
    pub fence_ttl: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "simulated_propagation_ms")]
    pub simulated_propagation: Duration,
}

impl Default for SurfaceSettings {
    fn default() -> Self {
        Self {
            sheet: "search_base".to_string(),
            rows: vec![10],
            max_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            lock_wait: Duration::from_secs(10),
            fence_ttl: Duration::from_secs(60),
            simulated_propagation: Duration::from_millis(300),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "deadline_secs")]
    pub deadline: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "deadline_margin_secs")]
    pub deadline_margin: Duration,
    pub job_concurrency: usize,
    pub queue_capacity: usize,
    pub ranked_offers: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(360),
            deadline_margin: Duration::from_secs(30),
            job_concurrency: 4,
            queue_capacity: 64,
            ranked_offers: 3,
        }
    }
}

impl PipelineSettings {
    /// Time the orchestrator may spend before it must give up and record a
    /// timeout, leaving headroom under the host's hard ceiling.
    pub fn run_budget(&self) -> Duration {
        self.deadline
            .checked_sub(self.deadline_margin)
            .filter(|budget| !budget.is_zero())
            .unwrap_or(self.deadline)
    }
}

impl Settings {
    /// Load the YAML settings file (if present) and apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = env::var("RESEARCH_CONFIG").ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());
        let mut settings = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else if explicit.is_some() {
            return Err(ConfigError::Read {
                path,
                message: "file not found".into(),
            });
        } else {
            Self::default()
        };
        settings.apply_env_overrides();
        settings.validate()?;
        info!(
            target = "research.config",
            path = %path,
            surface_rows = settings.surface.rows.len(),
            fx_rate = settings.fees.fx_rate,
            "settings loaded"
        );
        Ok(settings)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        Self::from_yaml(&raw).map_err(|err| ConfigError::Parse {
            path: path.to_string(),
            message: err.to_string(),
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(value) = env_parse("FX_RATE") {
            self.fees.fx_rate = value;
        }
        if let Some(value) = env_parse("FEE_PERCENT") {
            self.fees.fee_percent = value;
        }
        if let Some(value) = env_parse("FEE_FIXED") {
            self.fees.fee_fixed = value;
        }
        if let Some(value) = env_parse("OUTBOUND_SHIPPING") {
            self.fees.outbound_shipping = value;
        }
        if let Some(value) = env_parse("CONSUMPTION_TAX_RATE") {
            self.fees.consumption_tax_rate = value;
        }
        if let Some(value) = env_parse("MIN_TITLE_SIMILARITY") {
            self.sourcing.min_title_similarity = value;
        }
        if let Some(ms) = env_parse::<u64>("SURFACE_LOCK_WAIT_MS") {
            self.surface.lock_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SURFACE_MAX_WAIT_MS") {
            self.surface.max_wait = Duration::from_millis(ms);
        }
        if let Ok(sheet) = env::var("SURFACE_SHEET")
            && !sheet.trim().is_empty()
        {
            self.surface.sheet = sheet.trim().to_string();
        }
        if let Some(secs) = env_parse::<u64>("PIPELINE_DEADLINE_SECS") {
            self.pipeline.deadline = Duration::from_secs(secs);
        }
        if let Some(value) = env_parse::<usize>("JOB_CONCURRENCY").filter(|v| *v > 0) {
            self.pipeline.job_concurrency = value;
        }
        if let Some(value) = env_parse::<usize>("QUEUE_CAPACITY").filter(|v| *v > 0) {
            self.pipeline.queue_capacity = value;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fees.fx_rate.is_finite() && self.fees.fx_rate > 0.0) {
            return Err(ConfigError::Invalid(
                "fees.fx_rate",
                "must be a positive number".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.fees.fee_percent) {
            return Err(ConfigError::Invalid(
                "fees.fee_percent",
                "must be within [0, 1)".into(),
            ));
        }
        if !(self.sourcing.min_title_similarity.is_finite()
            && self.sourcing.min_title_similarity >= 0.0)
        {
            return Err(ConfigError::Invalid(
                "sourcing.min_title_similarity",
                "must be a non-negative number".into(),
            ));
        }
        if self.surface.rows.is_empty() {
            return Err(ConfigError::Invalid(
                "surface.rows",
                "at least one scratch row is required".into(),
            ));
        }
        if self.surface.rows.iter().any(|row| *row < 2) {
            return Err(ConfigError::Invalid(
                "surface.rows",
                "scratch rows start at row 2 (the item URL sits one row above)".into(),
            ));
        }
        if self.surface.max_wait < self.surface.poll_interval * 2 {
            return Err(ConfigError::Invalid(
                "surface.max_wait_ms",
                "must cover at least two poll intervals".into(),
            ));
        }
        Ok(())
    }
}

pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}
