//! Layered runtime settings.
//!
//! Built-in defaults, then an optional TOML file, then `RSIBOT_*` environment
//! variables (`__` separates nested tables, e.g. `RSIBOT_STAGE_THRESHOLDS__T2`).

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::binance::{BINANCE_REST_BASE, BINANCE_WS_BASE};
use crate::execution::position_manager::{LifecycleConfig, StageThresholds, StopMultipliers};
use crate::execution::supervisor::SupervisorConfig;
use crate::indicators::{IndicatorSettings, SignalSmoothing};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("thresholds must satisfy 0 < t0 < t1 < t2 (got {t0}, {t1}, {t2})")]
    ThresholdOrder { t0: f64, t1: f64, t2: f64 },

    #[error("stop multipliers must satisfy 0 < k0 < 1 and 0 < k1 < k2 (got {k0}, {k1}, {k2})")]
    StopOrder { k0: f64, k1: f64, k2: f64 },

    #[error("{field} must be in (0, 1), got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("invalid interval '{0}'")]
    Interval(String),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub buffer_capacity: usize,
    pub snapshot_timeout_secs: u64,
    pub snapshot_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub stream_idle_timeout_secs: u64,
    pub rest_base_url: String,
    pub ws_base_url: String,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 500,
            snapshot_timeout_secs: 10,
            snapshot_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            stream_idle_timeout_secs: 120,
            rest_base_url: BINANCE_REST_BASE.to_string(),
            ws_base_url: BINANCE_WS_BASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub symbol: String,
    pub tick_interval: String,
    pub signal_interval: String,
    pub oscillator_period: usize,
    pub signal_smoothing_period: usize,
    pub signal_smoothing: SignalSmoothing,
    pub risk_percent_of_balance: f64,
    pub stage_thresholds: StageThresholds,
    pub stop_multipliers: StopMultipliers,
    pub partial_exit_fraction: f64,
    pub take_profit_r: Option<f64>,
    pub stop_buffer_pct: f64,
    pub trail_trigger_pct: f64,
    pub trail_step_pct: f64,
    pub initial_balance: f64,
    pub stream: StreamSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let lifecycle = LifecycleConfig::default();
        let indicators = IndicatorSettings::default();
        Self {
            symbol: "SOLUSDT".to_string(),
            tick_interval: "1m".to_string(),
            signal_interval: "15m".to_string(),
            oscillator_period: indicators.oscillator_period,
            signal_smoothing_period: indicators.signal_period,
            signal_smoothing: indicators.smoothing,
            risk_percent_of_balance: lifecycle.risk_percent_of_balance,
            stage_thresholds: lifecycle.thresholds,
            stop_multipliers: lifecycle.stop_multipliers,
            partial_exit_fraction: lifecycle.partial_exit_fraction,
            take_profit_r: lifecycle.take_profit_r,
            stop_buffer_pct: lifecycle.stop_buffer_pct,
            trail_trigger_pct: lifecycle.trail_trigger_pct,
            trail_step_pct: lifecycle.trail_step_pct,
            initial_balance: 1000.0,
            stream: StreamSettings::default(),
        }
    }
}

impl Settings {
    /// Load defaults, then `path` if it exists, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            if path.exists() {
                tracing::info!("Loading configuration from {:?}", path);
            } else {
                tracing::warn!("Config file {:?} not found, using defaults", path);
            }
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("RSIBOT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Fail fast on anything the engine could not run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::Invalid("symbol must not be empty".into()));
        }
        if self.oscillator_period == 0 || self.signal_smoothing_period == 0 {
            return Err(ConfigError::Invalid(
                "oscillator_period and signal_smoothing_period must be positive".into(),
            ));
        }
        if self.signal_smoothing_period >= self.oscillator_period {
            tracing::warn!(
                oscillator_period = self.oscillator_period,
                signal_period = self.signal_smoothing_period,
                "Signal period is not shorter than the oscillator period"
            );
        }
        if !(self.initial_balance.is_finite() && self.initial_balance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "initial_balance must be positive, got {}",
                self.initial_balance
            )));
        }

        let tick_ms = parse_interval(&self.tick_interval)?;
        let signal_ms = parse_interval(&self.signal_interval)?;
        if signal_ms % tick_ms != 0 {
            return Err(ConfigError::Invalid(format!(
                "signal_interval {} is not a multiple of tick_interval {}",
                self.signal_interval, self.tick_interval
            )));
        }

        let stream = &self.stream;
        if stream.buffer_capacity <= self.oscillator_period + 1 {
            return Err(ConfigError::Invalid(format!(
                "buffer_capacity ({}) must exceed oscillator_period + 1",
                stream.buffer_capacity
            )));
        }
        if stream.backoff_base_ms == 0 || stream.backoff_max_ms < stream.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "backoff_max_ms must be >= backoff_base_ms > 0".into(),
            ));
        }
        if stream.snapshot_timeout_secs == 0 || stream.stream_idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }

        self.lifecycle().validate()
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            risk_percent_of_balance: self.risk_percent_of_balance,
            stop_buffer_pct: self.stop_buffer_pct,
            thresholds: self.stage_thresholds,
            stop_multipliers: self.stop_multipliers,
            partial_exit_fraction: self.partial_exit_fraction,
            trail_trigger_pct: self.trail_trigger_pct,
            trail_step_pct: self.trail_step_pct,
            take_profit_r: self.take_profit_r,
        }
    }

    pub fn indicator_settings(&self) -> IndicatorSettings {
        IndicatorSettings {
            oscillator_period: self.oscillator_period,
            signal_period: self.signal_smoothing_period,
            smoothing: self.signal_smoothing,
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            symbol: self.symbol.clone(),
            tick_interval: self.tick_interval.clone(),
            signal_interval: self.signal_interval.clone(),
            snapshot_count: self.stream.buffer_capacity,
            snapshot_timeout: std::time::Duration::from_secs(self.stream.snapshot_timeout_secs),
            snapshot_retries: self.stream.snapshot_retries,
            backoff_base: std::time::Duration::from_millis(self.stream.backoff_base_ms),
            backoff_max: std::time::Duration::from_millis(self.stream.backoff_max_ms),
            idle_timeout: std::time::Duration::from_secs(self.stream.stream_idle_timeout_secs),
        }
    }
}

/// Parse an exchange interval string (`1m`, `15m`, `1h`, `1d`) into milliseconds
pub fn parse_interval(interval: &str) -> Result<i64, ConfigError> {
    let interval = interval.trim();
    let invalid = || ConfigError::Interval(interval.to_string());

    let split = interval
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (amount, unit) = interval.split_at(split);
    let amount: i64 = amount.parse().map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }

    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        _ => return Err(invalid()),
    };
    Ok(amount * unit_ms)
}
