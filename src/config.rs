use anyhow::Context;
use figment::providers::Env;
use figment::Figment;
use serde::Deserialize;

use crate::cache::ForecastPolicy;
use crate::projector::DEFAULT_LOOKBACK_MONTHS;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Process configuration, read from the environment after `.env` is loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_sweep_workers")]
    pub sweep_workers: usize,
    #[serde(default = "default_lookback_months")]
    pub lookback_months: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sweep_workers() -> usize {
    4
}

fn default_lookback_months() -> u32 {
    DEFAULT_LOOKBACK_MONTHS
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_figment(Figment::new().merge(Env::raw()))
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment.extract().context("invalid configuration")?;
        anyhow::ensure!(config.sweep_workers >= 1, "SWEEP_WORKERS must be at least 1");
        Ok(config)
    }

    pub fn policy(&self) -> ForecastPolicy {
        ForecastPolicy {
            lookback_months: self.lookback_months,
            sweep_workers: self.sweep_workers,
        }
    }
}
