//! Leader configuration
//!
//! Defaults drive two robots on the local host. Override with `DDD_*`
//! environment variables.

use anyhow::{bail, Context, Result};
use ddd_shared::timing;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the leader
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Peripheral addresses; index N is robot N
    pub peripherals: Vec<String>,
    /// Delay between the prepare and the agreed execution time
    pub prepare_delay_ms: u32,
    /// Number of synchronized rounds to run
    pub rounds: u32,
    /// Pause between rounds
    pub round_interval: Duration,
    /// How long to wait for a single response
    pub response_timeout: Duration,
    /// Wait after Go so the robots can dock before the first round
    pub settle_time: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            peripherals: vec!["127.0.0.1:9100".into(), "127.0.0.1:9101".into()],
            prepare_delay_ms: timing::DEFAULT_PREPARE_DELAY_MS,
            rounds: 10,
            round_interval: Duration::from_millis(800),
            response_timeout: Duration::from_millis(timing::RESPONSE_TIMEOUT_MS),
            settle_time: Duration::from_millis(3000),
        }
    }
}

impl ControllerConfig {
    /// Build the configuration from defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let peripherals = match lookup("DDD_PERIPHERALS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(String::from)
                .collect(),
            None => defaults.peripherals,
        };
        if peripherals.is_empty() {
            bail!("DDD_PERIPHERALS lists no peripherals");
        }

        let round_interval_ms = parse_or(
            &lookup,
            "DDD_ROUND_INTERVAL_MS",
            defaults.round_interval.as_millis() as u64,
        )?;
        let response_timeout_ms = parse_or(&lookup, "DDD_RESPONSE_TIMEOUT_MS", timing::RESPONSE_TIMEOUT_MS)?;
        let settle_ms = parse_or(&lookup, "DDD_SETTLE_MS", defaults.settle_time.as_millis() as u64)?;

        Ok(Self {
            peripherals,
            prepare_delay_ms: parse_or(&lookup, "DDD_PREPARE_DELAY_MS", defaults.prepare_delay_ms)?,
            rounds: parse_or(&lookup, "DDD_ROUNDS", defaults.rounds)?,
            round_interval: Duration::from_millis(round_interval_ms),
            response_timeout: Duration::from_millis(response_timeout_ms),
            settle_time: Duration::from_millis(settle_ms),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
