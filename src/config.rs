//! Robot configuration
//!
//! Defaults suit a robot running next to its leader on one host. Any field can
//! be overridden with a `DDD_*` environment variable.

use anyhow::{Context, Result};
use ddd_shared::timing;
use std::str::FromStr;
use std::time::Duration;

/// Base port; robot N listens on `BASE_PORT + N` unless told otherwise
pub const BASE_PORT: u16 = 9100;

/// Configuration for one robot
#[derive(Debug, Clone)]
pub struct RobotConfig {
    /// Robot number; robot 0 drives forward, the others are mirrored
    pub robot_id: u8,
    /// Address the link listens on for the leader
    pub listen_addr: String,
    /// Control loop period
    pub tick_interval: Duration,
    /// How long a prepared action waits for its commit
    pub prepare_timeout: Duration,
    /// Simulated dock sensor fires after this many seeking ticks
    pub dock_after_ticks: u32,
    /// Wheel speed for drive commands
    pub drive_speed: i16,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            robot_id: 0,
            listen_addr: format!("127.0.0.1:{}", BASE_PORT),
            tick_interval: Duration::from_millis(timing::TICK_INTERVAL_MS),
            prepare_timeout: Duration::from_millis(u64::from(timing::PREPARE_TIMEOUT_MS)),
            dock_after_ticks: 200,
            drive_speed: timing::DRIVE_SPEED,
        }
    }
}

impl RobotConfig {
    /// Build the configuration from defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let robot_id: u8 = parse_or(&lookup, "DDD_ROBOT_ID", defaults.robot_id)?;
        let listen_addr = lookup("DDD_LISTEN_ADDR").unwrap_or_else(|| {
            format!("127.0.0.1:{}", BASE_PORT + u16::from(robot_id))
        });
        let tick_ms = parse_or(&lookup, "DDD_TICK_MS", timing::TICK_INTERVAL_MS)?;
        let prepare_timeout_ms = parse_or(
            &lookup,
            "DDD_PREPARE_TIMEOUT_MS",
            u64::from(timing::PREPARE_TIMEOUT_MS),
        )?;

        Ok(Self {
            robot_id,
            listen_addr,
            tick_interval: Duration::from_millis(tick_ms.max(1)),
            prepare_timeout: Duration::from_millis(prepare_timeout_ms),
            dock_after_ticks: parse_or(&lookup, "DDD_DOCK_AFTER_TICKS", defaults.dock_after_ticks)?,
            drive_speed: parse_or(&lookup, "DDD_DRIVE_SPEED", defaults.drive_speed)?,
        })
    }

    /// Prepare timeout in clock milliseconds
    pub fn prepare_timeout_ms(&self) -> u32 {
        u32::try_from(self.prepare_timeout.as_millis()).unwrap_or(u32::MAX)
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
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RobotConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.robot_id, 0);
        assert_eq!(config.listen_addr, "127.0.0.1:9100");
        assert_eq!(config.tick_interval, Duration::from_millis(10));
        assert_eq!(config.prepare_timeout_ms(), 5000);
    }

    #[test]
    fn test_robot_id_moves_default_port() {
        let config = RobotConfig::from_lookup(lookup(&[("DDD_ROBOT_ID", "1")])).unwrap();
        assert_eq!(config.robot_id, 1);
        assert_eq!(config.listen_addr, "127.0.0.1:9101");
    }

    #[test]
    fn test_overrides() {
        let config = RobotConfig::from_lookup(lookup(&[
            ("DDD_LISTEN_ADDR", "0.0.0.0:7000"),
            ("DDD_TICK_MS", "5"),
            ("DDD_PREPARE_TIMEOUT_MS", "1500"),
            ("DDD_DOCK_AFTER_TICKS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:7000");
        assert_eq!(config.tick_interval, Duration::from_millis(5));
        assert_eq!(config.prepare_timeout_ms(), 1500);
        assert_eq!(config.dock_after_ticks, 0);
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let err = RobotConfig::from_lookup(lookup(&[("DDD_ROBOT_ID", "two")])).unwrap_err();
        assert!(err.to_string().contains("DDD_ROBOT_ID"));
    }
}
