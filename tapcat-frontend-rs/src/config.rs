use std::time::Duration;

use tally::{CounterId, SyncConfig};

use crate::{cadence::CadenceConfig, combo::DEFAULT_COMBO_TIMEOUT, multiplier::LuckConfig};

/// The row everyone taps on.
pub const GLOBAL_COUNTER_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a number of milliseconds, got {value:?}")]
    InvalidMillis { name: &'static str, value: String },
    #[error("{name} must not be empty")]
    Empty { name: &'static str },
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub global_counter_id: CounterId,
    /// Also keep a per-user counter in sync, fed the same taps.
    pub personal_counter_id: Option<CounterId>,
    pub sync: SyncConfig,
    pub cadence: CadenceConfig,
    #[serde(with = "tally::duration_ms")]
    pub combo_timeout: Duration,
    pub luck: LuckConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_counter_id: CounterId::new(GLOBAL_COUNTER_ID),
            personal_counter_id: None,
            sync: SyncConfig::default(),
            cadence: CadenceConfig::default(),
            combo_timeout: DEFAULT_COMBO_TIMEOUT,
            luck: LuckConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by any `TAPCAT_*` variables in the environment or a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(id) = lookup("TAPCAT_GLOBAL_COUNTER_ID") {
            config.global_counter_id = non_empty("TAPCAT_GLOBAL_COUNTER_ID", id)?.into();
        }
        if let Some(id) = lookup("TAPCAT_PERSONAL_COUNTER_ID") {
            config.personal_counter_id = Some(non_empty("TAPCAT_PERSONAL_COUNTER_ID", id)?.into());
        }
        if let Some(value) = lookup("TAPCAT_FLUSH_INTERVAL_MS") {
            config.sync.flush_interval = millis("TAPCAT_FLUSH_INTERVAL_MS", value)?;
        }
        if let Some(value) = lookup("TAPCAT_POLL_INTERVAL_MS") {
            config.sync.poll_interval = millis("TAPCAT_POLL_INTERVAL_MS", value)?;
        }
        Ok(config)
    }
}

fn non_empty(name: &'static str, value: String) -> Result<String, ConfigError> {
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(ConfigError::Empty { name });
    }
    Ok(value)
}

fn millis(name: &'static str, value: String) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(millis) if millis > 0 => Ok(Duration::from_millis(millis)),
        _ => Err(ConfigError::InvalidMillis { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_any_variables() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.global_counter_id.as_str(), GLOBAL_COUNTER_ID);
        assert_eq!(config.sync.flush_interval, Duration::from_millis(200));
        assert_eq!(config.combo_timeout, Duration::from_secs(2));
    }

    #[test]
    fn variables_override_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("TAPCAT_PERSONAL_COUNTER_ID", " user-42 "),
            ("TAPCAT_FLUSH_INTERVAL_MS", "150"),
        ]))
        .unwrap();
        assert_eq!(config.personal_counter_id, Some(CounterId::new("user-42")));
        assert_eq!(config.sync.flush_interval, Duration::from_millis(150));
        assert_eq!(config.sync.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn bad_values_are_reported() {
        let err = EngineConfig::from_lookup(lookup(&[("TAPCAT_POLL_INTERVAL_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidMillis {
                name: "TAPCAT_POLL_INTERVAL_MS",
                ..
            }
        ));
        assert!(EngineConfig::from_lookup(lookup(&[("TAPCAT_GLOBAL_COUNTER_ID", "  ")])).is_err());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"combo_timeout": 1500, "sync": {"flush_interval": 250}}"#)
                .unwrap();
        assert_eq!(config.combo_timeout, Duration::from_millis(1500));
        assert_eq!(config.sync.flush_interval, Duration::from_millis(250));
        assert_eq!(config.sync.max_retries_before_issue, 5);
        assert_eq!(config.cadence.fast_threshold, 7);
    }
}
