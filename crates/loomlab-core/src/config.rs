//! Optional config from .loomlabrc or ~/.loomlabrc (JSON). Merged with env and CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dispatch::DispatcherKind;
use crate::error::ConfigError;
use crate::lag::LagSpec;
use crate::primes::Workload;
use crate::tracker::PeakSampling;

pub const CONFIG_FILE: &str = ".loomlabrc";

const DEFAULT_TASKS: usize = 1000;

/// Effective experiment settings. Every field is optional in the file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    pub tasks: usize,
    pub workers: usize,
    pub dispatcher: DispatcherKind,
    pub workload: Workload,
    pub lag: Option<LagSpec>,
    pub timeout_ms: Option<u64>,
    pub sampling: PeakSampling,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            tasks: DEFAULT_TASKS,
            workers: num_cpus::get(),
            dispatcher: DispatcherKind::Fixed,
            workload: Workload::Prime,
            lag: None,
            timeout_ms: None,
            sampling: PeakSampling::OnEnter,
        }
    }
}

impl ExperimentConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.timeout_ms == Some(0) {
            return Err(invalid("timeout_ms", "must be greater than 0"));
        }
        Ok(())
    }

    /// Apply `LOOMLAB_*` overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply `LOOMLAB_*` overrides read through `lookup`. Setting only one of
    /// the lag bounds keeps the other from the current lag (zero if none).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LOOMLAB_TASKS") {
            self.tasks = parse_env("LOOMLAB_TASKS", &v)?;
        }
        if let Some(v) = lookup("LOOMLAB_WORKERS") {
            self.workers = parse_env("LOOMLAB_WORKERS", &v)?;
        }
        if let Some(v) = lookup("LOOMLAB_DISPATCHER") {
            self.dispatcher = v
                .trim()
                .parse()
                .map_err(|reason: String| invalid("LOOMLAB_DISPATCHER", &reason))?;
        }
        if let Some(v) = lookup("LOOMLAB_TIMEOUT_MS") {
            self.timeout_ms = Some(parse_env("LOOMLAB_TIMEOUT_MS", &v)?);
        }

        let lag_min = lookup("LOOMLAB_LAG_MIN_MS")
            .map(|v| parse_env::<u64>("LOOMLAB_LAG_MIN_MS", &v))
            .transpose()?;
        let lag_max = lookup("LOOMLAB_LAG_MAX_MS")
            .map(|v| parse_env::<u64>("LOOMLAB_LAG_MAX_MS", &v))
            .transpose()?;
        if lag_min.is_some() || lag_max.is_some() {
            let current = self.lag.unwrap_or_default();
            let minimum = lag_min.map(Duration::from_millis).unwrap_or(current.minimum());
            let maximum = lag_max.map(Duration::from_millis).unwrap_or(current.maximum());
            // A lone minimum above the old maximum becomes a fixed lag.
            let maximum = if lag_max.is_none() { maximum.max(minimum) } else { maximum };
            self.lag = Some(LagSpec::new(minimum, maximum)?);
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, &format!("'{}': {}", value, e)))
}

/// Read one config file. It must exist.
pub fn load_config_from(path: &Path) -> Result<ExperimentConfig, ConfigError> {
    let shown = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: shown.clone(),
        source,
    })?;
    let config: ExperimentConfig =
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: shown.clone(),
            source,
        })?;
    config.validate()?;
    debug!(path = %shown, "loaded config");
    Ok(config)
}

/// Load .loomlabrc in `dir`, else ~/.loomlabrc, else defaults. The first file
/// found wins; a file that exists but does not parse is an error.
pub fn load_config(dir: &Path) -> Result<ExperimentConfig, ConfigError> {
    load_config_with_home(dir, home_dir().as_deref())
}

fn load_config_with_home(dir: &Path, home: Option<&Path>) -> Result<ExperimentConfig, ConfigError> {
    let mut candidates = vec![dir.join(CONFIG_FILE)];
    if let Some(home) = home {
        candidates.push(home.join(CONFIG_FILE));
    }
    match candidates.iter().find(|p| p.is_file()) {
        Some(path) => load_config_from(path),
        None => Ok(ExperimentConfig::default()),
    }
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(unix)]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
    #[cfg(windows)]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_files_give_defaults() {
        let dir = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        let config = load_config_with_home(dir.path(), Some(home.path())).unwrap();
        assert_eq!(config, ExperimentConfig::default());
        assert_eq!(config.tasks, 1000);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_local_file_wins_over_home() {
        let dir = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"tasks": 50, "dispatcher": "per-task", "lag": {"minimum_ms": 1, "maximum_ms": 3}}"#,
        )
        .unwrap();
        std::fs::write(home.path().join(CONFIG_FILE), r#"{"tasks": 7}"#).unwrap();
        let config = load_config_with_home(dir.path(), Some(home.path())).unwrap();
        assert_eq!(config.tasks, 50);
        assert_eq!(config.dispatcher, DispatcherKind::PerTask);
        assert_eq!(config.lag, Some(LagSpec::from_millis(1, 3).unwrap()));
        assert_eq!(config.workload, Workload::Prime);
    }

    #[test]
    fn test_load_config_from_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bench.json");
        std::fs::write(&path, r#"{"tasks": 5, "timeout_ms": 900}"#).unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.tasks, 5);
        assert_eq!(config.timeout(), Some(Duration::from_millis(900)));

        let missing = dir.path().join("absent.json");
        let err = load_config_from(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Io { ref path, .. } if path.ends_with("absent.json")));
    }

    #[test]
    fn test_home_file_used_when_no_local() {
        let dir = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        std::fs::write(home.path().join(CONFIG_FILE), r#"{"workload": "double"}"#).unwrap();
        let config = load_config_with_home(dir.path(), Some(home.path())).unwrap();
        assert_eq!(config.workload, Workload::Double);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        let err = load_config_with_home(dir.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"lag": {"minimum_ms": 9, "maximum_ms": 1}}"#,
        )
        .unwrap();
        assert!(load_config_with_home(dir.path(), None).is_err());

        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"workers": 0}"#).unwrap();
        let err = load_config_with_home(dir.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "workers"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ExperimentConfig::default();
        config
            .apply_env(env(&[
                ("LOOMLAB_TASKS", "12"),
                ("LOOMLAB_WORKERS", " 3 "),
                ("LOOMLAB_DISPATCHER", "single"),
                ("LOOMLAB_TIMEOUT_MS", "250"),
                ("LOOMLAB_LAG_MAX_MS", "8"),
            ]))
            .unwrap();
        assert_eq!(config.tasks, 12);
        assert_eq!(config.workers, 3);
        assert_eq!(config.dispatcher, DispatcherKind::Single);
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.lag, Some(LagSpec::from_millis(0, 8).unwrap()));
    }

    #[test]
    fn test_env_lone_lag_minimum_becomes_fixed() {
        let mut config = ExperimentConfig::default();
        config.apply_env(env(&[("LOOMLAB_LAG_MIN_MS", "5")])).unwrap();
        assert_eq!(config.lag, Some(LagSpec::fixed(Duration::from_millis(5))));
    }

    #[test]
    fn test_env_bad_values() {
        let mut config = ExperimentConfig::default();
        let err = config.apply_env(env(&[("LOOMLAB_TASKS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "LOOMLAB_TASKS"));
        let err = config
            .apply_env(env(&[("LOOMLAB_LAG_MIN_MS", "9"), ("LOOMLAB_LAG_MAX_MS", "2")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "lag"));
        assert!(config.apply_env(env(&[("LOOMLAB_DISPATCHER", "gpu")])).is_err());
    }

    #[test]
    fn test_config_json_shape() {
        let config = ExperimentConfig {
            workers: 4,
            ..ExperimentConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["dispatcher"], "fixed");
        assert_eq!(json["sampling"], "on-enter");
        assert_eq!(json["workers"], 4);
        assert!(json["lag"].is_null());
    }
}
