//! Scheduler configuration loading.
//!
//! Settings come from an optional JSON5 file and are then overridden by
//! `LOOPER_*` environment variables. Every field is optional; unset fields
//! resolve to the defaults a fresh test run expects (clock at 0, unpaused,
//! negative delays rejected).

use crate::error::{Error, Result};
use crate::scheduler::IdleState;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const START_TIME_ENV: &str = "LOOPER_START_TIME_MS";
pub const IDLE_STATE_ENV: &str = "LOOPER_IDLE_STATE";
pub const NEGATIVE_DELAY_ENV: &str = "LOOPER_NEGATIVE_DELAY";

/// What to do with a post whose delay is below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegativeDelayPolicy {
    /// Fail the post with [`Error::NegativeDelay`].
    #[default]
    Reject,
    /// Treat the delay as zero.
    Clamp,
}

impl NegativeDelayPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" | "error" | "strict" => Some(Self::Reject),
            "clamp" | "zero" | "lenient" => Some(Self::Clamp),
            _ => None,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Virtual time the clock starts at, and returns to on reset.
    #[serde(alias = "startTimeMs")]
    pub start_time_ms: Option<u64>,
    /// Idle state a new or reset scheduler starts in.
    #[serde(alias = "idleState")]
    pub idle_state: Option<IdleState>,
    #[serde(alias = "negativeDelay")]
    pub negative_delay: Option<NegativeDelayPolicy>,
}

impl SchedulerConfig {
    /// Defaults plus `LOOPER_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env_overrides_with(|name| std::env::var(name).ok())
    }

    /// Load settings from a JSON5 file.
    ///
    /// A missing or blank file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        json5::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse scheduler config {}: {e}",
                path.display()
            ))
        })
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_overrides_with<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(START_TIME_ENV) {
            let value = raw.trim().parse::<u64>().map_err(|e| {
                Error::config(format!("{START_TIME_ENV}={raw:?} is not a valid time: {e}"))
            })?;
            self.start_time_ms = Some(value);
        }
        if let Some(raw) = lookup(IDLE_STATE_ENV) {
            let state = IdleState::parse(&raw).ok_or_else(|| {
                Error::config(format!("{IDLE_STATE_ENV}={raw:?} is not a known idle state"))
            })?;
            self.idle_state = Some(state);
        }
        if let Some(raw) = lookup(NEGATIVE_DELAY_ENV) {
            let policy = NegativeDelayPolicy::parse(&raw).ok_or_else(|| {
                Error::config(format!(
                    "{NEGATIVE_DELAY_ENV}={raw:?} is not a known negative delay policy"
                ))
            })?;
            self.negative_delay = Some(policy);
        }
        Ok(self)
    }

    pub fn start_time(&self) -> u64 {
        self.start_time_ms.unwrap_or(0)
    }

    pub fn initial_idle_state(&self) -> IdleState {
        self.idle_state.unwrap_or(IdleState::Unpaused)
    }

    pub fn negative_delay_policy(&self) -> NegativeDelayPolicy {
        self.negative_delay.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_resolve() {
        let config = SchedulerConfig::default();
        assert_eq!(config.start_time(), 0);
        assert_eq!(config.initial_idle_state(), IdleState::Unpaused);
        assert_eq!(config.negative_delay_policy(), NegativeDelayPolicy::Reject);
    }

    #[test]
    fn load_returns_defaults_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SchedulerConfig::load_from_path(&dir.path().join("absent.json5"))
            .expect("load missing");
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn load_parses_json5_with_camel_case_aliases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("looper.json5");
        std::fs::write(
            &path,
            r#"{
                // trailing commas and comments are fine
                startTimeMs: 100,
                idleState: "paused",
                negativeDelay: "clamp",
            }"#,
        )
        .expect("write config");

        let config = SchedulerConfig::load_from_path(&path).expect("load");
        assert_eq!(config.start_time(), 100);
        assert_eq!(config.initial_idle_state(), IdleState::Paused);
        assert_eq!(config.negative_delay_policy(), NegativeDelayPolicy::Clamp);
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("looper.json5");
        std::fs::write(&path, "{ idleState: ").expect("write config");

        let err = SchedulerConfig::load_from_path(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[test]
    fn env_overrides_file_values() {
        let config = SchedulerConfig {
            start_time_ms: Some(5),
            idle_state: Some(IdleState::Paused),
            negative_delay: None,
        };
        let config = config
            .apply_env_overrides_with(lookup_from(&[
                (START_TIME_ENV, " 250 "),
                (IDLE_STATE_ENV, "constant-idle"),
                (NEGATIVE_DELAY_ENV, "clamp"),
            ]))
            .expect("apply env");

        assert_eq!(config.start_time(), 250);
        assert_eq!(config.initial_idle_state(), IdleState::ConstantIdle);
        assert_eq!(config.negative_delay_policy(), NegativeDelayPolicy::Clamp);
    }

    #[test]
    fn from_env_matches_process_environment() {
        let expected = SchedulerConfig::default()
            .apply_env_overrides_with(|name| std::env::var(name).ok());
        match (SchedulerConfig::from_env(), expected) {
            (Ok(actual), Ok(expected)) => assert_eq!(actual, expected),
            (Err(actual), Err(expected)) => assert_eq!(actual.to_string(), expected.to_string()),
            (actual, expected) => unreachable!("Expected same outcome, got {actual:?} vs {expected:?}"),
        }
    }

    #[test]
    fn env_rejects_unknown_idle_state() {
        let err = SchedulerConfig::default()
            .apply_env_overrides_with(lookup_from(&[(IDLE_STATE_ENV, "sleepy")]))
            .unwrap_err();
        assert!(err.to_string().contains(IDLE_STATE_ENV));
    }

    #[test]
    fn env_rejects_bad_start_time() {
        let err = SchedulerConfig::default()
            .apply_env_overrides_with(lookup_from(&[(START_TIME_ENV, "-1")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
