//! Engine settings loaded from TOML.
//!
//! Defaults are embedded via `include_str!`; `Settings::from_toml` parses
//! and validates a caller-provided override. The sampler section seeds
//! the live sampler state, which the runtime setters can still adjust.

use serde::Deserialize;

pub const DEFAULT_SETTINGS_TOML: &str = include_str!("default_settings.toml");

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("TOML parse error: {0}")]
    Parse(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub model: ModelSettings,
    pub sampler: SamplerSettings,
    pub guards: GuardSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSettings {
    /// Upper bound on the KV-cache length; 0 keeps the file's context
    /// length.
    pub context_cap: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplerSettings {
    /// Lower clamp applied to the requested temperature.
    pub temperature_floor: f32,
    /// Candidate count when nucleus sampling is off.
    pub top_k: usize,
    /// Divisive penalty for ids in the recent window (1.0 disables).
    pub repetition_penalty: f32,
    /// How many recent ids the penalties look at.
    pub repetition_window: usize,
    /// Per-occurrence subtractive penalty (0.0 disables).
    pub frequency_penalty: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardSettings {
    /// Stop once a generated token starts a codepoint of three or more
    /// UTF-8 bytes. Heuristic against drift into scripts the small models
    /// were not trained for.
    pub drift_guard: bool,
    /// Generated-token count before the drift guard arms.
    pub drift_min_tokens: usize,
    /// A repeat of this many ids twice in a row stops generation.
    pub cycle_len: usize,
    /// Extra iterations granted after max_tokens to finish a sentence.
    pub grace_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_toml(DEFAULT_SETTINGS_TOML).expect("embedded settings TOML must be valid")
    }
}

impl Settings {
    pub fn from_toml(toml_str: &str) -> Result<Self, SettingsError> {
        let s: Settings =
            toml::from_str(toml_str).map_err(|e| SettingsError::Parse(e.to_string()))?;
        s.validate()?;
        Ok(s)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        fn check(ok: bool, field: &'static str, reason: &'static str) -> Result<(), SettingsError> {
            if ok {
                Ok(())
            } else {
                Err(SettingsError::InvalidValue { field, reason })
            }
        }

        check(
            self.sampler.temperature_floor >= 0.0,
            "sampler.temperature_floor",
            "must be non-negative",
        )?;
        check(self.sampler.top_k > 0, "sampler.top_k", "must be positive")?;
        check(
            self.sampler.repetition_penalty > 0.0,
            "sampler.repetition_penalty",
            "must be positive",
        )?;
        check(
            self.sampler.repetition_window > 0,
            "sampler.repetition_window",
            "must be positive",
        )?;
        check(
            self.sampler.frequency_penalty >= 0.0,
            "sampler.frequency_penalty",
            "must be non-negative",
        )?;
        check(self.guards.cycle_len > 0, "guards.cycle_len", "must be positive")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_default_toml() {
        let s = Settings::default();
        assert_eq!(s.model.context_cap, 4096);
        assert_eq!(s.sampler.top_k, 50);
        assert_eq!(s.sampler.repetition_window, 64);
        assert!((s.sampler.repetition_penalty - 1.1).abs() < f32::EPSILON);
        assert!((s.sampler.frequency_penalty - 0.2).abs() < f32::EPSILON);
        assert!(s.guards.drift_guard);
        assert_eq!(s.guards.cycle_len, 8);
        assert_eq!(s.guards.grace_limit, 32);
    }

    #[test]
    fn parse_valid_custom_toml() {
        let toml = r#"
[model]
context_cap = 0

[sampler]
temperature_floor = 0.2
top_k = 40
repetition_penalty = 1.3
repetition_window = 128
frequency_penalty = 0.0

[guards]
drift_guard = false
drift_min_tokens = 0
cycle_len = 4
grace_limit = 16
"#;
        let s = Settings::from_toml(toml).unwrap();
        assert_eq!(s.model.context_cap, 0);
        assert_eq!(s.sampler.top_k, 40);
        assert!(!s.guards.drift_guard);
    }

    #[test]
    fn error_zero_window() {
        let toml = DEFAULT_SETTINGS_TOML.replace("repetition_window = 64", "repetition_window = 0");
        let err = Settings::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("repetition_window"));
    }

    #[test]
    fn error_negative_penalty() {
        let toml =
            DEFAULT_SETTINGS_TOML.replace("frequency_penalty = 0.2", "frequency_penalty = -1.0");
        let err = Settings::from_toml(&toml).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue { .. }));
    }

    #[test]
    fn error_invalid_toml() {
        let err = Settings::from_toml("not toml {{{").unwrap_err();
        assert!(matches!(err, SettingsError::Parse(_)));
    }

    #[test]
    fn error_missing_section() {
        let err = Settings::from_toml("[model]\ncontext_cap = 0\n").unwrap_err();
        assert!(matches!(err, SettingsError::Parse(_)));
    }
}
