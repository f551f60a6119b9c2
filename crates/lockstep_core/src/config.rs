//! Runtime configuration
//!
//! Loaded from JSON, then overridden from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `LOCKSTEP_HEADLESS` | `RuntimeConfig::headless` (`1`/`true`) |
//! | `LOCKSTEP_RENDER_TIMEOUT_MS` | `EngineConfig::render_timeout_ms` for every engine |
//! | `LOCKSTEP_WORKERS` | `EngineConfig::worker_threads` for every engine |

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_HEADLESS: &str = "LOCKSTEP_HEADLESS";
pub const ENV_RENDER_TIMEOUT_MS: &str = "LOCKSTEP_RENDER_TIMEOUT_MS";
pub const ENV_WORKERS: &str = "LOCKSTEP_WORKERS";

/// Roughly one frame at 60Hz.
pub const DEFAULT_RENDER_TIMEOUT_MS: u64 = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: '{value}'")]
    Env { key: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration for the `lockstep` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Run against the in-process headless backend instead of real windows.
    pub headless: bool,
    pub engines: Vec<EngineConfig>,
}

impl RuntimeConfig {
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json_str(&source)
    }

    /// Apply `LOCKSTEP_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_HEADLESS) {
            self.headless = parse_bool(ENV_HEADLESS, &value)?;
        }
        if let Some(value) = lookup(ENV_RENDER_TIMEOUT_MS) {
            let ms = value.trim().parse::<u64>().map_err(|_| ConfigError::Env {
                key: ENV_RENDER_TIMEOUT_MS,
                value: value.clone(),
            })?;
            for engine in &mut self.engines {
                engine.render_timeout_ms = ms;
            }
        }
        if let Some(value) = lookup(ENV_WORKERS) {
            let workers = value.trim().parse::<usize>().map_err(|_| ConfigError::Env {
                key: ENV_WORKERS,
                value: value.clone(),
            })?;
            for engine in &mut self.engines {
                engine.worker_threads = workers;
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engines.iter().try_for_each(EngineConfig::validate)
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env {
            key,
            value: value.to_string(),
        }),
    }
}

/// Per-engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub title: String,
    /// Size of the engine's auxiliary worker pool.
    pub worker_threads: usize,
    /// How long the render side waits for a fresh simulation frame before
    /// re-rendering the previous state.
    pub render_timeout_ms: u64,
    /// Upper bound on a single `update` delta.
    pub max_frame_delta_ms: u64,
    /// Upper bound on `fixed_update` calls per simulation iteration.
    pub max_fixed_steps: u32,
    pub clear_color: [f32; 4],
    /// Surfaces created during `init`. The first one becomes the main surface.
    pub surfaces: Vec<SurfaceConfig>,
}

impl EngineConfig {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_surface(mut self, surface: SurfaceConfig) -> Self {
        self.surfaces.push(surface);
        self
    }

    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    pub fn max_frame_delta(&self) -> Duration {
        Duration::from_millis(self.max_frame_delta_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid(format!(
                "engine '{}' needs at least one worker thread",
                self.title
            )));
        }
        if self.render_timeout_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "engine '{}' render_timeout_ms must be non-zero",
                self.title
            )));
        }
        if self.max_frame_delta_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "engine '{}' max_frame_delta_ms must be non-zero",
                self.title
            )));
        }
        self.surfaces.iter().try_for_each(SurfaceConfig::validate)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "Lockstep Engine".to_string(),
            worker_threads: 2,
            render_timeout_ms: DEFAULT_RENDER_TIMEOUT_MS,
            max_frame_delta_ms: 250,
            max_fixed_steps: 5,
            clear_color: [0.1, 0.1, 0.1, 1.0],
            surfaces: Vec::new(),
        }
    }
}

/// Initial state of one render surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub fullscreen: bool,
}

impl SurfaceConfig {
    pub fn new(title: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            title: title.into(),
            width,
            height,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "surface '{}' has zero size {}x{}",
                self.title, self.width, self.height
            )));
        }
        Ok(())
    }
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            title: "Lockstep".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            fullscreen: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_with_defaults() {
        let config = RuntimeConfig::from_json_str(
            r#"{
                "engines": [
                    {
                        "title": "A",
                        "surfaces": [ { "title": "main", "width": 640, "height": 480 } ]
                    },
                    { "title": "B" }
                ]
            }"#,
        )
        .unwrap();

        assert!(!config.headless);
        assert_eq!(config.engines.len(), 2);
        let a = &config.engines[0];
        assert_eq!(a.render_timeout(), Duration::from_millis(DEFAULT_RENDER_TIMEOUT_MS));
        assert_eq!(a.surfaces[0].width, 640);
        assert!(a.surfaces[0].vsync);
        assert!(config.engines[1].surfaces.is_empty());
    }

    #[test]
    fn test_rejects_zero_sized_surface() {
        let err = RuntimeConfig::from_json_str(
            r#"{ "engines": [ { "surfaces": [ { "width": 0 } ] } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_frame_delta() {
        let err = RuntimeConfig::from_json_str(
            r#"{ "engines": [ { "title": "A", "max_frame_delta_ms": 0 } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("max_frame_delta_ms")));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RuntimeConfig {
            headless: false,
            engines: vec![EngineConfig::new("A"), EngineConfig::new("B")],
        };
        let env: HashMap<&str, &str> = [
            (ENV_HEADLESS, "true"),
            (ENV_RENDER_TIMEOUT_MS, "40"),
            (ENV_WORKERS, "3"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert!(config.headless);
        assert!(config.engines.iter().all(|e| e.render_timeout_ms == 40));
        assert!(config.engines.iter().all(|e| e.worker_threads == 3));
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_HEADLESS).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { key: ENV_HEADLESS, .. }));
    }

    #[test]
    fn test_zero_workers_rejected_after_override() {
        let mut config = RuntimeConfig {
            headless: true,
            engines: vec![EngineConfig::new("A")],
        };
        let err = config
            .apply_overrides(|key| (key == ENV_WORKERS).then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
