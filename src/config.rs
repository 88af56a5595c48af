//! Layered configuration: defaults < file < env < runtime.
//!
//! Generalizes `goose-conductor::config::ConductorConfig`, which only
//! layers defaults < env. This adds a file layer (YAML, searched at the
//! paths named in spec §6) and a `set_runtime` escape hatch for dynamic
//! overrides, table-driven instead of one `if let` per field so that
//! adding a config key doesn't require touching every layer by hand.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AidosError, AidosResult};

/// Top-level AIDOS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AidosConfig {
    pub api: ApiConfig,
    pub agents: AgentsConfig,
    pub budget: BudgetConfig,
    pub output: OutputConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub provider: String,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub max_concurrent: usize,
    #[serde(with = "humantime_millis")]
    pub timeout_ms: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_total_tokens: u64,
    #[serde(with = "humantime_millis")]
    pub max_session_duration_ms: Duration,
    pub warning_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub max_file_size: u64,
    pub max_files: usize,
}

mod humantime_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

impl Default for AidosConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            agents: AgentsConfig::default(),
            budget: BudgetConfig::default(),
            output: OutputConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "mock-1".to_string(),
            max_tokens: 200_000,
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            timeout_ms: Duration::from_secs(600),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_total_tokens: 2_000_000,
            max_session_duration_ms: Duration::from_secs(3600),
            warning_threshold: 0.8,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("aidos")
                .join("output"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        let dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            dir: dir.join("aidos").join("logs"),
            max_file_size: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

/// Search paths checked, in order, for a config file in the working
/// directory, per spec §6.
pub const CONFIG_SEARCH_PATHS: &[&str] = &["aidos.config.yaml", "aidos.config.yml", ".aidos.yaml"];

impl AidosConfig {
    /// Build config by merging, in increasing precedence: compiled-in
    /// defaults, the first config file found on [`CONFIG_SEARCH_PATHS`],
    /// then `AIDOS_`-prefixed environment variables.
    pub fn load(working_dir: &Path) -> AidosResult<Self> {
        let mut cfg = Self::default();

        if let Some(path) = Self::find_config_file(working_dir) {
            cfg = cfg.merge_file(&path)?;
        }

        cfg.apply_env();
        Ok(cfg)
    }

    fn find_config_file(working_dir: &Path) -> Option<PathBuf> {
        CONFIG_SEARCH_PATHS
            .iter()
            .map(|p| working_dir.join(p))
            .find(|p| p.exists())
    }

    /// Load a file at `path` (YAML or JSON, by extension) and overlay it on
    /// top of `self`.
    pub fn merge_file(mut self, path: &Path) -> AidosResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AidosError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let file_cfg: AidosConfig = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| {
                AidosError::Configuration(format!("invalid YAML in {}: {}", path.display(), e))
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| {
                AidosError::Configuration(format!("invalid JSON in {}: {}", path.display(), e))
            })?,
            other => {
                return Err(AidosError::Configuration(format!(
                    "unsupported config extension '{}' for {}",
                    other,
                    path.display()
                )))
            }
        };

        self = file_cfg;
        self.validate()?;
        Ok(self)
    }

    /// Apply `AIDOS_`-prefixed environment overrides. Table-driven: each
    /// entry names a dot-path and a setter, so growing the config schema
    /// means adding a row here rather than an `if let` block.
    pub fn apply_env(&mut self) {
        self.apply_env_from(&std::env::vars().collect::<Vec<_>>());
    }

    /// Testable variant of [`apply_env`] that takes an explicit variable
    /// list instead of reading the real process environment.
    pub fn apply_env_from(&mut self, vars: &[(String, String)]) {
        for (key, value) in vars {
            let Some(path) = key.strip_prefix("AIDOS_") else {
                continue;
            };
            let path = path.to_lowercase();
            self.set_by_env_path(&path, value);
        }
    }

    fn set_by_env_path(&mut self, path: &str, value: &str) {
        match path {
            "api_provider" => self.api.provider = value.to_string(),
            "api_model" => self.api.model = value.to_string(),
            "api_max_tokens" => {
                if let Ok(v) = value.parse() {
                    self.api.max_tokens = v;
                }
            }
            "agents_max_concurrent" => {
                if let Ok(v) = value.parse() {
                    self.agents.max_concurrent = v;
                }
            }
            "agents_timeout_ms" => {
                if let Ok(v) = value.parse::<u64>() {
                    self.agents.timeout_ms = Duration::from_millis(v);
                }
            }
            "budget_max_total_tokens" => {
                if let Ok(v) = value.parse() {
                    self.budget.max_total_tokens = v;
                }
            }
            "budget_max_session_duration_ms" => {
                if let Ok(v) = value.parse::<u64>() {
                    self.budget.max_session_duration_ms = Duration::from_millis(v);
                }
            }
            "budget_warning_threshold" => {
                if let Ok(v) = value.parse() {
                    self.budget.warning_threshold = v;
                }
            }
            "output_directory" => self.output.directory = PathBuf::from(value),
            "log_dir" => self.log.dir = PathBuf::from(value),
            "log_max_files" => {
                if let Ok(v) = value.parse() {
                    self.log.max_files = v;
                }
            }
            // Unknown variables are ignored, per spec §6.
            _ => {}
        }
    }

    /// Runtime-set escape hatch (highest precedence layer). `path` is a
    /// dotted path validated against the known schema above; unknown paths
    /// are rejected rather than silently ignored, since a caller invoking
    /// this programmatically expects to know if the path was wrong.
    pub fn set_runtime(&mut self, path: &str, value: serde_json::Value) -> AidosResult<()> {
        match path {
            "api.provider" => self.api.provider = as_string(path, value)?,
            "api.model" => self.api.model = as_string(path, value)?,
            "api.max_tokens" => self.api.max_tokens = as_u64(path, value)? as u32,
            "agents.max_concurrent" => self.agents.max_concurrent = as_u64(path, value)? as usize,
            "agents.timeout_ms" => {
                self.agents.timeout_ms = Duration::from_millis(as_u64(path, value)?)
            }
            "budget.max_total_tokens" => self.budget.max_total_tokens = as_u64(path, value)?,
            "budget.max_session_duration_ms" => {
                self.budget.max_session_duration_ms = Duration::from_millis(as_u64(path, value)?)
            }
            "budget.warning_threshold" => self.budget.warning_threshold = as_f64(path, value)?,
            "output.directory" => self.output.directory = PathBuf::from(as_string(path, value)?),
            _ => {
                return Err(AidosError::Configuration(format!(
                    "unknown runtime config path: {}",
                    path
                )))
            }
        }
        Ok(())
    }

    /// Validation performed after loading a file layer: unsupported values
    /// are rejected fatally (spec §7, Configuration error).
    pub fn validate(&self) -> AidosResult<()> {
        if self.agents.max_concurrent == 0 {
            return Err(AidosError::Configuration(
                "agents.max_concurrent must be >= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.budget.warning_threshold) {
            return Err(AidosError::Configuration(
                "budget.warning_threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Serialize to YAML, used by `saveToFile`/round-trip tests.
    pub fn save_to_file(&self, path: &Path) -> AidosResult<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| AidosError::Configuration(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, yaml)
            .map_err(|e| AidosError::Configuration(format!("failed to write {}: {}", path.display(), e)))?;
        Ok(())
    }
}

fn as_string(path: &str, v: serde_json::Value) -> AidosResult<String> {
    v.as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| AidosError::Configuration(format!("{} expects a string", path)))
}

fn as_u64(path: &str, v: serde_json::Value) -> AidosResult<u64> {
    v.as_u64()
        .ok_or_else(|| AidosError::Configuration(format!("{} expects a non-negative integer", path)))
}

fn as_f64(path: &str, v: serde_json::Value) -> AidosResult<f64> {
    v.as_f64()
        .ok_or_else(|| AidosError::Configuration(format!("{} expects a number", path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AidosConfig::default().validate().is_ok());
    }

    #[test]
    fn env_overlay_sets_known_fields_and_ignores_unknown() {
        let mut cfg = AidosConfig::default();
        cfg.apply_env_from(&[
            ("AIDOS_AGENTS_MAX_CONCURRENT".into(), "9".into()),
            ("AIDOS_API_MODEL".into(), "opus".into()),
            ("AIDOS_NOT_A_REAL_KEY".into(), "ignored".into()),
            ("OTHER_VAR".into(), "ignored".into()),
        ]);
        assert_eq!(cfg.agents.max_concurrent, 9);
        assert_eq!(cfg.api.model, "opus");
    }

    #[test]
    fn env_overlay_is_idempotent() {
        let vars = vec![("AIDOS_AGENTS_MAX_CONCURRENT".to_string(), "9".to_string())];
        let mut a = AidosConfig::default();
        a.apply_env_from(&vars);
        let mut b = a.clone();
        b.apply_env_from(&vars);
        assert_eq!(a.agents.max_concurrent, b.agents.max_concurrent);
    }

    #[test]
    fn runtime_set_rejects_unknown_path() {
        let mut cfg = AidosConfig::default();
        let err = cfg
            .set_runtime("nonsense.path", serde_json::json!(1))
            .unwrap_err();
        assert!(matches!(err, AidosError::Configuration(_)));
    }

    #[test]
    fn runtime_set_overrides_env_and_file_layers() {
        let mut cfg = AidosConfig::default();
        cfg.apply_env_from(&[("AIDOS_AGENTS_MAX_CONCURRENT".into(), "2".into())]);
        cfg.set_runtime("agents.max_concurrent", serde_json::json!(7))
            .unwrap();
        assert_eq!(cfg.agents.max_concurrent, 7);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.yaml");
        let mut cfg = AidosConfig::default();
        cfg.api.model = "custom-model".into();
        cfg.save_to_file(&path).unwrap();

        let reloaded = AidosConfig::default().merge_file(&path).unwrap();
        assert_eq!(reloaded.api.model, "custom-model");
    }

    #[test]
    fn invalid_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        std::fs::write(&path, "x=1").unwrap();
        let err = AidosConfig::default().merge_file(&path).unwrap_err();
        assert!(matches!(err, AidosError::Configuration(_)));
    }

    #[test]
    fn invalid_warning_threshold_fails_validation() {
        let mut cfg = AidosConfig::default();
        cfg.budget.warning_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }
}
