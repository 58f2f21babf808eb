//! Engine configuration stored under `.autoloop/config.toml`.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{CliKind, ModelConfig, RetryConfig, SelectionStrategy, SupervisorConfig};

pub const DEFAULT_CONFIG_PATH: &str = ".autoloop/config.toml";

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the built-in
/// pools and policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub strategy: SelectionStrategy,

    /// Per-attempt timeout used when a model sets none.
    pub default_timeout_secs: u64,

    pub retry: RetryConfig,

    pub supervisor: SupervisorConfig,

    /// Binary path overrides, consulted after the `AUTOLOOP_*_PATH` env vars.
    pub binaries: BTreeMap<CliKind, PathBuf>,

    pub models: ModelPools,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelPools {
    pub primary: Vec<ModelConfig>,
    pub fallback: Vec<ModelConfig>,
}

impl Default for ModelPools {
    fn default() -> Self {
        let mut sonnet = ModelConfig::new("claude-sonnet", CliKind::Claude, "sonnet");
        sonnet.display_name = Some("Claude Sonnet".to_string());
        sonnet.cost_weight = Some(3.0);

        let mut codex = ModelConfig::new("codex", CliKind::Codex, "gpt-5-codex");
        codex.display_name = Some("Codex".to_string());
        codex.cost_weight = Some(5.0);

        let mut gemini = ModelConfig::new("gemini-pro", CliKind::Gemini, "gemini-2.5-pro");
        gemini.display_name = Some("Gemini Pro".to_string());
        gemini.cost_weight = Some(2.0);

        let mut opencode = ModelConfig::new(
            "opencode-sonnet",
            CliKind::Opencode,
            "anthropic/claude-sonnet-4-5",
        );
        opencode.display_name = Some("OpenCode Sonnet".to_string());
        opencode.cost_weight = Some(4.0);

        Self {
            primary: vec![sonnet, codex],
            fallback: vec![gemini, opencode],
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            default_timeout_secs: 30 * 60,
            retry: RetryConfig::default(),
            supervisor: SupervisorConfig::default(),
            binaries: BTreeMap::new(),
            models: ModelPools::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_secs == 0 {
            return Err(anyhow!("default_timeout_secs must be > 0"));
        }
        if self.models.primary.is_empty() {
            return Err(anyhow!("models.primary must contain at least one model"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow!("retry.base_delay_ms must be <= retry.max_delay_ms"));
        }
        if self.supervisor.progress_interval_ms == 0 {
            return Err(anyhow!("supervisor.progress_interval_ms must be > 0"));
        }

        let mut seen = HashSet::new();
        for model in self.models.primary.iter().chain(&self.models.fallback) {
            if model.name.trim().is_empty() {
                return Err(anyhow!("model name must be non-empty"));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(anyhow!("duplicate model name {:?}", model.name));
            }
            if model.model.trim().is_empty() {
                return Err(anyhow!("model {:?} has an empty model id", model.name));
            }
            if model.timeout == Some(0) {
                return Err(anyhow!("model {:?} timeout must be > 0", model.name));
            }
            if model.cost_weight.is_some_and(|cost| !cost.is_finite() || cost < 0.0) {
                return Err(anyhow!(
                    "model {:?} cost_weight must be a non-negative number",
                    model.name
                ));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.retry.rate_limit_wait_ms, 60_000);
        assert_eq!(cfg.supervisor.sigkill_delay_ms, 5_000);
        assert_eq!(cfg.supervisor.progress_interval_ms, 2_000);
    }

    #[test]
    fn write_then_load_preserves_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = EngineConfig::default();
        cfg.strategy = SelectionStrategy::CostAware;
        cfg.binaries
            .insert(CliKind::Claude, PathBuf::from("/opt/claude/bin/claude"));
        cfg.models.primary[0].timeout = Some(120);
        cfg.models.primary[0]
            .env
            .insert("CLAUDE_CODE_MAX_OUTPUT_TOKENS".to_string(), "32000".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
strategy = "priority"

[retry]
max_retries_per_model = 5

[[models.primary]]
name = "haiku"
cli = "claude"
model = "haiku"
timeout = 120
args = ["--max-turns", "40"]
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.strategy, SelectionStrategy::Priority);
        assert_eq!(cfg.retry.max_retries_per_model, 5);
        assert_eq!(cfg.retry.base_delay_ms, RetryConfig::default().base_delay_ms);
        assert_eq!(cfg.models.primary.len(), 1);
        assert_eq!(cfg.models.primary[0].timeout, Some(120));
        assert_eq!(cfg.models.fallback, ModelPools::default().fallback);
    }

    #[test]
    fn rejects_duplicate_model_names() {
        let mut cfg = EngineConfig::default();
        let dup = cfg.models.primary[0].clone();
        cfg.models.fallback.push(dup);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate model name"));
    }

    #[test]
    fn rejects_unknown_cli() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[[models.primary]]\nname = \"x\"\ncli = \"cursor\"\nmodel = \"m\"\n",
        )
        .expect("write");
        assert!(load_config(&path).is_err());
    }
}
