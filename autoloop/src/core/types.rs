//! Shared deterministic types for engine core logic.
//!
//! These types define stable contracts between the selector, classifier and
//! supervisor. They are plain data: no I/O, no clocks.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Worker CLI families the engine knows how to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliKind {
    Claude,
    Codex,
    Gemini,
    Opencode,
}

impl CliKind {
    /// Every supported CLI, in resolution order.
    pub const ALL: [CliKind; 4] = [
        CliKind::Claude,
        CliKind::Codex,
        CliKind::Gemini,
        CliKind::Opencode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CliKind::Claude => "claude",
            CliKind::Codex => "codex",
            CliKind::Gemini => "gemini",
            CliKind::Opencode => "opencode",
        }
    }
}

impl fmt::Display for CliKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CliKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        CliKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("unknown cli {s:?} (expected claude, codex, gemini or opencode)"))
    }
}

/// A named way to invoke one worker CLI against one backend model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Unique key used for retry bookkeeping.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub cli: CliKind,
    /// Backend model identifier passed through the CLI's model flag.
    pub model: String,
    /// Per-model timeout in seconds; wins over the caller default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Extra arguments appended after the CLI's fixed flags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Relative cost hint (lower = cheaper). Missing means `1.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_weight: Option<f64>,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, cli: CliKind, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            cli,
            model: model.into(),
            timeout: None,
            env: BTreeMap::new(),
            args: Vec::new(),
            cost_weight: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// `cli/model` label used in logs and exhaustion reports.
    pub fn label(&self) -> String {
        format!("{}/{}", self.cli, self.model)
    }

    pub fn cost(&self) -> f64 {
        self.cost_weight.unwrap_or(1.0)
    }

    /// Timeout for this model: its own override, else the caller default.
    pub fn effective_timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(default_secs))
    }
}

/// Backoff and same-model retry policy for rate-limited attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub exponential_backoff: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retry_same_model: bool,
    /// Same-model retries allowed before rotating away from a model.
    pub max_retries_per_model: u32,
    /// Flat wait used when `exponential_backoff` is off.
    pub rate_limit_wait_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            exponential_backoff: true,
            base_delay_ms: 2_000,
            max_delay_ms: 120_000,
            retry_same_model: true,
            max_retries_per_model: 2,
            rate_limit_wait_ms: 60_000,
        }
    }
}

/// Child-process supervision timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Grace period between SIGTERM and a forced kill.
    pub sigkill_delay_ms: u64,
    pub progress_interval_ms: u64,
    /// Mirror child output lines to the console.
    pub echo_output: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sigkill_delay_ms: 5_000,
            progress_interval_ms: 2_000,
            echo_output: true,
        }
    }
}

/// How the selector walks the active pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    CostAware,
    Random,
    Priority,
}

impl SelectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round-robin",
            SelectionStrategy::CostAware => "cost-aware",
            SelectionStrategy::Random => "random",
            SelectionStrategy::Priority => "priority",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single spawn-to-exit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptResult {
    pub exit_code: i32,
    /// True only when the supervisor's deadline ended the process.
    pub timed_out: bool,
}

impl AttemptResult {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            timed_out: false,
        }
    }

    pub fn timed_out(exit_code: i32) -> Self {
        Self {
            exit_code,
            timed_out: true,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_kind_parses_case_insensitively() {
        assert_eq!("Claude".parse::<CliKind>().expect("parse"), CliKind::Claude);
        assert_eq!(" opencode ".parse::<CliKind>().expect("parse"), CliKind::Opencode);
        assert!("cursor".parse::<CliKind>().is_err());
    }

    #[test]
    fn model_timeout_overrides_caller_default() {
        let mut model = ModelConfig::new("fast", CliKind::Claude, "haiku");
        assert_eq!(model.effective_timeout(600), Duration::from_secs(600));
        model.timeout = Some(120);
        assert_eq!(model.effective_timeout(600), Duration::from_secs(120));
    }

    #[test]
    fn display_name_falls_back_to_name() {
        let mut model = ModelConfig::new("sonnet", CliKind::Claude, "claude-sonnet-4-5");
        assert_eq!(model.display_name(), "sonnet");
        model.display_name = Some("Claude Sonnet".to_string());
        assert_eq!(model.display_name(), "Claude Sonnet");
        assert_eq!(model.label(), "claude/claude-sonnet-4-5");
    }

    #[test]
    fn strategy_uses_kebab_case_names() {
        let parsed: SelectionStrategy = serde_json::from_str("\"cost-aware\"").expect("parse");
        assert_eq!(parsed, SelectionStrategy::CostAware);
        assert_eq!(SelectionStrategy::RoundRobin.to_string(), "round-robin");
    }
}
