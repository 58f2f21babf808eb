//! The attempt loop: select a model, run it, classify the outcome, and retry,
//! rotate or fail over until one attempt succeeds or every slot is used.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::rate_limit_delay;
use crate::core::classifier::{Classification, OUTPUT_TAIL_CHARS, classify, tail};
use crate::core::invocation::build_invocation;
use crate::core::selector::ModelSelector;
use crate::core::types::{CliKind, ModelConfig, RetryConfig};
use crate::io::config::EngineConfig;
use crate::io::process::{KillHandle, ProcessSupervisor, RunRequest, Supervisor};
use crate::io::resolver::{BinaryResolver, CliBinaryMap, ResolveError, ResolverEnv};

/// Blocks between rate-limited attempts. Tests record instead of sleeping.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Fatal construction errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(
        "no configured model can run: models use [{configured}] but only [{installed}] resolved; install a CLI or point AUTOLOOP_<CLI>_PATH at it"
    )]
    NoRunnableModels {
        configured: String,
        installed: String,
    },
}

/// Why `execute` gave up.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(
        "all attempts failed ({}); check that each CLI is logged in and its API key is valid, that the network is reachable, and the provider's status page",
        .attempted.join(", ")
    )]
    Exhausted { attempted: Vec<String> },
    #[error("attempt log: {0:#}")]
    Io(anyhow::Error),
}

/// Summary of a successful `execute` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    /// Name of the model whose attempt succeeded.
    pub model: String,
    /// `cli/model` of the winning attempt.
    pub label: String,
    pub dispatches: u32,
    pub rate_limit_waits: u32,
    pub used_fallback: bool,
}

pub struct Engine<S = ProcessSupervisor, Z = ThreadSleeper> {
    selector: ModelSelector,
    binaries: CliBinaryMap,
    retry: RetryConfig,
    supervisor: S,
    sleeper: Z,
}

impl Engine {
    /// Resolve worker binaries and build an engine that runs real processes.
    pub fn from_config(config: &EngineConfig, env: ResolverEnv) -> Result<Self, EngineError> {
        let resolver = BinaryResolver::new(env, config.binaries.clone());
        let (binaries, _report) = resolver.resolve_binaries()?;
        let selector = ModelSelector::new(
            config.strategy,
            config.models.primary.clone(),
            config.models.fallback.clone(),
        );
        Self::with_parts(
            selector,
            binaries,
            config.retry.clone(),
            ProcessSupervisor::new(config.supervisor.clone()),
            ThreadSleeper,
        )
    }
}

impl<S: Supervisor, Z: Sleeper> Engine<S, Z> {
    pub fn with_parts(
        selector: ModelSelector,
        binaries: CliBinaryMap,
        retry: RetryConfig,
        supervisor: S,
        sleeper: Z,
    ) -> Result<Self, EngineError> {
        let runnable = selector
            .primary()
            .iter()
            .chain(selector.fallback())
            .filter(|model| binaries.contains(model.cli))
            .count();
        if runnable == 0 {
            return Err(EngineError::NoRunnableModels {
                configured: join_clis(
                    selector
                        .primary()
                        .iter()
                        .chain(selector.fallback())
                        .map(|model| model.cli),
                ),
                installed: join_clis(binaries.iter().map(|(cli, _)| cli)),
            });
        }
        for model in selector.primary().iter().chain(selector.fallback()) {
            if !binaries.contains(model.cli) {
                warn!(model = %model.name, cli = %model.cli, "no binary for model's cli, it will be skipped");
            }
        }
        Ok(Self {
            selector,
            binaries,
            retry,
            supervisor,
            sleeper,
        })
    }

    /// Run `prompt` until one attempt succeeds or every attempt slot is used.
    ///
    /// Worker output is appended to `output_file`. `timeout_secs` applies to
    /// models without their own timeout.
    #[instrument(skip_all, fields(output = %output_file.display(), timeout_secs = timeout_secs))]
    pub fn execute(
        &mut self,
        prompt: &str,
        output_file: &Path,
        timeout_secs: u64,
    ) -> Result<ExecutionReport, ExecutionError> {
        self.selector.restart_rotation();
        let max_attempts = self.selector.total_model_count();
        let mut attempt = 0;
        let mut attempted: Vec<String> = Vec::new();
        let mut pending_retry: Option<ModelConfig> = None;
        let mut rate_limit_waits = 0u32;
        let mut dispatches = 0u32;

        while attempt < max_attempts {
            let model = match pending_retry.take().or_else(|| self.selector.next_model()) {
                Some(model) => model,
                None => {
                    debug!(attempt, "no model available for this slot");
                    self.rotate(&mut attempt);
                    continue;
                }
            };
            let Some(binary) = self.binaries.get(model.cli) else {
                warn!(model = %model.display_name(), cli = %model.cli, "cli not installed, skipping");
                self.rotate(&mut attempt);
                continue;
            };

            let timeout = model.effective_timeout(timeout_secs);
            let invocation = build_invocation(&model, prompt);
            let request = RunRequest {
                binary: binary.to_path_buf(),
                args: invocation.args,
                env: invocation.env,
                stdin: invocation.stdin,
                output_prefix: format!("[{}] ", model.display_name()),
                label: format!("{} ({})", model.display_name(), model.label()),
                output_file: output_file.to_path_buf(),
                timeout,
            };

            let offset = output_len(output_file).map_err(ExecutionError::Io)?;
            info!(
                attempt = attempt + 1,
                max_attempts,
                model = %model.display_name(),
                label = %model.label(),
                fallback = self.selector.is_using_fallback(),
                "dispatching attempt"
            );
            let result = self.supervisor.run(&request).map_err(ExecutionError::Io)?;
            dispatches += 1;
            let label = model.label();
            if !attempted.contains(&label) {
                attempted.push(label);
            }

            let output_tail = read_output_tail(output_file, offset).map_err(ExecutionError::Io)?;
            match classify(&result, &output_tail) {
                Classification::Succeeded => {
                    info!(model = %model.display_name(), dispatches, "attempt succeeded");
                    return Ok(ExecutionReport {
                        model: model.name.clone(),
                        label: model.label(),
                        dispatches,
                        rate_limit_waits,
                        used_fallback: self.selector.is_using_fallback(),
                    });
                }
                Classification::TimedOut => {
                    warn!(
                        model = %model.display_name(),
                        timeout_secs = timeout.as_secs(),
                        "attempt timed out after {}s; raise the model's `timeout` if the task needs longer",
                        timeout.as_secs()
                    );
                    self.rotate(&mut attempt);
                }
                Classification::RateLimited => {
                    let delay = rate_limit_delay(&self.retry, rate_limit_waits);
                    rate_limit_waits += 1;
                    warn!(
                        model = %model.display_name(),
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    self.sleeper.sleep(delay);
                    if self.retry.retry_same_model {
                        let count = self.selector.track_retry(&model.name);
                        if count <= self.retry.max_retries_per_model {
                            info!(
                                model = %model.display_name(),
                                retry = count,
                                max_retries = self.retry.max_retries_per_model,
                                "retrying same model"
                            );
                            pending_retry = Some(model);
                            continue;
                        }
                        info!(model = %model.display_name(), "retry budget used up, rotating");
                    }
                    self.rotate(&mut attempt);
                }
                Classification::QuotaExhausted => {
                    warn!(model = %model.display_name(), "quota or billing limit hit, switching to fallback pool");
                    self.selector.switch_to_fallback();
                    attempt += 1;
                }
                Classification::Failed => {
                    warn!(
                        model = %model.display_name(),
                        exit_code = result.exit_code,
                        "attempt failed, rotating"
                    );
                    self.rotate(&mut attempt);
                }
            }
        }

        warn!(attempts = attempted.len(), dispatches, "every attempt slot used without success");
        Err(ExecutionError::Exhausted { attempted })
    }

    /// Advance the attempt slot, failing over once the primary pool is used up.
    ///
    /// Every slot advance goes through here on purpose: timeouts, exhausted
    /// rate-limit retries and skipped models fail over just like plain errors.
    fn rotate(&mut self, attempt: &mut usize) {
        if *attempt + 1 >= self.selector.primary().len() && !self.selector.is_using_fallback() {
            self.selector.switch_to_fallback();
        }
        *attempt += 1;
    }

    /// Force-kill the in-flight worker, if any.
    pub fn kill_current(&self) -> bool {
        self.supervisor.kill_handle().kill()
    }

    /// Handle usable from another thread (e.g. a Ctrl-C handler).
    pub fn kill_handle(&self) -> KillHandle {
        self.supervisor.kill_handle()
    }

    pub fn switch_to_fallback(&mut self) -> bool {
        self.selector.switch_to_fallback()
    }

    pub fn reset_fallback(&mut self) {
        self.selector.reset_fallback();
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    pub fn binaries(&self) -> &CliBinaryMap {
        &self.binaries
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    pub fn sleeper(&self) -> &Z {
        &self.sleeper
    }
}

fn join_clis(clis: impl Iterator<Item = CliKind>) -> String {
    let mut names: Vec<&str> = clis.map(|cli| cli.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    names.join(", ")
}

fn output_len(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}

/// Last [`OUTPUT_TAIL_CHARS`] characters written to `path` at or after byte
/// `since`. Earlier attempts in the same file are never rescanned.
fn read_output_tail(path: &Path, since: u64) -> Result<String> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    // A char is at most 4 bytes in UTF-8.
    let window = (OUTPUT_TAIL_CHARS * 4) as u64;
    let start = since.max(len.saturating_sub(window)).min(len);
    file.seek(SeekFrom::Start(start))
        .with_context(|| format!("seek {}", path.display()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&buf);
    Ok(tail(&text, OUTPUT_TAIL_CHARS).to_string())
}
