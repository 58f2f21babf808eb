//! Test-only fakes for driving the engine without real worker processes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::core::types::{AttemptResult, CliKind, ModelConfig};
use crate::engine::Sleeper;
use crate::io::process::{RunRequest, Supervisor};
use crate::io::resolver::CliBinaryMap;

/// One scripted attempt: the result to report and the text the "worker" prints.
#[derive(Debug, Clone)]
pub struct ScriptedAttempt {
    pub result: AttemptResult,
    pub output: String,
}

impl ScriptedAttempt {
    pub fn success(output: &str) -> Self {
        Self::exit(0, output)
    }

    pub fn exit(code: i32, output: &str) -> Self {
        Self {
            result: AttemptResult::exited(code),
            output: output.to_string(),
        }
    }

    pub fn timeout() -> Self {
        Self {
            result: AttemptResult::timed_out(143),
            output: "still working...".to_string(),
        }
    }
}

/// Supervisor that replays a fixed script and records every request.
///
/// Each attempt appends its output to the request's output file, like the real
/// supervisor does.
pub struct ScriptedSupervisor {
    script: RefCell<VecDeque<ScriptedAttempt>>,
    requests: RefCell<Vec<RunRequest>>,
}

impl ScriptedSupervisor {
    pub fn new(script: Vec<ScriptedAttempt>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests.borrow().clone()
    }

    /// Model ids passed via `--model`, in dispatch order.
    pub fn dispatched_models(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .filter_map(|request| {
                let pos = request.args.iter().position(|arg| arg == "--model")?;
                request.args.get(pos + 1).cloned()
            })
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.script.borrow().len()
    }
}

impl Supervisor for ScriptedSupervisor {
    fn run(&self, request: &RunRequest) -> Result<AttemptResult> {
        self.requests.borrow_mut().push(request.clone());
        let attempt = self
            .script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("script exhausted at {}", request.label))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.output_file)
            .with_context(|| format!("open {}", request.output_file.display()))?;
        writeln!(file, "=== {} ===", request.label).context("write header")?;
        writeln!(file, "{}", attempt.output).context("write output")?;
        Ok(attempt.result)
    }
}

/// Sleeper that records requested delays instead of blocking.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}

/// Model whose name doubles as its backend model id.
pub fn model(name: &str, cli: CliKind) -> ModelConfig {
    ModelConfig::new(name, cli, name)
}

/// Model with an explicit cost weight.
pub fn costed_model(name: &str, cli: CliKind, cost: f64) -> ModelConfig {
    ModelConfig {
        cost_weight: Some(cost),
        ..model(name, cli)
    }
}

/// Binary map with placeholder paths for `clis`.
pub fn binaries_for(clis: &[CliKind]) -> CliBinaryMap {
    clis.iter()
        .map(|cli| (*cli, PathBuf::from(format!("/fake/bin/{cli}"))))
        .collect()
}
