//! Per-CLI invocation templates.
//!
//! Each worker CLI is described by a row in [`template`]; building the argv
//! for a model is a pure function of that row and the [`ModelConfig`]. Adding
//! a new CLI is a new row, not a new branch in the supervisor.

use std::collections::BTreeMap;

use crate::core::types::{CliKind, ModelConfig};

/// Where the prompt goes when invoking a CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPlacement {
    /// Piped through standard input.
    Stdin,
    /// Appended as the final positional argument.
    Positional,
}

/// Fixed invocation shape for one CLI family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CliTemplate {
    /// Executable name searched on `PATH`.
    pub executable: &'static str,
    /// Subcommand and unattended/permission flags, emitted first.
    pub leading_args: &'static [&'static str],
    pub model_flag: &'static str,
    /// Arguments emitted after user args (e.g. codex's `-` stdin marker).
    pub trailing_args: &'static [&'static str],
    pub prompt: PromptPlacement,
    /// Shown when the binary cannot be found.
    pub install_hint: &'static str,
}

const CLAUDE: CliTemplate = CliTemplate {
    executable: "claude",
    leading_args: &["--print", "--dangerously-skip-permissions"],
    model_flag: "--model",
    trailing_args: &[],
    prompt: PromptPlacement::Stdin,
    install_hint: "npm install -g @anthropic-ai/claude-code",
};

const CODEX: CliTemplate = CliTemplate {
    executable: "codex",
    leading_args: &[
        "exec",
        "--sandbox",
        "danger-full-access",
        "--skip-git-repo-check",
    ],
    model_flag: "--model",
    trailing_args: &["-"],
    prompt: PromptPlacement::Stdin,
    install_hint: "npm install -g @openai/codex",
};

const GEMINI: CliTemplate = CliTemplate {
    executable: "gemini",
    leading_args: &["--yolo"],
    model_flag: "--model",
    trailing_args: &[],
    prompt: PromptPlacement::Stdin,
    install_hint: "npm install -g @google/gemini-cli",
};

const OPENCODE: CliTemplate = CliTemplate {
    executable: "opencode",
    leading_args: &["run"],
    model_flag: "--model",
    trailing_args: &[],
    prompt: PromptPlacement::Positional,
    install_hint: "curl -fsSL https://opencode.ai/install | bash",
};

/// Look up the invocation template for a CLI.
pub fn template(cli: CliKind) -> &'static CliTemplate {
    match cli {
        CliKind::Claude => &CLAUDE,
        CliKind::Codex => &CODEX,
        CliKind::Gemini => &GEMINI,
        CliKind::Opencode => &OPENCODE,
    }
}

/// Fully built command line for one attempt (binary path excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub args: Vec<String>,
    pub stdin: Option<String>,
    /// Variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
}

/// Build argv/stdin/env for running `prompt` against `model`.
///
/// Order: leading flags, model flag, the model's own args, trailing flags,
/// then the prompt when it is positional. Custom args can add flags but never
/// displace the fixed ones.
pub fn build_invocation(model: &ModelConfig, prompt: &str) -> Invocation {
    let template = template(model.cli);
    let mut args: Vec<String> = template
        .leading_args
        .iter()
        .map(|arg| arg.to_string())
        .collect();
    args.push(template.model_flag.to_string());
    args.push(model.model.clone());
    args.extend(model.args.iter().cloned());
    args.extend(template.trailing_args.iter().map(|arg| arg.to_string()));

    let stdin = match template.prompt {
        PromptPlacement::Stdin => Some(prompt.to_string()),
        PromptPlacement::Positional => {
            args.push(prompt.to_string());
            None
        }
    };

    Invocation {
        args,
        stdin,
        env: model.env.clone(),
    }
}
