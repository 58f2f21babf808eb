//! Command-line front end for the autoloop execution engine.
//!
//! `autoloop run` drives one task through the model pools; the other commands
//! inspect binary resolution and configuration.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::debug;

use autoloop::core::types::ModelConfig;
use autoloop::engine::{Engine, ExecutionError};
use autoloop::exit_codes;
use autoloop::io::config::{DEFAULT_CONFIG_PATH, EngineConfig, load_config, write_config};
use autoloop::io::resolver::{BinaryResolver, ResolverEnv};
use autoloop::logging;

#[derive(Parser)]
#[command(
    name = "autoloop",
    version,
    about = "Run coding-agent CLIs with model rotation, retries and fallback"
)]
struct Cli {
    /// Engine config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one task, rotating models until an attempt succeeds.
    Run {
        /// File that worker output is appended to.
        #[arg(short, long)]
        output: PathBuf,
        /// Prompt text.
        #[arg(short, long, conflicts_with = "prompt_file")]
        prompt: Option<String>,
        /// Read the prompt from a file (`-` for stdin).
        #[arg(long)]
        prompt_file: Option<PathBuf>,
        /// Default per-attempt timeout in seconds (models may override).
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Print the execution report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show where each worker CLI was found, or every path that was checked.
    Binaries,
    /// List the configured model pools.
    Models {
        #[arg(long)]
        json: bool,
    },
    /// Write a default config file.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            output,
            prompt,
            prompt_file,
            timeout,
            json,
        } => {
            let prompt = read_prompt(prompt, prompt_file.as_deref())?;
            cmd_run(&cli.config, &prompt, &output, timeout, json)
        }
        Command::Binaries => cmd_binaries(&cli.config),
        Command::Models { json } => cmd_models(&cli.config, json),
        Command::Init { force } => cmd_init(&cli.config, force),
    }
}

fn read_prompt(prompt: Option<String>, prompt_file: Option<&Path>) -> Result<String> {
    let prompt = match (prompt, prompt_file) {
        (Some(prompt), _) => prompt,
        (None, Some(path)) if path == Path::new("-") => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read prompt from stdin")?;
            buf
        }
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        (None, None) => bail!("a prompt is required (--prompt or --prompt-file)"),
    };
    if prompt.trim().is_empty() {
        bail!("prompt is empty");
    }
    Ok(prompt)
}

fn cmd_run(
    config_path: &Path,
    prompt: &str,
    output: &Path,
    timeout: Option<u64>,
    json: bool,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let timeout_secs = timeout.unwrap_or(config.default_timeout_secs);
    if timeout_secs == 0 {
        bail!("--timeout must be > 0");
    }
    debug!(config = %config_path.display(), timeout_secs, "starting run");

    let mut engine = Engine::from_config(&config, ResolverEnv::from_process())?;
    match engine.execute(prompt, output, timeout_secs) {
        Ok(report) => {
            if json {
                let payload =
                    serde_json::to_string_pretty(&report).context("serialize execution report")?;
                println!("{payload}");
            } else {
                println!(
                    "run: model={} label={} dispatches={} rate_limit_waits={} fallback={}",
                    report.model,
                    report.label,
                    report.dispatches,
                    report.rate_limit_waits,
                    report.used_fallback
                );
            }
            Ok(exit_codes::OK)
        }
        Err(err @ ExecutionError::Exhausted { .. }) => {
            eprintln!("{err}");
            Ok(exit_codes::EXHAUSTED)
        }
        Err(ExecutionError::Io(err)) => {
            Err(err.context(format!("write attempt log {}", output.display())))
        }
    }
}

fn cmd_binaries(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let report =
        BinaryResolver::new(ResolverEnv::from_process(), config.binaries.clone()).resolve_all();
    print!("{}", report.render());
    if report.binaries().is_empty() {
        Ok(exit_codes::INVALID)
    } else {
        Ok(exit_codes::OK)
    }
}

fn cmd_models(config_path: &Path, json: bool) -> Result<i32> {
    let config = load_config(config_path)?;
    if json {
        let payload =
            serde_json::to_string_pretty(&config.models).context("serialize model pools")?;
        println!("{payload}");
        return Ok(exit_codes::OK);
    }
    println!("strategy: {}", config.strategy);
    for (pool, models) in [
        ("primary", &config.models.primary),
        ("fallback", &config.models.fallback),
    ] {
        println!("{pool}:");
        for model in models {
            println!("  {}", describe_model(model, config.default_timeout_secs));
        }
    }
    Ok(exit_codes::OK)
}

fn describe_model(model: &ModelConfig, default_timeout_secs: u64) -> String {
    format!(
        "{} ({}) {} cost={} timeout={}s",
        model.name,
        model.display_name(),
        model.label(),
        model.cost(),
        model.effective_timeout(default_timeout_secs).as_secs()
    )
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &EngineConfig::default())
        .with_context(|| format!("write {}", config_path.display()))?;
    println!("init: wrote {}", config_path.display());
    Ok(exit_codes::OK)
}
