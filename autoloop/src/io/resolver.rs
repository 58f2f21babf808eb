//! Worker binary discovery.
//!
//! Each CLI is resolved once, at engine construction, through a fixed chain:
//! dedicated env var, config override, `PATH`, then known install locations.
//! The first candidate that exists wins. The result is an immutable
//! [`CliBinaryMap`] plus a [`ResolutionReport`] describing every path checked.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::ffi::OsString;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::invocation::template;
use crate::core::types::CliKind;

/// Name of the env var that pins a CLI's binary, e.g. `AUTOLOOP_CLAUDE_PATH`.
pub fn env_var_name(cli: CliKind) -> String {
    format!("AUTOLOOP_{}_PATH", cli.as_str().to_ascii_uppercase())
}

/// Home-relative install locations tried after `PATH`.
fn home_locations(cli: CliKind) -> &'static [&'static str] {
    match cli {
        CliKind::Claude => &[
            ".claude/local/claude",
            ".local/bin/claude",
            ".npm-global/bin/claude",
        ],
        CliKind::Codex => &[".npm-global/bin/codex", ".local/bin/codex"],
        CliKind::Gemini => &[".npm-global/bin/gemini", ".local/bin/gemini"],
        CliKind::Opencode => &[".opencode/bin/opencode", ".local/bin/opencode"],
    }
}

/// System prefixes package managers commonly install into.
pub const SYSTEM_PREFIXES: [&str; 2] = ["/usr/local/bin", "/opt/homebrew/bin"];

/// Snapshot of the process environment the resolver reads.
#[derive(Debug, Clone, Default)]
pub struct ResolverEnv {
    pub vars: HashMap<String, String>,
    pub path: Option<OsString>,
    pub home: Option<PathBuf>,
    /// Directories checked after the home-relative locations.
    pub system_prefixes: Vec<PathBuf>,
}

impl ResolverEnv {
    pub fn from_process() -> Self {
        let vars = CliKind::ALL
            .into_iter()
            .map(env_var_name)
            .filter_map(|name| env::var(&name).ok().map(|value| (name, value)))
            .collect();
        Self {
            vars,
            path: env::var_os("PATH"),
            home: dirs::home_dir(),
            system_prefixes: SYSTEM_PREFIXES.iter().map(PathBuf::from).collect(),
        }
    }
}

/// Where a candidate path came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    EnvVar(String),
    ConfigOverride,
    PathSearch,
    KnownLocation,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::EnvVar(name) => write!(f, "${name}"),
            Source::ConfigOverride => f.write_str("config override"),
            Source::PathSearch => f.write_str("PATH"),
            Source::KnownLocation => f.write_str("known location"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub source: Source,
    pub path: PathBuf,
    pub found: bool,
}

/// Resolution outcome for a single CLI.
#[derive(Debug, Clone)]
pub struct CliResolution {
    pub cli: CliKind,
    /// Candidates in the order they were checked, ending at the winner.
    pub candidates: Vec<Candidate>,
}

impl CliResolution {
    pub fn resolved(&self) -> Option<&Candidate> {
        self.candidates.iter().find(|candidate| candidate.found)
    }
}

/// Per-CLI resolution details, in [`CliKind::ALL`] order.
#[derive(Debug, Clone)]
pub struct ResolutionReport {
    pub entries: Vec<CliResolution>,
}

impl ResolutionReport {
    pub fn binaries(&self) -> CliBinaryMap {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .resolved()
                    .map(|candidate| (entry.cli, candidate.path.clone()))
            })
            .collect()
    }

    /// Human-readable listing of every path checked, with install hints for
    /// CLIs that did not resolve.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match entry.resolved() {
                Some(found) => {
                    let _ = writeln!(
                        out,
                        "{}: {} (via {})",
                        entry.cli,
                        found.path.display(),
                        found.source
                    );
                }
                None => {
                    let _ = writeln!(out, "{}: not found", entry.cli);
                    for candidate in &entry.candidates {
                        let _ = writeln!(
                            out,
                            "  checked {} ({})",
                            candidate.path.display(),
                            candidate.source
                        );
                    }
                    let _ = writeln!(
                        out,
                        "  install: {} (or set {})",
                        template(entry.cli).install_hint,
                        env_var_name(entry.cli)
                    );
                }
            }
        }
        out
    }
}

/// Resolved binary per CLI. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliBinaryMap(BTreeMap<CliKind, PathBuf>);

impl CliBinaryMap {
    pub fn get(&self, cli: CliKind) -> Option<&Path> {
        self.0.get(&cli).map(PathBuf::as_path)
    }

    pub fn contains(&self, cli: CliKind) -> bool {
        self.0.contains_key(&cli)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CliKind, &Path)> {
        self.0.iter().map(|(cli, path)| (*cli, path.as_path()))
    }
}

impl FromIterator<(CliKind, PathBuf)> for CliBinaryMap {
    fn from_iter<I: IntoIterator<Item = (CliKind, PathBuf)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no worker CLI binaries found; nothing can execute tasks\n{report}")]
    NoBinaries { report: String },
}

pub struct BinaryResolver {
    env: ResolverEnv,
    overrides: BTreeMap<CliKind, PathBuf>,
}

impl BinaryResolver {
    pub fn new(env: ResolverEnv, overrides: BTreeMap<CliKind, PathBuf>) -> Self {
        Self { env, overrides }
    }

    /// Walk the chain for one CLI, stopping at the first existing file.
    pub fn resolve(&self, cli: CliKind) -> CliResolution {
        let mut candidates = Vec::new();

        let var = env_var_name(cli);
        if let Some(value) = self.env.vars.get(&var).filter(|value| !value.trim().is_empty()) {
            if check(&mut candidates, cli, Source::EnvVar(var.clone()), PathBuf::from(value.trim())) {
                return CliResolution { cli, candidates };
            }
            warn!(%cli, var = %var, "env override does not point at a file");
        }

        if let Some(path) = self.overrides.get(&cli)
            && check(&mut candidates, cli, Source::ConfigOverride, path.clone())
        {
            return CliResolution { cli, candidates };
        }

        let executable = template(cli).executable;
        let on_path = self
            .env
            .path
            .as_ref()
            .and_then(|path| search_path(path, executable));
        match on_path {
            Some(path) => {
                if check(&mut candidates, cli, Source::PathSearch, path) {
                    return CliResolution { cli, candidates };
                }
            }
            None => candidates.push(Candidate {
                source: Source::PathSearch,
                path: PathBuf::from(executable),
                found: false,
            }),
        }

        let known = self
            .env
            .home
            .iter()
            .flat_map(|home| home_locations(cli).iter().map(move |rel| home.join(rel)))
            .chain(
                self.env
                    .system_prefixes
                    .iter()
                    .map(|prefix| prefix.join(executable)),
            );
        for path in known {
            if check(&mut candidates, cli, Source::KnownLocation, path) {
                break;
            }
        }

        CliResolution { cli, candidates }
    }

    pub fn resolve_all(&self) -> ResolutionReport {
        ResolutionReport {
            entries: CliKind::ALL.into_iter().map(|cli| self.resolve(cli)).collect(),
        }
    }

    /// Resolve every CLI; fails if none resolves at all.
    pub fn resolve_binaries(&self) -> Result<(CliBinaryMap, ResolutionReport), ResolveError> {
        let report = self.resolve_all();
        let binaries = report.binaries();
        if binaries.is_empty() {
            return Err(ResolveError::NoBinaries {
                report: report.render(),
            });
        }
        for (cli, path) in binaries.iter() {
            info!(%cli, path = %path.display(), "resolved worker binary");
        }
        Ok((binaries, report))
    }
}

fn check(candidates: &mut Vec<Candidate>, cli: CliKind, source: Source, path: PathBuf) -> bool {
    let found = is_usable(&path);
    debug!(%cli, %source, path = %path.display(), found, "checked binary candidate");
    candidates.push(Candidate {
        source,
        path,
        found,
    });
    found
}

/// `which`-style lookup across a `PATH` value.
fn search_path(path: &OsString, executable: &str) -> Option<PathBuf> {
    env::split_paths(path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(executable))
        .find(|candidate| is_usable(candidate))
}

#[cfg(unix)]
fn is_usable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_usable(path: &Path) -> bool {
    path.is_file()
}
