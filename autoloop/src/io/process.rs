//! Worker process supervision.
//!
//! [`ProcessSupervisor`] runs one worker attempt: spawn, tee stdout/stderr into
//! the attempt log (append) and the console, tick a progress line, and enforce
//! the deadline with SIGTERM followed by a forced kill. Spawn failures become a
//! non-zero [`AttemptResult`] with a remediation hint in the log.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::{AttemptResult, SupervisorConfig};

/// How long to wait for output pipes to drain after a normal exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const PROGRESS_BAR_WIDTH: usize = 20;

/// Everything needed to run one worker attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    /// Prepended to echoed console lines, e.g. `[sonnet] `.
    pub output_prefix: String,
    /// Identifies the attempt in the log header.
    pub label: String,
    pub output_file: PathBuf,
    pub timeout: Duration,
}

/// Runs worker attempts. Tests substitute scripted implementations.
pub trait Supervisor {
    /// Run one attempt to completion.
    ///
    /// Spawn failures are reported as a non-zero [`AttemptResult`]; `Err` is
    /// reserved for problems with the output file itself.
    fn run(&self, request: &RunRequest) -> Result<AttemptResult>;

    /// Handle for force-killing the in-flight child from another thread.
    fn kill_handle(&self) -> KillHandle {
        KillHandle::default()
    }
}

/// Shared pointer to the in-flight child's pid.
#[derive(Debug, Clone, Default)]
pub struct KillHandle {
    pid: Arc<Mutex<Option<u32>>>,
}

impl KillHandle {
    fn set(&self, pid: u32) {
        if let Ok(mut slot) = self.pid.lock() {
            *slot = Some(pid);
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.pid.lock() {
            *slot = None;
        }
    }

    pub fn current(&self) -> Option<u32> {
        self.pid.lock().ok().and_then(|slot| *slot)
    }

    /// Force-kill the in-flight child. Returns false when nothing is running.
    pub fn kill(&self) -> bool {
        let Some(pid) = self.current() else {
            return false;
        };
        warn!(pid, "force-killing worker on request");
        send_signal(pid, Signal::Kill)
    }
}

/// Supervisor that spawns real worker processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    kill: KillHandle,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            kill: KillHandle::default(),
        }
    }
}

impl Supervisor for ProcessSupervisor {
    #[instrument(skip_all, fields(label = %request.label, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &RunRequest) -> Result<AttemptResult> {
        let sink = LogSink::open(&request.output_file)?;
        sink.write_note(&format!(
            "=== {} {} | {} | timeout {}s ===",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            request.label,
            request.binary.display(),
            request.timeout.as_secs()
        ));

        let mut cmd = Command::new(&request.binary);
        cmd.args(&request.args)
            .envs(&request.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if request.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        debug!(binary = %request.binary.display(), "spawning worker");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let failure = spawn_failure(&err, &request.binary);
                error!(err = %err, exit_code = failure.exit_code, "failed to spawn worker");
                sink.write_note(&format!("[spawn failed] {err}\n[hint] {}", failure.hint));
                sink.close();
                return Ok(AttemptResult::exited(failure.exit_code));
            }
        };
        self.kill.set(child.id());

        let stdin_done = request.stdin.clone().and_then(|input| {
            let mut stdin = child.stdin.take()?;
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                if let Err(err) = stdin.write_all(input.as_bytes()) {
                    debug!(err = %err, "worker closed stdin early");
                }
                drop(stdin);
                let _ = tx.send(());
            });
            Some(rx)
        });

        let (done_tx, done_rx) = mpsc::channel();
        let mut readers = 0;
        let echo = self.config.echo_output.then(|| request.output_prefix.clone());
        if let Some(stdout) = child.stdout.take() {
            spawn_pump(stdout, sink.clone(), echo.clone(), done_tx.clone());
            readers += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_pump(stderr, sink.clone(), echo, done_tx);
            readers += 1;
        }

        let mut progress = Progress::new(self.config.echo_output, &request.output_prefix);
        let started = Instant::now();
        let waited = wait_with_deadline(
            &mut child,
            request.timeout,
            Duration::from_millis(self.config.progress_interval_ms.max(1)),
            Duration::from_millis(self.config.sigkill_delay_ms),
            |elapsed| progress.tick(elapsed, request.timeout),
        );
        self.kill.clear();
        progress.finish();
        let (status, timed_out) = match waited {
            Ok(outcome) => outcome,
            Err(err) => {
                sink.close();
                return Err(err);
            }
        };

        if timed_out {
            // Reaped after the kill: nothing more is accepted from the worker.
            sink.stop_output();
            if stdin_done.is_some_and(|rx| rx.try_recv().is_err()) {
                warn!("prompt still being written after kill, detaching stdin writer");
            }
        } else {
            drain_readers(&done_rx, readers, DRAIN_TIMEOUT);
            if let Some(rx) = stdin_done {
                wait_stdin_writer(&rx, DRAIN_TIMEOUT);
            }
        }

        let exit_code = exit_code(status);
        let elapsed = started.elapsed().as_secs();
        if timed_out {
            sink.write_note(&format!("[timed out after {elapsed}s, exit {exit_code}]"));
        } else {
            sink.write_note(&format!("[exit {exit_code} after {elapsed}s]"));
        }
        sink.close();
        debug!(exit_code, timed_out, "worker finished");

        Ok(AttemptResult {
            exit_code,
            timed_out,
        })
    }

    fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }
}

/// Wait for `child`, ticking `on_tick` every `tick` until it exits or the
/// deadline passes. Returns the exit status and whether the deadline fired.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    tick: Duration,
    grace: Duration,
    mut on_tick: impl FnMut(Duration),
) -> Result<(ExitStatus, bool)> {
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
        let now = Instant::now();
        let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero()) else {
            warn!(timeout_secs = timeout.as_secs(), "worker timed out, terminating");
            return terminate(child, grace).map(|status| (status, true));
        };
        match child
            .wait_timeout(tick.min(remaining))
            .context("wait for worker")?
        {
            Some(status) => return Ok((status, false)),
            None => on_tick(started.elapsed()),
        }
    }
}

/// Graceful then forced termination.
fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    if send_signal(child.id(), Signal::Term) {
        if let Some(status) = child
            .wait_timeout(grace)
            .context("wait for worker after SIGTERM")?
        {
            info!("worker exited after SIGTERM");
            return Ok(status);
        }
        warn!(grace_ms = grace.as_millis() as u64, "worker ignored SIGTERM, killing");
    }
    child.kill().context("kill worker")?;
    child.wait().context("reap killed worker")
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> bool {
    use nix::sys::signal::{Signal as NixSignal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let signal = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(err) => {
            warn!(pid, ?signal, err = %err, "failed to signal worker");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) -> bool {
    debug!(pid, ?signal, "signals unsupported on this platform");
    false
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Exit code and remediation text for a spawn error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnFailure {
    pub exit_code: i32,
    pub hint: String,
}

/// Map a spawn error to a synthetic exit code and a hint keyed by OS error.
pub fn spawn_failure(err: &io::Error, binary: &Path) -> SpawnFailure {
    if let Some(failure) = err
        .raw_os_error()
        .and_then(|raw| errno_failure(raw, binary))
    {
        return failure;
    }
    let path = binary.display();
    let (exit_code, hint) = match err.kind() {
        io::ErrorKind::NotFound => (127, not_found_hint(binary)),
        io::ErrorKind::PermissionDenied => (126, format!("{path} is not executable")),
        io::ErrorKind::OutOfMemory => (1, OOM_HINT.to_string()),
        _ => (1, format!("failed to spawn {path}: {err}")),
    };
    SpawnFailure { exit_code, hint }
}

const OOM_HINT: &str = "out of memory while spawning the worker; stop other workers or add swap";

fn not_found_hint(binary: &Path) -> String {
    format!(
        "{} does not exist; reinstall the CLI or fix its AUTOLOOP_*_PATH override",
        binary.display()
    )
}

#[cfg(unix)]
fn errno_failure(raw: i32, binary: &Path) -> Option<SpawnFailure> {
    use nix::errno::Errno;

    let path = binary.display();
    let (exit_code, hint) = match Errno::from_raw(raw) {
        Errno::ENOENT => (127, not_found_hint(binary)),
        Errno::EACCES | Errno::EPERM => (126, format!("{path} is not executable; run `chmod +x {path}`")),
        Errno::ENOEXEC => (
            126,
            format!("{path} is not a valid executable here (wrong architecture or missing shebang)"),
        ),
        Errno::ENOMEM => (1, OOM_HINT.to_string()),
        Errno::E2BIG => (
            1,
            "argument list too long; use a CLI that reads the prompt from stdin".to_string(),
        ),
        Errno::EMFILE | Errno::ENFILE => (
            1,
            "too many open files; raise the limit with `ulimit -n`".to_string(),
        ),
        Errno::EAGAIN => (
            1,
            "process limit reached; check `ulimit -u` and stray worker processes".to_string(),
        ),
        _ => return None,
    };
    Some(SpawnFailure { exit_code, hint })
}

#[cfg(not(unix))]
fn errno_failure(_raw: i32, _binary: &Path) -> Option<SpawnFailure> {
    None
}

/// Append-only attempt log shared by the output pumps.
#[derive(Clone)]
struct LogSink {
    inner: Arc<Mutex<SinkState>>,
}

struct SinkState {
    writer: Option<BufWriter<File>>,
    /// Cleared once the worker is reaped after a kill; late bytes are dropped.
    accepting_output: bool,
}

impl LogSink {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open attempt log {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(SinkState {
                writer: Some(BufWriter::new(file)),
                accepting_output: true,
            })),
        })
    }

    /// Append raw worker output.
    fn write_output(&self, bytes: &[u8]) {
        self.append(bytes, false);
    }

    /// Append a supervisor line (header, footer, hints).
    fn write_note(&self, line: &str) {
        self.append(format!("{line}\n").as_bytes(), true);
    }

    fn append(&self, bytes: &[u8], note: bool) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        if !note && !state.accepting_output {
            return;
        }
        if let Some(writer) = state.writer.as_mut() {
            if let Err(err) = writer.write_all(bytes) {
                warn!(err = %err, "failed to write attempt log");
            } else if let Err(err) = writer.flush() {
                warn!(err = %err, "failed to flush attempt log");
            }
        }
    }

    fn stop_output(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.accepting_output = false;
        }
    }

    fn close(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.accepting_output = false;
            if let Some(mut writer) = state.writer.take()
                && let Err(err) = writer.flush()
            {
                warn!(err = %err, "failed to flush attempt log");
            }
        }
    }
}

/// Read `reader` line by line into the log (and console when `echo` is set).
fn spawn_pump<R: Read + Send + 'static>(
    reader: R,
    sink: LogSink,
    echo: Option<String>,
    done: Sender<()>,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    sink.write_output(&line);
                    if let Some(prefix) = &echo {
                        let text = String::from_utf8_lossy(&line);
                        let mut stdout = io::stdout().lock();
                        let _ = writeln!(stdout, "{prefix}{}", text.trim_end_matches(['\r', '\n']));
                    }
                }
                Err(err) => {
                    debug!(err = %err, "worker output stream ended with error");
                    break;
                }
            }
        }
        let _ = done.send(());
    });
}

fn drain_readers(done: &Receiver<()>, readers: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for _ in 0..readers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if done.recv_timeout(remaining).is_err() {
            warn!("worker output still open after exit (background child?), detaching");
            return;
        }
    }
}

/// A background child can inherit stdin without reading it, leaving the
/// writer blocked on a full pipe after the worker itself has exited.
fn wait_stdin_writer(done: &Receiver<()>, timeout: Duration) {
    if done.recv_timeout(timeout).is_err() {
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            "prompt still being written after exit (background child?), detaching stdin writer"
        );
    }
}

/// Single-line console progress indicator.
struct Progress {
    enabled: bool,
    prefix: String,
    drawn: bool,
}

impl Progress {
    fn new(enabled: bool, prefix: &str) -> Self {
        Self {
            enabled,
            prefix: prefix.to_string(),
            drawn: false,
        }
    }

    fn tick(&mut self, elapsed: Duration, timeout: Duration) {
        let line = format_progress(elapsed, timeout);
        debug!(progress = %line, "worker running");
        if self.enabled {
            let mut stderr = io::stderr().lock();
            let _ = write!(stderr, "\r{}{line}", self.prefix);
            let _ = stderr.flush();
            self.drawn = true;
        }
    }

    fn finish(&mut self) {
        if self.drawn {
            let _ = writeln!(io::stderr().lock());
            self.drawn = false;
        }
    }
}

/// Render `[####----------------] 20% 1m00s / 5m00s`.
pub fn format_progress(elapsed: Duration, timeout: Duration) -> String {
    let total = timeout.as_secs_f64();
    let ratio = if total > 0.0 {
        (elapsed.as_secs_f64() / total).clamp(0.0, 1.0)
    } else {
        1.0
    };
    let filled = (ratio * PROGRESS_BAR_WIDTH as f64).round() as usize;
    format!(
        "[{}{}] {:>3}% {} / {}",
        "#".repeat(filled),
        "-".repeat(PROGRESS_BAR_WIDTH - filled),
        (ratio * 100.0).floor() as u32,
        format_duration(elapsed),
        format_duration(timeout)
    )
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}m{:02}s", secs / 60, secs % 60)
}
