pub mod reaper;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::probe::{wait_ready, PollBudget, ProbeOutcome, ProbeSpec};

/// Interval between spawn and the first liveness verification.
const STARTUP_INTERVAL_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    #[default]
    Never,
    /// Retry exactly once when readiness fails inside the warmup budget.
    OnFailure,
}

/// Everything needed to run a binary as a detached daemon.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub name: String,
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub readiness: Option<ProbeSpec>,
    pub readiness_budget: Duration,
    pub min_uptime: Duration,
    pub retry: RetryPolicy,
}

impl DaemonSpec {
    pub fn new(name: &str, binary: impl Into<PathBuf>, pid_file: PathBuf, log_file: PathBuf) -> Self {
        const DEFAULT_READINESS_BUDGET_SECS: u64 = 15;
        const DEFAULT_MIN_UPTIME_MS: u64 = 2_000;
        Self {
            name: name.to_string(),
            binary: binary.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            pid_file,
            log_file,
            readiness: None,
            readiness_budget: Duration::from_secs(DEFAULT_READINESS_BUDGET_SECS),
            min_uptime: Duration::from_millis(DEFAULT_MIN_UPTIME_MS),
            retry: RetryPolicy::Never,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning { pid: i32 },
    /// The daemon is alive. `ready: false` means readiness did not converge
    /// inside the budget; callers may keep probing on their own.
    Started { pid: i32, ready: bool, capture: Option<String> },
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// Start a daemon per the PID-file contract:
/// live PID-file short-circuits, stale files are reclaimed, the child is
/// detached into its own process group with both stdio streams appended to
/// the log file, and readiness is evaluated in the parent.
pub async fn start_daemon(spec: &DaemonSpec) -> anyhow::Result<StartOutcome> {
    if let Some(pid) = read_pid_file(&spec.pid_file) {
        if pid_alive(pid) {
            debug!(daemon = %spec.name, pid, "already running");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }
        info!(daemon = %spec.name, pid, "reclaiming stale pid file");
        let _ = std::fs::remove_file(&spec.pid_file);
    }

    let binary = match resolve_binary(&spec.binary) {
        Some(path) => path,
        None => {
            return Ok(StartOutcome::Failed {
                reason: format!("binary not found: {}", spec.binary.display()),
            })
        }
    };

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_file)
        .with_context(|| format!("failed to open log file {}", spec.log_file.display()))?;
    let stderr_file = log_file
        .try_clone()
        .context("failed to clone log file handle")?;

    let mut cmd = std::process::Command::new(&binary);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(log_file)
        .stderr(stderr_file);
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    // New process group (PGID = child PID) so termination reaches the whole
    // tree, and the parent can exit without taking the daemon down.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let spawned_at = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return Ok(StartOutcome::Failed {
                reason: format!("failed to spawn {}: {e}", binary.display()),
            })
        }
    };
    let pid = child.id() as i32;
    write_pid_file(&spec.pid_file, pid)?;
    // The daemon outlives this process, but while we are alive an exited
    // child would linger as a zombie and fool `kill(pid, 0)`. A detached
    // reaper thread waits on the handle without blocking anything.
    std::thread::spawn(move || {
        let _ = child.wait();
    });

    tokio::time::sleep(Duration::from_millis(STARTUP_INTERVAL_MS)).await;
    if !pid_alive(pid) {
        let _ = std::fs::remove_file(&spec.pid_file);
        return Ok(StartOutcome::Failed {
            reason: format!("{} exited during startup, see {}", spec.name, spec.log_file.display()),
        });
    }

    let Some(readiness) = &spec.readiness else {
        info!(daemon = %spec.name, pid, "started");
        return Ok(StartOutcome::Started { pid, ready: true, capture: None });
    };

    match wait_ready(readiness, PollBudget::new(spec.readiness_budget)).await? {
        ProbeOutcome::Ready => {
            info!(daemon = %spec.name, pid, "started and ready");
            Ok(StartOutcome::Started { pid, ready: true, capture: None })
        }
        ProbeOutcome::ReadyWithCapture(capture) => {
            info!(daemon = %spec.name, pid, "started and ready");
            Ok(StartOutcome::Started { pid, ready: true, capture: Some(capture) })
        }
        ProbeOutcome::TimedOut => {
            let within_warmup = spawned_at.elapsed() < spec.min_uptime;
            let alive = pid_alive(pid);
            if within_warmup && spec.retry == RetryPolicy::OnFailure {
                warn!(daemon = %spec.name, pid, alive, "readiness failed inside warmup, retrying once");
                stop_daemon(&spec.pid_file, Duration::from_millis(500), true).await?;
                let mut retry_spec = spec.clone();
                retry_spec.retry = RetryPolicy::Never;
                return Box::pin(start_daemon(&retry_spec)).await;
            }
            if alive {
                warn!(daemon = %spec.name, pid, "started but readiness did not converge");
                Ok(StartOutcome::Started { pid, ready: false, capture: None })
            } else {
                let _ = std::fs::remove_file(&spec.pid_file);
                Ok(StartOutcome::Failed {
                    reason: format!("{} exited before becoming ready", spec.name),
                })
            }
        }
    }
}

/// Two-phase termination: TERM the process group (or the bare PID when
/// `kill_group` is false), wait `gentle`, then KILL. Removes the PID file.
/// Every signal tolerates "process already gone".
pub async fn stop_daemon(
    pid_file: &Path,
    gentle: Duration,
    kill_group: bool,
) -> anyhow::Result<StopOutcome> {
    let Some(pid) = read_pid_file(pid_file) else {
        return Ok(StopOutcome::NotRunning);
    };
    if !pid_alive(pid) {
        let _ = std::fs::remove_file(pid_file);
        return Ok(StopOutcome::NotRunning);
    }

    terminate(pid, kill_group, gentle).await;
    let _ = std::fs::remove_file(pid_file);
    Ok(StopOutcome::Stopped)
}

/// Signal-escalated termination of a bare PID (no PID file involved).
pub async fn terminate(pid: i32, kill_group: bool, gentle: Duration) {
    let target = if kill_group { -pid } else { pid };

    // TERM first; ESRCH means the process (group) is already gone.
    unsafe { libc::kill(target, libc::SIGTERM) };

    let deadline = Instant::now() + gentle;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return;
        }
        const POLL_MS: u64 = 50;
        tokio::time::sleep(Duration::from_millis(POLL_MS)).await;
    }

    if pid_alive(pid) {
        debug!(pid, "gentle stop expired, sending KILL");
        unsafe { libc::kill(target, libc::SIGKILL) };
        // A child that re-grouped itself (setsid) escapes the group signal;
        // the direct KILL covers it and returns ESRCH when already gone.
        if kill_group {
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
    }
}

/// A command run attached to the console, as the automation runner does it.
#[derive(Debug, Clone)]
pub struct ForegroundSpec {
    pub command: String,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub tee_log: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

/// Run a command in the foreground under a cleanup wrapper: stdio streams to
/// the parent console (optionally teed to a log file), and termination
/// signals are forwarded to the whole child process group.
pub async fn run_foreground(spec: &ForegroundSpec) -> anyhow::Result<i32> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(&spec.command);
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn: {}", spec.command))?;
    let pid = child.id().map(|p| p as i32).unwrap_or(0);

    let mut tee = match &spec.tee_log {
        Some(path) => Some(
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("failed to open log file {}", path.display()))?,
        ),
        None => None,
    };

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();

    let wait = async {
        let (mut out_done, mut err_done) = (false, false);
        while !(out_done && err_done) {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => match line? {
                    Some(line) => {
                        println!("{line}");
                        if let Some(f) = tee.as_mut() {
                            f.write_all(line.as_bytes()).await?;
                            f.write_all(b"\n").await?;
                        }
                    }
                    None => out_done = true,
                },
                line = err_lines.next_line(), if !err_done => match line? {
                    Some(line) => {
                        eprintln!("{line}");
                        if let Some(f) = tee.as_mut() {
                            f.write_all(line.as_bytes()).await?;
                            f.write_all(b"\n").await?;
                        }
                    }
                    None => err_done = true,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!(pid, "interrupt received, stopping child process group");
                    terminate(pid, true, Duration::from_secs(3)).await;
                }
            }
        }
        let status = child.wait().await?;
        anyhow::Ok(status.code().unwrap_or(1))
    };

    match spec.timeout {
        Some(limit) => match tokio::time::timeout(limit, wait).await {
            Ok(code) => code,
            Err(_) => {
                warn!(command = %spec.command, "step timed out, stopping process group");
                terminate(pid, true, Duration::from_secs(3)).await;
                anyhow::bail!("timed out after {limit:?}: {}", spec.command)
            }
        },
        None => wait.await,
    }
}

/// `kill(pid, 0)` liveness: delivery failure other than EPERM means gone.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let ret = unsafe { libc::kill(pid, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub fn read_pid_file(path: &Path) -> Option<i32> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.trim().parse().ok()
}

fn write_pid_file(path: &Path, pid: i32) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, format!("{pid}\n"))
        .with_context(|| format!("failed to write pid file {}", path.display()))
}

/// Resolve a binary through PATH when it is not already an absolute path.
pub fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.is_absolute() {
        return binary.exists().then(|| binary.to_path_buf());
    }
    let output = std::process::Command::new("which")
        .arg(binary)
        .output()
        .ok()?;
    if output.status.success() {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("asd-test-super-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sleep_spec(dir: &Path, name: &str) -> DaemonSpec {
        let mut spec = DaemonSpec::new(
            name,
            "/bin/sleep",
            dir.join(format!("{name}.pid")),
            dir.join(format!("{name}.log")),
        );
        spec.args = vec!["30".into()];
        spec
    }

    /// Spawn and reap a short-lived process to get a PID that is known dead.
    fn dead_pid() -> i32 {
        let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    #[test]
    fn pid_alive_on_self() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(0));
    }

    #[tokio::test]
    async fn stale_pid_file_is_reclaimed() {
        let dir = temp_dir("stale");
        let spec = sleep_spec(&dir, "stale");
        fs::write(&spec.pid_file, format!("{}\n", dead_pid())).unwrap();

        let outcome = start_daemon(&spec).await.unwrap();
        let StartOutcome::Started { pid, ready, .. } = outcome else {
            panic!("expected Started, got {outcome:?}");
        };
        assert!(ready);
        assert_eq!(read_pid_file(&spec.pid_file), Some(pid));

        stop_daemon(&spec.pid_file, Duration::from_millis(200), true)
            .await
            .unwrap();
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn second_start_reports_already_running() {
        let dir = temp_dir("already");
        let spec = sleep_spec(&dir, "already");

        let first = start_daemon(&spec).await.unwrap();
        let StartOutcome::Started { pid, .. } = first else {
            panic!("expected Started, got {first:?}");
        };
        let second = start_daemon(&spec).await.unwrap();
        assert_eq!(second, StartOutcome::AlreadyRunning { pid });

        stop_daemon(&spec.pid_file, Duration::from_millis(200), true)
            .await
            .unwrap();
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn missing_binary_fails_without_pid_file() {
        let dir = temp_dir("nobin");
        let spec = DaemonSpec::new(
            "nobin",
            "asd-definitely-not-a-binary",
            dir.join("nobin.pid"),
            dir.join("nobin.log"),
        );
        let outcome = start_daemon(&spec).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Failed { .. }));
        assert!(!spec.pid_file.exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn immediate_exit_is_failed_and_cleans_pid_file() {
        let dir = temp_dir("exit");
        let mut spec = DaemonSpec::new(
            "exit",
            "/bin/true",
            dir.join("exit.pid"),
            dir.join("exit.log"),
        );
        spec.args = vec![];
        let outcome = start_daemon(&spec).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Failed { .. }));
        assert!(!spec.pid_file.exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn two_phase_kill_defeats_term_trap() {
        let dir = temp_dir("trap");
        let mut spec = DaemonSpec::new(
            "trap",
            "/bin/sh",
            dir.join("trap.pid"),
            dir.join("trap.log"),
        );
        spec.args = vec![
            "-c".into(),
            "trap '' TERM; while true; do sleep 1; done".into(),
        ];

        let StartOutcome::Started { pid, .. } = start_daemon(&spec).await.unwrap() else {
            panic!("expected Started");
        };
        assert!(pid_alive(pid));

        let stopped = stop_daemon(&spec.pid_file, Duration::from_millis(300), true)
            .await
            .unwrap();
        assert_eq!(stopped, StopOutcome::Stopped);
        assert!(!spec.pid_file.exists());
        // KILL is not trappable; give the kernel a moment to reap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pid_alive(pid));

        // A fresh start after the kill is a clean start, not already-running.
        let again = start_daemon(&spec).await.unwrap();
        assert!(matches!(again, StartOutcome::Started { .. }));
        stop_daemon(&spec.pid_file, Duration::from_millis(300), true)
            .await
            .unwrap();
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn stop_without_pid_file_is_not_running() {
        let dir = temp_dir("norun");
        let outcome = stop_daemon(&dir.join("none.pid"), Duration::from_millis(100), true)
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        fs::remove_dir_all(&dir).ok();
    }
}
