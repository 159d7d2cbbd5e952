use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::debug;

/// An observable condition to wait for. Every variant is evaluated under the
/// same polling contract: a total budget, an inter-poll sleep, and best-effort
/// cancellation once the deadline elapses.
#[derive(Debug, Clone)]
pub enum ProbeSpec {
    Http { url: String },
    Tcp { host: String, port: u16 },
    LogRegex { path: PathBuf, pattern: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    /// A log-regex probe whose pattern carries a capture group returns the
    /// first captured slice (used for tunnel URL lines).
    ReadyWithCapture(String),
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        !matches!(self, Self::TimedOut)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    pub total: Duration,
    pub interval: Duration,
}

impl PollBudget {
    pub fn new(total: Duration) -> Self {
        const DEFAULT_INTERVAL_MS: u64 = 250;
        Self {
            total,
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
        }
    }
}

/// Wait for the condition described by `spec` within `budget`.
pub async fn wait_ready(spec: &ProbeSpec, budget: PollBudget) -> anyhow::Result<ProbeOutcome> {
    let deadline = Instant::now() + budget.total;
    match spec {
        ProbeSpec::Http { url } => wait_http(url, deadline, budget.interval).await,
        ProbeSpec::Tcp { host, port } => wait_tcp(host, *port, deadline, budget.interval).await,
        ProbeSpec::LogRegex { path, pattern } => {
            let re = Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid readiness pattern {pattern:?}: {e}"))?;
            wait_log_regex(path.clone(), re, deadline, budget.interval).await
        }
    }
}

/// Admin endpoints often answer 401/404 while perfectly healthy, so any
/// response short of a server error counts as ready.
pub fn http_status_ready(status: u16) -> bool {
    (200..500).contains(&status)
}

async fn wait_http(
    url: &str,
    deadline: Instant,
    interval: Duration,
) -> anyhow::Result<ProbeOutcome> {
    const ATTEMPT_TIMEOUT_MS: u64 = 2_000;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(ATTEMPT_TIMEOUT_MS))
        .build()?;
    loop {
        match client.get(url).send().await {
            Ok(resp) if http_status_ready(resp.status().as_u16()) => {
                debug!(url, status = resp.status().as_u16(), "http readiness passed");
                return Ok(ProbeOutcome::Ready);
            }
            // Server errors and network errors both mean "not yet".
            Ok(_) | Err(_) => {}
        }
        if Instant::now() >= deadline {
            return Ok(ProbeOutcome::TimedOut);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn wait_tcp(
    host: &str,
    port: u16,
    deadline: Instant,
    interval: Duration,
) -> anyhow::Result<ProbeOutcome> {
    let addr = format!("{host}:{port}");
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(ProbeOutcome::TimedOut);
        }
        match tokio::time::timeout(remaining, tokio::net::TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                // Destroy on first connect; the probe only cares about accept.
                drop(stream);
                debug!(addr, "tcp readiness passed");
                return Ok(ProbeOutcome::Ready);
            }
            Ok(Err(_)) => {}
            Err(_) => return Ok(ProbeOutcome::TimedOut),
        }
        if Instant::now() >= deadline {
            return Ok(ProbeOutcome::TimedOut);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Tail `path` from its length at probe start; only content appended after
/// that point is matched. Pre-existing occurrences of the pattern are ignored.
async fn wait_log_regex(
    path: PathBuf,
    re: Regex,
    deadline: Instant,
    interval: Duration,
) -> anyhow::Result<ProbeOutcome> {
    let start_offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    loop {
        if let Some(outcome) = match_new_content(&path, start_offset, &re) {
            return Ok(outcome);
        }
        if Instant::now() >= deadline {
            return Ok(ProbeOutcome::TimedOut);
        }
        tokio::time::sleep(interval).await;
    }
}

fn match_new_content(path: &std::path::Path, start_offset: u64, re: &Regex) -> Option<ProbeOutcome> {
    let mut file = std::fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    // A truncated (rotated) log restarts the window at zero.
    let offset = if len < start_offset { 0 } else { start_offset };
    if len <= offset {
        return None;
    }
    file.seek(SeekFrom::Start(offset)).ok()?;
    let mut fresh = String::new();
    file.read_to_string(&mut fresh).ok()?;
    let caps = re.captures(&fresh)?;
    match caps.get(1) {
        Some(m) => Some(ProbeOutcome::ReadyWithCapture(m.as_str().to_string())),
        None => Some(ProbeOutcome::Ready),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("asd-test-probe-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn http_status_classes() {
        assert!(http_status_ready(200));
        assert!(http_status_ready(401));
        assert!(http_status_ready(404));
        assert!(http_status_ready(499));
        assert!(!http_status_ready(500));
        assert!(!http_status_ready(503));
    }

    #[tokio::test]
    async fn tcp_ready_on_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let outcome = wait_ready(
            &ProbeSpec::Tcp { host: "127.0.0.1".into(), port },
            PollBudget::new(Duration::from_secs(2)),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ProbeOutcome::Ready);
    }

    #[tokio::test]
    async fn tcp_closed_port_times_out() {
        // Bind then drop to get a port that is almost certainly closed.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let outcome = wait_ready(
            &ProbeSpec::Tcp { host: "127.0.0.1".into(), port },
            PollBudget::new(Duration::from_millis(300)),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ProbeOutcome::TimedOut);
    }

    #[tokio::test]
    async fn log_regex_ignores_preexisting_content() {
        let dir = temp_dir("preexisting");
        let log = dir.join("daemon.log");
        fs::write(&log, "listening on https://old.example.com\n").unwrap();

        let spec = ProbeSpec::LogRegex {
            path: log.clone(),
            pattern: r"(https?://[^\s]+\.[^\s]+)".into(),
        };
        let waiter = tokio::spawn({
            let spec = spec.clone();
            async move { wait_ready(&spec, PollBudget::new(Duration::from_secs(3))).await }
        });

        // Give the probe time to record the starting offset, then append.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let mut f = fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(f, "assigned https://fresh.example.com").unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ProbeOutcome::ReadyWithCapture("https://fresh.example.com".into())
        );
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn log_regex_times_out_without_new_match() {
        let dir = temp_dir("timeout");
        let log = dir.join("daemon.log");
        fs::write(&log, "nothing interesting https://seen.example.com\n").unwrap();
        let outcome = wait_ready(
            &ProbeSpec::LogRegex {
                path: log,
                pattern: r"(https?://[^\s]+\.[^\s]+)".into(),
            },
            PollBudget::new(Duration::from_millis(400)),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ProbeOutcome::TimedOut);
        fs::remove_dir_all(&dir).ok();
    }
}
