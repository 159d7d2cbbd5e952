pub mod session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::TunnelState;
use crate::paths::Paths;
use crate::probe::ProbeSpec;
use crate::registry::Registry;
use crate::supervisor::{self, DaemonSpec, RetryPolicy, StartOutcome};
use session::{SessionParams, URL_PATTERN};

/// Env marker written onto every spawned tunnel client so the lease reaper
/// can recognize strays after an unclean exit.
pub const LEASE_KEY: &str = "ASD_TUNNEL_LEASE";

const DEFAULT_TUNNEL_TIMEOUT_SECS: u64 = 20;
const CI_TIMEOUT_MULTIPLIER: u32 = 3;
const MAX_BACKOFF_SECS: u64 = 8;

#[derive(Debug, Error)]
pub enum TunnelFailure {
    #[error("no tunnel credential available")]
    CredentialMissing,
    #[error("failed to start tunnel client: {0}")]
    Spawn(String),
    #[error("tunnel client exited before reporting a URL")]
    Crashed,
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Durable per-service session state, one JSON file per service under the
/// workspace tunnels dir. The process itself is owned by its PID file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub service_id: String,
    pub credential_ref: String,
    pub desired_subdomain: String,
    pub local_dial: String,
    pub state: TunnelState,
    pub public_url: Option<String>,
    pub pid: Option<i32>,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub started_at: Option<OffsetDateTime>,
    pub reconnect_count: u32,
}

impl SessionRecord {
    fn new(params: &SessionParams) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            service_id: params.service_id.clone(),
            credential_ref: params.credential.name.clone(),
            desired_subdomain: params.subdomain.clone(),
            local_dial: params.local_dial.clone(),
            state: TunnelState::Idle,
            public_url: None,
            pid: None,
            started_at: None,
            reconnect_count: 0,
        }
    }

    /// A transition away from `established` clears the public URL before any
    /// next connect attempt populates it again.
    fn set_state(&mut self, state: TunnelState) {
        if self.state == TunnelState::Established && state != TunnelState::Established {
            self.public_url = None;
        }
        self.state = state;
    }
}

/// Translates public declarations into supervised SSH sessions and keeps the
/// registry's tunnel fields truthful.
pub struct TunnelManager {
    tunnels_dir: PathBuf,
    log_dir: PathBuf,
    lease_value: String,
}

impl TunnelManager {
    pub fn new(paths: &Paths) -> Self {
        Self {
            tunnels_dir: paths.tunnels_dir.clone(),
            log_dir: paths.log_dir.clone(),
            // Scoped per workspace so parallel projects do not reap each
            // other's sessions.
            lease_value: paths.workspace_dir.to_string_lossy().to_string(),
        }
    }

    pub fn lease_value(&self) -> &str {
        &self.lease_value
    }

    fn slug(service_id: &str) -> String {
        service_id.replace([':', '/'], "-")
    }

    fn record_path(&self, service_id: &str) -> PathBuf {
        self.tunnels_dir.join(format!("{}.json", Self::slug(service_id)))
    }

    fn pid_file(&self, service_id: &str) -> PathBuf {
        self.tunnels_dir.join(format!("{}.pid", Self::slug(service_id)))
    }

    fn log_file(&self, service_id: &str) -> PathBuf {
        self.log_dir.join(format!("tunnel-{}.log", Self::slug(service_id)))
    }

    pub fn load_record(&self, service_id: &str) -> Option<SessionRecord> {
        let raw = std::fs::read_to_string(self.record_path(service_id)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn save_record(&self, record: &SessionRecord) -> anyhow::Result<()> {
        let path = self.record_path(&record.service_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(record)?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        let Ok(entries) = std::fs::read_dir(&self.tunnels_dir) else {
            return Vec::new();
        };
        let mut records: Vec<SessionRecord> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| {
                let raw = std::fs::read_to_string(e.path()).ok()?;
                serde_json::from_str(&raw).ok()
            })
            .collect();
        records.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        records
    }

    /// Ensure a supervised session exists for `params`, waiting for the
    /// gateway's URL line. Safe to call repeatedly; a live established
    /// session short-circuits.
    pub async fn ensure_session(
        &self,
        registry: &Registry,
        params: &SessionParams,
    ) -> Result<SessionRecord, TunnelFailure> {
        let (binary, args) = session::ssh_command(params);
        self.ensure_session_with_command(registry, params, binary, args).await
    }

    async fn ensure_session_with_command(
        &self,
        registry: &Registry,
        params: &SessionParams,
        binary: PathBuf,
        args: Vec<String>,
    ) -> Result<SessionRecord, TunnelFailure> {
        let mut record = match self.load_record(&params.service_id) {
            // One session per (service, credential): a live session built on
            // a different credential is torn down first.
            Some(existing) if existing.credential_ref != params.credential.name => {
                info!(
                    service = %params.service_id,
                    old = %existing.credential_ref,
                    new = %params.credential.name,
                    "credential changed, restarting tunnel session"
                );
                self.stop_session(registry, &params.service_id).await?;
                SessionRecord::new(params)
            }
            Some(existing) => existing,
            None => SessionRecord::new(params),
        };

        let pid_alive = record
            .pid
            .map(supervisor::pid_alive)
            .unwrap_or(false);

        if pid_alive && record.state == TunnelState::Established && record.public_url.is_some() {
            return Ok(record);
        }

        if !pid_alive && record.started_at.is_some() {
            // Transport failure: bounded backoff, then restart with the same
            // argument list. The URL is not sticky across reconnects.
            record.set_state(TunnelState::Degraded);
            record.reconnect_count += 1;
            let delay = backoff_for(record.reconnect_count);
            warn!(
                service = %params.service_id,
                attempt = record.reconnect_count,
                delay_secs = delay.as_secs(),
                "tunnel client gone, reconnecting after backoff"
            );
            self.save_record(&record)?;
            registry
                .set_tunnel(&params.service_id, None, Some(&record.id))
                .map_err(|e| TunnelFailure::Io(e.into()))?;
            tokio::time::sleep(delay).await;
        }

        record.set_state(TunnelState::Connecting);
        self.save_record(&record)?;

        let mut env = HashMap::new();
        env.insert(LEASE_KEY.to_string(), self.lease_value.clone());

        let mut spec = DaemonSpec::new(
            &format!("tunnel-{}", params.service_id),
            binary,
            self.pid_file(&params.service_id),
            self.log_file(&params.service_id),
        );
        spec.args = args;
        spec.env = env;
        spec.readiness = Some(ProbeSpec::LogRegex {
            path: self.log_file(&params.service_id),
            pattern: URL_PATTERN.to_string(),
        });
        spec.readiness_budget = tunnel_budget();
        spec.retry = RetryPolicy::OnFailure;

        match supervisor::start_daemon(&spec).await.map_err(TunnelFailure::Io)? {
            StartOutcome::AlreadyRunning { pid } => {
                // Session from an earlier invocation; recover the URL from
                // the live transcript.
                record.pid = Some(pid);
                match read_transcript_url(&self.log_file(&params.service_id)) {
                    Some(url) => self.mark_established(registry, record, pid, url).map_err(TunnelFailure::Io),
                    None => {
                        record.set_state(TunnelState::Degraded);
                        self.save_record(&record)?;
                        Ok(record)
                    }
                }
            }
            StartOutcome::Started { pid, ready: true, capture: Some(url) } => {
                record.started_at = Some(OffsetDateTime::now_utc());
                self.mark_established(registry, record, pid, url).map_err(TunnelFailure::Io)
            }
            StartOutcome::Started { pid, .. } => {
                // Alive but the gateway has not announced a URL yet.
                record.pid = Some(pid);
                record.started_at = Some(OffsetDateTime::now_utc());
                record.set_state(TunnelState::Degraded);
                self.save_record(&record)?;
                registry
                    .set_tunnel(&params.service_id, None, Some(&record.id))
                    .map_err(|e| TunnelFailure::Io(e.into()))?;
                Ok(record)
            }
            StartOutcome::Failed { reason } => {
                record.set_state(TunnelState::Failed);
                record.pid = None;
                self.save_record(&record)?;
                let _ = registry.set_tunnel_error(&params.service_id, &reason);
                if reason.contains("exited") {
                    Err(TunnelFailure::Crashed)
                } else {
                    Err(TunnelFailure::Spawn(reason))
                }
            }
        }
    }

    fn mark_established(
        &self,
        registry: &Registry,
        mut record: SessionRecord,
        pid: i32,
        url: String,
    ) -> anyhow::Result<SessionRecord> {
        let changed = record.public_url.as_deref() != Some(url.as_str());
        record.pid = Some(pid);
        record.state = TunnelState::Established;
        record.public_url = Some(url.clone());
        self.save_record(&record)?;
        registry.set_tunnel(&record.service_id, Some(&url), Some(&record.id))?;
        if changed {
            info!(service = %record.service_id, url = %url, "tunnel established");
        }
        Ok(record)
    }

    /// Explicit stop: terminate the process group, drop the PID file, clear
    /// `publicUrl` and `tunnelSessionId`.
    pub async fn stop_session(&self, registry: &Registry, service_id: &str) -> anyhow::Result<bool> {
        let pid_file = self.pid_file(service_id);
        let stopped = supervisor::stop_daemon(&pid_file, Duration::from_secs(3), true).await?;

        if let Some(mut record) = self.load_record(service_id) {
            record.set_state(TunnelState::Stopped);
            record.pid = None;
            self.save_record(&record)?;
        }
        let _ = std::fs::remove_file(self.record_path(service_id));
        let _ = registry.set_tunnel(service_id, None, None);
        info!(service = %service_id, "tunnel session stopped");
        Ok(stopped == supervisor::StopOutcome::Stopped)
    }

    pub async fn stop_all(&self, registry: &Registry) -> anyhow::Result<usize> {
        let mut stopped = 0;
        for record in self.list_sessions() {
            if self.stop_session(registry, &record.service_id).await? {
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    /// Mop up detached tunnel clients from an unclean exit, sparing the PIDs
    /// of sessions we still track.
    pub async fn reap_strays(&self) -> usize {
        let tracked: Vec<i32> = self
            .list_sessions()
            .iter()
            .filter_map(|r| r.pid)
            .collect();
        supervisor::reaper::reap_leased(
            LEASE_KEY,
            &self.lease_value,
            &tracked,
            Duration::from_secs(2),
        )
        .await
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(3);
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

/// Tunnel startup budget, multiplied under CI where gateways are slower.
fn tunnel_budget() -> Duration {
    let base = std::env::var("ASD_TUNNEL_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TUNNEL_TIMEOUT_SECS);
    let multiplier = if std::env::var("CI").map(|v| v == "true").unwrap_or(false) {
        CI_TIMEOUT_MULTIPLIER as u64
    } else {
        1
    };
    Duration::from_secs(base * multiplier)
}

/// Full-transcript URL scan, used when adopting an already-running session.
fn read_transcript_url(log_file: &std::path::Path) -> Option<String> {
    let text = std::fs::read_to_string(log_file).ok()?;
    session::parse_public_url(&text)
}
