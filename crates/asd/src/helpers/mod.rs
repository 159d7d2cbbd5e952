//! Helper daemons: web terminal, browser IDE, database GUI, and traffic
//! inspector. Each is an external binary driven through the supervisor and
//! registered as a service so the reconciler routes it like anything else.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::{ServiceDeclaration, ServiceSource};
use crate::paths::Paths;
use crate::probe::ProbeSpec;
use crate::registry::{Registry, RegistryEntry};
use crate::supervisor::{self, DaemonSpec, StartOutcome, StopOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    Terminal,
    Code,
    Database,
    Inspect,
}

impl Helper {
    pub const ALL: [Helper; 4] = [Self::Terminal, Self::Code, Self::Database, Self::Inspect];

    pub fn service_id(&self) -> &'static str {
        match self {
            Self::Terminal => "asd:terminal",
            Self::Code => "asd:code",
            Self::Database => "asd:database",
            Self::Inspect => "asd:inspect",
        }
    }

    pub fn binary(&self) -> &'static str {
        match self {
            Self::Terminal => "ttyd",
            Self::Code => "code-server",
            Self::Database => "dbgate",
            Self::Inspect => "mitmweb",
        }
    }

    /// Per-service port hint env var (e.g. `TTYD_PORT`), then the default.
    fn port_env(&self) -> &'static str {
        match self {
            Self::Terminal => "TTYD_PORT",
            Self::Code => "CODE_SERVER_PORT",
            Self::Database => "DBGATE_PORT",
            Self::Inspect => "INSPECT_PORT",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Self::Terminal => 7681,
            Self::Code => 8443,
            Self::Database => 3113,
            Self::Inspect => 8081,
        }
    }

    fn subdomain(&self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Code => "code",
            Self::Database => "database",
            Self::Inspect => "inspect",
        }
    }

    pub fn port(&self) -> u16 {
        std::env::var(self.port_env())
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| self.default_port())
    }

    fn args(&self, port: u16, paths: &Paths) -> Vec<String> {
        match self {
            Self::Terminal => vec![
                "--port".to_string(),
                port.to_string(),
                "--writable".to_string(),
                std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string()),
            ],
            Self::Code => vec![
                "--bind-addr".to_string(),
                format!("127.0.0.1:{port}"),
                "--auth".to_string(),
                "none".to_string(),
                paths.project_root.to_string_lossy().to_string(),
            ],
            Self::Database => Vec::new(),
            Self::Inspect => vec!["--web-port".to_string(), port.to_string()],
        }
    }

    fn daemon_spec(&self, paths: &Paths) -> DaemonSpec {
        let port = self.port();
        let slug = self.subdomain();
        let mut spec = DaemonSpec::new(
            slug,
            self.binary(),
            paths.workspace_dir.join(format!("{slug}.pid")),
            paths.log_dir.join(format!("{slug}.log")),
        );
        spec.args = self.args(port, paths);
        if *self == Self::Database {
            spec.env.insert("PORT".to_string(), port.to_string());
        }
        spec.readiness = Some(ProbeSpec::Http {
            url: format!("http://127.0.0.1:{port}/"),
        });
        spec.readiness_budget = Duration::from_secs(15);
        spec
    }

    fn declaration(&self, port: u16) -> ServiceDeclaration {
        ServiceDeclaration {
            id: self.service_id().to_string(),
            dial: Some(format!("127.0.0.1:{port}")),
            subdomain: Some(self.subdomain().to_string()),
            ..Default::default()
        }
    }
}

impl FromStr for Helper {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "terminal" => Ok(Self::Terminal),
            "code" => Ok(Self::Code),
            "database" => Ok(Self::Database),
            "inspect" => Ok(Self::Inspect),
            other => Err(format!("unknown helper: {other}")),
        }
    }
}

/// Start a helper and upsert its registry entry.
pub async fn start(helper: Helper, paths: &Paths, registry: &Registry) -> anyhow::Result<StartOutcome> {
    let spec = helper.daemon_spec(paths);
    let outcome = supervisor::start_daemon(&spec).await?;
    if matches!(outcome, StartOutcome::Started { .. } | StartOutcome::AlreadyRunning { .. }) {
        let port = helper.port();
        let mut entry = RegistryEntry::from_declaration(helper.declaration(port), ServiceSource::Config);
        entry.allocated_port = Some(port);
        if let StartOutcome::Started { pid, .. } | StartOutcome::AlreadyRunning { pid } = &outcome {
            entry.process_id = Some(*pid);
        }
        registry.upsert(entry)?;
    }
    Ok(outcome)
}

/// Stop a helper and drop its registry entry.
pub async fn stop(helper: Helper, paths: &Paths, registry: &Registry) -> anyhow::Result<StopOutcome> {
    let pid_file = paths.workspace_dir.join(format!("{}.pid", helper.subdomain()));
    let outcome = supervisor::stop_daemon(&pid_file, Duration::from_secs(3), true).await?;
    let _ = registry.remove(helper.service_id());
    Ok(outcome)
}

/// Binary availability summary for `asd update`.
pub fn binary_status() -> Vec<(String, Option<PathBuf>)> {
    let mut binaries: Vec<&str> = vec!["caddy", "ssh", "sshpass"];
    binaries.extend(Helper::ALL.iter().map(|h| h.binary()));
    binaries
        .into_iter()
        .map(|name| {
            (
                name.to_string(),
                supervisor::resolve_binary(std::path::Path::new(name)),
            )
        })
        .collect()
}
