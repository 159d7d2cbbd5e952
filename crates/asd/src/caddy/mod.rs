pub mod routes;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::paths::Paths;
use crate::probe::ProbeSpec;
use crate::supervisor::{self, DaemonSpec, StartOutcome, StopOutcome};
use routes::RouteSpec;

const DEFAULT_ADMIN: &str = "127.0.0.1:2019";
const SERVER_NAME: &str = "asd";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    /// Caddy's automatic HTTPS with its internal CA (localhost development).
    #[default]
    Internal,
    /// Public issuance (the gateway handles TLS for tunnel hosts anyway).
    Auto,
    /// Plain HTTP only.
    Off,
}

#[derive(Debug, Clone)]
pub struct CaddySettings {
    pub tls: TlsPolicy,
    pub http_port: u16,
    pub https_port: u16,
}

impl Default for CaddySettings {
    fn default() -> Self {
        Self { tls: TlsPolicy::Internal, http_port: 80, https_port: 443 }
    }
}

#[derive(Debug, Error)]
pub enum CaddyError {
    #[error("caddy admin API unreachable at {0}")]
    AdminUnreachable(String),
    #[error("caddy admin API returned {status}: {detail}")]
    Protocol { status: u16, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Desired routes already match the live admin config.
    Unchanged,
    /// The diff batch was applied through the admin API.
    Patched { routes: usize },
    /// Admin API unavailable; full config rendered and daemon restarted.
    StaticMode { routes: usize },
}

/// Owns the local reverse proxy: admin-API diffing when the API is up,
/// static-config + daemon restart when it is not.
pub struct CaddyController {
    admin_base: String,
    caddy_dir: PathBuf,
    log_dir: PathBuf,
    settings: CaddySettings,
}

impl CaddyController {
    pub fn new(paths: &Paths, settings: CaddySettings) -> Self {
        let admin = std::env::var("ASD_CADDY_ADMIN")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_ADMIN.to_string());
        Self {
            admin_base: format!("http://{admin}"),
            caddy_dir: paths.caddy_dir.clone(),
            log_dir: paths.log_dir.clone(),
            settings,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.caddy_dir.join("caddy.json")
    }

    fn pid_file(&self) -> PathBuf {
        self.caddy_dir.join("caddy.pid")
    }

    fn daemon_spec(&self) -> DaemonSpec {
        let mut spec = DaemonSpec::new(
            "caddy",
            "caddy",
            self.pid_file(),
            self.log_dir.join("caddy.log"),
        );
        spec.args = vec![
            "run".to_string(),
            "--config".to_string(),
            self.config_path().to_string_lossy().to_string(),
        ];
        spec.readiness = Some(ProbeSpec::Http {
            url: format!("{}/config/", self.admin_base),
        });
        spec.readiness_budget = Duration::from_secs(10);
        spec
    }

    /// Ensure the daemon is alive and the admin port answers.
    pub async fn start(&self) -> Result<StartOutcome, CaddyError> {
        if !self.config_path().exists() {
            self.write_static_config(&[])?;
        }
        Ok(supervisor::start_daemon(&self.daemon_spec()).await?)
    }

    pub async fn stop(&self) -> Result<StopOutcome, CaddyError> {
        Ok(supervisor::stop_daemon(&self.pid_file(), Duration::from_secs(3), true).await?)
    }

    pub async fn restart(&self) -> Result<StartOutcome, CaddyError> {
        self.stop().await?;
        self.start().await
    }

    /// Apply the desired route set: one idempotent diff batch against the
    /// admin API, falling back to static-config mode when it is unreachable.
    pub async fn apply(&self, specs: &[RouteSpec]) -> Result<ApplyOutcome, CaddyError> {
        let desired = routes::render_routes(specs);

        let current = match self.fetch_live_routes().await {
            Ok(current) => current,
            Err(CaddyError::AdminUnreachable(_)) => {
                warn!("caddy admin API unreachable, switching to static config mode");
                self.write_static_config(&desired)?;
                supervisor::stop_daemon(&self.pid_file(), Duration::from_secs(3), true).await?;
                supervisor::start_daemon(&self.daemon_spec()).await?;
                return Ok(ApplyOutcome::StaticMode { routes: desired.len() });
            }
            Err(e) => return Err(e),
        };

        match current {
            Some(live) if live == Value::Array(desired.clone()) => {
                // Keep the on-disk config in sync for the next cold start.
                self.write_static_config(&desired)?;
                Ok(ApplyOutcome::Unchanged)
            }
            Some(_) => {
                self.patch_routes(&desired).await?;
                self.write_static_config(&desired)?;
                info!(routes = desired.len(), "caddy routes patched");
                Ok(ApplyOutcome::Patched { routes: desired.len() })
            }
            None => {
                // No server configured yet: load the full config in one shot.
                self.load_full_config(&desired).await?;
                self.write_static_config(&desired)?;
                info!(routes = desired.len(), "caddy config loaded");
                Ok(ApplyOutcome::Patched { routes: desired.len() })
            }
        }
    }

    /// Live route array, `None` when the admin API answers but no `asd`
    /// server is configured yet.
    async fn fetch_live_routes(&self) -> Result<Option<Value>, CaddyError> {
        let url = format!(
            "{}/config/apps/http/servers/{SERVER_NAME}/routes",
            self.admin_base
        );
        let client = admin_client()?;
        let resp = client
            .get(&url)
            .send()
            .await
            .map_err(|_| CaddyError::AdminUnreachable(self.admin_base.clone()))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CaddyError::Protocol {
                status: status.as_u16(),
                detail: resp.text().await.unwrap_or_default(),
            });
        }
        let value: Value = resp.json().await.map_err(|e| CaddyError::Protocol {
            status: status.as_u16(),
            detail: e.to_string(),
        })?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(value))
    }

    async fn patch_routes(&self, desired: &[Value]) -> Result<(), CaddyError> {
        let url = format!(
            "{}/config/apps/http/servers/{SERVER_NAME}/routes",
            self.admin_base
        );
        let client = admin_client()?;
        let resp = client
            .patch(&url)
            .json(&desired)
            .send()
            .await
            .map_err(|_| CaddyError::AdminUnreachable(self.admin_base.clone()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CaddyError::Protocol {
                status: status.as_u16(),
                detail: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn load_full_config(&self, desired: &[Value]) -> Result<(), CaddyError> {
        let url = format!("{}/load", self.admin_base);
        let config = self.render_full_config(desired);
        let client = admin_client()?;
        let resp = client
            .post(&url)
            .json(&config)
            .send()
            .await
            .map_err(|_| CaddyError::AdminUnreachable(self.admin_base.clone()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CaddyError::Protocol {
                status: status.as_u16(),
                detail: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn write_static_config(&self, desired: &[Value]) -> Result<(), CaddyError> {
        std::fs::create_dir_all(&self.caddy_dir)?;
        let config = self.render_full_config(desired);
        let tmp = self.config_path().with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&config).map_err(anyhow::Error::from)?)?;
        std::fs::rename(&tmp, self.config_path())?;
        Ok(())
    }

    /// The full Caddy JSON document for static mode and cold starts.
    pub fn render_full_config(&self, route_values: &[Value]) -> Value {
        let admin = self.admin_base.trim_start_matches("http://");
        let listen = match self.settings.tls {
            TlsPolicy::Off => vec![format!(":{}", self.settings.http_port)],
            _ => vec![
                format!(":{}", self.settings.http_port),
                format!(":{}", self.settings.https_port),
            ],
        };
        let mut server = json!({
            "listen": listen,
            "routes": route_values,
        });
        if self.settings.tls == TlsPolicy::Off {
            server["automatic_https"] = json!({ "disable": true });
        }

        let mut config = json!({
            "admin": { "listen": admin },
            "apps": {
                "http": {
                    "servers": { SERVER_NAME: server }
                }
            }
        });
        if self.settings.tls == TlsPolicy::Internal {
            config["apps"]["tls"] = json!({
                "automation": {
                    "policies": [{ "issuers": [{ "module": "internal" }] }]
                }
            });
        }
        config
    }
}

fn admin_client() -> Result<reqwest::Client, CaddyError> {
    const ADMIN_TIMEOUT_SECS: u64 = 5;
    reqwest::Client::builder()
        .timeout(Duration::from_secs(ADMIN_TIMEOUT_SECS))
        .build()
        .map_err(|e| CaddyError::Other(e.into()))
}
