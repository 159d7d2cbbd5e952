use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelProtocol {
    #[default]
    Http,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathRoute {
    pub path: String,
    #[serde(default)]
    pub strip_prefix: bool,
}

/// Which routes of a service basic auth is enforced on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasicAuthScope {
    #[default]
    All,
    Hosts,
    Paths,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthPolicy {
    /// `None` inherits the project policy.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub routes: Option<BasicAuthScope>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityHeaders {
    #[serde(default)]
    pub hsts: bool,
    #[serde(default)]
    pub frame_options: Option<String>,
    #[serde(default)]
    pub compression: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthCheck {
    Http { http: String },
    Tcp { tcp: u16 },
    Command { command: String },
}

/// User- or plugin-provided intent for one service. An overlay is a
/// declaration with no `dial`; it refines a plugin-provided service of the
/// same id rather than standing alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDeclaration {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub dial: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub paths: Vec<PathRoute>,
    #[serde(default)]
    pub public: Option<bool>,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub tunnel_protocol: Option<TunnelProtocol>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuthPolicy>,
    #[serde(default)]
    pub security_headers: Option<SecurityHeaders>,
    #[serde(default)]
    pub iframe_origin: Option<String>,
    #[serde(default)]
    pub delete_response_headers: Vec<String>,
    #[serde(default)]
    pub ingress_tag: Option<String>,
    /// name → template, written to the project dotenv after reconciliation.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

impl ServiceDeclaration {
    pub fn is_public(&self) -> bool {
        self.public.unwrap_or(false)
    }

    pub fn is_overlay(&self) -> bool {
        self.dial.is_none()
    }

    /// The tunnel URL prefix: explicit `subdomain` or the id with any
    /// namespace separator flattened.
    pub fn subdomain_or_id(&self) -> String {
        self.subdomain
            .clone()
            .unwrap_or_else(|| self.id.replace(':', "-"))
    }

    /// Refine `self` (a plugin base) with an overlay; overlay fields win
    /// wherever they are set.
    pub fn merged_with(&self, overlay: &ServiceDeclaration) -> ServiceDeclaration {
        ServiceDeclaration {
            id: self.id.clone(),
            dial: overlay.dial.clone().or_else(|| self.dial.clone()),
            hosts: pick_vec(&overlay.hosts, &self.hosts),
            paths: pick_vec(&overlay.paths, &self.paths),
            public: overlay.public.or(self.public),
            subdomain: overlay.subdomain.clone().or_else(|| self.subdomain.clone()),
            tunnel_protocol: overlay.tunnel_protocol.or(self.tunnel_protocol),
            priority: overlay.priority.or(self.priority),
            basic_auth: overlay.basic_auth.clone().or_else(|| self.basic_auth.clone()),
            security_headers: overlay
                .security_headers
                .clone()
                .or_else(|| self.security_headers.clone()),
            iframe_origin: overlay
                .iframe_origin
                .clone()
                .or_else(|| self.iframe_origin.clone()),
            delete_response_headers: pick_vec(
                &overlay.delete_response_headers,
                &self.delete_response_headers,
            ),
            ingress_tag: overlay.ingress_tag.clone().or_else(|| self.ingress_tag.clone()),
            env: {
                let mut env = self.env.clone();
                env.extend(overlay.env.clone());
                env
            },
            health_check: overlay
                .health_check
                .clone()
                .or_else(|| self.health_check.clone()),
        }
    }
}

fn pick_vec<T: Clone>(overlay: &[T], base: &[T]) -> Vec<T> {
    if overlay.is_empty() {
        base.to_vec()
    } else {
        overlay.to_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceSource {
    Config,
    Plugin,
    Docker,
    PortScan,
}

impl ServiceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Plugin => "plugin",
            Self::Docker => "docker",
            Self::PortScan => "port-scan",
        }
    }
}

impl fmt::Display for ServiceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A service probed from the host rather than declared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredService {
    pub id: String,
    pub dial: String,
    pub source: ServiceSource,
    #[serde(with = "time::serde::timestamp")]
    pub detected_at: OffsetDateTime,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Ok,
    Warn,
    Stop,
    #[default]
    Unknown,
    Pending,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Stop => "stop",
            Self::Unknown => "unknown",
            Self::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Container,
    #[default]
    Binary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    #[default]
    Idle,
    Connecting,
    Established,
    Degraded,
    Failed,
    Stopped,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Established => "established",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "connecting" => Ok(Self::Connecting),
            "established" => Ok(Self::Established),
            "degraded" => Ok(Self::Degraded),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("invalid tunnel state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServiceDeclaration {
        ServiceDeclaration {
            id: "db:gui".to_string(),
            dial: Some("127.0.0.1:8090".to_string()),
            public: Some(false),
            subdomain: Some("dbgui".to_string()),
            priority: Some(10),
            ..Default::default()
        }
    }

    #[test]
    fn overlay_fields_win() {
        let overlay = ServiceDeclaration {
            id: "db:gui".to_string(),
            public: Some(true),
            subdomain: Some("data".to_string()),
            ..Default::default()
        };
        let merged = base().merged_with(&overlay);
        assert_eq!(merged.dial.as_deref(), Some("127.0.0.1:8090"));
        assert!(merged.is_public());
        assert_eq!(merged.subdomain.as_deref(), Some("data"));
        assert_eq!(merged.priority, Some(10));
    }

    #[test]
    fn overlay_env_extends_base_env() {
        let mut base = base();
        base.env.insert("A".into(), "1".into());
        base.env.insert("B".into(), "1".into());
        let mut overlay = ServiceDeclaration::default();
        overlay.env.insert("B".into(), "2".into());
        let merged = base.merged_with(&overlay);
        assert_eq!(merged.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(merged.env.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn overlay_is_declaration_without_dial() {
        assert!(ServiceDeclaration::default().is_overlay());
        assert!(!base().is_overlay());
    }

    #[test]
    fn subdomain_falls_back_to_flattened_id() {
        let mut decl = base();
        decl.subdomain = None;
        assert_eq!(decl.subdomain_or_id(), "db-gui");
    }

    #[test]
    fn health_check_forms_deserialize() {
        let http: HealthCheck = serde_yaml::from_str("http: /healthz").unwrap();
        assert_eq!(http, HealthCheck::Http { http: "/healthz".into() });
        let tcp: HealthCheck = serde_yaml::from_str("tcp: 5432").unwrap();
        assert_eq!(tcp, HealthCheck::Tcp { tcp: 5432 });
        let cmd: HealthCheck = serde_yaml::from_str("command: pg_isready").unwrap();
        assert_eq!(cmd, HealthCheck::Command { command: "pg_isready".into() });
    }
}
