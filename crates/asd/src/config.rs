use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::caddy::TlsPolicy;
use crate::domain::ServiceDeclaration;

/// Highest project config `version` this build understands.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub project: ProjectSection,
    /// Feature-flag booleans (helper daemons, discovery, …).
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
    #[serde(default)]
    pub network: NetworkSection,
    /// Task name → ordered step list for `asd run <task>`.
    #[serde(default)]
    pub automation: BTreeMap<String, Vec<AutomationStep>>,
    #[serde(default)]
    pub tunnels: TunnelsSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectSection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: Option<String>,
    /// Plugin directories relative to the project root, each carrying a
    /// `net.manifest.yaml`.
    #[serde(default)]
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSection {
    #[serde(default)]
    pub caddy: CaddySection,
    /// id → declaration; the mapping key is the authoritative id.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDeclaration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaddySection {
    #[serde(default)]
    pub tls: TlsPolicy,
    #[serde(default)]
    pub http_port: Option<u16>,
    #[serde(default)]
    pub https_port: Option<u16>,
    #[serde(default)]
    pub basic_auth: ProjectBasicAuth,
}

/// Project-wide basic-auth policy; per-service declarations may override.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectBasicAuth {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub realm: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationStep {
    pub run: String,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub wait_for: Option<WaitFor>,
    /// Seconds; unset means no step deadline.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WaitFor {
    Http { http: String },
    Tcp { tcp: u16 },
    Log { log: String, pattern: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunnelsSection {
    /// Default credential mode: ephemeral | token | key.
    #[serde(default)]
    pub mode: Option<String>,
    /// Per-service credential-name overrides.
    #[serde(default)]
    pub services: BTreeMap<String, String>,
}

impl ProjectConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: ProjectConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate(path)?;
        Ok(config)
    }

    /// Missing file reads as an empty config (`asd init` writes one).
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(version) = self.version {
            if version > CONFIG_VERSION {
                anyhow::bail!(
                    "{}: config version {version} is newer than supported {CONFIG_VERSION}",
                    path.display()
                );
            }
        }
        for (id, decl) in &self.network.services {
            if id.trim().is_empty() {
                anyhow::bail!("{}: network.services has an empty service id", path.display());
            }
            if let Some(dial) = &decl.dial {
                if !dial.contains('$') && dial.rsplit_once(':').is_none() {
                    anyhow::bail!(
                        "{}: network.services.{id}.dial must be host:port, got {dial:?}",
                        path.display()
                    );
                }
            }
        }
        for (task, steps) in &self.automation {
            if steps.is_empty() {
                anyhow::bail!("{}: automation.{task} has no steps", path.display());
            }
        }
        Ok(())
    }

    /// Declarations from `network.services` with ids stamped from the map key.
    pub fn service_declarations(&self) -> Vec<ServiceDeclaration> {
        self.network
            .services
            .iter()
            .map(|(id, decl)| {
                let mut decl = decl.clone();
                decl.id = id.clone();
                decl
            })
            .collect()
    }

    pub fn feature_enabled(&self, name: &str, default: bool) -> bool {
        self.features.get(name).copied().unwrap_or(default)
    }
}

/// Per-user settings in the ASD home.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Override for the credential bootstrap endpoint.
    #[serde(default)]
    pub tunnel_endpoint: Option<String>,
    #[serde(default)]
    pub default_basic_auth_user: Option<String>,
}

impl GlobalConfig {
    pub fn load_or_default(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_yaml::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unparseable global config, using defaults");
                Self::default()
            }
        }
    }
}
