use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

/// Unauthenticated bootstrap endpoint handing out short-lived credentials.
pub const BOOTSTRAP_ENDPOINT: &str = "https://api.asd.engineer/v1/tunnel-credentials";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Ephemeral,
    Token,
    Key,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tunnels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_aliases: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelCredential {
    pub name: String,
    pub kind: CredentialKind,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Password/token for password auth, or a path to a private key.
    pub secret_or_key_ref: String,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<CredentialLimits>,
}

impl TunnelCredential {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// A credential pointing at the local machine is running against a
    /// development gateway; exposed origins then use
    /// `ASD_TUNNEL_SERVER_HTTP_PORT` instead of the public hostname.
    pub fn is_localhost_mode(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    entries: Vec<TunnelCredential>,
}

/// JSON-backed store under the ASD home. Expired ephemeral credentials are
/// filtered from listings but stay on disk until the next rotate.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }

    pub fn list(&self) -> anyhow::Result<Vec<TunnelCredential>> {
        let file = self.read()?;
        let now = OffsetDateTime::now_utc();
        Ok(file
            .entries
            .into_iter()
            .filter(|c| !c.is_expired(now))
            .collect())
    }

    pub fn get(&self, name: &str) -> anyhow::Result<Option<TunnelCredential>> {
        Ok(self.read()?.entries.into_iter().find(|c| c.name == name))
    }

    pub fn default_name(&self) -> anyhow::Result<Option<String>> {
        Ok(self.read()?.default)
    }

    pub fn set_default(&self, name: &str) -> anyhow::Result<()> {
        let mut file = self.read()?;
        if !file.entries.iter().any(|c| c.name == name) {
            anyhow::bail!("no credential named {name:?}");
        }
        file.default = Some(name.to_string());
        self.write(&file)
    }

    pub fn append(&self, cred: TunnelCredential) -> anyhow::Result<()> {
        let mut file = self.read()?;
        if file.entries.iter().any(|c| c.name == cred.name) {
            anyhow::bail!("credential {name:?} already exists", name = cred.name);
        }
        if file.default.is_none() {
            file.default = Some(cred.name.clone());
        }
        file.entries.push(cred);
        self.write(&file)
    }

    /// Replace the credential with the same name (or add it), prune every
    /// expired entry from disk, and make the new credential the default.
    pub fn rotate(&self, cred: TunnelCredential) -> anyhow::Result<()> {
        let mut file = self.read()?;
        let now = OffsetDateTime::now_utc();
        file.entries.retain(|c| c.name != cred.name && !c.is_expired(now));
        file.default = Some(cred.name.clone());
        file.entries.push(cred);
        self.write(&file)
    }

    /// The credential the tunnel manager should use: env override first, then
    /// the named default, then the only non-expired entry if unambiguous.
    pub fn resolve_active(&self) -> anyhow::Result<Option<TunnelCredential>> {
        if let Some(cred) = env_credential() {
            return Ok(Some(cred));
        }
        let listed = self.list()?;
        if let Some(name) = self.default_name()? {
            if let Some(cred) = listed.iter().find(|c| c.name == name) {
                return Ok(Some(cred.clone()));
            }
        }
        match listed.as_slice() {
            [only] => Ok(Some(only.clone())),
            _ => Ok(None),
        }
    }

    fn read(&self) -> anyhow::Result<CredentialFile> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CredentialFile::default())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("corrupt credential file {}", self.path.display()))
    }

    fn write(&self, file: &CredentialFile) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let rendered = serde_json::to_string_pretty(file)?;
        std::fs::write(&tmp, rendered)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Credential synthesized from environment variables without touching disk.
pub fn env_credential() -> Option<TunnelCredential> {
    let host = env::var("ASD_TUNNEL_HOST").ok().filter(|v| !v.is_empty())?;
    let client_id = env::var("ASD_CLIENT_ID")
        .or_else(|_| env::var("ASD_TUNNEL_USER"))
        .ok()
        .filter(|v| !v.is_empty())?;
    let token = env::var("ASD_TUNNEL_TOKEN").ok().filter(|v| !v.is_empty())?;
    let port = env::var("ASD_TUNNEL_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(22);
    Some(TunnelCredential {
        name: "env".to_string(),
        kind: CredentialKind::Token,
        host,
        port,
        client_id,
        secret_or_key_ref: token,
        expires_at: None,
        limits: None,
    })
}

#[derive(Debug, Deserialize)]
struct BootstrapResponse {
    tunnel_client_id: String,
    tunnel_client_secret: String,
    #[serde(default, with = "time::serde::timestamp::option")]
    expires_at: Option<OffsetDateTime>,
    tunnel_host: String,
    tunnel_port: u16,
    #[serde(default)]
    limits: Option<CredentialLimits>,
}

/// Request a fresh ephemeral credential from the gateway.
pub async fn fetch_ephemeral(endpoint: &str) -> anyhow::Result<TunnelCredential> {
    let client = reqwest::Client::new();
    let resp = client
        .post(endpoint)
        .header("User-Agent", format!("asd/{}", env!("CARGO_PKG_VERSION")))
        .send()
        .await
        .context("failed to contact credential endpoint")?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("credential endpoint returned {status}: {body}");
    }

    let data: BootstrapResponse = resp
        .json()
        .await
        .context("failed to parse credential response")?;

    info!(client_id = %data.tunnel_client_id, host = %data.tunnel_host, "ephemeral credential issued");
    Ok(TunnelCredential {
        name: format!("ephemeral-{}", data.tunnel_client_id),
        kind: CredentialKind::Ephemeral,
        host: data.tunnel_host,
        port: data.tunnel_port,
        client_id: data.tunnel_client_id,
        secret_or_key_ref: data.tunnel_client_secret,
        expires_at: data.expires_at,
        limits: data.limits,
    })
}
