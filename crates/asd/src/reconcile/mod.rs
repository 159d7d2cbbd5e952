use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::caddy::routes::{BasicAuthRender, RouteSpec};
use crate::caddy::{ApplyOutcome, CaddyController, CaddyError, CaddySettings};
use crate::config::ProjectConfig;
use crate::credentials::{CredentialStore, TunnelCredential};
use crate::discover;
use crate::domain::{
    BasicAuthScope, HealthCheck, HealthState, ProcessKind, ServiceDeclaration, ServiceSource,
    TunnelProtocol, TunnelState,
};
use crate::dotenv;
use crate::expand::Expander;
use crate::paths::Paths;
use crate::plugins;
use crate::probe::{wait_ready, PollBudget, ProbeSpec};
use crate::registry::{Registry, RegistryEntry, RegistryError};
use crate::tunnel::{session::SessionParams, TunnelFailure, TunnelManager};

/// Failure classes the reconciler aggregates; unknown kinds do not exist by
/// construction, every component failure maps onto one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Config,
    TransientIo,
    Spawn,
    Protocol,
    Misconfiguration,
    Fatal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::TransientIo => "transient-io",
            Self::Spawn => "spawn",
            Self::Protocol => "protocol",
            Self::Misconfiguration => "misconfiguration",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Surfaced, but the pass still counts as applied.
    Warning,
    /// The affected service (or the pass) did not apply.
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub service_id: Option<String>,
    pub kind: FailureKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub services: usize,
    pub discovered: usize,
    pub routes_applied: Option<String>,
    pub tunnels_established: usize,
    pub env_written: Vec<String>,
    pub failures: Vec<Failure>,
}

impl ReconcileReport {
    pub fn has_fatal(&self) -> bool {
        self.failures.iter().any(|f| f.kind == FailureKind::Fatal)
    }

    pub fn has_errors(&self) -> bool {
        self.failures.iter().any(|f| f.severity == Severity::Error)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub apply_caddy: bool,
    pub apply_tunnels: bool,
    pub discover: bool,
    pub ids: Option<Vec<String>>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self { apply_caddy: true, apply_tunnels: true, discover: true, ids: None }
    }
}

/// Orchestrates one reconcile pass: declared + discovered services into the
/// registry, proxy routes, tunnel sessions, and declarative env writes.
pub struct Reconciler {
    paths: Paths,
    config: ProjectConfig,
    registry: Arc<Registry>,
    tunnels: Arc<TunnelManager>,
    caddy: CaddyController,
    credentials: CredentialStore,
}

impl Reconciler {
    pub fn new(paths: Paths, config: ProjectConfig) -> Self {
        let settings = CaddySettings {
            tls: config.network.caddy.tls,
            http_port: config.network.caddy.http_port.unwrap_or(80),
            https_port: config.network.caddy.https_port.unwrap_or(443),
        };
        Self {
            registry: Arc::new(Registry::open(&paths.registry_path)),
            tunnels: Arc::new(TunnelManager::new(&paths)),
            caddy: CaddyController::new(&paths, settings),
            credentials: CredentialStore::new(&paths.credentials_path),
            paths,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn caddy(&self) -> &CaddyController {
        &self.caddy
    }

    pub fn active_credential(&self) -> anyhow::Result<Option<TunnelCredential>> {
        self.credentials.resolve_active()
    }

    /// Rebuild and apply the proxy route set from the current registry,
    /// without touching tunnels or declarations.
    pub async fn refresh_routes(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let env = dotenv::load(&self.paths.dotenv_path).unwrap_or_default();
        let credential = self.credentials.resolve_active().unwrap_or(None);
        let expander = Mutex::new(Expander::new(env, credential));
        self.route_pass(&expander, &mut report).await;
        report
    }

    /// Tunnel sessions (plus a route refresh) for every public service, or
    /// the given ids only.
    pub async fn start_tunnels(&self, ids: Option<Vec<String>>) -> ReconcileReport {
        let opts = ReconcileOptions { apply_caddy: true, apply_tunnels: true, discover: false, ids };
        self.apply(&opts).await
    }

    /// One full pass (`asd net apply`). Failures on one service never abort
    /// the reconcile of unrelated entries.
    pub async fn apply(&self, opts: &ReconcileOptions) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let env = match dotenv::load(&self.paths.dotenv_path) {
            Ok(env) => env,
            Err(e) => {
                report.failures.push(Failure {
                    service_id: None,
                    kind: FailureKind::TransientIo,
                    severity: Severity::Warning,
                    message: format!("dotenv unreadable: {e}"),
                });
                Default::default()
            }
        };

        let credential = match self.credentials.resolve_active() {
            Ok(cred) => cred,
            Err(e) => {
                report.failures.push(Failure {
                    service_id: None,
                    kind: FailureKind::TransientIo,
                    severity: Severity::Warning,
                    message: format!("credential store unreadable: {e}"),
                });
                None
            }
        };

        // Fresh port-allocation scope per pass.
        let expander = Mutex::new(Expander::new(env, credential.clone()));

        // 1–2: declared set from plugins + user config.
        let declared = match self.declared_set(&expander, &mut report) {
            Some(declared) => declared,
            None => return report,
        };
        report.services = declared.len();

        // 3: discovered services that no declaration claims.
        if opts.discover {
            let declared_ids: HashSet<String> = declared.iter().map(|d| d.id.clone()).collect();
            report.discovered = self.discover_pass(&declared_ids).await;
        }

        let selected: Vec<ServiceDeclaration> = match &opts.ids {
            Some(ids) => declared
                .into_iter()
                .filter(|d| ids.iter().any(|id| *id == d.id))
                .collect(),
            None => declared,
        };

        // 4: registry upserts.
        for decl in &selected {
            let entry = self.entry_for(decl, &expander);
            if let Err(e) = self.registry.upsert(entry) {
                report.failures.push(registry_failure(Some(decl.id.clone()), e));
            }
        }

        // Pass one of the URL cycle: sessions first, each waiting for its URL.
        if opts.apply_tunnels {
            self.tunnel_pass(&selected, credential.as_ref(), &expander, &mut report)
                .await;
        }

        // Pass two: routes and dotenv, now that tunnel URLs are known.
        if opts.apply_caddy {
            self.route_pass(&expander, &mut report).await;
        }
        self.env_pass(&selected, &expander, &mut report);

        // 7: readiness sweep.
        self.health_sweep(&selected, &mut report).await;

        report
    }

    fn declared_set(
        &self,
        expander: &Mutex<Expander>,
        report: &mut ReconcileReport,
    ) -> Option<Vec<ServiceDeclaration>> {
        let manifests =
            match plugins::load_enabled(&self.paths.project_root, &self.config.project.plugins) {
                Ok(manifests) => manifests,
                Err(e) => {
                    report.failures.push(Failure {
                        service_id: None,
                        kind: FailureKind::Config,
                        severity: Severity::Error,
                        message: e.to_string(),
                    });
                    return None;
                }
            };

        let mut merged: BTreeMap<String, ServiceDeclaration> = BTreeMap::new();
        for manifest in &manifests {
            for mut decl in manifest.declarations() {
                // Manifest templates (ports, random strings) expand up front.
                if let Some(dial) = &decl.dial {
                    let expanded = expander.lock().expand(dial, decl.subdomain.as_deref());
                    decl.dial = Some(expanded);
                }
                merged.insert(decl.id.clone(), decl);
            }
        }

        for decl in self.config.service_declarations() {
            match merged.get(&decl.id) {
                // Overlay refines the plugin entry rather than duplicating it.
                Some(base) if decl.is_overlay() => {
                    let refined = base.merged_with(&decl);
                    merged.insert(decl.id.clone(), refined);
                }
                _ => {
                    let mut decl = decl;
                    if let Some(dial) = &decl.dial {
                        let expanded = expander.lock().expand(dial, decl.subdomain.as_deref());
                        decl.dial = Some(expanded);
                    }
                    merged.insert(decl.id.clone(), decl);
                }
            }
        }

        for decl in merged.values() {
            if decl.is_overlay() {
                report.failures.push(Failure {
                    service_id: Some(decl.id.clone()),
                    kind: FailureKind::Config,
                    severity: Severity::Error,
                    message: "overlay has no plugin base providing a dial".to_string(),
                });
            }
        }

        Some(merged.into_values().filter(|d| !d.is_overlay()).collect())
    }

    async fn discover_pass(&self, declared_ids: &HashSet<String>) -> usize {
        let exclude = [2019u16];
        let mut count = 0;
        for found in discover::discover_all(&exclude).await {
            if declared_ids.contains(&found.id) {
                continue;
            }
            let declared_dial = found.dial.clone();
            let mut decl = ServiceDeclaration {
                id: found.id.clone(),
                dial: Some(declared_dial),
                ..Default::default()
            };
            decl.subdomain = Some(found.id.replace(':', "-"));
            let mut entry = RegistryEntry::from_declaration(decl, found.source);
            entry.process_kind = match found.source {
                ServiceSource::Docker => ProcessKind::Container,
                _ => ProcessKind::Binary,
            };
            match self.registry.upsert(entry) {
                Ok(()) => count += 1,
                Err(e) => debug!(service = %found.id, error = %e, "discovered upsert failed"),
            }
        }
        count
    }

    fn entry_for(&self, decl: &ServiceDeclaration, expander: &Mutex<Expander>) -> RegistryEntry {
        let mut decl = decl.clone();
        if let Some(dial) = &decl.dial {
            if dial.contains('$') {
                let expanded = expander.lock().expand(dial, decl.subdomain.as_deref());
                decl.dial = Some(expanded);
            }
        }
        let allocated_port = decl
            .dial
            .as_deref()
            .and_then(|d| d.rsplit_once(':'))
            .and_then(|(_, port)| port.parse().ok());
        let mut entry = RegistryEntry::from_declaration(decl, ServiceSource::Config);
        entry.allocated_port = allocated_port;
        entry
    }

    async fn tunnel_pass(
        &self,
        selected: &[ServiceDeclaration],
        credential: Option<&TunnelCredential>,
        expander: &Mutex<Expander>,
        report: &mut ReconcileReport,
    ) {
        let public: Vec<&ServiceDeclaration> =
            selected.iter().filter(|d| d.is_public()).collect();
        if public.is_empty() {
            return;
        }

        let Some(credential) = credential else {
            // Non-fatal: routes still install for localhost, tunnel host
            // templates expand to empty and get filtered.
            for decl in &public {
                report.failures.push(Failure {
                    service_id: Some(decl.id.clone()),
                    kind: FailureKind::Config,
                    severity: Severity::Warning,
                    message: "public service has no tunnel credential; run `asd auth credentials`"
                        .to_string(),
                });
            }
            return;
        };

        // Sessions start concurrently; each individually waits for its URL.
        let mut set = JoinSet::new();
        for decl in public {
            let Some(dial) = decl.dial.clone() else {
                continue;
            };
            let params = SessionParams {
                service_id: decl.id.clone(),
                subdomain: decl.subdomain_or_id(),
                protocol: decl.tunnel_protocol.unwrap_or(TunnelProtocol::Http),
                local_dial: dial,
                credential: credential.clone(),
            };
            let tunnels = Arc::clone(&self.tunnels);
            let registry = Arc::clone(&self.registry);
            set.spawn(async move {
                let result = tunnels.ensure_session(&registry, &params).await;
                (params.service_id, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let Ok((service_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(record) if record.state == TunnelState::Established => {
                    report.tunnels_established += 1;
                }
                Ok(record) => {
                    report.failures.push(Failure {
                        service_id: Some(service_id),
                        kind: FailureKind::TransientIo,
                        severity: Severity::Warning,
                        message: format!(
                            "tunnel session is {} (no public URL yet)",
                            record.state
                        ),
                    });
                }
                Err(TunnelFailure::CredentialMissing) => {
                    report.failures.push(Failure {
                        service_id: Some(service_id),
                        kind: FailureKind::Config,
                        severity: Severity::Error,
                        message: TunnelFailure::CredentialMissing.to_string(),
                    });
                }
                Err(e @ TunnelFailure::Spawn(_)) | Err(e @ TunnelFailure::Crashed) => {
                    report.failures.push(Failure {
                        service_id: Some(service_id),
                        kind: FailureKind::Spawn,
                        severity: Severity::Error,
                        message: e.to_string(),
                    });
                }
                Err(TunnelFailure::Io(e)) => {
                    report.failures.push(Failure {
                        service_id: Some(service_id),
                        kind: FailureKind::TransientIo,
                        severity: Severity::Warning,
                        message: e.to_string(),
                    });
                }
            }
        }

        // Refresh the expander's credential: exposedOrigin inputs are known.
        expander.lock().set_credential(Some(credential.clone()));
    }

    async fn route_pass(&self, expander: &Mutex<Expander>, report: &mut ReconcileReport) {
        let entries = match self.registry.load() {
            Ok(entries) => entries,
            Err(e) => {
                report.failures.push(registry_failure(None, e));
                return;
            }
        };

        let mut specs: Vec<RouteSpec> = Vec::new();
        {
            let expander = expander.lock();
            for entry in &entries {
                if let Some(spec) = self.route_for(entry, &expander, report) {
                    specs.push(spec);
                }
            }
        }
        crate::caddy::routes::sort_routes(&mut specs);

        match self.caddy.apply(&specs).await {
            Ok(ApplyOutcome::Unchanged) => {
                report.routes_applied = Some("unchanged".to_string());
            }
            Ok(ApplyOutcome::Patched { routes }) => {
                report.routes_applied = Some(format!("patched ({routes} routes)"));
            }
            Ok(ApplyOutcome::StaticMode { routes }) => {
                report.routes_applied = Some(format!("static config ({routes} routes)"));
            }
            Err(CaddyError::Protocol { status, detail }) => {
                report.failures.push(Failure {
                    service_id: None,
                    kind: FailureKind::Protocol,
                    severity: Severity::Error,
                    message: format!("caddy admin API returned {status}: {detail}"),
                });
            }
            Err(e) => {
                report.failures.push(Failure {
                    service_id: None,
                    kind: FailureKind::TransientIo,
                    severity: Severity::Warning,
                    message: e.to_string(),
                });
            }
        }
    }

    fn route_for(
        &self,
        entry: &RegistryEntry,
        expander: &Expander,
        report: &mut ReconcileReport,
    ) -> Option<RouteSpec> {
        let decl = &entry.declaration;
        let dial = decl.dial.clone()?;
        let subdomain = decl.subdomain_or_id();

        let mut hosts = vec![format!("{subdomain}.localhost")];
        if decl.is_public() {
            hosts.push(expander.tunnel_host(&subdomain));
        }
        for host in &decl.hosts {
            hosts.push(expand_host(expander, host, &subdomain));
        }
        // Unresolved tunnel templates expand to "" and are filtered here; the
        // service stays reachable on localhost alone.
        hosts.retain(|h| !h.is_empty());
        hosts.dedup();

        let basic_auth = self.basic_auth_for(decl, expander, report);

        let (path_prefix, strip_prefix) = match decl.paths.first() {
            Some(route) => (Some(route.path.clone()), route.strip_prefix),
            None => (None, false),
        };

        Some(RouteSpec {
            service_id: decl.id.clone(),
            hosts,
            path_prefix,
            strip_prefix,
            dial,
            priority: decl.priority.unwrap_or(0),
            basic_auth,
            security: decl.security_headers.clone(),
            iframe_origin: decl.iframe_origin.clone(),
            delete_response_headers: decl.delete_response_headers.clone(),
            ingress_tag: decl
                .ingress_tag
                .clone()
                .or_else(|| std::env::var("ASD_INGRESS_TAG").ok().filter(|v| !v.is_empty())),
        })
    }

    fn basic_auth_for(
        &self,
        decl: &ServiceDeclaration,
        expander: &Expander,
        report: &mut ReconcileReport,
    ) -> Option<BasicAuthRender> {
        let project = &self.config.network.caddy.basic_auth;
        let service = decl.basic_auth.clone().unwrap_or_default();
        let enabled = service.enabled.unwrap_or(project.enabled);
        if !enabled {
            return None;
        }

        let username = expander.env_value("ASD_BASIC_AUTH_USERNAME");
        let password = expander.env_value("ASD_BASIC_AUTH_PASSWORD");
        if username.is_empty() || password.is_empty() {
            report.failures.push(Failure {
                service_id: Some(decl.id.clone()),
                kind: FailureKind::Config,
                severity: Severity::Warning,
                message: "basic auth enabled but ASD_BASIC_AUTH_USERNAME/PASSWORD missing in dotenv"
                    .to_string(),
            });
            return None;
        }

        Some(BasicAuthRender {
            username,
            password_hash: crate::expand::bcrypt_hash(&password, 10),
            realm: service.realm.or_else(|| project.realm.clone()),
            scope: service.routes.unwrap_or(BasicAuthScope::All),
        })
    }

    /// 6: re-expand every declaration's env mapping; only resolved, non-empty
    /// values that differ from the stored dotenv are written.
    fn env_pass(
        &self,
        selected: &[ServiceDeclaration],
        expander: &Mutex<Expander>,
        report: &mut ReconcileReport,
    ) {
        let mut updates: Vec<(String, String)> = Vec::new();
        {
            let mut expander = expander.lock();
            for decl in selected {
                let subdomain = decl.subdomain_or_id();
                for (key, template) in &decl.env {
                    let value = expander.expand(template, Some(&subdomain));
                    if value.is_empty() || value.contains("${") {
                        // Unresolved macros are a skipped entry, never an
                        // empty write.
                        debug!(service = %decl.id, key = %key, "env binding unresolved, skipped");
                        continue;
                    }
                    updates.push((key.clone(), value));
                }
            }
            updates.extend(expander.take_pending_dotenv());
        }

        if updates.is_empty() {
            return;
        }
        match dotenv::upsert(&self.paths.dotenv_path, &updates) {
            Ok(written) => {
                if !written.is_empty() {
                    info!(keys = ?written, "dotenv bindings written");
                }
                report.env_written = written;
            }
            Err(e) => report.failures.push(Failure {
                service_id: None,
                kind: FailureKind::TransientIo,
                severity: Severity::Warning,
                message: format!("dotenv write failed: {e}"),
            }),
        }
    }

    async fn health_sweep(&self, selected: &[ServiceDeclaration], report: &mut ReconcileReport) {
        for decl in selected {
            let state = health_of(decl).await;
            if let Err(e) =
                self.registry
                    .mark_health(&decl.id, state, OffsetDateTime::now_utc())
            {
                report.failures.push(registry_failure(Some(decl.id.clone()), e));
            }
        }
    }

    /// Removal pass: stop owned tunnels, revoke routes, optionally purge
    /// registry entries. Each revocation is individually atomic.
    pub async fn remove(&self, ids: &[String], purge: bool) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for id in ids {
            if let Err(e) = self.tunnels.stop_session(&self.registry, id).await {
                report.failures.push(Failure {
                    service_id: Some(id.clone()),
                    kind: FailureKind::TransientIo,
                    severity: Severity::Warning,
                    message: e.to_string(),
                });
            }
            if purge {
                match self.registry.remove(id) {
                    Ok(true) => info!(service = %id, "registry entry removed"),
                    Ok(false) => warn!(service = %id, "no registry entry to remove"),
                    Err(e) => report.failures.push(registry_failure(Some(id.clone()), e)),
                }
            }
        }
        // Revoke routes for whatever remains.
        let expander = Mutex::new(Expander::new(Default::default(), None));
        self.route_pass(&expander, &mut report).await;
        report
    }

    /// `net clean`: stop every tunnel, drop discovered entries, empty routes.
    pub async fn clean(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if let Err(e) = self.tunnels.stop_all(&self.registry).await {
            report.failures.push(Failure {
                service_id: None,
                kind: FailureKind::TransientIo,
                severity: Severity::Warning,
                message: e.to_string(),
            });
        }
        self.tunnels.reap_strays().await;
        match self.registry.load() {
            Ok(entries) => {
                for entry in entries {
                    if matches!(entry.source, ServiceSource::Docker | ServiceSource::PortScan) {
                        let _ = self.registry.remove(entry.id());
                    }
                }
            }
            Err(e) => report.failures.push(registry_failure(None, e)),
        }
        if let Err(e) = self.caddy.apply(&[]).await {
            report.failures.push(Failure {
                service_id: None,
                kind: FailureKind::TransientIo,
                severity: Severity::Warning,
                message: e.to_string(),
            });
        }
        report
    }

    /// `net reset`: clean plus a registry wipe back to an empty file.
    pub async fn reset(&self) -> ReconcileReport {
        let mut report = self.clean().await;
        if let Err(e) = self.registry.reset() {
            report.failures.push(registry_failure(None, e));
        }
        report
    }
}

fn expand_host(expander: &Expander, host: &str, _subdomain: &str) -> String {
    // Host templates carry their own prefix argument; a shared-reference
    // expansion covers the tunnel-derived forms used in host lists.
    if let Some(rest) = host
        .strip_prefix("${{")
        .and_then(|h| h.strip_suffix("}}"))
    {
        let expr = rest.trim();
        if let Some(args) = expr
            .strip_prefix("macro.tunnelHost(")
            .and_then(|a| a.strip_suffix(')'))
        {
            return expander.tunnel_host(args.trim().trim_matches(|c| c == '"' || c == '\''));
        }
        return String::new();
    }
    host.to_string()
}

async fn health_of(decl: &ServiceDeclaration) -> HealthState {
    const HEALTH_BUDGET_SECS: u64 = 3;
    let budget = PollBudget::new(Duration::from_secs(HEALTH_BUDGET_SECS));

    let spec = match (&decl.health_check, &decl.dial) {
        (Some(HealthCheck::Http { http }), Some(dial)) => ProbeSpec::Http {
            url: format!("http://{dial}{http}"),
        },
        (Some(HealthCheck::Http { http }), None) => ProbeSpec::Http { url: http.clone() },
        (Some(HealthCheck::Tcp { tcp }), _) => ProbeSpec::Tcp {
            host: "127.0.0.1".to_string(),
            port: *tcp,
        },
        (Some(HealthCheck::Command { command }), _) => {
            return match run_health_command(command).await {
                Some(true) => HealthState::Ok,
                Some(false) => HealthState::Stop,
                None => HealthState::Unknown,
            };
        }
        (None, Some(dial)) => match dial.rsplit_once(':').and_then(|(h, p)| {
            p.parse::<u16>().ok().map(|p| (h.to_string(), p))
        }) {
            Some((host, port)) => ProbeSpec::Tcp { host, port },
            None => return HealthState::Unknown,
        },
        (None, None) => return HealthState::Unknown,
    };

    match wait_ready(&spec, budget).await {
        Ok(outcome) if outcome.is_ready() => HealthState::Ok,
        Ok(_) => HealthState::Stop,
        Err(_) => HealthState::Unknown,
    }
}

async fn run_health_command(command: &str) -> Option<bool> {
    const COMMAND_BUDGET_SECS: u64 = 5;
    let result = tokio::time::timeout(
        Duration::from_secs(COMMAND_BUDGET_SECS),
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status(),
    )
    .await;
    match result {
        Ok(Ok(status)) => Some(status.success()),
        Ok(Err(_)) => None,
        Err(_) => Some(false),
    }
}

fn registry_failure(service_id: Option<String>, e: RegistryError) -> Failure {
    let (kind, severity) = match &e {
        RegistryError::LockContention(_) => (FailureKind::TransientIo, Severity::Warning),
        RegistryError::Corrupt(_) | RegistryError::FutureVersion { .. } => {
            (FailureKind::Fatal, Severity::Error)
        }
        RegistryError::Io(_) => (FailureKind::TransientIo, Severity::Warning),
    };
    Failure { service_id, kind, severity, message: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PathRoute;
    use std::fs;
    use std::path::PathBuf;

    fn project_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("asd-test-rec-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join(".asd")).unwrap();
        dir
    }

    fn reconciler_for(dir: &PathBuf, config_yaml: &str) -> Reconciler {
        fs::write(dir.join("asd.yaml"), config_yaml).unwrap();
        let paths = Paths::resolve(dir).unwrap();
        let config = ProjectConfig::load(&paths.project_config_path()).unwrap();
        Reconciler::new(paths, config)
    }

    const NO_CRED_CONFIG: &str = r#"
version: 1
project:
  name: demo
network:
  services:
    frontend:
      dial: 127.0.0.1:5173
      public: true
      subdomain: app
      env:
        PUBLIC_URL: "${{ macro.exposedOrigin() }}"
"#;

    /// Graceful no-credential path: no session, warning recorded, entry has
    /// no tunnel URL, and PUBLIC_URL is not written (expanded empty).
    #[tokio::test]
    async fn apply_without_credential_is_non_fatal() {
        let dir = project_dir("nocred");
        let rec = reconciler_for(&dir, NO_CRED_CONFIG);

        let opts = ReconcileOptions {
            apply_caddy: false,
            apply_tunnels: true,
            discover: false,
            ids: None,
        };
        let report = rec.apply(&opts).await;

        assert_eq!(report.services, 1);
        assert_eq!(report.tunnels_established, 0);
        assert!(report
            .failures
            .iter()
            .any(|f| f.kind == FailureKind::Config && f.service_id.as_deref() == Some("frontend")));
        assert!(!report.has_fatal());

        let entry = rec.registry.get("frontend").unwrap().unwrap();
        assert_eq!(entry.tunnel_url, None);

        let env = dotenv::load(&rec.paths.dotenv_path).unwrap();
        assert!(!env.contains_key("PUBLIC_URL"));
        assert!(report.env_written.is_empty());
    }

    #[tokio::test]
    async fn overlay_refines_plugin_service() {
        let dir = project_dir("overlay");
        fs::create_dir_all(dir.join("plugins/pg")).unwrap();
        fs::write(
            dir.join("plugins/pg/net.manifest.yaml"),
            "services:\n  \"db:gui\":\n    dial: 127.0.0.1:8090\n    subdomain: dbgui\n",
        )
        .unwrap();
        let rec = reconciler_for(
            &dir,
            r#"
project:
  name: demo
  plugins: [plugins/pg]
network:
  services:
    "db:gui":
      public: true
      subdomain: data
"#,
        );

        let opts = ReconcileOptions {
            apply_caddy: false,
            apply_tunnels: false,
            discover: false,
            ids: None,
        };
        let report = rec.apply(&opts).await;
        assert_eq!(report.services, 1);

        let entry = rec.registry.get("db:gui").unwrap().unwrap();
        // Overlay kept the plugin dial but flipped subdomain and public.
        assert_eq!(entry.declaration.dial.as_deref(), Some("127.0.0.1:8090"));
        assert_eq!(entry.declaration.subdomain.as_deref(), Some("data"));
        assert!(entry.declaration.is_public());
    }

    #[tokio::test]
    async fn second_apply_changes_nothing() {
        let dir = project_dir("idem");
        let rec = reconciler_for(&dir, NO_CRED_CONFIG);
        let opts = ReconcileOptions {
            apply_caddy: false,
            apply_tunnels: false,
            discover: false,
            ids: None,
        };

        rec.apply(&opts).await;
        let registry_once = fs::read_to_string(&rec.paths.registry_path).unwrap();
        let report = rec.apply(&opts).await;
        let registry_twice = fs::read_to_string(&rec.paths.registry_path).unwrap();

        // Health timestamps move; entries themselves must not.
        let strip = |raw: &str| raw
            .lines()
            .filter(|l| !l.contains("lastHealthAt"))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(strip(&registry_once), strip(&registry_twice));
        assert!(report.env_written.is_empty());
    }

    #[test]
    fn route_for_filters_empty_tunnel_host_without_credential() {
        let dir = project_dir("routes");
        let rec = reconciler_for(&dir, NO_CRED_CONFIG);
        let expander = Expander::new(Default::default(), None);
        let mut report = ReconcileReport::default();

        let decl = ServiceDeclaration {
            id: "frontend".into(),
            dial: Some("127.0.0.1:5173".into()),
            public: Some(true),
            subdomain: Some("app".into()),
            ..Default::default()
        };
        let entry = RegistryEntry::from_declaration(decl, ServiceSource::Config);
        let spec = rec.route_for(&entry, &expander, &mut report).unwrap();
        assert_eq!(spec.hosts, vec!["app.localhost".to_string()]);
    }

    #[test]
    fn route_for_includes_tunnel_host_with_credential() {
        use crate::credentials::{CredentialKind, TunnelCredential};
        let dir = project_dir("routes2");
        let rec = reconciler_for(&dir, NO_CRED_CONFIG);
        let cred = TunnelCredential {
            name: "t".into(),
            kind: CredentialKind::Token,
            host: "cicd.eu1.asd.engineer".into(),
            port: 2222,
            client_id: "fkmc".into(),
            secret_or_key_ref: "s".into(),
            expires_at: None,
            limits: None,
        };
        let expander = Expander::new(Default::default(), Some(cred));
        let mut report = ReconcileReport::default();

        let decl = ServiceDeclaration {
            id: "myapp".into(),
            dial: Some("127.0.0.1:3000".into()),
            public: Some(true),
            subdomain: Some("myapp".into()),
            paths: vec![PathRoute { path: "/api".into(), strip_prefix: true }],
            ..Default::default()
        };
        let entry = RegistryEntry::from_declaration(decl, ServiceSource::Config);
        let spec = rec.route_for(&entry, &expander, &mut report).unwrap();
        assert_eq!(
            spec.hosts,
            vec![
                "myapp.localhost".to_string(),
                "myapp-fkmc.cicd.eu1.asd.engineer".to_string(),
            ]
        );
        assert_eq!(spec.path_prefix.as_deref(), Some("/api"));
        assert!(spec.strip_prefix);
    }

    #[tokio::test]
    async fn env_pass_writes_resolved_bindings_idempotently() {
        use crate::credentials::{CredentialKind, TunnelCredential};
        let dir = project_dir("envpass");
        let rec = reconciler_for(&dir, NO_CRED_CONFIG);
        let cred = TunnelCredential {
            name: "t".into(),
            kind: CredentialKind::Token,
            host: "cicd.eu1.asd.engineer".into(),
            port: 2222,
            client_id: "fkmc".into(),
            secret_or_key_ref: "s".into(),
            expires_at: None,
            limits: None,
        };
        let decl = ServiceDeclaration {
            id: "frontend".into(),
            dial: Some("127.0.0.1:5173".into()),
            public: Some(true),
            subdomain: Some("app".into()),
            env: [(
                "PUBLIC_URL".to_string(),
                "${{ macro.exposedOrigin() }}".to_string(),
            )]
            .into(),
            ..Default::default()
        };

        let expander = Mutex::new(Expander::new(Default::default(), Some(cred)));
        let mut report = ReconcileReport::default();
        rec.env_pass(std::slice::from_ref(&decl), &expander, &mut report);
        assert_eq!(report.env_written, vec!["PUBLIC_URL".to_string()]);

        let env = dotenv::load(&rec.paths.dotenv_path).unwrap();
        assert_eq!(
            env.get("PUBLIC_URL").map(String::as_str),
            Some("https://app-fkmc.cicd.eu1.asd.engineer")
        );

        // Second pass: same value, no write.
        let mut report2 = ReconcileReport::default();
        rec.env_pass(std::slice::from_ref(&decl), &expander, &mut report2);
        assert!(report2.env_written.is_empty());
    }

    #[tokio::test]
    async fn health_sweep_marks_listening_dial_ok() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let dir = project_dir("health");
        let rec = reconciler_for(
            &dir,
            &format!(
                "network:\n  services:\n    live:\n      dial: 127.0.0.1:{port}\n    dead:\n      dial: 127.0.0.1:1\n"
            ),
        );
        let opts = ReconcileOptions {
            apply_caddy: false,
            apply_tunnels: false,
            discover: false,
            ids: None,
        };
        rec.apply(&opts).await;

        let live = rec.registry.get("live").unwrap().unwrap();
        assert_eq!(live.last_health_result, HealthState::Ok);
        assert!(live.last_health_at.is_some());
        let dead = rec.registry.get("dead").unwrap().unwrap();
        assert_eq!(dead.last_health_result, HealthState::Stop);
    }
}
