mod automation;
mod caddy;
mod config;
mod credentials;
mod discover;
mod domain;
mod dotenv;
mod expand;
mod helpers;
mod paths;
mod plugins;
mod probe;
mod reconcile;
mod registry;
mod supervisor;
mod tunnel;

use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tabled::Tabled;
use tracing::warn;

use crate::config::{GlobalConfig, ProjectConfig};
use crate::credentials::{CredentialStore, BOOTSTRAP_ENDPOINT};
use crate::domain::{ServiceDeclaration, TunnelProtocol};
use crate::helpers::Helper;
use crate::paths::Paths;
use crate::reconcile::{FailureKind, ReconcileOptions, ReconcileReport, Reconciler};
use crate::registry::ListFilter;
use crate::supervisor::StartOutcome;
use crate::tunnel::session::SessionParams;

#[derive(Parser)]
#[command(name = "asd", version, about = "Expose local services through a tunnel gateway and a managed Caddy proxy")]
struct Cli {
    /// Emit machine-readable JSON instead of human output
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold asd.yaml and the project workspace
    Init,
    /// Seed the project dotenv with the keys asd reads
    EnvInit,
    /// Run an automation task from asd.yaml
    Run {
        task: String,
    },
    /// Check helper binaries and report their versions
    Update,
    /// Expose a local port (or manage existing exposures)
    Expose(ExposeArgs),
    /// Service network: registry, proxy routes, tunnels
    Net {
        #[command(subcommand)]
        action: Option<NetAction>,
    },
    /// Web terminal helper
    Terminal {
        #[command(subcommand)]
        action: HelperAction,
    },
    /// Browser IDE helper
    Code {
        #[command(subcommand)]
        action: HelperAction,
    },
    /// Database GUI helper
    Database {
        #[command(subcommand)]
        action: HelperAction,
    },
    /// Traffic inspector helper
    Inspect {
        #[command(subcommand)]
        action: HelperAction,
    },
    /// Manage the local Caddy daemon
    Caddy {
        #[command(subcommand)]
        action: CaddyAction,
    },
    /// Tunnel credentials
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
}

#[derive(Args)]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
struct ExposeArgs {
    /// Local TCP port to expose
    #[arg(required = true)]
    port: Option<u16>,
    /// Service name (defaults to port-<port>)
    #[arg(long)]
    name: Option<String>,
    /// Proxy route only, no tunnel
    #[arg(long)]
    local_only: bool,
    /// Tunnel only, skip the proxy route
    #[arg(long)]
    direct: bool,
    #[command(subcommand)]
    action: Option<ExposeAction>,
}

#[derive(Subcommand)]
enum ExposeAction {
    /// List exposures and their tunnel state
    List,
    /// Stop an exposure by name or port
    Stop { target: String },
}

#[derive(Subcommand)]
enum NetAction {
    /// Reconcile declared + discovered services onto proxy and tunnels
    Apply {
        /// Only apply proxy routes
        #[arg(long)]
        caddy: bool,
        /// Only apply tunnel sessions
        #[arg(long)]
        tunnel: bool,
        /// Restrict to these service ids (comma separated)
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<String>>,
    },
    /// Re-run the reconcile without discovery
    Refresh,
    /// Probe the host for running services
    Discover,
    /// Start the tunnel session of one service
    Start { id: String },
    /// Stop the tunnel session of one service
    Stop { id: String },
    /// Open a service in the browser
    Open { id: String },
    /// Stop a service's tunnel and purge its registry entry
    Remove { id: String },
    /// Stop tunnels, drop discovered entries, clear routes
    Clean,
    /// Clean plus wipe the registry file
    Reset,
    /// Tunnel sessions for every public service
    Tunnel {
        #[command(subcommand)]
        action: TunnelAction,
    },
}

#[derive(Subcommand)]
enum TunnelAction {
    Start,
    Stop,
    Reset,
}

#[derive(Subcommand)]
enum HelperAction {
    Start,
    Stop,
}

#[derive(Subcommand)]
enum CaddyAction {
    Start,
    Stop,
    Restart,
    /// Print the rendered Caddy config
    Config,
}

#[derive(Subcommand)]
enum AuthAction {
    /// Show the active credential
    Status,
    /// Fetch a fresh ephemeral credential and make it the default
    Credentials,
    /// Switch the default credential
    Switch { name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();
    warn_on_env_leaks();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "✗".red());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let default = if std::env::var("ASD_DEBUG").map(|v| !v.is_empty()).unwrap_or(false) {
        "asd=debug"
    } else if std::env::var("ASD_VERBOSE").map(|v| !v.is_empty()).unwrap_or(false) {
        "asd=info"
    } else {
        "asd=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Sandbox/test overrides leaking into a normal run are a misconfiguration,
/// surfaced once per run as a warning.
fn warn_on_env_leaks() {
    let in_ci = std::env::var("CI").map(|v| v == "true").unwrap_or(false);
    if in_ci {
        return;
    }
    for key in ["ASD_DIR_PATH"] {
        if std::env::var(key).map(|v| !v.is_empty()).unwrap_or(false) {
            warn!("{key} is set; this override is meant for test sandboxes");
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let cwd = std::env::current_dir()?;
    let json = cli.json;

    match cli.command {
        Commands::Init => run_init(&cwd, json),
        Commands::EnvInit => run_env_init(&cwd, json),
        Commands::Run { task } => {
            let paths = Paths::resolve(&cwd)?;
            let config = ProjectConfig::load_or_default(&paths.project_config_path())?;
            automation::run_task(&paths, &config, &task).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Update => run_update(json),
        Commands::Expose(args) => run_expose(&cwd, args, json).await,
        Commands::Net { action } => run_net(&cwd, action, json).await,
        Commands::Terminal { action } => run_helper(&cwd, Helper::Terminal, action, json).await,
        Commands::Code { action } => run_helper(&cwd, Helper::Code, action, json).await,
        Commands::Database { action } => run_helper(&cwd, Helper::Database, action, json).await,
        Commands::Inspect { action } => run_helper(&cwd, Helper::Inspect, action, json).await,
        Commands::Caddy { action } => run_caddy(&cwd, action, json).await,
        Commands::Auth { action } => run_auth(&cwd, action, json).await,
    }
}

fn reconciler(cwd: &std::path::Path) -> anyhow::Result<Reconciler> {
    let paths = Paths::resolve(cwd)?;
    let config = ProjectConfig::load_or_default(&paths.project_config_path())?;
    Ok(Reconciler::new(paths, config))
}

// ---------------------------------------------------------------------------
// init / env-init / update
// ---------------------------------------------------------------------------

const CONFIG_TEMPLATE: &str = r#"version: 1
project:
  name: my-project
  plugins: []
network:
  caddy:
    tls: internal
    basic_auth:
      enabled: false
  services: {}
automation: {}
tunnels:
  mode: ephemeral
"#;

fn run_init(cwd: &std::path::Path, json: bool) -> anyhow::Result<ExitCode> {
    std::fs::create_dir_all(cwd.join(".asd"))?;
    let paths = Paths::resolve(cwd)?;
    let config_path = paths.project_config_path();
    let created = if config_path.exists() {
        false
    } else {
        std::fs::write(&config_path, CONFIG_TEMPLATE)?;
        true
    };
    if json {
        println!(
            "{}",
            serde_json::json!({ "ok": true, "config": config_path, "created": created })
        );
    } else if created {
        print_check(true, &format!("wrote {}", config_path.display()));
        print_check(true, &format!("workspace at {}", paths.workspace_dir.display()));
    } else {
        print_warn(&format!("{} already exists, left untouched", config_path.display()));
    }
    Ok(ExitCode::SUCCESS)
}

fn run_env_init(cwd: &std::path::Path, json: bool) -> anyhow::Result<ExitCode> {
    let paths = Paths::resolve(cwd)?;
    let mut expander = expand::Expander::new(Default::default(), None);
    let existing = dotenv::load(&paths.dotenv_path)?;

    let mut updates: Vec<(String, String)> = Vec::new();
    if !existing.contains_key("ASD_BASIC_AUTH_USERNAME") {
        updates.push(("ASD_BASIC_AUTH_USERNAME".to_string(), "dev".to_string()));
    }
    if !existing.contains_key("ASD_BASIC_AUTH_PASSWORD") {
        let password = expander.expand("${{ macro.getRandomString(20, urlsafe) }}", None);
        updates.push(("ASD_BASIC_AUTH_PASSWORD".to_string(), password));
    }
    let written = dotenv::upsert(&paths.dotenv_path, &updates)?;
    if json {
        println!("{}", serde_json::json!({ "ok": true, "written": written }));
    } else if written.is_empty() {
        print_check(true, "dotenv already seeded");
    } else {
        print_check(true, &format!("seeded {} in {}", written.join(", "), paths.dotenv_path.display()));
    }
    Ok(ExitCode::SUCCESS)
}

fn run_update(json: bool) -> anyhow::Result<ExitCode> {
    let statuses = helpers::binary_status();
    if json {
        let value: Vec<serde_json::Value> = statuses
            .iter()
            .map(|(name, path)| {
                serde_json::json!({ "binary": name, "path": path.as_ref().map(|p| p.display().to_string()) })
            })
            .collect();
        println!("{}", serde_json::to_string(&value)?);
        return Ok(ExitCode::SUCCESS);
    }
    let mut missing = 0;
    for (name, path) in &statuses {
        match path {
            Some(path) => print_check(true, &format!("{name} at {}", path.display())),
            None => {
                print_check(false, &format!("{name} not found on PATH"));
                missing += 1;
            }
        }
    }
    if missing > 0 {
        print_warn(&format!("{missing} helper binaries missing; install them to enable the related commands"));
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// expose
// ---------------------------------------------------------------------------

async fn run_expose(
    cwd: &std::path::Path,
    args: ExposeArgs,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let rec = reconciler(cwd)?;
    match args.action {
        Some(ExposeAction::List) => return run_expose_list(&rec, json),
        Some(ExposeAction::Stop { target }) => return run_expose_stop(&rec, &target, json).await,
        None => {}
    }
    let Some(port) = args.port else {
        anyhow::bail!("a port is required: asd expose <port>");
    };

    let name = args.name.unwrap_or_else(|| format!("port-{port}"));
    let decl = ServiceDeclaration {
        id: name.clone(),
        dial: Some(format!("127.0.0.1:{port}")),
        public: Some(!args.local_only),
        subdomain: Some(name.clone()),
        tunnel_protocol: Some(TunnelProtocol::Http),
        ..Default::default()
    };

    let mut entry = registry::RegistryEntry::from_declaration(decl, domain::ServiceSource::Config);
    entry.allocated_port = Some(port);
    rec.registry().upsert(entry)?;

    let mut tunnel_url: Option<String> = None;
    if !args.local_only {
        match rec.active_credential()? {
            Some(credential) => {
                let params = SessionParams {
                    service_id: name.clone(),
                    subdomain: name.clone(),
                    protocol: TunnelProtocol::Http,
                    local_dial: format!("127.0.0.1:{port}"),
                    credential,
                };
                let record = rec.tunnels().ensure_session(rec.registry(), &params).await?;
                tunnel_url = record.public_url;
            }
            None => print_warn("no tunnel credential; run `asd auth credentials` (route stays local)"),
        }
    }

    if !args.direct {
        let report = rec.refresh_routes().await;
        print_failures(&report, json);
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "ok": true,
                "service": name,
                "local": format!("http://127.0.0.1:{port}"),
                "caddy": format!("https://{name}.localhost"),
                "tunnel": tunnel_url,
            })
        );
    } else {
        println!("{}", name.bold());
        println!("  local   http://127.0.0.1:{port}");
        if !args.direct {
            println!("  caddy   https://{name}.localhost");
        }
        match &tunnel_url {
            Some(url) => println!("  tunnel  {url}"),
            None if !args.local_only => println!("  tunnel  {}", "pending".dimmed()),
            None => {}
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Tabled)]
struct ExposeRow {
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "DIAL")]
    dial: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "PUBLIC URL")]
    url: String,
}

fn run_expose_list(rec: &Reconciler, json: bool) -> anyhow::Result<ExitCode> {
    let sessions = rec.tunnels().list_sessions();
    if json {
        println!("{}", serde_json::to_string(&sessions)?);
        return Ok(ExitCode::SUCCESS);
    }
    if sessions.is_empty() {
        println!("No active exposures.");
        return Ok(ExitCode::SUCCESS);
    }
    let rows: Vec<ExposeRow> = sessions
        .iter()
        .map(|s| ExposeRow {
            service: s.service_id.bold().to_string(),
            dial: s.local_dial.clone(),
            state: s.state.to_string(),
            url: s.public_url.clone().unwrap_or_else(|| "-".dimmed().to_string()),
        })
        .collect();
    print_table(rows);
    Ok(ExitCode::SUCCESS)
}

async fn run_expose_stop(rec: &Reconciler, target: &str, json: bool) -> anyhow::Result<ExitCode> {
    // Accept a service name or a local port.
    let id = match rec.registry().get(target)? {
        Some(entry) => entry.id().to_string(),
        None => {
            let by_port = rec.registry().load()?.into_iter().find(|e| {
                e.allocated_port.map(|p| p.to_string()) == Some(target.to_string())
            });
            match by_port {
                Some(entry) => entry.id().to_string(),
                None => anyhow::bail!("no exposure named {target:?}"),
            }
        }
    };
    rec.tunnels().stop_session(rec.registry(), &id).await?;
    rec.registry().remove(&id)?;
    let report = rec.refresh_routes().await;
    print_failures(&report, json);
    if json {
        println!("{}", serde_json::json!({ "ok": true, "stopped": id }));
    } else {
        print_check(true, &format!("stopped {id}"));
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// net
// ---------------------------------------------------------------------------

async fn run_net(
    cwd: &std::path::Path,
    action: Option<NetAction>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let rec = reconciler(cwd)?;
    match action {
        None => run_net_status(&rec, json),
        Some(NetAction::Apply { caddy, tunnel, ids }) => {
            // Bare `net apply` drives both subsystems; flags narrow it.
            let opts = ReconcileOptions {
                apply_caddy: caddy || !tunnel,
                apply_tunnels: tunnel || !caddy,
                discover: true,
                ids,
            };
            let report = rec.apply(&opts).await;
            finish_report(report, json)
        }
        Some(NetAction::Refresh) => {
            let opts = ReconcileOptions { discover: false, ..Default::default() };
            let report = rec.apply(&opts).await;
            finish_report(report, json)
        }
        Some(NetAction::Discover) => {
            let found = discover::discover_all(&[2019]).await;
            if json {
                println!("{}", serde_json::to_string(&found)?);
            } else if found.is_empty() {
                println!("Nothing discovered.");
            } else {
                for service in &found {
                    print_check(true, &format!("{} ({}) at {}", service.id, service.source, service.dial));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(NetAction::Start { id }) => {
            let report = rec.start_tunnels(Some(vec![id])).await;
            finish_report(report, json)
        }
        Some(NetAction::Stop { id }) => {
            rec.tunnels().stop_session(rec.registry(), &id).await?;
            print_check(true, &format!("stopped tunnel for {id}"));
            Ok(ExitCode::SUCCESS)
        }
        Some(NetAction::Open { id }) => run_net_open(&rec, &id),
        Some(NetAction::Remove { id }) => {
            let report = rec.remove(&[id], true).await;
            finish_report(report, json)
        }
        Some(NetAction::Clean) => finish_report(rec.clean().await, json),
        Some(NetAction::Reset) => finish_report(rec.reset().await, json),
        Some(NetAction::Tunnel { action }) => match action {
            TunnelAction::Start => finish_report(rec.start_tunnels(None).await, json),
            TunnelAction::Stop => {
                let stopped = rec.tunnels().stop_all(rec.registry()).await?;
                print_check(true, &format!("stopped {stopped} tunnel sessions"));
                Ok(ExitCode::SUCCESS)
            }
            TunnelAction::Reset => {
                rec.tunnels().stop_all(rec.registry()).await?;
                rec.tunnels().reap_strays().await;
                finish_report(rec.start_tunnels(None).await, json)
            }
        },
    }
}

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "DIAL")]
    dial: String,
    #[tabled(rename = "SOURCE")]
    source: String,
    #[tabled(rename = "HEALTH")]
    health: String,
    #[tabled(rename = "TUNNEL")]
    tunnel: String,
}

fn run_net_status(rec: &Reconciler, json: bool) -> anyhow::Result<ExitCode> {
    let entries = rec.registry().list(&ListFilter::default())?;
    if json {
        println!("{}", serde_json::to_string(&entries)?);
        return Ok(ExitCode::SUCCESS);
    }
    if entries.is_empty() {
        println!("No services registered. Declare some in asd.yaml or run `asd net discover`.");
        return Ok(ExitCode::SUCCESS);
    }
    let rows: Vec<ServiceRow> = entries
        .iter()
        .map(|e| {
            let health = match e.last_health_result {
                domain::HealthState::Ok => "ok".green().to_string(),
                domain::HealthState::Warn => "warn".yellow().to_string(),
                domain::HealthState::Stop => "stop".red().to_string(),
                other => other.as_str().dimmed().to_string(),
            };
            ServiceRow {
                id: e.id().bold().to_string(),
                dial: e.declaration.dial.clone().unwrap_or_else(|| "-".to_string()),
                source: e.source.to_string(),
                health,
                tunnel: e
                    .tunnel_url
                    .clone()
                    .unwrap_or_else(|| "-".dimmed().to_string()),
            }
        })
        .collect();
    print_table(rows);
    Ok(ExitCode::SUCCESS)
}

fn run_net_open(rec: &Reconciler, id: &str) -> anyhow::Result<ExitCode> {
    let entry = rec
        .registry()
        .get(id)?
        .ok_or_else(|| anyhow::anyhow!("no service named {id:?}"))?;
    let url = entry.tunnel_url.clone().unwrap_or_else(|| {
        format!("https://{}.localhost", entry.declaration.subdomain_or_id())
    });
    println!("{url}");
    #[cfg(target_os = "macos")]
    let opener = "open";
    #[cfg(not(target_os = "macos"))]
    let opener = "xdg-open";
    let _ = std::process::Command::new(opener)
        .arg(&url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// helpers / caddy / auth
// ---------------------------------------------------------------------------

async fn run_helper(
    cwd: &std::path::Path,
    helper: Helper,
    action: HelperAction,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let rec = reconciler(cwd)?;
    let paths = Paths::resolve(cwd)?;
    match action {
        HelperAction::Start => {
            let outcome = helpers::start(helper, &paths, rec.registry()).await?;
            let report = rec.refresh_routes().await;
            print_failures(&report, json);
            match outcome {
                StartOutcome::Started { pid, ready, .. } => {
                    print_check(true, &format!(
                        "{} started (pid {pid}{})",
                        helper.service_id(),
                        if ready { "" } else { ", warming up" }
                    ));
                    Ok(ExitCode::SUCCESS)
                }
                StartOutcome::AlreadyRunning { pid } => {
                    print_check(true, &format!("{} already running (pid {pid})", helper.service_id()));
                    Ok(ExitCode::SUCCESS)
                }
                StartOutcome::Failed { reason } => {
                    print_check(false, &reason);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        HelperAction::Stop => {
            helpers::stop(helper, &paths, rec.registry()).await?;
            let report = rec.refresh_routes().await;
            print_failures(&report, json);
            print_check(true, &format!("{} stopped", helper.service_id()));
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_caddy(
    cwd: &std::path::Path,
    action: CaddyAction,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let rec = reconciler(cwd)?;
    match action {
        CaddyAction::Start => match rec.caddy().start().await? {
            StartOutcome::Started { pid, .. } => {
                print_check(true, &format!("caddy started (pid {pid})"));
                Ok(ExitCode::SUCCESS)
            }
            StartOutcome::AlreadyRunning { pid } => {
                print_check(true, &format!("caddy already running (pid {pid})"));
                Ok(ExitCode::SUCCESS)
            }
            StartOutcome::Failed { reason } => {
                print_check(false, &reason);
                Ok(ExitCode::FAILURE)
            }
        },
        CaddyAction::Stop => {
            rec.caddy().stop().await?;
            print_check(true, "caddy stopped");
            Ok(ExitCode::SUCCESS)
        }
        CaddyAction::Restart => {
            rec.caddy().restart().await?;
            print_check(true, "caddy restarted");
            Ok(ExitCode::SUCCESS)
        }
        CaddyAction::Config => {
            let path = rec.caddy().config_path();
            if path.exists() {
                let raw = std::fs::read_to_string(&path)?;
                println!("{raw}");
            } else if json {
                println!("{}", rec.caddy().render_full_config(&[]));
            } else {
                println!("{}", serde_json::to_string_pretty(&rec.caddy().render_full_config(&[]))?);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_auth(
    cwd: &std::path::Path,
    action: AuthAction,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let paths = Paths::resolve(cwd)?;
    let store = CredentialStore::new(&paths.credentials_path);
    let global = GlobalConfig::load_or_default(&paths.global_config_path());

    match action {
        AuthAction::Status => {
            let active = store.resolve_active()?;
            if json {
                println!("{}", serde_json::to_string(&active)?);
                return Ok(ExitCode::SUCCESS);
            }
            match active {
                Some(cred) => {
                    print_check(true, &format!(
                        "active credential {} ({:?}) -> {}@{}:{}",
                        cred.name.bold(),
                        cred.kind,
                        cred.client_id,
                        cred.host,
                        cred.port
                    ));
                    if let Some(expires) = cred.expires_at {
                        println!("  expires {expires}");
                    }
                }
                None => print_warn("no credential configured; run `asd auth credentials`"),
            }
            let listed = store.list()?;
            if !listed.is_empty() && !json {
                println!("  {} stored credential(s)", listed.len());
            }
            Ok(ExitCode::SUCCESS)
        }
        AuthAction::Credentials => {
            let endpoint = global
                .tunnel_endpoint
                .unwrap_or_else(|| BOOTSTRAP_ENDPOINT.to_string());
            let cred = credentials::fetch_ephemeral(&endpoint).await?;
            store.rotate(cred.clone())?;
            if json {
                println!("{}", serde_json::to_string(&cred)?);
            } else {
                print_check(true, &format!(
                    "ephemeral credential {} -> {}@{}:{}",
                    cred.name.bold(),
                    cred.client_id,
                    cred.host,
                    cred.port
                ));
            }
            Ok(ExitCode::SUCCESS)
        }
        AuthAction::Switch { name } => {
            store.set_default(&name)?;
            print_check(true, &format!("default credential is now {name}"));
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ---------------------------------------------------------------------------
// output plumbing
// ---------------------------------------------------------------------------

fn finish_report(report: ReconcileReport, json: bool) -> anyhow::Result<ExitCode> {
    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        if let Some(routes) = &report.routes_applied {
            print_check(true, &format!("proxy routes {routes}"));
        }
        if report.tunnels_established > 0 {
            print_check(true, &format!("{} tunnel(s) established", report.tunnels_established));
        }
        if !report.env_written.is_empty() {
            print_check(true, &format!("dotenv updated: {}", report.env_written.join(", ")));
        }
        print_failures(&report, false);
    }

    Ok(if report.has_errors() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Failures grouped by service id, glyph-prefixed by kind.
fn print_failures(report: &ReconcileReport, json: bool) {
    if json || report.failures.is_empty() {
        return;
    }
    let mut sorted = report.failures.clone();
    sorted.sort_by(|a, b| a.service_id.cmp(&b.service_id));
    for failure in &sorted {
        let scope = failure.service_id.as_deref().unwrap_or("project");
        let line = format!("[{}] {}: {}", failure.kind.as_str(), scope.bold(), failure.message);
        match failure.kind {
            FailureKind::Fatal | FailureKind::Spawn | FailureKind::Protocol => {
                println!("  {} {line}", "✗".red())
            }
            FailureKind::Config | FailureKind::Misconfiguration => {
                println!("  {} {line}", "!".yellow())
            }
            FailureKind::TransientIo => println!("  {} {line}", "!".yellow()),
        }
    }
}

fn print_table<T: Tabled>(rows: Vec<T>) {
    use tabled::settings::Style;
    let table = tabled::Table::new(&rows).with(Style::blank()).to_string();
    println!("{table}");
}

fn print_check(ok: bool, msg: &str) {
    if ok {
        println!("  {} {msg}", "✓".green());
    } else {
        println!("  {} {msg}", "✗".red());
    }
}

fn print_warn(msg: &str) {
    println!("  {} {msg}", "!".yellow());
}
