use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::domain::{DiscoveredService, ServiceSource};

const DOCKER_PROBE_TIMEOUT_SECS: u64 = 3;

/// Probe the host for running services: docker containers with published
/// ports, plus loopback LISTEN sockets. Discovered entries never overwrite
/// declared ids; the reconciler filters against the declared set.
pub async fn discover_all(exclude_ports: &[u16]) -> Vec<DiscoveredService> {
    let mut found = Vec::new();
    match docker_services().await {
        Ok(mut services) => found.append(&mut services),
        Err(e) => debug!(error = %e, "docker discovery skipped"),
    }
    let docker_ports: Vec<u16> = found
        .iter()
        .filter_map(|s| s.dial.rsplit_once(':').and_then(|(_, p)| p.parse().ok()))
        .collect();
    for port in loopback_listeners() {
        if exclude_ports.contains(&port) || docker_ports.contains(&port) {
            continue;
        }
        found.push(DiscoveredService {
            id: format!("port:{port}"),
            dial: format!("127.0.0.1:{port}"),
            source: ServiceSource::PortScan,
            detected_at: OffsetDateTime::now_utc(),
            labels: BTreeMap::new(),
        });
    }
    found
}

#[derive(Debug, Deserialize)]
struct DockerPsLine {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Ports", default)]
    ports: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

/// `docker ps` with a JSON line per container, bounded by a short timeout so
/// a wedged daemon does not stall the reconcile.
pub async fn docker_services() -> anyhow::Result<Vec<DiscoveredService>> {
    let output = tokio::time::timeout(
        Duration::from_secs(DOCKER_PROBE_TIMEOUT_SECS),
        tokio::process::Command::new("docker")
            .args(["ps", "--format", "{{json .}}"])
            .output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("docker ps timed out"))??;

    if !output.status.success() {
        anyhow::bail!(
            "docker ps failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let now = OffsetDateTime::now_utc();
    let mut services = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<DockerPsLine>(line) {
            Ok(parsed) => {
                if let Some(service) = container_to_service(&parsed, now) {
                    services.push(service);
                }
            }
            Err(e) => warn!(error = %e, "unparseable docker ps line"),
        }
    }
    Ok(services)
}

fn container_to_service(line: &DockerPsLine, now: OffsetDateTime) -> Option<DiscoveredService> {
    let port = first_published_port(&line.ports)?;
    let name = line.names.split(',').next().unwrap_or(&line.names).trim();
    let mut labels: BTreeMap<String, String> = line
        .labels
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    if !line.image.is_empty() {
        labels.insert("image".to_string(), line.image.clone());
    }
    Some(DiscoveredService {
        id: format!("docker:{name}"),
        dial: format!("127.0.0.1:{port}"),
        source: ServiceSource::Docker,
        detected_at: now,
        labels,
    })
}

/// First host-published port from a docker `Ports` column, e.g.
/// `0.0.0.0:5432->5432/tcp, :::5432->5432/tcp`.
fn first_published_port(ports: &str) -> Option<u16> {
    for mapping in ports.split(',') {
        let mapping = mapping.trim();
        let Some((host_side, _container_side)) = mapping.split_once("->") else {
            continue;
        };
        if let Some((_, port)) = host_side.rsplit_once(':') {
            if let Ok(port) = port.parse() {
                return Some(port);
            }
        }
    }
    None
}

/// LISTEN sockets bound to the loopback interface, from the proc table.
#[cfg(target_os = "linux")]
pub fn loopback_listeners() -> Vec<u16> {
    let mut ports = Vec::new();
    for (path, loopback_check) in [
        ("/proc/net/tcp", is_loopback_v4 as fn(&str) -> bool),
        ("/proc/net/tcp6", is_loopback_v6 as fn(&str) -> bool),
    ] {
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        ports.extend(parse_proc_net(&content, loopback_check));
    }
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[cfg(not(target_os = "linux"))]
pub fn loopback_listeners() -> Vec<u16> {
    Vec::new()
}

/// One line per socket: `sl local_address rem_address st …`; state 0A is
/// LISTEN, the local address is hex `ADDR:PORT`.
fn parse_proc_net(content: &str, is_loopback: impl Fn(&str) -> bool) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in content.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(_sl), Some(local), Some(_rem), Some(state)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if state != "0A" {
            continue;
        }
        let Some((addr, port_hex)) = local.rsplit_once(':') else {
            continue;
        };
        if !is_loopback(addr) {
            continue;
        }
        if let Ok(port) = u16::from_str_radix(port_hex, 16) {
            ports.push(port);
        }
    }
    ports
}

fn is_loopback_v4(addr_hex: &str) -> bool {
    // 127.0.0.1 little-endian.
    addr_hex == "0100007F"
}

fn is_loopback_v6(addr_hex: &str) -> bool {
    addr_hex == "00000000000000000000000001000000"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_ps_line_maps_to_service() {
        let line: DockerPsLine = serde_json::from_str(
            r#"{"Names":"pg-dev","Ports":"0.0.0.0:5432->5432/tcp, :::5432->5432/tcp","Image":"postgres:16","Labels":"com.docker.compose.project=shop"}"#,
        )
        .unwrap();
        let service = container_to_service(&line, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(service.id, "docker:pg-dev");
        assert_eq!(service.dial, "127.0.0.1:5432");
        assert_eq!(service.source, ServiceSource::Docker);
        assert_eq!(
            service.labels.get("com.docker.compose.project").map(String::as_str),
            Some("shop")
        );
        assert_eq!(service.labels.get("image").map(String::as_str), Some("postgres:16"));
    }

    #[test]
    fn container_without_published_ports_is_skipped() {
        let line: DockerPsLine = serde_json::from_str(
            r#"{"Names":"worker","Ports":"","Image":"redis:7","Labels":""}"#,
        )
        .unwrap();
        assert!(container_to_service(&line, OffsetDateTime::UNIX_EPOCH).is_none());
    }

    #[test]
    fn published_port_parsing_handles_ipv6_and_ranges() {
        assert_eq!(first_published_port("0.0.0.0:8080->80/tcp"), Some(8080));
        assert_eq!(first_published_port(":::9000->9000/tcp"), Some(9000));
        assert_eq!(first_published_port("6379/tcp"), None);
        assert_eq!(first_published_port(""), None);
    }

    #[test]
    fn proc_net_parser_filters_state_and_interface() {
        let content = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid\n\
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000\n\
   1: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0\n\
   2: 0100007F:D431 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000\n";
        let ports = parse_proc_net(content, is_loopback_v4);
        // 0x1F90 = 8080 listening on loopback; the 0.0.0.0 listener and the
        // established connection are both excluded.
        assert_eq!(ports, vec![8080]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_listener_appears_in_scan() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let ports = loopback_listeners();
        assert!(ports.contains(&port), "expected {port} in {ports:?}");
    }
}
