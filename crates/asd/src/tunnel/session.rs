use std::path::PathBuf;

use regex::Regex;

use crate::credentials::{CredentialKind, TunnelCredential};
use crate::domain::TunnelProtocol;

/// The gateway announces the assigned public URL as a human-readable line in
/// the session transcript; the first capture is the URL itself.
pub const URL_PATTERN: &str = r"(https?://[^\s]+\.[^\s]+)";

/// Inputs for one SSH reverse-forward invocation.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub service_id: String,
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    /// `host:port` of the local upstream.
    pub local_dial: String,
    pub credential: TunnelCredential,
}

/// Build the external SSH client invocation for a session.
///
/// Password-style credentials (token, ephemeral) authenticate through
/// `sshpass`; key credentials pass the key path to `ssh -i`. Ephemeral
/// credentials disable strict host-key checking since the gateway host key
/// rotates with the credential.
pub fn ssh_command(params: &SessionParams) -> (PathBuf, Vec<String>) {
    let cred = &params.credential;
    let mut args: Vec<String> = Vec::new();

    let binary = match cred.kind {
        CredentialKind::Key => PathBuf::from("ssh"),
        CredentialKind::Token | CredentialKind::Ephemeral => {
            args.push("-p".to_string());
            args.push(cred.secret_or_key_ref.clone());
            args.push("ssh".to_string());
            PathBuf::from("sshpass")
        }
    };

    if cred.kind == CredentialKind::Key {
        args.push("-i".to_string());
        args.push(cred.secret_or_key_ref.clone());
    }
    if cred.kind == CredentialKind::Ephemeral {
        args.push("-o".to_string());
        args.push("StrictHostKeyChecking=no".to_string());
        args.push("-o".to_string());
        args.push("UserKnownHostsFile=/dev/null".to_string());
    }

    // No pty, but keep the session channel open: the gateway announces the
    // assigned URL over it.
    args.extend(
        [
            "-o",
            "ExitOnForwardFailure=yes",
            "-o",
            "ServerAliveInterval=30",
            "-o",
            "ServerAliveCountMax=3",
            "-T",
        ]
        .map(str::to_string),
    );

    args.push("-R".to_string());
    args.push(forward_arg(params));

    args.push(format!("{}@{}", cred.client_id, cred.host));
    args.push("-p".to_string());
    args.push(cred.port.to_string());

    (binary, args)
}

fn forward_arg(params: &SessionParams) -> String {
    match params.protocol {
        TunnelProtocol::Http => format!("{}:80:{}", params.subdomain, params.local_dial),
        TunnelProtocol::Tcp => {
            // A named TCP alias is only requested when the server advertises
            // support; otherwise the listener port is server-assigned.
            let aliases_ok = params
                .credential
                .limits
                .as_ref()
                .and_then(|l| l.tcp_aliases)
                .unwrap_or(false);
            if aliases_ok {
                format!("{}:0:{}", params.subdomain, params.local_dial)
            } else {
                format!("0:{}", params.local_dial)
            }
        }
    }
}

/// Extract the assigned public URL from transcript text.
pub fn parse_public_url(text: &str) -> Option<String> {
    let re = Regex::new(URL_PATTERN).expect("url pattern");
    re.captures(text).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialLimits;

    fn credential(kind: CredentialKind) -> TunnelCredential {
        TunnelCredential {
            name: "test".to_string(),
            kind,
            host: "cicd.eu1.asd.engineer".to_string(),
            port: 2222,
            client_id: "fkmc".to_string(),
            secret_or_key_ref: "s3cret".to_string(),
            expires_at: None,
            limits: None,
        }
    }

    fn params(kind: CredentialKind, protocol: TunnelProtocol) -> SessionParams {
        SessionParams {
            service_id: "myapp".to_string(),
            subdomain: "myapp".to_string(),
            protocol,
            local_dial: "127.0.0.1:3000".to_string(),
            credential: credential(kind),
        }
    }

    #[test]
    fn ephemeral_http_session_uses_sshpass_and_relaxed_host_keys() {
        let (binary, args) = ssh_command(&params(CredentialKind::Ephemeral, TunnelProtocol::Http));
        assert_eq!(binary, PathBuf::from("sshpass"));
        assert_eq!(&args[..3], &["-p", "s3cret", "ssh"]);
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        let forward_idx = args.iter().position(|a| a == "-R").unwrap();
        assert_eq!(args[forward_idx + 1], "myapp:80:127.0.0.1:3000");
        assert!(args.contains(&"fkmc@cicd.eu1.asd.engineer".to_string()));
        let port_idx = args.iter().rposition(|a| a == "-p").unwrap();
        assert_eq!(args[port_idx + 1], "2222");
    }

    #[test]
    fn key_session_uses_ssh_with_identity() {
        let mut p = params(CredentialKind::Key, TunnelProtocol::Http);
        p.credential.secret_or_key_ref = "/home/dev/.ssh/asd_ed25519".to_string();
        let (binary, args) = ssh_command(&p);
        assert_eq!(binary, PathBuf::from("ssh"));
        let i_idx = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i_idx + 1], "/home/dev/.ssh/asd_ed25519");
        assert!(!args.contains(&"sshpass".to_string()));
        // Token host-key relaxation is ephemeral-only.
        assert!(!args.contains(&"StrictHostKeyChecking=no".to_string()));
    }

    #[test]
    fn tcp_forward_is_server_assigned_without_alias_support() {
        let (_, args) = ssh_command(&params(CredentialKind::Token, TunnelProtocol::Tcp));
        let forward_idx = args.iter().position(|a| a == "-R").unwrap();
        assert_eq!(args[forward_idx + 1], "0:127.0.0.1:3000");
    }

    #[test]
    fn tcp_alias_requested_only_when_advertised() {
        let mut p = params(CredentialKind::Token, TunnelProtocol::Tcp);
        p.credential.limits = Some(CredentialLimits {
            max_tunnels: None,
            tcp_aliases: Some(true),
        });
        let (_, args) = ssh_command(&p);
        let forward_idx = args.iter().position(|a| a == "-R").unwrap();
        assert_eq!(args[forward_idx + 1], "myapp:0:127.0.0.1:3000");
    }

    #[test]
    fn transcript_url_is_captured() {
        let transcript = "\
connecting to cicd.eu1.asd.engineer:2222\n\
press Ctrl-C to close the session\n\
HTTP: https://myapp-fkmc.cicd.eu1.asd.engineer\n";
        assert_eq!(
            parse_public_url(transcript).as_deref(),
            Some("https://myapp-fkmc.cicd.eu1.asd.engineer")
        );
        assert_eq!(parse_public_url("no url here"), None);
    }
}
