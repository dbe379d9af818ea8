//! The ssh subprocess as a black box: resolving the effective host
//! configuration with `ssh -G`, building the tunnel command line, and
//! classifying the verbose stderr stream into the three events the
//! tunnel state machine cares about.

use std::{
    collections::HashMap,
    env,
    process::{Command, Stdio},
};

use anyhow::{bail, Context};

use crate::consts;

/// The effective destination for an alias after ssh config resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedHost {
    pub hostname: String,
    pub port: Option<u16>,
    /// Ordered intermediate hops, empty for a direct connection.
    pub jump_chain: Vec<String>,
}

/// Ask ssh for the effective config of `alias` and pull out the
/// directives we care about. `ssh -G` flattens Include/Match logic for
/// us, so a plain line scan is enough.
pub fn resolve(
    alias: &str,
    ssh_config_file: Option<&str>,
    environment: &HashMap<String, String>,
) -> anyhow::Result<ResolvedHost> {
    let mut cmd = Command::new("ssh");
    cmd.arg("-G");
    if let Some(f) = ssh_config_file {
        cmd.arg("-F").arg(f);
    }
    cmd.arg(alias).envs(environment).stdin(Stdio::null());

    let output = cmd.output().context("running ssh -G")?;
    if !output.status.success() {
        bail!(
            "ssh -G {} failed: {}",
            alias,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(parse_directives(&String::from_utf8_lossy(&output.stdout)))
}

/// Scan `ssh -G` output for hostname / port / proxyjump directives.
pub fn parse_directives(text: &str) -> ResolvedHost {
    let mut resolved = ResolvedHost::default();
    for line in text.lines() {
        let mut words = line.split_ascii_whitespace();
        let Some(key) = words.next() else { continue };
        let value = words.collect::<Vec<_>>().join(" ");
        match key.to_ascii_lowercase().as_str() {
            "hostname" => resolved.hostname = value,
            "port" => resolved.port = value.parse().ok(),
            "proxyjump" if !value.is_empty() && value != "none" => {
                resolved.jump_chain =
                    value.split(',').map(|h| String::from(h.trim())).collect();
            }
            _ => {}
        }
    }
    resolved
}

/// Build the long-running tunnel command for an alias.
///
/// The child runs `-N` (no remote command), carries our marker option
/// so adoption and the orphan sweep can find it in the process table,
/// fails fast when a requested forward cannot be established, and runs
/// verbose so the stderr parser has events to chew on. SSH_ASKPASS
/// points back at our own binary so password prompts route through the
/// daemon instead of a missing tty.
pub fn tunnel_command(
    alias: &str,
    environment: &HashMap<String, String>,
    ssh_config_file: Option<&str>,
    askpass_token: &str,
    config_dir: &std::path::Path,
) -> anyhow::Result<Command> {
    let own_exe = env::current_exe().context("resolving the overseer binary for askpass")?;

    let mut cmd = Command::new("ssh");
    cmd.arg(alias)
        .arg("-N")
        .arg("-o")
        .arg(consts::SSH_IGNORE_UNKNOWN_OPT)
        .arg("-o")
        .arg(consts::SSH_MARKER_OPT)
        .arg("-o")
        .arg("ExitOnForwardFailure=yes")
        .arg("-v");
    if let Some(f) = ssh_config_file {
        cmd.arg("-F").arg(f);
    }
    cmd.envs(environment)
        .env("SSH_ASKPASS", own_exe)
        .env(consts::ALIAS_VAR, alias)
        .env(consts::ASKPASS_TOKEN_VAR, askpass_token)
        .env(consts::CONFIG_DIR_VAR, config_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    Ok(cmd)
}

/// The semantic events the tunnel state machine reacts to. The exact
/// stderr phrasings vary across OpenSSH versions; the matchers live
/// here so a new phrasing is a one-line change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshEvent {
    /// Forwards are up and the session is live.
    Ready,
    AuthFailure,
    ForwardFailure,
}

pub fn classify_stderr_line(line: &str) -> Option<SshEvent> {
    if line.contains("Entering interactive session") {
        return Some(SshEvent::Ready);
    }
    if line.contains("Permission denied")
        || line.contains("No more authentication methods to try")
    {
        return Some(SshEvent::AuthFailure);
    }
    if line.contains("remote port forwarding failed")
        || line.contains("cannot listen to port")
        || line.contains("Could not request local forwarding")
        || line.contains("forwarding failed")
    {
        return Some(SshEvent::ForwardFailure);
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_direct_host() {
        let out = "\
user testuser
hostname 127.0.0.1
port 22
addressfamily any
";
        let resolved = parse_directives(out);
        assert_eq!(resolved.hostname, "127.0.0.1");
        assert_eq!(resolved.port, Some(22));
        assert!(resolved.jump_chain.is_empty());
    }

    #[test]
    fn parses_jump_chain() {
        let out = "\
hostname internal.example.com
proxyjump bastion1, bastion2
port 2222
";
        let resolved = parse_directives(out);
        assert_eq!(resolved.hostname, "internal.example.com");
        assert_eq!(resolved.port, Some(2222));
        assert_eq!(resolved.jump_chain, vec!["bastion1", "bastion2"]);
    }

    #[test]
    fn proxyjump_none_is_direct() {
        let resolved = parse_directives("hostname h\nproxyjump none\n");
        assert!(resolved.jump_chain.is_empty());
    }

    #[test]
    fn classifies_readiness() {
        assert_eq!(
            classify_stderr_line("debug1: Entering interactive session."),
            Some(SshEvent::Ready)
        );
    }

    #[test]
    fn classifies_auth_failures() {
        assert_eq!(
            classify_stderr_line("testuser@127.0.0.1: Permission denied (publickey,password)."),
            Some(SshEvent::AuthFailure)
        );
        assert_eq!(
            classify_stderr_line("debug1: No more authentication methods to try."),
            Some(SshEvent::AuthFailure)
        );
    }

    #[test]
    fn classifies_forward_failures() {
        assert_eq!(
            classify_stderr_line("Error: remote port forwarding failed for listen port 8080"),
            Some(SshEvent::ForwardFailure)
        );
        assert_eq!(
            classify_stderr_line(
                "channel_setup_fwd_listener_tcpip: cannot listen to port: 3000"
            ),
            Some(SshEvent::ForwardFailure)
        );
    }

    #[test]
    fn ignores_debug_noise() {
        assert_eq!(classify_stderr_line("debug1: Connecting to 127.0.0.1 port 22."), None);
        assert_eq!(classify_stderr_line("debug1: Authentication succeeded (publickey)."), None);
        assert_eq!(classify_stderr_line(""), None);
    }
}
