use std::path::Path;

use anyhow::{anyhow, Context};

use crate::protocol;

pub fn run(socket: &Path, alias: &str, env: &[String]) -> anyhow::Result<()> {
    protocol::ensure_daemon_running(socket).context("bringing up daemon")?;
    protocol::check_version_mismatch(socket);

    let mut verb = format!("SSH_CONNECT {alias}");
    for kv in env {
        verb.push_str(&format!(" --env={kv}"));
    }

    let saw_error = protocol::send_streaming(socket, &verb)?;
    if saw_error {
        return Err(anyhow!("failed to start tunnel '{alias}'"));
    }
    Ok(())
}
