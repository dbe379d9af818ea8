use std::path::Path;

use anyhow::Context;

use crate::protocol;

pub fn run(socket: &Path) -> anyhow::Result<()> {
    protocol::ensure_daemon_running(socket).context("bringing up daemon")?;
    protocol::check_version_mismatch(socket);

    let resp = protocol::send(socket, "STATUS").context("querying status")?;
    for msg in &resp.messages {
        match msg.status {
            protocol::Status::Info => println!("{}", msg.message),
            protocol::Status::Warn => eprintln!("overseer: warn: {}", msg.message),
            protocol::Status::Error => eprintln!("overseer: error: {}", msg.message),
        }
    }

    let Some(tunnels) = resp.data.as_ref().and_then(|d| d.as_array()) else {
        return Ok(());
    };
    if tunnels.is_empty() {
        return Ok(());
    }

    println!("ALIAS\tSTATE\tPID\tHOST\tRECONNECTS");
    for t in tunnels {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            t["alias"].as_str().unwrap_or("?"),
            t["state"].as_str().unwrap_or("?"),
            t["pid"].as_i64().unwrap_or(0),
            t["resolved_host"].as_str().unwrap_or(""),
            t["total_reconnects"].as_u64().unwrap_or(0),
        );
    }
    Ok(())
}
