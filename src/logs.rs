use std::{io, path::Path};

use anyhow::Context;

use crate::protocol;

/// Stream the daemon's own log lines. `follow` distinguishes the
/// ATTACH verb (used by the interactive attach view) from LOGS; the
/// daemon treats them the same.
pub fn run(
    socket: &Path,
    lines: Option<usize>,
    no_history: bool,
    follow: bool,
) -> anyhow::Result<()> {
    protocol::ensure_daemon_running(socket).context("bringing up daemon")?;
    protocol::check_version_mismatch(socket);

    let mut verb = String::from(if follow { "ATTACH" } else { "LOGS" });
    if let Some(n) = lines {
        verb.push_str(&format!(" {n}"));
    }
    if no_history {
        verb.push_str(" no_history");
    }

    protocol::stream_raw(socket, &verb, &mut io::stdout())
}
