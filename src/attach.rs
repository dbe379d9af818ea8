use std::{io, path::Path};

use anyhow::Context;

use crate::protocol;

/// Attach to a companion's output stream: history replay followed by
/// live lines until the companion dies or we hang up.
pub fn run(
    socket: &Path,
    alias: &str,
    name: &str,
    lines: Option<usize>,
    no_history: bool,
) -> anyhow::Result<()> {
    protocol::ensure_daemon_running(socket).context("bringing up daemon")?;
    protocol::check_version_mismatch(socket);

    let mut verb = format!("COMPANION_ATTACH {alias} {name}");
    if let Some(n) = lines {
        verb.push_str(&format!(" {n}"));
    }
    if no_history {
        verb.push_str(" no_history");
    }

    protocol::stream_raw(socket, &verb, &mut io::stdout())
}
