use std::path::Path;

use anyhow::{anyhow, bail};

use crate::protocol;

pub fn run(socket: &Path, alias: Option<String>, all: bool) -> anyhow::Result<()> {
    let verb = match (&alias, all) {
        (_, true) => String::from("STOP_ALL"),
        (Some(alias), false) => format!("STOP {alias}"),
        (None, false) => bail!("an alias (or --all) is required"),
    };

    // a missing daemon means there is nothing to stop
    if protocol::send_with_timeout(socket, "STATUS", crate::consts::PROBE_TIMEOUT).is_err() {
        eprintln!("daemon is not running");
        return Ok(());
    }

    let saw_error = protocol::send_streaming(socket, &verb)?;
    if saw_error {
        return Err(anyhow!("stop failed"));
    }
    Ok(())
}
