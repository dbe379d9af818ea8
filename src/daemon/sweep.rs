//! Startup sweep for ssh processes carrying our marker option that no
//! adopted tunnel claimed. A daemon that crashed mid-write can leave
//! such strays behind, and a stray holds the forwarded ports hostage.

use std::{collections::HashSet, fs};

use tracing::{info, warn};

use super::{state, tunnel};
use crate::consts;

/// Scan the process table and terminate unclaimed marker-carrying ssh
/// processes. Returns how many were swept.
pub fn sweep_orphans(adopted: &HashSet<libc::pid_t>) -> usize {
    let own_pid = std::process::id() as libc::pid_t;
    let mut swept = 0;

    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(err) => {
            warn!("cannot scan /proc for orphans: {:?}", err);
            return 0;
        }
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<libc::pid_t>().ok())
        else {
            continue;
        };
        if pid == own_pid || adopted.contains(&pid) {
            continue;
        }
        let Some(cmdline) = state::process_cmdline(pid) else { continue };
        if !is_marked_ssh(&cmdline) {
            continue;
        }

        info!("sweeping orphaned ssh process {} ({})", pid, cmdline.join(" "));
        match tunnel::graceful_terminate(pid, consts::GRACE_TIMEOUT, "orphaned ssh") {
            Ok(()) => swept += 1,
            Err(err) => warn!("sweeping orphan {}: {:?}", pid, err),
        }
    }
    swept
}

fn is_marked_ssh(cmdline: &[String]) -> bool {
    let is_ssh = cmdline.first().map(|a| a.contains("ssh")).unwrap_or(false);
    is_ssh && cmdline.iter().any(|a| a == consts::SSH_MARKER_OPT)
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| String::from(*s)).collect()
    }

    #[test]
    fn recognizes_marked_ssh() {
        assert!(is_marked_ssh(&args(&[
            "ssh",
            "webdev",
            "-N",
            "-o",
            "overseer-daemon=true",
        ])));
        assert!(is_marked_ssh(&args(&[
            "/usr/bin/ssh",
            "-o",
            "overseer-daemon=true",
            "host",
        ])));
    }

    #[test]
    fn ignores_unmarked_and_non_ssh() {
        assert!(!is_marked_ssh(&args(&["ssh", "somehost"])));
        assert!(!is_marked_ssh(&args(&["vim", "overseer-daemon=true"])));
        assert!(!is_marked_ssh(&args(&[])));
    }
}
