//! Snapshotting running tunnels to disk and adopting them back after
//! a daemon restart. The snapshot has everything needed to re-attach
//! to a surviving ssh child; it never contains askpass tokens.

use std::{
    collections::{HashMap, HashSet},
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use nix::{errno::Errno, sys::signal, unistd::Pid};
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    companion::{Companion, CompanionState},
    exit_notify::{ExitNotifier, EXIT_UNKNOWN},
    tunnel::{Tunnel, TunnelState},
    Daemon, Registry,
};
use crate::consts;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StateFile {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub tunnels: Vec<TunnelRecord>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TunnelRecord {
    pub pid: libc::pid_t,
    pub alias: String,
    pub hostname: String,
    pub cmdline: Vec<String>,
    pub start_date: DateTime<Utc>,
    pub last_connected_time: DateTime<Utc>,
    pub retry_count: u32,
    pub total_reconnects: u32,
    pub auto_reconnect: bool,
    pub state: TunnelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_chain: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub companions: Option<Vec<CompanionRecord>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompanionRecord {
    pub name: String,
    pub pid: libc::pid_t,
}

pub fn state_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(consts::STATE_FILE_NAME)
}

/// Build the persistable view of the registry. Tunnels without a live
/// pid are omitted; so are companions without one.
pub(crate) fn snapshot(registry: &Registry) -> Vec<TunnelRecord> {
    let mut records: Vec<TunnelRecord> = registry
        .tunnels
        .values()
        .filter(|t| t.pid > 0)
        .map(|t| {
            let companions: Vec<CompanionRecord> = registry
                .companions
                .iter()
                .filter(|((alias, _), c)| *alias == t.alias && c.pid > 0)
                .map(|((_, name), c)| CompanionRecord { name: name.clone(), pid: c.pid })
                .collect();
            TunnelRecord {
                pid: t.pid,
                alias: t.alias.clone(),
                hostname: t.hostname.clone(),
                cmdline: t.cmdline.clone(),
                start_date: t.start_date,
                last_connected_time: t.last_connected_time.unwrap_or(t.start_date),
                retry_count: t.retry_count,
                total_reconnects: t.total_reconnects,
                auto_reconnect: t.auto_reconnect,
                state: t.state,
                environment: if t.environment.is_empty() {
                    None
                } else {
                    Some(t.environment.clone())
                },
                resolved_host: if t.resolved_host.is_empty() {
                    None
                } else {
                    Some(t.resolved_host.clone())
                },
                jump_chain: if t.jump_chain.is_empty() {
                    None
                } else {
                    Some(t.jump_chain.clone())
                },
                companions: if companions.is_empty() { None } else { Some(companions) },
            }
        })
        .collect();
    records.sort_by(|a, b| a.alias.cmp(&b.alias));
    records
}

/// Write the snapshot atomically: temp file in the same directory,
/// mode 0600, then rename over the real path.
pub fn save(config_dir: &Path, records: Vec<TunnelRecord>) -> anyhow::Result<()> {
    let file = StateFile {
        version: String::from(consts::STATE_VERSION),
        timestamp: Utc::now(),
        tunnels: records,
    };

    let tmp = tempfile::NamedTempFile::new_in(config_dir)
        .context("creating state temp file")?;
    serde_json::to_writer_pretty(tmp.as_file(), &file).context("encoding state file")?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
        .context("restricting state file mode")?;
    tmp.persist(state_file_path(config_dir))
        .context("renaming state file into place")?;
    Ok(())
}

/// Read the snapshot back; an absent file is zero tunnels, not an
/// error.
pub fn load(config_dir: &Path) -> anyhow::Result<Option<StateFile>> {
    let path = state_file_path(config_dir);
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path).context("reading state file")?;
    let file: StateFile = serde_json::from_str(&text).context("parsing state file")?;
    Ok(Some(file))
}

/// Adopt every tunnel (and companion) in the state file whose process
/// is still alive and still looks like ours. Returns the set of
/// adopted pids so the orphan sweep can leave them alone.
///
/// Bad entries are logged and skipped; adoption never aborts startup.
pub fn restore(daemon: &Arc<Daemon>) -> HashSet<libc::pid_t> {
    let mut adopted = HashSet::new();
    let file = match load(&daemon.config_dir) {
        Ok(Some(file)) => file,
        Ok(None) => {
            info!("no state file, starting fresh");
            return adopted;
        }
        Err(err) => {
            warn!("unreadable state file, starting fresh: {:#}", err);
            return adopted;
        }
    };
    if file.version != consts::STATE_VERSION {
        warn!(
            "state file version '{}' does not match '{}', starting fresh",
            file.version,
            consts::STATE_VERSION
        );
        return adopted;
    }

    for record in file.tunnels {
        if let Err(reason) = validate_tunnel_record(&record) {
            warn!("skipping tunnel '{}': {}", record.alias, reason);
            continue;
        }
        info!("adopting tunnel '{}' with pid {}", record.alias, record.pid);

        let alias = record.alias.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let tunnel = Tunnel {
            alias: alias.clone(),
            hostname: record.hostname.clone(),
            resolved_host: record.resolved_host.clone().unwrap_or_default(),
            jump_chain: record.jump_chain.clone().unwrap_or_default(),
            pid: record.pid,
            state: TunnelState::Connected,
            start_date: record.start_date,
            last_connected_time: Some(record.last_connected_time),
            retry_count: record.retry_count,
            total_reconnects: record.total_reconnects,
            auto_reconnect: record.auto_reconnect,
            environment: record.environment.clone().unwrap_or_default(),
            cmdline: record.cmdline.clone(),
            cancel: Arc::clone(&cancel),
            exit_notifier: Arc::new(ExitNotifier::new()),
            adopted: true,
        };
        {
            let mut registry = daemon.registry.lock().unwrap();
            registry.tunnels.insert(alias.clone(), tunnel);
        }
        // tokens never hit the disk; adopted children get fresh ones
        daemon.tokens.mint(&alias);
        adopted.insert(record.pid);
        spawn_adopted_tunnel_monitor(daemon, alias.clone(), record.pid, cancel);

        for comp in record.companions.unwrap_or_default() {
            if adopt_companion(daemon, &alias, &comp) {
                adopted.insert(comp.pid);
            }
        }
    }

    daemon.persist_state();
    adopted
}

fn validate_tunnel_record(record: &TunnelRecord) -> Result<(), String> {
    if record.pid <= 0 {
        return Err(String::from("pid is not positive"));
    }
    if !pid_alive(record.pid) {
        return Err(format!("process {} is gone", record.pid));
    }
    let Some(cmdline) = process_cmdline(record.pid) else {
        return Err(format!("no command line available for {}", record.pid));
    };
    let is_ssh = cmdline.first().map(|a| a.contains("ssh")).unwrap_or(false);
    let has_marker = cmdline.iter().any(|a| a == consts::SSH_MARKER_OPT);
    let has_alias = cmdline.iter().any(|a| *a == record.alias);
    if !(is_ssh && has_marker && has_alias) {
        return Err(format!("process {} no longer looks like our ssh child", record.pid));
    }
    Ok(())
}

fn adopt_companion(daemon: &Arc<Daemon>, alias: &str, comp: &CompanionRecord) -> bool {
    if comp.pid <= 0 || !pid_alive(comp.pid) {
        info!("companion '{}/{}' did not survive, not adopting", alias, comp.name);
        return false;
    }
    let Some(config) = daemon.config.companion(alias, &comp.name) else {
        warn!(
            "companion '{}/{}' is alive but no longer configured, not adopting",
            alias, comp.name
        );
        return false;
    };
    info!("adopting companion '{}/{}' with pid {}", alias, comp.name, comp.pid);

    let mut entry = Companion::placeholder(alias, &comp.name, config);
    entry.pid = comp.pid;
    entry.state = CompanionState::Running;
    entry.adopted = true;
    {
        let mut registry = daemon.registry.lock().unwrap();
        registry
            .companions
            .insert((String::from(alias), String::from(&comp.name)), entry);
    }
    spawn_adopted_companion_monitor(daemon, String::from(alias), String::from(&comp.name), comp.pid);
    true
}

/// We cannot `wait` on a process we did not fork, so adopted children
/// get a poll monitor that turns disappearance into the same
/// child-exited event the wait-based monitor produces.
fn spawn_adopted_tunnel_monitor(
    daemon: &Arc<Daemon>,
    alias: String,
    pid: libc::pid_t,
    cancel: Arc<AtomicBool>,
) {
    let daemon = Arc::clone(daemon);
    thread::spawn(move || loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        {
            // stop polling once a reconnect swapped in a new child
            let registry = daemon.registry.lock().unwrap();
            match registry.tunnels.get(&alias) {
                Some(t) if t.pid == pid => {}
                _ => return,
            }
        }
        if !pid_alive(pid) {
            info!("adopted ssh child {} for '{}' is gone", pid, alias);
            daemon.on_child_exit(&alias, EXIT_UNKNOWN);
            return;
        }
        thread::sleep(consts::ADOPTED_POLL);
    });
}

fn spawn_adopted_companion_monitor(
    daemon: &Arc<Daemon>,
    alias: String,
    name: String,
    pid: libc::pid_t,
) {
    let daemon = Arc::clone(daemon);
    thread::spawn(move || loop {
        {
            let registry = daemon.registry.lock().unwrap();
            match registry.companions.get(&(alias.clone(), name.clone())) {
                Some(c) if c.pid == pid => {}
                _ => return,
            }
        }
        if !pid_alive(pid) {
            info!("adopted companion {} for '{}/{}' is gone", pid, alias, name);
            daemon.on_companion_exit(&alias, &name, EXIT_UNKNOWN);
            return;
        }
        thread::sleep(consts::ADOPTED_POLL);
    });
}

/// signal-0 liveness probe. EPERM still means "exists".
pub fn pid_alive(pid: libc::pid_t) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Read a process's argv from the OS process table.
pub fn process_cmdline(pid: libc::pid_t) -> Option<Vec<String>> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    if args.is_empty() {
        None
    } else {
        Some(args)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(alias: &str, pid: libc::pid_t) -> TunnelRecord {
        TunnelRecord {
            pid,
            alias: String::from(alias),
            hostname: String::from(alias),
            cmdline: vec![
                String::from("ssh"),
                String::from(alias),
                String::from("-N"),
                String::from("-o"),
                String::from(consts::SSH_MARKER_OPT),
            ],
            start_date: Utc::now(),
            last_connected_time: Utc::now(),
            retry_count: 0,
            total_reconnects: 2,
            auto_reconnect: true,
            state: TunnelState::Connected,
            environment: None,
            resolved_host: Some(String::from("127.0.0.1")),
            jump_chain: None,
            companions: Some(vec![CompanionRecord { name: String::from("web"), pid: 1234 }]),
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), vec![record("webdev", 4321)]).unwrap();

        let file = load(dir.path()).unwrap().unwrap();
        assert_eq!(file.version, consts::STATE_VERSION);
        assert_eq!(file.tunnels.len(), 1);
        let t = &file.tunnels[0];
        assert_eq!(t.alias, "webdev");
        assert_eq!(t.pid, 4321);
        assert_eq!(t.state, TunnelState::Connected);
        assert_eq!(t.companions.as_ref().unwrap()[0].name, "web");
    }

    #[test]
    fn state_file_mode_is_0600() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), vec![]).unwrap();
        let mode = fs::metadata(state_file_path(dir.path())).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn load_of_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn optional_fields_stay_off_the_wire() {
        let mut r = record("webdev", 10);
        r.environment = None;
        r.jump_chain = None;
        r.companions = None;
        let wire = serde_json::to_string(&r).unwrap();
        assert!(!wire.contains("environment"));
        assert!(!wire.contains("jump_chain"));
        assert!(!wire.contains("companions"));
        // and parsing a record without them works
        let back: TunnelRecord = serde_json::from_str(&wire).unwrap();
        assert!(back.companions.is_none());
    }

    #[test]
    fn validation_rejects_dead_and_mismatched_pids() {
        // a pid that can't exist
        let dead = record("webdev", i32::MAX - 1);
        assert!(validate_tunnel_record(&dead).is_err());

        // our own pid is alive but is not an ssh process
        let own = record("webdev", std::process::id() as libc::pid_t);
        assert!(validate_tunnel_record(&own).is_err());
    }

    #[test]
    fn own_process_probes() {
        let own = std::process::id() as libc::pid_t;
        assert!(pid_alive(own));
        let cmdline = process_cmdline(own).unwrap();
        assert!(!cmdline.is_empty());
    }
}
