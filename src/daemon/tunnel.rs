//! The tunnel table and its lifecycle state machine. Each tunnel is
//! one long-running ssh child plus the bookkeeping needed to watch it,
//! reconnect it, and tear it down together with its companions.

use std::{
    collections::HashMap,
    io::{BufRead, BufReader},
    os::unix::process::CommandExt,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread, time,
};

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use crossbeam_channel::RecvTimeoutError;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    exit_notify::{ExitNotifier, EXIT_UNKNOWN},
    ssh::{self, SshEvent},
    Daemon,
};
use crate::{consts, protocol::Status};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelState::Connecting => "connecting",
            TunnelState::Connected => "connected",
            TunnelState::Reconnecting => "reconnecting",
            TunnelState::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// One supervised ssh child. The waitable process handle is owned by
/// the monitor thread, not stored here; adopted tunnels have no handle
/// anywhere and are watched with signal-0 polls instead.
#[derive(Debug)]
pub struct Tunnel {
    pub alias: String,
    pub hostname: String,
    pub resolved_host: String,
    pub jump_chain: Vec<String>,
    pub pid: libc::pid_t,
    pub state: TunnelState,
    pub start_date: DateTime<Utc>,
    pub last_connected_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub total_reconnects: u32,
    pub auto_reconnect: bool,
    pub environment: HashMap<String, String>,
    pub cmdline: Vec<String>,
    /// Set by the stop path; monitors check it before reconnecting.
    pub cancel: Arc<AtomicBool>,
    /// Signaled by the monitor when the current ssh child goes away.
    pub exit_notifier: Arc<ExitNotifier>,
    pub adopted: bool,
}

/// The snapshot shape handed back by the STATUS verb.
#[derive(Serialize, Debug, Clone)]
pub struct TunnelSnapshot {
    pub alias: String,
    pub hostname: String,
    pub resolved_host: String,
    pub jump_chain: Vec<String>,
    pub pid: libc::pid_t,
    pub state: TunnelState,
    pub start_date: DateTime<Utc>,
    pub last_connected_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub total_reconnects: u32,
    pub auto_reconnect: bool,
}

/// Where streaming handlers push their progress lines. The reconnect
/// path runs with no client attached and uses the log-only impl.
pub trait ProgressSink {
    fn emit(&mut self, status: Status, message: &str);
}

enum PumpEvent {
    Ssh(SshEvent),
    Eof,
}

impl Daemon {
    /// Bring a tunnel up and wait for the forward to establish. On
    /// success the entry is Connected and its companions are starting;
    /// on failure no entry remains.
    pub fn start_tunnel(
        self: &Arc<Self>,
        alias: &str,
        extra_env: &HashMap<String, String>,
        sink: &mut dyn ProgressSink,
    ) -> anyhow::Result<()> {
        {
            let registry = self.registry.lock().unwrap();
            if registry.tunnels.contains_key(alias) {
                bail!("tunnel '{alias}' is already running");
            }
        }

        let tunnel_config = self.config.tunnel(alias);
        let mut environment = self.config.env.clone().unwrap_or_default();
        if let Some(env) = &tunnel_config.env {
            environment.extend(env.clone());
        }
        environment.extend(extra_env.clone());

        sink.emit(Status::Info, &format!("Resolving configuration for {alias}"));
        let resolved =
            ssh::resolve(alias, self.config.ssh_config_file.as_deref(), &environment)?;
        if !resolved.jump_chain.is_empty() {
            sink.emit(
                Status::Info,
                &format!("Connecting via {}", resolved.jump_chain.join(" -> ")),
            );
        }

        let tunnel = Tunnel {
            alias: String::from(alias),
            hostname: String::from(alias),
            resolved_host: resolved.hostname,
            jump_chain: resolved.jump_chain,
            pid: 0,
            state: TunnelState::Connecting,
            start_date: Utc::now(),
            last_connected_time: None,
            retry_count: 0,
            total_reconnects: 0,
            auto_reconnect: tunnel_config.auto_reconnect.unwrap_or(true),
            environment,
            cmdline: vec![],
            cancel: Arc::new(AtomicBool::new(false)),
            exit_notifier: Arc::new(ExitNotifier::new()),
            adopted: false,
        };
        {
            // re-check: the lock was dropped while ssh -G ran
            let mut registry = self.registry.lock().unwrap();
            if registry.tunnels.contains_key(alias) {
                bail!("tunnel '{alias}' is already running");
            }
            registry.tunnels.insert(String::from(alias), tunnel);
        }

        sink.emit(Status::Info, &format!("Starting ssh for {alias}"));
        match self.connect_blocking(alias) {
            Ok(()) => {
                self.mark_connected(alias);
                self.start_companions_for(alias);
                sink.emit(Status::Info, "Connected");
                Ok(())
            }
            Err(err) => {
                {
                    let mut registry = self.registry.lock().unwrap();
                    registry.tunnels.remove(alias);
                }
                self.tokens.remove(alias);
                self.persist_state();
                Err(err)
            }
        }
    }

    /// Spawn the ssh child for an existing Connecting entry and block
    /// until the stderr parser reports an outcome. On Ready the child
    /// is handed off to a monitor thread and this returns Ok.
    fn connect_blocking(self: &Arc<Self>, alias: &str) -> anyhow::Result<()> {
        let environment = {
            let registry = self.registry.lock().unwrap();
            let tunnel = registry
                .tunnels
                .get(alias)
                .ok_or_else(|| anyhow!("tunnel '{alias}' went away"))?;
            tunnel.environment.clone()
        };

        let token = self.tokens.mint(alias);
        let mut cmd = ssh::tunnel_command(
            alias,
            &environment,
            self.config.ssh_config_file.as_deref(),
            &token,
            &self.config_dir,
        )?;
        // the child leads its own process group so teardown can signal
        // the whole tree
        cmd.process_group(0);

        let cmdline: Vec<String> = std::iter::once(cmd.get_program())
            .chain(cmd.get_args())
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let mut child = cmd.spawn().context("spawning ssh")?;
        let pid = child.id() as libc::pid_t;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("ssh child has no stderr pipe"))?;

        {
            let mut registry = self.registry.lock().unwrap();
            let Some(tunnel) = registry.tunnels.get_mut(alias) else {
                drop(registry);
                self.reap_failed(child, pid, alias);
                bail!("tunnel '{alias}' was stopped during spawn");
            };
            tunnel.pid = pid;
            tunnel.cmdline = cmdline;
            tunnel.state = TunnelState::Connecting;
            tunnel.exit_notifier = Arc::new(ExitNotifier::new());
        }
        debug!("tunnel '{}' spawned ssh pid {}", alias, pid);

        let (event_tx, event_rx) = crossbeam_channel::bounded(1);
        let pump_alias = String::from(alias);
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            let mut sent = false;
            for line in reader.lines() {
                let Ok(line) = line else { break };
                debug!("ssh[{}]: {}", pump_alias, line);
                if !sent {
                    if let Some(event) = ssh::classify_stderr_line(&line) {
                        sent = true;
                        let _ = event_tx.try_send(PumpEvent::Ssh(event));
                    }
                }
            }
            // stderr EOF means the child is gone or going
            let _ = event_tx.try_send(PumpEvent::Eof);
        });

        match event_rx.recv_timeout(consts::CONNECT_TIMEOUT) {
            Ok(PumpEvent::Ssh(SshEvent::Ready)) => {
                let daemon = Arc::clone(self);
                let monitor_alias = String::from(alias);
                thread::spawn(move || daemon.monitor_child(monitor_alias, child));
                Ok(())
            }
            Ok(PumpEvent::Ssh(SshEvent::AuthFailure)) => {
                self.reap_failed(child, pid, alias);
                bail!("authentication failed")
            }
            Ok(PumpEvent::Ssh(SshEvent::ForwardFailure)) => {
                self.reap_failed(child, pid, alias);
                bail!("port forwarding failed")
            }
            Ok(PumpEvent::Eof) | Err(RecvTimeoutError::Disconnected) => {
                let status = child.wait().context("reaping dead ssh child")?;
                bail!("ssh exited before the session came up ({status})")
            }
            Err(RecvTimeoutError::Timeout) => {
                self.reap_failed(child, pid, alias);
                bail!("timed out waiting for ssh to connect")
            }
        }
    }

    fn reap_failed(&self, mut child: process::Child, pid: libc::pid_t, alias: &str) {
        if let Err(err) = graceful_terminate(pid, consts::GRACE_TIMEOUT, alias) {
            warn!("terminating failed ssh child for '{}': {:?}", alias, err);
        }
        let _ = child.wait();
    }

    pub(crate) fn mark_connected(&self, alias: &str) {
        {
            let mut registry = self.registry.lock().unwrap();
            if let Some(tunnel) = registry.tunnels.get_mut(alias) {
                tunnel.state = TunnelState::Connected;
                tunnel.last_connected_time = Some(Utc::now());
                tunnel.retry_count = 0;
            }
        }
        info!("tunnel '{}' connected", alias);
        self.persist_state();
    }

    /// Wait-based monitor for children we forked ourselves.
    fn monitor_child(self: Arc<Self>, alias: String, mut child: process::Child) {
        let code = match child.wait() {
            Ok(status) => status.code().unwrap_or(EXIT_UNKNOWN),
            Err(err) => {
                warn!("waiting on ssh child for '{}': {:?}", alias, err);
                EXIT_UNKNOWN
            }
        };
        info!("tunnel '{}' ssh child exited with code {}", alias, code);
        self.on_child_exit(&alias, code);
    }

    /// Shared exit path for wait-based and poll-based monitors:
    /// either hand the tunnel to the reconnect loop or tear it down.
    pub(crate) fn on_child_exit(self: &Arc<Self>, alias: &str, code: i32) {
        let max_retries = self
            .config
            .tunnel(alias)
            .max_retries
            .unwrap_or(consts::RECONNECT_MAX_RETRIES);
        let (cancelled, notifier, reconnect) = {
            let mut registry = self.registry.lock().unwrap();
            let Some(tunnel) = registry.tunnels.get_mut(alias) else { return };
            let cancelled = tunnel.cancel.load(Ordering::SeqCst);
            tunnel.pid = 0;
            let reconnect =
                !cancelled && tunnel.auto_reconnect && tunnel.retry_count < max_retries;
            (cancelled, Arc::clone(&tunnel.exit_notifier), reconnect)
        };
        notifier.notify_exit(code);
        if cancelled {
            // the stop path owns the rest of the cleanup
            return;
        }
        if reconnect {
            self.reconnect_loop(alias, max_retries);
        } else {
            self.teardown_tunnel(alias, "ssh child exited");
        }
    }

    /// Reconnect with exponential backoff until the tunnel comes back,
    /// the retry cap is hit, or someone stops it. Runs on the
    /// monitor thread of the child that just died.
    fn reconnect_loop(self: &Arc<Self>, alias: &str, max_retries: u32) {
        // companions go down with the child, but their history stays
        // so attach clients can resubscribe across the gap
        self.stop_companions_for(alias, true);

        loop {
            let (retry, cancel) = {
                let mut registry = self.registry.lock().unwrap();
                let Some(tunnel) = registry.tunnels.get_mut(alias) else { return };
                if tunnel.cancel.load(Ordering::SeqCst) {
                    return;
                }
                tunnel.state = TunnelState::Reconnecting;
                tunnel.retry_count += 1;
                tunnel.total_reconnects += 1;
                tunnel.pid = 0;
                (tunnel.retry_count, Arc::clone(&tunnel.cancel))
            };
            self.persist_state();

            let backoff = reconnect_backoff(retry);
            info!(
                "tunnel '{}' reconnect attempt {}/{} in {:?}",
                alias, retry, max_retries, backoff
            );
            let deadline = time::Instant::now() + backoff;
            while time::Instant::now() < deadline {
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                thread::sleep(consts::LIVENESS_POLL);
            }

            {
                let mut registry = self.registry.lock().unwrap();
                let Some(tunnel) = registry.tunnels.get_mut(alias) else { return };
                if tunnel.cancel.load(Ordering::SeqCst) {
                    return;
                }
                tunnel.state = TunnelState::Connecting;
            }

            match self.connect_blocking(alias) {
                Ok(()) => {
                    self.mark_connected(alias);
                    self.start_companions_for(alias);
                    info!("tunnel '{}' reconnected", alias);
                    return;
                }
                Err(err) => {
                    warn!(
                        "tunnel '{}' reconnect attempt {} failed: {:#}",
                        alias, retry, err
                    );
                    if retry >= max_retries {
                        self.teardown_tunnel(alias, "reconnect retries exhausted");
                        return;
                    }
                }
            }
        }
    }

    /// Stop a tunnel: signal the ssh process group, stop companions,
    /// drop the entry. With `for_reconnect` the companion entries and
    /// their histories survive for resubscribe.
    pub fn stop_tunnel(self: &Arc<Self>, alias: &str, for_reconnect: bool) -> anyhow::Result<()> {
        let grace = self
            .config
            .tunnel(alias)
            .grace_timeout_ms
            .map(time::Duration::from_millis)
            .unwrap_or(consts::GRACE_TIMEOUT);
        let (pid, notifier) = {
            let mut registry = self.registry.lock().unwrap();
            let Some(tunnel) = registry.tunnels.get_mut(alias) else {
                bail!("tunnel '{alias}' is not running");
            };
            tunnel.cancel.store(true, Ordering::SeqCst);
            tunnel.state = TunnelState::Disconnected;
            (tunnel.pid, Arc::clone(&tunnel.exit_notifier))
        };

        // all of the waiting happens outside the lock
        if pid > 0 {
            graceful_terminate(pid, grace, alias)?;
            // give the monitor a moment to observe the exit
            let _ = notifier.wait(Some(grace));
        }
        self.stop_companions_for(alias, for_reconnect);

        {
            let mut registry = self.registry.lock().unwrap();
            registry.tunnels.remove(alias);
            if !for_reconnect {
                registry.companions.retain(|(a, _), _| a != alias);
            }
        }
        self.tokens.remove(alias);
        self.persist_state();
        info!("tunnel '{}' stopped", alias);
        Ok(())
    }

    /// Forced reconnect (the SSH_RECONNECT verb): tear the child down
    /// keeping companion history, then run the start protocol again.
    pub fn reconnect_tunnel(
        self: &Arc<Self>,
        alias: &str,
        sink: &mut dyn ProgressSink,
    ) -> anyhow::Result<()> {
        let (environment, total_reconnects) = {
            let registry = self.registry.lock().unwrap();
            let Some(tunnel) = registry.tunnels.get(alias) else {
                bail!("tunnel '{alias}' is not running");
            };
            (tunnel.environment.clone(), tunnel.total_reconnects)
        };
        sink.emit(Status::Info, &format!("Reconnecting {alias}"));
        self.stop_tunnel(alias, true)?;
        self.start_tunnel(alias, &environment, sink)?;
        {
            let mut registry = self.registry.lock().unwrap();
            if let Some(tunnel) = registry.tunnels.get_mut(alias) {
                tunnel.total_reconnects = total_reconnects + 1;
            }
        }
        self.persist_state();
        Ok(())
    }

    /// Remove a tunnel the monitor gave up on: companions stopped and
    /// dropped, entry gone, state persisted.
    fn teardown_tunnel(self: &Arc<Self>, alias: &str, reason: &str) {
        info!("removing tunnel '{}': {}", alias, reason);
        self.stop_companions_for(alias, false);
        {
            let mut registry = self.registry.lock().unwrap();
            registry.tunnels.remove(alias);
            registry.companions.retain(|(a, _), _| a != alias);
        }
        self.tokens.remove(alias);
        self.persist_state();
    }

    pub fn status_data(&self) -> Vec<TunnelSnapshot> {
        let registry = self.registry.lock().unwrap();
        let mut snapshots: Vec<TunnelSnapshot> = registry
            .tunnels
            .values()
            .map(|t| TunnelSnapshot {
                alias: t.alias.clone(),
                hostname: t.hostname.clone(),
                resolved_host: t.resolved_host.clone(),
                jump_chain: t.jump_chain.clone(),
                pid: t.pid,
                state: t.state,
                start_date: t.start_date,
                last_connected_time: t.last_connected_time,
                retry_count: t.retry_count,
                total_reconnects: t.total_reconnects,
                auto_reconnect: t.auto_reconnect,
            })
            .collect();
        snapshots.sort_by(|a, b| a.alias.cmp(&b.alias));
        snapshots
    }

    pub fn tunnel_aliases(&self) -> Vec<String> {
        let registry = self.registry.lock().unwrap();
        let mut aliases: Vec<String> = registry.tunnels.keys().cloned().collect();
        aliases.sort();
        aliases
    }
}

/// TERM the process group, poll liveness with a null signal, then
/// KILL. A target that never existed or is already reaped is fine.
pub fn graceful_terminate(
    pid: libc::pid_t,
    timeout: time::Duration,
    label: &str,
) -> anyhow::Result<()> {
    terminate_with(pid, Signal::SIGTERM, timeout, label, true)
}

/// Signal escalation shared by tunnels, companions and the orphan
/// sweep. `group` targets the process group instead of the single pid
/// (adopted companions are signaled directly).
pub(crate) fn terminate_with(
    pid: libc::pid_t,
    sig: Signal,
    timeout: time::Duration,
    label: &str,
    group: bool,
) -> anyhow::Result<()> {
    let target = Pid::from_raw(if group { -pid } else { pid });
    match signal::kill(target, sig) {
        Err(Errno::ESRCH) => return Ok(()),
        Err(err) => return Err(err).context(format!("sending {sig} to {label}")),
        Ok(()) => {}
    }

    let deadline = time::Instant::now() + timeout;
    while time::Instant::now() < deadline {
        match signal::kill(target, None) {
            Err(Errno::ESRCH) => return Ok(()),
            _ => thread::sleep(consts::LIVENESS_POLL),
        }
    }

    info!("{} survived {} for {:?}, sending SIGKILL", label, sig, timeout);
    match signal::kill(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err).context(format!("sending SIGKILL to {label}")),
    }
}

/// Exponential backoff for reconnect attempt `retry` (1-based),
/// bounded by the cap.
pub(crate) fn reconnect_backoff(retry: u32) -> time::Duration {
    let shift = retry.saturating_sub(1).min(16);
    let backoff = consts::RECONNECT_BACKOFF_BASE.saturating_mul(1u32 << shift);
    backoff.min(consts::RECONNECT_BACKOFF_CAP)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(reconnect_backoff(1), time::Duration::from_secs(1));
        assert_eq!(reconnect_backoff(2), time::Duration::from_secs(2));
        assert_eq!(reconnect_backoff(3), time::Duration::from_secs(4));
        assert_eq!(reconnect_backoff(7), time::Duration::from_secs(60));
        assert_eq!(reconnect_backoff(100), consts::RECONNECT_BACKOFF_CAP);
    }

    #[test]
    fn terminate_of_absent_pid_is_ok() {
        // pid is valid but long gone; TERM gets ESRCH and we succeed
        graceful_terminate(i32::MAX - 1, time::Duration::from_millis(10), "ghost").unwrap();
    }

    #[test]
    fn states_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&TunnelState::Connected).unwrap(), "\"connected\"");
        assert_eq!(TunnelState::Reconnecting.to_string(), "reconnecting");
    }
}
