//! Companion processes: helpers that run for the lifetime of a tunnel
//! (mounts, local servers, watchers). Each companion owns a log
//! broadcaster that outlives the process so attach clients can replay
//! output after it dies.

use std::{
    collections::hash_map::Entry,
    io::{BufRead, BufReader, Read, Write},
    os::unix::{net::UnixStream, process::CommandExt},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread, time,
};

use anyhow::{bail, Context};
use crossbeam_channel::RecvTimeoutError;
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use super::{
    askpass,
    exit_notify::{ExitNotifier, EXIT_UNKNOWN},
    tunnel::{terminate_with, TunnelState},
    Daemon,
};
use crate::{
    broadcast::Broadcaster,
    config::{CompanionConfig, RestartPolicy},
    consts,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionState {
    Dormant,
    Starting,
    Running,
    Ready,
    Stopped,
    Failed,
}

impl std::fmt::Display for CompanionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompanionState::Dormant => "dormant",
            CompanionState::Starting => "starting",
            CompanionState::Running => "running",
            CompanionState::Ready => "ready",
            CompanionState::Stopped => "stopped",
            CompanionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
pub struct Companion {
    pub alias: String,
    pub name: String,
    pub config: CompanionConfig,
    pub pid: libc::pid_t,
    pub state: CompanionState,
    /// Outlives the process so attach clients can replay history
    /// after it dies. Cleared on stop.
    pub output: Arc<Broadcaster>,
    /// Fired when the process exits; attach streams wait on it. A
    /// done notifier on a dead companion is swapped for a fresh one
    /// when an attach still wants to replay history.
    pub exit_notifier: Arc<ExitNotifier>,
    pub init_token: Option<String>,
    pub restarts: u32,
    pub adopted: bool,
}

impl Companion {
    pub fn placeholder(alias: &str, name: &str, config: CompanionConfig) -> Self {
        let history = config.history_size.unwrap_or(consts::DEFAULT_HISTORY_LINES);
        Companion {
            alias: String::from(alias),
            name: String::from(name),
            config,
            pid: 0,
            state: CompanionState::Dormant,
            output: Arc::new(Broadcaster::with_capacity(history)),
            exit_notifier: Arc::new(ExitNotifier::new()),
            init_token: None,
            restarts: 0,
            adopted: false,
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(
            self.state,
            CompanionState::Starting | CompanionState::Running | CompanionState::Ready
        )
    }
}

impl Daemon {
    /// Bring up every companion configured for a tunnel. Failures are
    /// logged, not propagated: one broken helper must not take the
    /// tunnel down with it.
    pub(crate) fn start_companions_for(self: &Arc<Self>, alias: &str) {
        for name in self.config.companion_names(alias) {
            if let Err(err) = self.start_companion(alias, &name) {
                warn!("starting companion '{}/{}': {:#}", alias, name, err);
            }
        }
    }

    pub fn start_companion(self: &Arc<Self>, alias: &str, name: &str) -> anyhow::Result<()> {
        let Some(config) = self.config.companion(alias, name) else {
            bail!("no companion '{name}' configured for '{alias}'");
        };

        let (output, init_token) = {
            let mut registry = self.registry.lock().unwrap();
            let entry = registry
                .companions
                .entry((String::from(alias), String::from(name)))
                .or_insert_with(|| Companion::placeholder(alias, name, config.clone()));
            if entry.is_up() {
                return Ok(());
            }
            entry.state = CompanionState::Starting;
            entry.adopted = false;
            entry.config = config.clone();
            entry.exit_notifier = Arc::new(ExitNotifier::new());
            entry.init_token = if config.init_protocol.unwrap_or(false) {
                Some(askpass::mint_token())
            } else {
                None
            };
            (Arc::clone(&entry.output), entry.init_token.clone())
        };

        let argv = shell_words::split(&config.command)
            .context("parsing companion command")?;
        if argv.is_empty() {
            self.set_companion_state(alias, name, CompanionState::Failed);
            bail!("companion '{alias}/{name}' has an empty command");
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .process_group(0)
            .env(consts::TUNNEL_VAR, alias)
            .env(consts::COMPANION_VAR, name)
            .env(consts::CONFIG_DIR_VAR, &self.config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(token) = &init_token {
            cmd.env(consts::COMPANION_TOKEN_VAR, token);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.set_companion_state(alias, name, CompanionState::Failed);
                return Err(err).context(format!("spawning companion '{alias}/{name}'"));
            }
        };
        let pid = child.id() as libc::pid_t;

        {
            let mut registry = self.registry.lock().unwrap();
            if let Some(entry) =
                registry.companions.get_mut(&(String::from(alias), String::from(name)))
            {
                entry.pid = pid;
                entry.state = CompanionState::Running;
            }
        }
        info!("companion '{}/{}' running as pid {}", alias, name, pid);

        if let Some(stdout) = child.stdout.take() {
            spawn_line_pump(stdout, Arc::clone(&output), alias, name, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_pump(stderr, Arc::clone(&output), alias, name, "stderr");
        }

        let daemon = Arc::clone(self);
        let monitor_alias = String::from(alias);
        let monitor_name = String::from(name);
        thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.code().unwrap_or(EXIT_UNKNOWN),
                Err(err) => {
                    warn!(
                        "waiting on companion '{}/{}': {:?}",
                        monitor_alias, monitor_name, err
                    );
                    EXIT_UNKNOWN
                }
            };
            daemon.on_companion_exit(&monitor_alias, &monitor_name, code);
        });

        Ok(())
    }

    fn set_companion_state(&self, alias: &str, name: &str, state: CompanionState) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(entry) =
            registry.companions.get_mut(&(String::from(alias), String::from(name)))
        {
            entry.state = state;
        }
    }

    /// Exit path shared by the wait-based monitor and the poll-based
    /// monitor of adopted companions. Applies the restart policy.
    pub(crate) fn on_companion_exit(self: &Arc<Self>, alias: &str, name: &str, code: i32) {
        let key = (String::from(alias), String::from(name));
        let failed = code != 0;
        let (notifier, restart) = {
            let mut registry = self.registry.lock().unwrap();
            let Some(entry) = registry.companions.get_mut(&key) else { return };
            let notifier = Arc::clone(&entry.exit_notifier);
            if entry.state == CompanionState::Stopped {
                // the stop path already did the bookkeeping
                (notifier, false)
            } else {
                entry.pid = 0;
                let max = entry.config.max_restarts.unwrap_or(consts::RESTART_MAX);
                let wants_restart = match entry.config.restart.unwrap_or_default() {
                    RestartPolicy::Always => true,
                    RestartPolicy::OnFailure => failed,
                    RestartPolicy::Never => false,
                };
                let restart = wants_restart && entry.restarts < max;
                entry.state = if failed && !restart {
                    CompanionState::Failed
                } else {
                    CompanionState::Stopped
                };
                if restart {
                    entry.restarts += 1;
                }
                (notifier, restart)
            }
        };
        notifier.notify_exit(code);
        info!("companion '{}/{}' exited with code {}", alias, name, code);

        if !restart {
            return;
        }

        let (attempt, backoff) = {
            let registry = self.registry.lock().unwrap();
            let Some(entry) = registry.companions.get(&key) else { return };
            (entry.restarts, restart_backoff(entry.restarts, &entry.config))
        };
        info!(
            "companion '{}/{}' restart attempt {} in {:?}",
            alias, name, attempt, backoff
        );
        let deadline = time::Instant::now() + backoff;
        while time::Instant::now() < deadline {
            thread::sleep(consts::LIVENESS_POLL);
            let registry = self.registry.lock().unwrap();
            match registry.companions.get(&key) {
                // a stop or tunnel teardown during the backoff wins
                Some(entry) if entry.state == CompanionState::Stopped && entry.pid == 0 => {}
                Some(_) | None => return,
            }
        }
        let tunnel_up = {
            let registry = self.registry.lock().unwrap();
            registry
                .tunnels
                .get(alias)
                .map(|t| t.state == TunnelState::Connected)
                .unwrap_or(false)
        };
        if !tunnel_up {
            // the tunnel is gone or mid-reconnect; its come-back path
            // starts companions itself
            return;
        }
        if let Err(err) = self.start_companion(alias, name) {
            warn!("restarting companion '{}/{}': {:#}", alias, name, err);
        }
    }

    /// Idempotent stop: signal the process (group), escalate after the
    /// grace period, clear history unless the tunnel is only bouncing.
    pub fn stop_companion(
        &self,
        alias: &str,
        name: &str,
        preserve_history: bool,
    ) -> anyhow::Result<()> {
        let key = (String::from(alias), String::from(name));
        let (pid, adopted, stop_signal, grace, output, notifier) = {
            let mut registry = self.registry.lock().unwrap();
            let Some(entry) = registry.companions.get_mut(&key) else {
                bail!("no companion '{alias}/{name}'");
            };
            let pid = entry.pid;
            let adopted = entry.adopted;
            let stop_signal = entry.config.stop_signal.clone();
            let grace = entry
                .config
                .grace_timeout_ms
                .map(time::Duration::from_millis)
                .unwrap_or(consts::GRACE_TIMEOUT);
            entry.state = CompanionState::Stopped;
            entry.pid = 0;
            entry.init_token = None;
            entry.restarts = 0;
            (
                pid,
                adopted,
                stop_signal,
                grace,
                Arc::clone(&entry.output),
                Arc::clone(&entry.exit_notifier),
            )
        };

        if pid > 0 {
            let sig = parse_signal(stop_signal.as_deref().unwrap_or("TERM"))?;
            let label = format!("companion {alias}/{name}");
            // adopted companions were not forked by us; signal the pid
            // directly rather than a process group we may not own
            terminate_with(pid, sig, grace, &label, !adopted)?;
        }
        if !preserve_history {
            output.clear_history();
        }
        notifier.notify_exit(EXIT_UNKNOWN);
        info!("companion '{}/{}' stopped", alias, name);
        Ok(())
    }

    /// Stop every companion belonging to a tunnel. Entry removal is
    /// the caller's business; it depends on whether the tunnel is
    /// going away or just reconnecting.
    pub(crate) fn stop_companions_for(self: &Arc<Self>, alias: &str, preserve_history: bool) {
        let names: Vec<String> = {
            let registry = self.registry.lock().unwrap();
            registry
                .companions
                .keys()
                .filter(|(a, _)| a == alias)
                .map(|(_, n)| n.clone())
                .collect()
        };
        for name in names {
            if let Err(err) = self.stop_companion(alias, &name, preserve_history) {
                warn!("stopping companion '{}/{}': {:#}", alias, name, err);
            }
        }
    }

    /// The COMPANION_INIT verb: a companion that opted into the init
    /// protocol calls back with the token we minted at spawn to flip
    /// Running -> Ready.
    pub fn companion_ready(&self, alias: &str, name: &str, token: &str) -> anyhow::Result<()> {
        let mut registry = self.registry.lock().unwrap();
        let Some(entry) =
            registry.companions.get_mut(&(String::from(alias), String::from(name)))
        else {
            bail!("no companion '{alias}/{name}'");
        };
        match &entry.init_token {
            Some(expected) if expected == token => {}
            _ => bail!("invalid companion init token"),
        }
        if entry.state != CompanionState::Running {
            bail!("companion '{alias}/{name}' is not running");
        }
        entry.state = CompanionState::Ready;
        info!("companion '{}/{}' reported ready", alias, name);
        Ok(())
    }

    /// The COMPANION_ATTACH verb: header, then history replay and/or a
    /// live stream of the companion's output as opaque text lines.
    pub fn handle_companion_attach(
        self: &Arc<Self>,
        stream: &mut UnixStream,
        alias: &str,
        name: &str,
        show_history: bool,
        history_lines: usize,
    ) -> anyhow::Result<()> {
        writeln!(stream, "Attached to companion {alias}/{name}\n")
            .context("writing attach header")?;

        enum Branch {
            Unknown,
            Dead(Arc<Broadcaster>, CompanionState),
            Live(Arc<Broadcaster>, Arc<ExitNotifier>),
        }

        let key = (String::from(alias), String::from(name));
        let branch = {
            let mut registry = self.registry.lock().unwrap();
            match registry.companions.entry(key) {
                Entry::Vacant(slot) => match self.config.companion(alias, name) {
                    None => Branch::Unknown,
                    Some(config) => {
                        // remember the name so future runs have a
                        // history to land in
                        let entry = slot.insert(Companion::placeholder(alias, name, config));
                        Branch::Dead(Arc::clone(&entry.output), entry.state)
                    }
                },
                Entry::Occupied(mut slot) => {
                    let entry = slot.get_mut();
                    if entry.is_up() {
                        Branch::Live(
                            Arc::clone(&entry.output),
                            Arc::clone(&entry.exit_notifier),
                        )
                    } else {
                        if entry.exit_notifier.is_done() {
                            // swap in a fresh notifier so the replay
                            // stream below does not instantly "terminate"
                            entry.exit_notifier = Arc::new(ExitNotifier::new());
                        }
                        Branch::Dead(Arc::clone(&entry.output), entry.state)
                    }
                }
            }
        };

        match branch {
            Branch::Unknown => {
                writeln!(stream, "no such companion: {alias}/{name}")
                    .context("writing unknown companion notice")?;
                Ok(())
            }
            Branch::Dead(output, state) => {
                writeln!(stream, "companion {alias}/{name} is not currently running ({state})")
                    .context("writing not-running notice")?;
                if show_history {
                    let (id, _rx, history) = output.subscribe_with_history(history_lines);
                    output.unsubscribe(id);
                    for line in history {
                        writeln!(stream, "{line}").context("replaying history line")?;
                    }
                }
                Ok(())
            }
            Branch::Live(output, notifier) => {
                let (id, rx, history) = if show_history {
                    output.subscribe_with_history(history_lines)
                } else {
                    let (id, rx) = output.subscribe();
                    (id, rx, vec![])
                };
                let result = stream_live(stream, alias, name, rx, history, &notifier);
                output.unsubscribe(id);
                result
            }
        }
    }
}

/// Pump live lines at an attach client until the companion dies, the
/// client goes away, or a write fails.
fn stream_live(
    stream: &mut UnixStream,
    alias: &str,
    name: &str,
    rx: crossbeam_channel::Receiver<String>,
    history: Vec<String>,
    notifier: &ExitNotifier,
) -> anyhow::Result<()> {
    for line in history {
        writeln!(stream, "{line}").context("replaying history line")?;
    }

    // watch for the client hanging up: a reader that copies-to-discard
    // from the connection observes the EOF
    let disconnected = Arc::new(AtomicBool::new(false));
    {
        let disconnected = Arc::clone(&disconnected);
        let mut reader = stream.try_clone().context("cloning stream for hangup watch")?;
        thread::spawn(move || {
            let mut sink = [0u8; 64];
            loop {
                match reader.read(&mut sink) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            disconnected.store(true, Ordering::SeqCst);
        });
    }

    loop {
        if disconnected.load(Ordering::SeqCst) {
            debug!("attach client for '{}/{}' disconnected", alias, name);
            return Ok(());
        }
        match rx.recv_timeout(consts::LIVENESS_POLL) {
            Ok(line) => {
                if writeln!(stream, "{line}").is_err() {
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if notifier.is_done() {
                    // flush whatever was already queued before the exit
                    while let Ok(line) = rx.try_recv() {
                        if writeln!(stream, "{line}").is_err() {
                            return Ok(());
                        }
                    }
                    writeln!(stream, "companion {alias}/{name} terminated")
                        .context("writing terminated notice")?;
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

fn spawn_line_pump<R>(
    reader: R,
    output: Arc<Broadcaster>,
    alias: &str,
    name: &str,
    stream_label: &'static str,
) where
    R: Read + Send + 'static,
{
    let alias = String::from(alias);
    let name = String::from(name);
    thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            debug!("companion[{}/{}] {}: {}", alias, name, stream_label, line);
            output.broadcast(&line);
        }
    });
}

/// Accept "TERM" and "SIGTERM" style names.
pub(crate) fn parse_signal(name: &str) -> anyhow::Result<Signal> {
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") { upper } else { format!("SIG{upper}") };
    full.parse::<Signal>()
        .map_err(|_| anyhow::anyhow!("unknown stop signal '{name}'"))
}

/// Exponential backoff for companion restart `attempt` (1-based).
fn restart_backoff(attempt: u32, config: &CompanionConfig) -> time::Duration {
    let cap = config
        .backoff_cap_ms
        .map(time::Duration::from_millis)
        .unwrap_or(consts::RESTART_BACKOFF_CAP);
    let shift = attempt.saturating_sub(1).min(16);
    consts::RESTART_BACKOFF_BASE.saturating_mul(1u32 << shift).min(cap)
}
