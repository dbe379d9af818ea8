use std::{
    collections::HashMap,
    env, fs,
    os::unix::{
        fs::PermissionsExt,
        net::{UnixListener, UnixStream},
    },
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
};

use anyhow::{bail, Context};
use nix::{errno::Errno, sys::signal, unistd::Pid};
use tracing::{info, warn};

use crate::{config, consts, protocol};

pub mod askpass;
pub mod companion;
pub mod exit_notify;
pub mod logging;
pub mod server;
pub mod signals;
pub mod ssh;
pub mod state;
pub mod sweep;
pub mod tunnel;

/// The in-memory model: every handler and monitor reads and mutates it
/// under the one daemon mutex. Long waits (child wait, ssh -G, backoff
/// sleeps) always happen with the lock released.
pub struct Registry {
    pub tunnels: HashMap<String, tunnel::Tunnel>,
    pub companions: HashMap<(String, String), companion::Companion>,
}

impl Registry {
    fn new() -> Self {
        Registry { tunnels: HashMap::new(), companions: HashMap::new() }
    }
}

pub struct Daemon {
    pub config: config::Config,
    pub config_dir: PathBuf,
    pub registry: Mutex<Registry>,
    pub tokens: askpass::TokenTable,
}

impl Daemon {
    pub fn new(config: config::Config, config_dir: PathBuf) -> Arc<Self> {
        Arc::new(Daemon {
            config,
            config_dir,
            registry: Mutex::new(Registry::new()),
            tokens: askpass::TokenTable::new(),
        })
    }

    /// Snapshot the registry to the state file. Record building holds
    /// the lock; the disk write does not.
    pub fn persist_state(&self) {
        let records = {
            let registry = self.registry.lock().unwrap();
            state::snapshot(&registry)
        };
        if let Err(err) = state::save(&self.config_dir, records) {
            warn!("persisting tunnel state: {:#}", err);
        }
    }
}

pub fn run(config_file: Option<String>) -> anyhow::Result<()> {
    let config_dir = config::config_dir()?;
    fs::create_dir_all(&config_dir).context("creating config dir")?;

    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    let config = config::read_config(&config_file)?;
    let daemon = Daemon::new(config, config_dir.clone());

    // pick surviving children back up, then clear out any strays a
    // crashed predecessor left holding our forwards
    let adopted = state::restore(&daemon);
    if !adopted.is_empty() {
        info!("adopted {} process(es) from the state file", adopted.len());
    }
    let swept = sweep::sweep_orphans(&adopted);
    if swept > 0 {
        info!("swept {} orphaned ssh process(es)", swept);
    }

    let socket = protocol::socket_path(&config_dir);
    if socket.exists() {
        if UnixStream::connect(&socket).is_ok() {
            bail!("another daemon is already listening on {:?}", socket);
        }
        fs::remove_file(&socket).context("clearing stale socket")?;
    }
    let listener = UnixListener::bind(&socket).context("binding to socket")?;
    fs::set_permissions(&socket, fs::Permissions::from_mode(0o600))
        .context("restricting socket mode")?;

    signals::Handler::new(socket.clone(), Arc::clone(&daemon)).spawn()?;
    spawn_monitor_pid_watcher(Arc::clone(&daemon), socket.clone());

    server::serve(daemon, listener)?;

    let _ = fs::remove_file(&socket);
    Ok(())
}

/// Watch the process named by OVERSEER_MONITOR_PID (the parent at fork
/// time by default) and shut the daemon down when it dies, so a daemon
/// forked inside an SSH session does not outlive the session.
fn spawn_monitor_pid_watcher(daemon: Arc<Daemon>, socket: PathBuf) {
    let pid = env::var(consts::MONITOR_PID_VAR)
        .ok()
        .and_then(|v| v.parse::<libc::pid_t>().ok())
        .map(Pid::from_raw)
        .unwrap_or_else(nix::unistd::getppid);
    if pid.as_raw() <= 1 {
        info!("no monitorable parent, daemon will only exit on signal");
        return;
    }

    info!("watching monitor pid {}", pid);
    thread::spawn(move || loop {
        if let Err(Errno::ESRCH) = signal::kill(pid, None) {
            info!("monitor pid {} is gone, shutting down", pid);
            daemon.persist_state();
            let _ = fs::remove_file(&socket);
            std::process::exit(0);
        }
        thread::sleep(consts::MONITOR_PID_POLL);
    });
}
