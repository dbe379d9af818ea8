use std::time;

/// How long the daemon will wait for the command line when a client
/// connects before giving up on the connection.
pub const SOCK_STREAM_TIMEOUT: time::Duration = time::Duration::from_millis(200);

/// Read deadline used by short unary probes such as STATUS.
pub const PROBE_TIMEOUT: time::Duration = time::Duration::from_millis(500);

/// How long the client waits for a freshly forked daemon to come up,
/// sliced into DAEMON_UP_POLL sized probes.
pub const DAEMON_UP_WAIT: time::Duration = time::Duration::from_secs(5);
pub const DAEMON_UP_POLL: time::Duration = time::Duration::from_millis(100);

/// How long the client waits for the daemon to go away after a shutdown.
pub const DAEMON_STOP_WAIT: time::Duration = time::Duration::from_secs(2);

/// How long we wait for an ssh child to report readiness before we
/// declare the connection attempt dead.
pub const CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(30);

/// Default grace period between SIGTERM and SIGKILL when tearing a
/// process down, and the liveness poll cadence inside that window.
pub const GRACE_TIMEOUT: time::Duration = time::Duration::from_secs(2);
pub const LIVENESS_POLL: time::Duration = time::Duration::from_millis(100);

/// Poll cadence for processes we did not fork and so cannot wait on.
pub const ADOPTED_POLL: time::Duration = time::Duration::from_secs(1);

/// Poll cadence for the monitored parent process.
pub const MONITOR_PID_POLL: time::Duration = time::Duration::from_secs(1);

/// Tunnel reconnect backoff: base doubles per retry, bounded by the cap.
pub const RECONNECT_BACKOFF_BASE: time::Duration = time::Duration::from_secs(1);
pub const RECONNECT_BACKOFF_CAP: time::Duration = time::Duration::from_secs(60);
pub const RECONNECT_MAX_RETRIES: u32 = 5;

/// Companion restart backoff.
pub const RESTART_BACKOFF_BASE: time::Duration = time::Duration::from_millis(500);
pub const RESTART_BACKOFF_CAP: time::Duration = time::Duration::from_secs(30);
pub const RESTART_MAX: u32 = 5;

/// Ring buffer capacity for log history and the per-subscriber
/// channel buffer. Producers never block; full subscribers drop.
pub const DEFAULT_HISTORY_LINES: usize = 1000;
pub const SUBSCRIBER_BUFFER: usize = 100;

pub const TOKEN_LEN: usize = 32;

pub const SOCKET_NAME: &str = "overseer.sock";
pub const STATE_FILE_NAME: &str = "tunnel_state.json";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATE_VERSION: &str = "2";

/// Directory holding the socket, the state file and config.toml.
/// Defaults to ~/.config/overseer when unset.
pub const CONFIG_DIR_VAR: &str = "OVERSEER_CONFIG";

/// Read at daemon boot: the pid whose death makes the daemon exit.
/// The forking client sets this to its own parent so the daemon dies
/// with the shell or SSH session that spawned it, not with init.
pub const MONITOR_PID_VAR: &str = "OVERSEER_MONITOR_PID";

/// Environment handed to ssh children so the askpass helper can call
/// back into the daemon.
pub const ALIAS_VAR: &str = "OVERSEER_ALIAS";
pub const ASKPASS_TOKEN_VAR: &str = "OVERSEER_ASKPASS_TOKEN";

/// Environment handed to companion processes.
pub const TUNNEL_VAR: &str = "OVERSEER_TUNNEL";
pub const COMPANION_VAR: &str = "OVERSEER_COMPANION";
pub const COMPANION_TOKEN_VAR: &str = "OVERSEER_COMPANION_TOKEN";

/// Marker option attached to every ssh child we spawn. ssh ignores it
/// thanks to IgnoreUnknown, and adoption and the orphan sweep use it
/// to recognize our processes in the process table.
pub const SSH_MARKER_OPT: &str = "overseer-daemon=true";
pub const SSH_IGNORE_UNKNOWN_OPT: &str = "IgnoreUnknown=overseer-daemon";
