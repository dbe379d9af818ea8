use std::{collections::HashMap, env, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::info;

use crate::consts;

/// Resolve the directory holding the socket, the state file and
/// config.toml: $OVERSEER_CONFIG if set, ~/.config/overseer otherwise.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    match env::var(consts::CONFIG_DIR_VAR) {
        Ok(dir) => Ok(PathBuf::from(dir)),
        Err(_) => {
            let home = env::var("HOME").context("no OVERSEER_CONFIG or HOME")?;
            Ok(PathBuf::from(home).join(".config").join("overseer"))
        }
    }
}

pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else {
        let config_path = config_dir()?.join(consts::CONFIG_FILE_NAME);
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// ssh client config to pass to every ssh invocation with -F.
    /// Leave unset to use the user's normal ~/.ssh/config.
    pub ssh_config_file: Option<String>,

    /// A table of environment variables to inject into every ssh
    /// child, merged under any per-tunnel env.
    pub env: Option<HashMap<String, String>>,

    /// Per-alias tunnel settings. A tunnel does not need an entry
    /// here to be startable; missing aliases get the defaults.
    pub tunnels: Option<HashMap<String, TunnelConfig>>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct TunnelConfig {
    /// Respawn the ssh child when it dies unexpectedly. On by default.
    pub auto_reconnect: Option<bool>,

    /// How many consecutive reconnect attempts to make before giving
    /// the tunnel up.
    pub max_retries: Option<u32>,

    /// Extra environment for this tunnel's ssh child, layered over
    /// the global `env` table.
    pub env: Option<HashMap<String, String>>,

    /// Secret handed to the ssh askpass helper when it calls back in
    /// with a valid token. Most setups use agent or key auth and
    /// leave this unset, in which case the helper returns an empty
    /// string and ssh falls through to its other methods.
    pub askpass_secret: Option<String>,

    /// Grace period between SIGTERM and SIGKILL when stopping the
    /// ssh child, in milliseconds.
    pub grace_timeout_ms: Option<u64>,

    /// Companion processes to run for the lifetime of this tunnel,
    /// keyed by name.
    pub companions: Option<HashMap<String, CompanionConfig>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CompanionConfig {
    /// The command line to run, split with shell-words.
    pub command: String,

    /// Signal name used to stop the companion (TERM, INT, HUP, ...).
    pub stop_signal: Option<String>,

    pub restart: Option<RestartPolicy>,

    /// When set, the companion is expected to call back in over the
    /// COMPANION_INIT verb once it is actually serving, using the
    /// token we hand it at spawn. Until then it shows as "running"
    /// rather than "ready".
    pub init_protocol: Option<bool>,

    /// Ring buffer capacity for this companion's output history.
    pub history_size: Option<usize>,

    /// Restart attempts allowed before the companion is marked failed.
    pub max_restarts: Option<u32>,

    /// Cap on the exponential restart backoff, in milliseconds.
    pub backoff_cap_ms: Option<u64>,

    /// Grace period between the stop signal and SIGKILL, in
    /// milliseconds.
    pub grace_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
}

impl Config {
    /// Settings for one alias, defaulted when the config has no entry.
    pub fn tunnel(&self, alias: &str) -> TunnelConfig {
        self.tunnels
            .as_ref()
            .and_then(|t| t.get(alias))
            .cloned()
            .unwrap_or_default()
    }

    pub fn companion(&self, alias: &str, name: &str) -> Option<CompanionConfig> {
        self.tunnels
            .as_ref()
            .and_then(|t| t.get(alias))
            .and_then(|t| t.companions.as_ref())
            .and_then(|c| c.get(name))
            .cloned()
    }

    /// Names of the companions configured for an alias.
    pub fn companion_names(&self, alias: &str) -> Vec<String> {
        self.tunnels
            .as_ref()
            .and_then(|t| t.get(alias))
            .and_then(|t| t.companions.as_ref())
            .map(|c| {
                let mut names: Vec<String> = c.keys().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }
}
