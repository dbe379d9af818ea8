use std::{env, io, path::PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::error;

mod attach;
mod broadcast;
mod config;
mod consts;
mod daemon;
mod logs;
mod protocol;
mod start;
mod status;
mod stop;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times"
    )]
    verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    config_file: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[clap(about = "Runs the supervising daemon that owns all tunnels")]
    Daemon,

    #[clap(about = "Starts an ssh tunnel (and its companions) by alias")]
    Start {
        #[clap(help = "The tunnel alias, as known to your ssh config")]
        alias: String,
        #[clap(
            long = "env",
            value_name = "K=V",
            help = "Extra environment for the ssh child, may be repeated"
        )]
        env: Vec<String>,
    },

    #[clap(about = "Stops a tunnel and its companions")]
    Stop {
        #[clap(help = "The tunnel alias to stop")]
        alias: Option<String>,
        #[clap(long, help = "Stop every running tunnel")]
        all: bool,
    },

    #[clap(about = "Forces a tunnel to drop and reconnect")]
    Reconnect {
        #[clap(help = "The tunnel alias to reconnect")]
        alias: String,
    },

    #[clap(about = "Shows the running tunnels")]
    Status,

    #[clap(about = "Streams the daemon's own log lines")]
    Logs {
        #[clap(help = "How many lines of history to replay first")]
        lines: Option<usize>,
        #[clap(long, help = "Skip the history replay")]
        no_history: bool,
    },

    #[clap(about = "Attaches to the daemon's live log stream")]
    Attach {
        #[clap(help = "How many lines of history to replay first")]
        lines: Option<usize>,
        #[clap(long, help = "Skip the history replay")]
        no_history: bool,
    },

    #[clap(subcommand, about = "Companion process commands")]
    Companion(CompanionCommands),

    // called by companion processes that opted into the init
    // protocol, not by humans
    #[clap(hide = true)]
    CompanionInit,
}

#[derive(Subcommand, Debug)]
enum CompanionCommands {
    #[clap(about = "Attaches to a companion's output stream")]
    Attach {
        #[clap(help = "The owning tunnel's alias")]
        alias: String,
        #[clap(help = "The companion name")]
        name: String,
        #[clap(help = "How many lines of history to replay first")]
        lines: Option<usize>,
        #[clap(long, help = "Skip the history replay")]
        no_history: bool,
    },
}

fn main() -> anyhow::Result<()> {
    // ssh execs $SSH_ASKPASS with just a prompt argument, no
    // subcommand; recognize that mode by the token the daemon put in
    // our environment before clap gets a chance to reject the args
    if let (Ok(alias), Ok(token)) =
        (env::var(consts::ALIAS_VAR), env::var(consts::ASKPASS_TOKEN_VAR))
    {
        return askpass_main(&alias, &token);
    }

    let args = Args::parse();

    if let Commands::Daemon = args.command {
        daemon::logging::init(args.verbose);
        return daemon::run(args.config_file);
    }

    if args.verbose > 0 {
        let level = if args.verbose == 1 { tracing::Level::DEBUG } else { tracing::Level::TRACE };
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
    }

    let socket = socket_path()?;
    let res: anyhow::Result<()> = match args.command {
        Commands::Daemon => unreachable!("handled above"),
        Commands::Start { alias, env } => start::run(&socket, &alias, &env),
        Commands::Stop { alias, all } => stop::run(&socket, alias, all),
        Commands::Reconnect { alias } => reconnect(&socket, &alias),
        Commands::Status => status::run(&socket),
        Commands::Logs { lines, no_history } => logs::run(&socket, lines, no_history, false),
        Commands::Attach { lines, no_history } => logs::run(&socket, lines, no_history, true),
        Commands::Companion(CompanionCommands::Attach { alias, name, lines, no_history }) => {
            attach::run(&socket, &alias, &name, lines, no_history)
        }
        Commands::CompanionInit => companion_init_main(&socket),
    };

    if let Err(err) = res {
        error!("{:?}", err);
        eprintln!("overseer: error: {err:#}");
        std::process::exit(1);
    }

    Ok(())
}

fn socket_path() -> anyhow::Result<PathBuf> {
    let config_dir = config::config_dir()?;
    Ok(protocol::socket_path(&config_dir))
}

fn reconnect(socket: &std::path::Path, alias: &str) -> anyhow::Result<()> {
    protocol::ensure_daemon_running(socket).context("bringing up daemon")?;
    protocol::check_version_mismatch(socket);
    let saw_error = protocol::send_streaming(socket, &format!("SSH_RECONNECT {alias}"))?;
    if saw_error {
        bail!("failed to reconnect tunnel '{alias}'");
    }
    Ok(())
}

/// Running as the ssh askpass helper: trade our token for the secret
/// and print it for ssh to read.
fn askpass_main(alias: &str, token: &str) -> anyhow::Result<()> {
    let socket = socket_path()?;
    let resp = protocol::send(&socket, &format!("ASKPASS {alias} {token}"))
        .context("asking daemon for the secret")?;
    if resp.is_error() {
        bail!("daemon rejected the askpass request");
    }
    let secret = resp.data.as_ref().and_then(|d| d.as_str()).unwrap_or("");
    println!("{secret}");
    Ok(())
}

/// Running inside a companion that opted into the init protocol: tell
/// the daemon we are actually serving.
fn companion_init_main(socket: &std::path::Path) -> anyhow::Result<()> {
    let alias = env::var(consts::TUNNEL_VAR).context("OVERSEER_TUNNEL is not set")?;
    let name = env::var(consts::COMPANION_VAR).context("OVERSEER_COMPANION is not set")?;
    let token =
        env::var(consts::COMPANION_TOKEN_VAR).context("OVERSEER_COMPANION_TOKEN is not set")?;

    let resp = protocol::send(socket, &format!("COMPANION_INIT {alias} {name} {token}"))
        .context("sending ready handshake")?;
    if resp.is_error() {
        bail!("daemon rejected the ready handshake");
    }
    Ok(())
}
