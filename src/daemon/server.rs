//! The accept loop and command dispatch. Every connection gets its own
//! worker thread which reads exactly one command line, dispatches, and
//! either writes one JSON document or streams lines until done.

use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read, Write},
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Context;
use crossbeam_channel::RecvTimeoutError;
use serde_json::json;
use tracing::{debug, error, info};

use super::{logging, tunnel::ProgressSink, Daemon};
use crate::{
    consts,
    protocol::{Message, Response, Status},
};

pub fn serve(daemon: Arc<Daemon>, listener: UnixListener) -> anyhow::Result<()> {
    info!("listening on socket");
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let daemon = Arc::clone(&daemon);
                thread::spawn(move || {
                    if let Err(err) = handle_conn(&daemon, stream) {
                        error!("handling new connection: {:?}", err);
                    }
                });
            }
            Err(err) => {
                error!("accepting stream: {:?}", err);
            }
        }
    }

    Ok(())
}

fn handle_conn(daemon: &Arc<Daemon>, mut stream: UnixStream) -> anyhow::Result<()> {
    // We want to avoid a dead client blocking this worker forever, but
    // once the command line is in, streaming verbs can legitimately
    // sit quiet for a long time.
    stream
        .set_read_timeout(Some(consts::SOCK_STREAM_TIMEOUT))
        .context("setting read timeout on inbound connection")?;

    let mut line = String::new();
    BufReader::new(stream.try_clone().context("cloning stream for reading")?)
        .read_line(&mut line)
        .context("reading command line")?;

    stream
        .set_read_timeout(None)
        .context("unsetting read timeout on inbound connection")?;

    let parts: Vec<String> = line.split_ascii_whitespace().map(String::from).collect();
    if parts.is_empty() {
        return write_unary(&mut stream, &Response::error("empty command"));
    }
    // never log token-bearing verbs verbatim
    info!("dispatching: {}", redact(&parts));

    let verb = parts[0].as_str();
    let args = &parts[1..];
    match verb {
        "STATUS" => handle_status(daemon, &mut stream),
        "VERSION" => write_unary(
            &mut stream,
            &Response::default().with_data(json!({ "version": env!("CARGO_PKG_VERSION") })),
        ),
        "START" | "SSH_CONNECT" => handle_start(daemon, stream, args),
        "STOP" => handle_stop(daemon, stream, args),
        "STOP_ALL" => handle_stop_all(daemon, stream, args),
        "SSH_RECONNECT" => handle_reconnect(daemon, stream, args),
        "LOGS" | "ATTACH" => handle_logs(stream, args),
        "COMPANION_ATTACH" => handle_companion_attach(daemon, stream, args),
        "ASKPASS" => handle_askpass(daemon, &mut stream, args),
        "COMPANION_INIT" => handle_companion_init(daemon, &mut stream, args),
        _ => write_unary(&mut stream, &Response::error(&format!("unknown command '{verb}'"))),
    }
}

/// Mask the token argument of secret-bearing verbs before anything is
/// logged.
fn redact(parts: &[String]) -> String {
    let mut parts: Vec<String> = parts.to_vec();
    match parts[0].as_str() {
        "ASKPASS" if parts.len() >= 3 => parts[2] = String::from("****"),
        "COMPANION_INIT" if parts.len() >= 4 => parts[3] = String::from("****"),
        _ => {}
    }
    parts.join(" ")
}

fn write_unary(stream: &mut UnixStream, resp: &Response) -> anyhow::Result<()> {
    let buf = serde_json::to_string(resp).context("encoding reply")?;
    stream.write_all(buf.as_bytes()).context("writing reply")?;
    stream.write_all(b"\n").context("writing reply terminator")?;
    stream.flush().context("flushing reply")?;
    Ok(())
}

/// Streaming replies: one JSON `Message` per line.
pub struct LineSink {
    stream: UnixStream,
}

impl LineSink {
    fn new(stream: &UnixStream) -> anyhow::Result<Self> {
        Ok(LineSink { stream: stream.try_clone().context("cloning stream for streaming")? })
    }

    fn send(&mut self, status: Status, message: &str) -> std::io::Result<()> {
        let msg = Message { message: String::from(message), status };
        let buf = serde_json::to_string(&msg).unwrap_or_default();
        self.stream.write_all(buf.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()
    }
}

impl ProgressSink for LineSink {
    fn emit(&mut self, status: Status, message: &str) {
        debug!("stream: {:?} {}", status, message);
        if let Err(err) = self.send(status, message) {
            debug!("client stopped reading stream: {:?}", err);
        }
    }
}

fn handle_status(daemon: &Arc<Daemon>, stream: &mut UnixStream) -> anyhow::Result<()> {
    let snapshots = daemon.status_data();
    let resp = if snapshots.is_empty() {
        Response::info("no tunnels")
    } else {
        Response::info(&format!("{} tunnel(s)", snapshots.len()))
            .with_data(serde_json::to_value(&snapshots).context("encoding status data")?)
    };
    write_unary(stream, &resp)
}

/// `START <alias> [--env=K=V ...]`
fn handle_start(daemon: &Arc<Daemon>, stream: UnixStream, args: &[String]) -> anyhow::Result<()> {
    let mut sink = LineSink::new(&stream)?;
    let Some(alias) = args.first() else {
        sink.emit(Status::Error, "usage: START <alias> [--env=K=V ...]");
        return Ok(());
    };
    let extra_env = match parse_env_args(&args[1..]) {
        Ok(env) => env,
        Err(bad) => {
            sink.emit(Status::Error, &format!("malformed argument '{bad}'"));
            return Ok(());
        }
    };
    if let Err(err) = daemon.start_tunnel(alias, &extra_env, &mut sink) {
        sink.emit(Status::Error, &err.to_string());
    }
    Ok(())
}

fn handle_stop(daemon: &Arc<Daemon>, stream: UnixStream, args: &[String]) -> anyhow::Result<()> {
    let mut sink = LineSink::new(&stream)?;
    let [alias] = args else {
        sink.emit(Status::Error, "usage: STOP <alias>");
        return Ok(());
    };
    sink.emit(Status::Info, &format!("Stopping {alias}"));
    match daemon.stop_tunnel(alias, false) {
        Ok(()) => sink.emit(Status::Info, "Stopped"),
        Err(err) => sink.emit(Status::Error, &err.to_string()),
    }
    Ok(())
}

fn handle_stop_all(
    daemon: &Arc<Daemon>,
    stream: UnixStream,
    args: &[String],
) -> anyhow::Result<()> {
    let mut sink = LineSink::new(&stream)?;
    if !args.is_empty() {
        sink.emit(Status::Error, "STOP_ALL takes no arguments");
        return Ok(());
    }
    let aliases = daemon.tunnel_aliases();
    if aliases.is_empty() {
        sink.emit(Status::Info, "no tunnels to stop");
        return Ok(());
    }
    for alias in aliases {
        sink.emit(Status::Info, &format!("Stopping {alias}"));
        match daemon.stop_tunnel(&alias, false) {
            Ok(()) => sink.emit(Status::Info, &format!("Stopped {alias}")),
            Err(err) => sink.emit(Status::Error, &err.to_string()),
        }
    }
    sink.emit(Status::Info, "Stopped");
    Ok(())
}

fn handle_reconnect(
    daemon: &Arc<Daemon>,
    stream: UnixStream,
    args: &[String],
) -> anyhow::Result<()> {
    let mut sink = LineSink::new(&stream)?;
    let [alias] = args else {
        sink.emit(Status::Error, "usage: SSH_RECONNECT <alias>");
        return Ok(());
    };
    if let Err(err) = daemon.reconnect_tunnel(alias, &mut sink) {
        sink.emit(Status::Error, &err.to_string());
    }
    Ok(())
}

/// `LOGS [<n>] [no_history]` / `ATTACH [<n>] [no_history]`: stream the
/// daemon's own log lines as opaque text.
fn handle_logs(mut stream: UnixStream, args: &[String]) -> anyhow::Result<()> {
    let (history_lines, show_history) = match parse_stream_args(args) {
        Ok(parsed) => parsed,
        Err(bad) => {
            writeln!(stream, "error: malformed argument '{bad}'")
                .context("writing arg error")?;
            return Ok(());
        }
    };

    let logs = &*logging::DAEMON_LOGS;
    let (id, rx, history) = if show_history {
        logs.subscribe_with_history(history_lines)
    } else {
        let (id, rx) = logs.subscribe();
        (id, rx, vec![])
    };

    let result = (|| -> anyhow::Result<()> {
        for line in history {
            writeln!(stream, "{line}").context("replaying log history")?;
        }

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
                return Ok(());
            }
            match rx.recv_timeout(consts::LIVENESS_POLL) {
                Ok(line) => {
                    if writeln!(stream, "{line}").is_err() {
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    })();
    logs.unsubscribe(id);
    result
}

/// `COMPANION_ATTACH <alias> <name> [<n>] [no_history]`
fn handle_companion_attach(
    daemon: &Arc<Daemon>,
    mut stream: UnixStream,
    args: &[String],
) -> anyhow::Result<()> {
    if args.len() < 2 {
        writeln!(stream, "error: usage: COMPANION_ATTACH <alias> <name> [<n>] [no_history]")
            .context("writing arg error")?;
        return Ok(());
    }
    let (alias, name) = (&args[0], &args[1]);
    let (history_lines, show_history) = match parse_stream_args(&args[2..]) {
        Ok(parsed) => parsed,
        Err(bad) => {
            writeln!(stream, "error: malformed argument '{bad}'")
                .context("writing arg error")?;
            return Ok(());
        }
    };
    daemon.handle_companion_attach(&mut stream, alias, name, show_history, history_lines)
}

/// `ASKPASS <alias> <token>`: hand the ssh askpass helper its secret,
/// or an empty string when none is configured.
fn handle_askpass(
    daemon: &Arc<Daemon>,
    stream: &mut UnixStream,
    args: &[String],
) -> anyhow::Result<()> {
    let [alias, token] = args else {
        return write_unary(stream, &Response::error("usage: ASKPASS <alias> <token>"));
    };
    if !daemon.tokens.verify(alias, token) {
        return write_unary(stream, &Response::error("invalid askpass token"));
    }
    let secret = daemon
        .config
        .tunnel(alias)
        .askpass_secret
        .unwrap_or_default();
    write_unary(stream, &Response::default().with_data(json!(secret)))
}

/// `COMPANION_INIT <alias> <name> <token>`: the ready handshake.
fn handle_companion_init(
    daemon: &Arc<Daemon>,
    stream: &mut UnixStream,
    args: &[String],
) -> anyhow::Result<()> {
    let [alias, name, token] = args else {
        return write_unary(
            stream,
            &Response::error("usage: COMPANION_INIT <alias> <name> <token>"),
        );
    };
    match daemon.companion_ready(alias, name, token) {
        Ok(()) => write_unary(stream, &Response::info("ready")),
        Err(err) => write_unary(stream, &Response::error(&err.to_string())),
    }
}

/// Parse trailing `[--env=K=V ...]` arguments. Returns the offending
/// argument on malformed input.
fn parse_env_args(args: &[String]) -> Result<HashMap<String, String>, String> {
    let mut env = HashMap::new();
    for arg in args {
        let Some(kv) = arg.strip_prefix("--env=") else {
            return Err(arg.clone());
        };
        let Some((key, value)) = kv.split_once('=') else {
            return Err(arg.clone());
        };
        if key.is_empty() {
            return Err(arg.clone());
        }
        env.insert(String::from(key), String::from(value));
    }
    Ok(env)
}

/// Parse trailing `[<n>] [no_history]` arguments shared by the log
/// streaming verbs.
fn parse_stream_args(args: &[String]) -> Result<(usize, bool), String> {
    let mut history_lines = consts::DEFAULT_HISTORY_LINES;
    let mut show_history = true;
    for arg in args {
        if arg == "no_history" {
            show_history = false;
        } else if let Ok(n) = arg.parse::<usize>() {
            history_lines = n;
        } else {
            return Err(arg.clone());
        }
    }
    Ok((history_lines, show_history))
}

#[cfg(test)]
mod test {
    use super::*;

    fn parts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| String::from(*s)).collect()
    }

    #[test]
    fn redacts_askpass_token() {
        assert_eq!(
            redact(&parts(&["ASKPASS", "webdev", "s3cr3tt0ken"])),
            "ASKPASS webdev ****"
        );
    }

    #[test]
    fn redacts_companion_init_token() {
        assert_eq!(
            redact(&parts(&["COMPANION_INIT", "webdev", "rails", "s3cr3t"])),
            "COMPANION_INIT webdev rails ****"
        );
    }

    #[test]
    fn leaves_other_verbs_alone() {
        assert_eq!(redact(&parts(&["START", "webdev", "--env=A=b"])), "START webdev --env=A=b");
        assert_eq!(redact(&parts(&["ASKPASS", "short"])), "ASKPASS short");
    }

    #[test]
    fn parses_env_args() {
        let env = parse_env_args(&parts(&["--env=A=1", "--env=B=two=2"])).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "two=2");
    }

    #[test]
    fn rejects_malformed_env_args() {
        assert_eq!(parse_env_args(&parts(&["-env=A=1"])), Err(String::from("-env=A=1")));
        assert_eq!(parse_env_args(&parts(&["--env=A"])), Err(String::from("--env=A")));
        assert_eq!(parse_env_args(&parts(&["--env==v"])), Err(String::from("--env==v")));
    }

    #[test]
    fn parses_stream_args() {
        assert_eq!(parse_stream_args(&parts(&[])), Ok((consts::DEFAULT_HISTORY_LINES, true)));
        assert_eq!(parse_stream_args(&parts(&["25"])), Ok((25, true)));
        assert_eq!(parse_stream_args(&parts(&["25", "no_history"])), Ok((25, false)));
        assert_eq!(parse_stream_args(&parts(&["nope"])), Err(String::from("nope")));
    }
}
