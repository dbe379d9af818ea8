//! The wire protocol spoken over the daemon's unix socket, and the
//! short-lived client the CLI commands use to speak it.
//!
//! Requests are a single `\n`-terminated line of whitespace separated
//! words (`VERB arg1 arg2 ...`). Replies come in two shapes: unary
//! commands get one JSON `Response` document and a close, streaming
//! commands get one JSON `Message` per line until the daemon closes
//! the stream. A few verbs (LOGS, ATTACH, COMPANION_ATTACH) stream
//! opaque text lines instead.

use std::{
    env,
    io::{BufRead, BufReader, Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Once,
    thread, time,
};

use anyhow::{anyhow, bail, Context};
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::consts;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Info,
    Warn,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message: String,
    pub status: Status,
}

/// The unary reply envelope. `data` carries a command specific payload
/// and is left off the wire entirely when unset.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Response {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    pub fn message(status: Status, message: &str) -> Self {
        Response {
            messages: vec![Message { message: String::from(message), status }],
            data: None,
        }
    }

    pub fn info(message: &str) -> Self {
        Self::message(Status::Info, message)
    }

    pub fn error(message: &str) -> Self {
        Self::message(Status::Error, message)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// True if any message in the envelope carries ERROR status.
    pub fn is_error(&self) -> bool {
        self.messages.iter().any(|m| m.status == Status::Error)
    }
}

/// Parse one line of a streaming reply. Blank lines are legal padding
/// and decode to None.
pub fn parse_stream_line(line: &str) -> anyhow::Result<Option<Message>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let msg: Message = serde_json::from_str(line).context("parsing stream line")?;
    Ok(Some(msg))
}

//
// Client
//

/// Dial the daemon socket. A connect failure means "daemon absent" to
/// every caller, so the error is kept as-is for them to classify.
fn dial(socket: &Path) -> anyhow::Result<UnixStream> {
    UnixStream::connect(socket)
        .with_context(|| format!("connecting to daemon at {:?}", socket))
}

fn write_command(stream: &mut UnixStream, verb: &str) -> anyhow::Result<()> {
    stream
        .set_write_timeout(Some(consts::SOCK_STREAM_TIMEOUT))
        .context("setting write timeout")?;
    stream.write_all(verb.as_bytes()).context("writing command")?;
    stream.write_all(b"\n").context("writing command terminator")?;
    stream.flush().context("flushing command")?;
    stream.set_write_timeout(None).context("unsetting write timeout")?;
    Ok(())
}

/// Send a unary command and collect the JSON reply.
pub fn send(socket: &Path, verb: &str) -> anyhow::Result<Response> {
    let mut stream = dial(socket)?;
    write_command(&mut stream, verb)?;

    let mut buf = String::new();
    stream.read_to_string(&mut buf).context("reading reply")?;
    let resp: Response = serde_json::from_str(&buf).context("parsing reply")?;
    Ok(resp)
}

/// Like `send`, but bounded by a read deadline so probes cannot hang
/// on a wedged daemon.
pub fn send_with_timeout(
    socket: &Path,
    verb: &str,
    timeout: time::Duration,
) -> anyhow::Result<Response> {
    let mut stream = dial(socket)?;
    write_command(&mut stream, verb)?;
    stream.set_read_timeout(Some(timeout)).context("setting read deadline")?;

    let mut buf = String::new();
    stream.read_to_string(&mut buf).context("reading reply")?;
    let resp: Response = serde_json::from_str(&buf).context("parsing reply")?;
    Ok(resp)
}

/// Send a streaming command, forwarding each `Message` line to the
/// terminal at its indicated level. EOF is the normal terminator.
/// Returns true if the daemon reported any ERROR.
pub fn send_streaming(socket: &Path, verb: &str) -> anyhow::Result<bool> {
    let mut stream = dial(socket)?;
    write_command(&mut stream, verb)?;

    let mut saw_error = false;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line.context("reading stream line")?;
        let Some(msg) = parse_stream_line(&line)? else {
            continue;
        };
        match msg.status {
            Status::Info => println!("{}", msg.message),
            Status::Warn => eprintln!("overseer: warn: {}", msg.message),
            Status::Error => {
                saw_error = true;
                eprintln!("overseer: error: {}", msg.message);
            }
        }
    }
    Ok(saw_error)
}

/// Send a command whose reply is opaque text lines (LOGS, ATTACH,
/// COMPANION_ATTACH) and copy them to `out` until the daemon closes.
pub fn stream_raw<W: Write>(socket: &Path, verb: &str, out: &mut W) -> anyhow::Result<()> {
    let mut stream = dial(socket)?;
    write_command(&mut stream, verb)?;

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line.context("reading stream line")?;
        writeln!(out, "{line}").context("writing stream line")?;
    }
    Ok(())
}

fn status_probe(socket: &Path) -> anyhow::Result<Response> {
    send_with_timeout(socket, "STATUS", consts::PROBE_TIMEOUT)
}

/// Make sure a daemon is listening on `socket`, forking one if not.
///
/// The forked daemon gets OVERSEER_MONITOR_PID set to our parent so it
/// exits with the shell session that caused it to exist rather than
/// living until reboot. Its stderr goes to a real temp file, not a
/// pipe: a pipe would deliver SIGPIPE to the daemon the moment we
/// exit, and we want early startup errors to survive for reporting.
pub fn ensure_daemon_running(socket: &Path) -> anyhow::Result<()> {
    if status_probe(socket).is_ok() {
        return Ok(());
    }

    let exe = env::current_exe().context("resolving our own binary")?;
    info!("no daemon on {:?}, forking {:?}", socket, exe);

    let capture = tempfile::NamedTempFile::new().context("creating stderr capture file")?;
    let capture_out = capture.reopen().context("reopening capture file for the daemon")?;

    let monitor_pid = nix::unistd::getppid();
    let mut child = Command::new(exe)
        .arg("daemon")
        .env(consts::MONITOR_PID_VAR, monitor_pid.as_raw().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(capture_out)
        .spawn()
        .context("forking daemon")?;

    let deadline = time::Instant::now() + consts::DAEMON_UP_WAIT;
    while time::Instant::now() < deadline {
        if let Some(status) = child.try_wait().context("polling forked daemon")? {
            let mut stderr = String::new();
            let _ = capture.reopen().and_then(|mut f| f.read_to_string(&mut stderr));
            bail!("daemon exited during startup ({}): {}", status, stderr.trim());
        }
        if status_probe(socket).is_ok() {
            return Ok(());
        }
        thread::sleep(consts::DAEMON_UP_POLL);
    }

    Err(anyhow!("daemon did not come up within {:?}", consts::DAEMON_UP_WAIT))
}

/// Poll until the daemon stops answering, for clients that just asked
/// it to shut down.
pub fn wait_for_daemon_stop(socket: &Path) -> anyhow::Result<()> {
    let deadline = time::Instant::now() + consts::DAEMON_STOP_WAIT;
    while time::Instant::now() < deadline {
        if status_probe(socket).is_err() {
            return Ok(());
        }
        thread::sleep(consts::DAEMON_UP_POLL);
    }
    Err(anyhow!("daemon still answering after {:?}", consts::DAEMON_STOP_WAIT))
}

/// Warn (once per process, never fail) when the daemon was built from
/// a different version than this client.
pub fn check_version_mismatch(socket: &Path) {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let Ok(resp) = send_with_timeout(socket, "VERSION", consts::PROBE_TIMEOUT) else {
            return;
        };
        let daemon_version = resp
            .data
            .as_ref()
            .and_then(|d| d.get("version"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let client_version = env!("CARGO_PKG_VERSION");
        if !daemon_version.is_empty() && daemon_version != client_version {
            warn!(%daemon_version, %client_version, "version mismatch");
            eprintln!(
                "overseer: warn: daemon is version {daemon_version} but this client is {client_version}, consider restarting the daemon",
            );
        }
    });
}

pub fn socket_path(config_dir: &Path) -> PathBuf {
    config_dir.join(consts::SOCKET_NAME)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn data_is_omitted_when_unset() {
        let resp = Response::info("no tunnels");
        let wire = serde_json::to_string(&resp).unwrap();
        assert_eq!(wire, r#"{"messages":[{"message":"no tunnels","status":"INFO"}]}"#);
    }

    #[test]
    fn data_round_trips() {
        let resp = Response::info("ok").with_data(serde_json::json!({"version": "1.2.3"}));
        let wire = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.data.unwrap()["version"], "1.2.3");
    }

    #[test]
    fn statuses_serialize_uppercase() {
        let msg = Message { message: String::from("x"), status: Status::Error };
        let wire = serde_json::to_string(&msg).unwrap();
        assert!(wire.contains(r#""status":"ERROR""#));
    }

    #[test]
    fn stream_lines_tolerate_blanks() {
        assert!(parse_stream_line("").unwrap().is_none());
        assert!(parse_stream_line("   ").unwrap().is_none());
        let msg = parse_stream_line(r#"{"message":"Connected","status":"INFO"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(msg.message, "Connected");
        assert_eq!(msg.status, Status::Info);
    }

    #[test]
    fn error_detection_scans_all_messages() {
        let mut resp = Response::info("fine");
        assert!(!resp.is_error());
        resp.messages.push(Message { message: String::from("bad"), status: Status::Error });
        assert!(resp.is_error());
    }
}
