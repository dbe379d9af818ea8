use std::{
    fs,
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::PathBuf,
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::{anyhow, Context};
use tempfile::TempDir;

use super::overseer_bin;

/// Proc is a helper handle for an `overseer daemon` subprocess. It
/// kills the subprocess when it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    local_tmp_dir: Option<TempDir>,
    pub config_dir: PathBuf,
    pub socket_path: PathBuf,
    pub log_file: PathBuf,
}

impl Proc {
    pub fn new(config_toml: &str) -> anyhow::Result<Proc> {
        let local_tmp_dir = tempfile::Builder::new()
            .prefix("overseer-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;
        let config_dir = local_tmp_dir.path().to_path_buf();

        fs::write(config_dir.join("config.toml"), config_toml).context("writing test config")?;

        let socket_path = config_dir.join("overseer.sock");
        let log_file = config_dir.join("daemon.log");
        eprintln!("spawning daemon proc with log {:?}", &log_file);

        let log = fs::File::create(&log_file).context("creating daemon log file")?;
        let proc = Command::new(overseer_bin()?)
            .arg("-v")
            .arg("daemon")
            .env("OVERSEER_CONFIG", &config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log)
            .spawn()
            .context("spawning daemon process")?;

        // spin until we can dial the socket successfully
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if UnixStream::connect(&socket_path).is_ok() {
                break;
            } else {
                std::thread::sleep(sleep_dur);
                sleep_dur *= 2;
            }
        }

        Ok(Proc { proc, local_tmp_dir: Some(local_tmp_dir), config_dir, socket_path, log_file })
    }

    /// Send one command line and read the whole reply (unary verbs and
    /// streaming verbs that terminate on their own).
    pub fn send(&self, line: &str) -> anyhow::Result<String> {
        let mut stream =
            UnixStream::connect(&self.socket_path).context("dialing daemon socket")?;
        stream.write_all(line.as_bytes()).context("writing command")?;
        stream.write_all(b"\n").context("writing terminator")?;

        let mut reply = String::new();
        stream
            .set_read_timeout(Some(time::Duration::from_secs(5)))
            .context("setting read timeout")?;
        stream.read_to_string(&mut reply).context("reading reply")?;
        Ok(reply)
    }

    /// Send a command that streams forever and collect whatever
    /// arrives within `window`.
    pub fn send_collect_for(&self, line: &str, window: time::Duration) -> anyhow::Result<String> {
        let mut stream =
            UnixStream::connect(&self.socket_path).context("dialing daemon socket")?;
        stream.write_all(line.as_bytes()).context("writing command")?;
        stream.write_all(b"\n").context("writing terminator")?;
        stream
            .set_read_timeout(Some(time::Duration::from_millis(100)))
            .context("setting read timeout")?;

        let mut collected = Vec::new();
        let deadline = time::Instant::now() + window;
        let mut buf = [0u8; 4096];
        while time::Instant::now() < deadline {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(_) => {}
            }
        }
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    pub fn daemon_log(&self) -> anyhow::Result<String> {
        fs::read_to_string(&self.log_file).context("reading daemon log")
    }

    pub fn state_file(&self) -> PathBuf {
        self.config_dir.join("tunnel_state.json")
    }

    pub fn kill(&mut self) -> anyhow::Result<()> {
        self.proc.kill().context("killing daemon")?;
        self.proc.wait().context("reaping daemon")?;
        Ok(())
    }

    pub fn signal_term(&self) -> anyhow::Result<()> {
        let pid = self.proc.id() as i32;
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        )
        .map_err(|e| anyhow!("sending SIGTERM to daemon: {e}"))
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        let _ = self.proc.kill();
        let _ = self.proc.wait();
        if std::env::var("OVERSEER_LEAVE_TEST_DIR").is_ok() {
            if let Some(dir) = self.local_tmp_dir.take() {
                eprintln!("leaving test dir behind: {:?}", dir.into_path());
            }
        }
    }
}
