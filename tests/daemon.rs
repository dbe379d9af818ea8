use std::{fs, os::unix::net::UnixStream, time};

use anyhow::Context;
use ntest::timeout;

mod support;

use crate::support::daemon::Proc;

#[test]
#[timeout(30000)]
fn start() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("").context("starting daemon")?;

        // The daemon should be up, listening, and quiet for a moment.
        std::thread::sleep(time::Duration::from_millis(300));
        assert!(daemon.socket_path.exists());

        let log = daemon.daemon_log()?;
        assert!(log.contains("STARTING DAEMON"));
        assert!(log.contains("listening on socket"));

        // log lines carry sortable timestamps
        let stamp = regex::Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}")?;
        assert!(stamp.is_match(&log));

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn status_with_no_tunnels() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("")?;
        let reply = daemon.send("STATUS")?;
        assert!(reply.contains(r#""message":"no tunnels""#));
        assert!(reply.contains(r#""status":"INFO""#));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn version_matches_build() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("")?;
        let reply = daemon.send("VERSION")?;
        let parsed: serde_json::Value = serde_json::from_str(reply.trim())?;
        assert_eq!(parsed["data"]["version"], env!("CARGO_PKG_VERSION"));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn unknown_verb_is_an_error() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("")?;
        let reply = daemon.send("FROBNICATE now")?;
        assert!(reply.contains(r#""status":"ERROR""#));
        assert!(reply.contains("unknown command"));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn malformed_args_are_an_error_without_side_effects() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("")?;

        let reply = daemon.send("STOP")?;
        assert!(reply.contains(r#""status":"ERROR""#));

        let reply = daemon.send("START webdev --bogus=flag")?;
        assert!(reply.contains(r#""status":"ERROR""#));
        assert!(reply.contains("malformed argument"));

        // nothing got created along the way
        let reply = daemon.send("STATUS")?;
        assert!(reply.contains("no tunnels"));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn stop_of_unknown_alias_is_a_user_error() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("")?;
        let reply = daemon.send("STOP nope")?;
        assert!(reply.contains(r#""status":"ERROR""#));
        assert!(reply.contains("not running"));

        // and again: still a clean error, no panic, no state change
        let reply = daemon.send("STOP nope")?;
        assert!(reply.contains("not running"));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn askpass_rejects_bad_tokens() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("")?;
        let reply = daemon.send("ASKPASS webdev bogustoken")?;
        assert!(reply.contains(r#""status":"ERROR""#));
        assert!(reply.contains("invalid askpass token"));

        // and the token never shows up in the daemon log
        std::thread::sleep(time::Duration::from_millis(200));
        let log = daemon.daemon_log()?;
        assert!(log.contains("ASKPASS webdev ****"));
        assert!(!log.contains("bogustoken"));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn companion_init_rejects_unknown_companions() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("")?;
        let reply = daemon.send("COMPANION_INIT webdev rails sometoken")?;
        assert!(reply.contains(r#""status":"ERROR""#));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn logs_replays_daemon_history() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("")?;
        // give startup logging a moment to land in the broadcaster
        std::thread::sleep(time::Duration::from_millis(300));

        let collected = daemon.send_collect_for("LOGS 500", time::Duration::from_secs(1))?;
        assert!(collected.contains("listening on socket"));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn logs_no_history_skips_the_replay() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("")?;
        std::thread::sleep(time::Duration::from_millis(300));

        let collected =
            daemon.send_collect_for("LOGS 500 no_history", time::Duration::from_millis(500))?;
        // startup noise predates the subscription, so it must not appear
        assert!(!collected.contains("STARTING DAEMON"));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn companion_attach_header_and_unknown_name() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("")?;
        let reply = daemon.send("COMPANION_ATTACH webdev ghost")?;
        let mut lines = reply.lines();
        assert_eq!(lines.next(), Some("Attached to companion webdev/ghost"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), Some("no such companion: webdev/ghost"));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn companion_attach_creates_dormant_placeholder() -> anyhow::Result<()> {
    support::dump_err(|| {
        let config = r#"
            [tunnels.webdev.companions.rails]
            command = "true"
        "#;
        let daemon = Proc::new(config)?;
        let reply = daemon.send("COMPANION_ATTACH webdev rails 10")?;
        assert!(reply.contains("Attached to companion webdev/rails"));
        assert!(reply.contains("not currently running"));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn sigterm_snapshots_state_and_removes_socket() -> anyhow::Result<()> {
    support::dump_err(|| {
        let mut daemon = Proc::new("")?;
        daemon.signal_term()?;
        daemon.proc.wait().context("waiting for daemon to exit")?;

        support::wait_until(|| Ok(!daemon.socket_path.exists()))?;

        let state = fs::read_to_string(daemon.state_file()).context("reading state file")?;
        let parsed: serde_json::Value = serde_json::from_str(&state)?;
        assert_eq!(parsed["version"], "2");
        assert_eq!(parsed["tunnels"].as_array().map(Vec::len), Some(0));
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn adoption_skips_entries_whose_process_is_gone() -> anyhow::Result<()> {
    support::dump_err(|| {
        // hand-craft a state file pointing at a pid that cannot exist
        let dir = tempfile::Builder::new()
            .prefix("overseer-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;
        fs::write(dir.path().join("config.toml"), "")?;
        fs::write(
            dir.path().join("tunnel_state.json"),
            r#"{
              "version": "2",
              "timestamp": "2026-07-01T00:00:00Z",
              "tunnels": [{
                "pid": 999999999,
                "alias": "webdev",
                "hostname": "webdev",
                "cmdline": ["ssh", "webdev", "-o", "overseer-daemon=true"],
                "start_date": "2026-07-01T00:00:00Z",
                "last_connected_time": "2026-07-01T00:00:00Z",
                "retry_count": 0,
                "total_reconnects": 0,
                "auto_reconnect": true,
                "state": "connected"
              }]
            }"#,
        )?;

        let log_file = dir.path().join("daemon.log");
        let log = fs::File::create(&log_file)?;
        let mut proc = std::process::Command::new(support::overseer_bin()?)
            .arg("-v")
            .arg("daemon")
            .env("OVERSEER_CONFIG", dir.path())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(log)
            .spawn()
            .context("spawning daemon")?;

        let socket_path = dir.path().join("overseer.sock");
        support::wait_until(|| Ok(UnixStream::connect(&socket_path).is_ok()))?;

        {
            let daemon_log = fs::read_to_string(&log_file)?;
            assert!(daemon_log.contains("skipping tunnel 'webdev'"));
        }

        let _ = proc.kill();
        let _ = proc.wait();
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn refuses_to_double_bind() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = Proc::new("")?;

        // a second daemon pointed at the same config dir must bail out
        let out = std::process::Command::new(support::overseer_bin()?)
            .arg("daemon")
            .env("OVERSEER_CONFIG", &daemon.config_dir)
            .output()
            .context("running second daemon")?;
        assert!(!out.status.success());
        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(stderr.contains("already listening"));
        Ok(())
    })
}
