//! Daemon logging: every formatted tracing line goes both to standard
//! error and to a process-wide broadcaster that the LOGS and ATTACH
//! verbs stream from.

use std::{
    io::{self, Write},
    sync::Arc,
};

use lazy_static::lazy_static;
use tracing_subscriber::fmt::MakeWriter;

use crate::broadcast::Broadcaster;

lazy_static! {
    /// The daemon's own log stream, shared with attach subscribers.
    pub static ref DAEMON_LOGS: Arc<Broadcaster> = Arc::new(Broadcaster::new());
}

/// Install the daemon subscriber: DEBUG minimum (TRACE when verbose),
/// thread ids on, sortable timestamps, teed output.
pub fn init(verbose: u8) {
    let level = if verbose == 0 { tracing::Level::DEBUG } else { tracing::Level::TRACE };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .with_target(false)
        .with_writer(TeeWriter)
        .init();
}

/// MakeWriter that copies formatted log lines to stderr and feeds
/// complete lines into DAEMON_LOGS.
pub struct TeeWriter;

impl<'a> MakeWriter<'a> for TeeWriter {
    type Writer = TeeGuard;

    fn make_writer(&'a self) -> Self::Writer {
        TeeGuard { buf: Vec::new() }
    }
}

/// One formatted event's worth of output. The fmt layer hands us the
/// whole line in practice, but we buffer and split defensively-shaped
/// input all the same: only complete `\n`-terminated lines reach the
/// broadcaster.
pub struct TeeGuard {
    buf: Vec<u8>,
}

impl Write for TeeGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl Drop for TeeGuard {
    fn drop(&mut self) {
        for line in self.buf.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            DAEMON_LOGS.broadcast(&String::from_utf8_lossy(line));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guard_splits_lines_into_the_broadcaster() {
        let (_id, rx) = DAEMON_LOGS.subscribe();
        {
            let mut guard = TeeGuard { buf: Vec::new() };
            guard.write_all(b"first line\nsecond line\n").unwrap();
        }
        assert_eq!(rx.recv().unwrap(), "first line");
        assert_eq!(rx.recv().unwrap(), "second line");
    }
}
