// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::{env, path::PathBuf, time};

use anyhow::anyhow;

pub mod daemon;

/// Run a test body, dumping the error chain to stderr on failure so
/// the assertion context survives the harness.
pub fn dump_err<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match f() {
        Ok(()) => Ok(()),
        Err(err) => {
            eprintln!("{err:?}");
            Err(err)
        }
    }
}

pub fn wait_until<P>(mut pred: P) -> anyhow::Result<()>
where
    P: FnMut() -> anyhow::Result<bool>,
{
    let mut sleep_dur = time::Duration::from_millis(5);
    for _ in 0..12 {
        if pred()? {
            return Ok(());
        } else {
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
    }

    Err(anyhow!("pred never became true"))
}

pub fn overseer_bin() -> anyhow::Result<PathBuf> {
    let path = cargo_dir().join("overseer");
    if !path.exists() {
        return Err(anyhow!("no overseer binary at {:?}, run cargo build first", path));
    }
    Ok(path)
}

pub fn cargo_dir() -> PathBuf {
    env::var_os("CARGO_BIN_PATH")
        .map(PathBuf::from)
        .or_else(|| {
            env::current_exe().ok().map(|mut path| {
                path.pop();
                if path.ends_with("deps") {
                    path.pop();
                }
                path
            })
        })
        .unwrap_or_else(|| panic!("CARGO_BIN_PATH wasn't set. Cannot continue running test"))
}
