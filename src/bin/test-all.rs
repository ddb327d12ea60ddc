//! Test launcher: runs every `test-*` executable found beside this one
//! and aggregates their exit codes. Any failing child makes the launcher
//! exit with -1.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{exit, Command};

use anyhow::{Context, Result};
use tracing::{info, warn};

fn is_test_executable(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if cfg!(windows) {
        name.starts_with("test-") && name.ends_with(".exe")
    } else {
        name.starts_with("test-")
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

fn run() -> Result<i32> {
    let self_path = env::current_exe().context("locating launcher executable")?;
    let directory = self_path
        .parent()
        .context("launcher executable has no parent directory")?;

    let mut candidates: Vec<PathBuf> = directory
        .read_dir()
        .with_context(|| format!("listing {}", directory.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_test_executable(path) && is_executable(path))
        .collect();
    candidates.sort();

    for path in candidates {
        if path.file_name() == self_path.file_name() {
            continue;
        }
        let name = path.file_name().unwrap_or_default().to_string_lossy();

        info!("running test executable: {}", name);
        let status = Command::new(&path)
            .current_dir(directory)
            .status()
            .with_context(|| format!("spawning {}", name))?;

        match status.code() {
            Some(0) => info!("all tests from {} passed", name),
            Some(code) => {
                warn!("tests failed with exit code {}", code);
                return Ok(-1);
            }
            None => {
                warn!("tests failed, process terminated by signal");
                return Ok(-1);
            }
        }
    }

    info!("all tests passed");
    Ok(0)
}

fn main() {
    tracing_subscriber::fmt().init();

    match run() {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            exit(-1);
        }
    }
}
