//! Discovery of the rsync binary

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Directories searched for `rsync*` binaries besides `PATH`
pub const EXTRA_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/opt/local/bin", "/usr/bin"];

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Find the newest rsync installed on this machine.
///
/// Falls back to the first `rsync` on `PATH`, then to the bare name.
pub async fn find_best_rsync() -> PathBuf {
    let path_dirs: Vec<PathBuf> = env::var_os("PATH")
        .map(|path| env::split_paths(&path).collect())
        .unwrap_or_default();

    let mut extra_dirs: Vec<PathBuf> = EXTRA_DIRS.iter().map(PathBuf::from).collect();
    if let Some(home) = dirs::home_dir() {
        extra_dirs.push(home.join("bin"));
    }

    find_best_rsync_in(&path_dirs, &extra_dirs).await
}

/// [`find_best_rsync`] over explicit directory lists
pub async fn find_best_rsync_in(path_dirs: &[PathBuf], extra_dirs: &[PathBuf]) -> PathBuf {
    let candidates = candidates(path_dirs, extra_dirs);
    debug!("rsync candidates: {:?}", candidates);

    let mut best: Option<(Vec<u64>, PathBuf)> = None;
    for candidate in &candidates {
        let Some(version) = probe_version(candidate).await else {
            continue;
        };
        // Equal versions go to the greater path
        if best.as_ref().map_or(true, |(current, path)| (&version, candidate) > (current, path)) {
            best = Some((version, candidate.clone()));
        }
    }

    if let Some((version, path)) = best {
        info!("Using {} (version {})", path.display(), format_version(&version));
        return path;
    }

    path_dirs
        .iter()
        .map(|dir| dir.join("rsync"))
        .find(|path| is_executable(path))
        .unwrap_or_else(|| PathBuf::from("rsync"))
}

/// Executables named `rsync` on `path_dirs`, then any `rsync*` in `extra_dirs`,
/// without duplicates
pub fn candidates(path_dirs: &[PathBuf], extra_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();
    let mut add = |path: PathBuf| {
        if !found.contains(&path) && is_executable(&path) {
            found.push(path);
        }
    };

    for dir in path_dirs {
        add(dir.join("rsync"));
    }

    for dir in extra_dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        let mut names: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("rsync"))
            .map(|entry| entry.path())
            .collect();
        names.sort();
        for path in names {
            add(path);
        }
    }

    found
}

/// Parse the version from the first line of `rsync --version`.
///
/// `rsync  version 3.2.7  protocol version 31` gives `[3, 2, 7]`.
pub fn parse_version(first_line: &str) -> Option<Vec<u64>> {
    if !first_line.contains("version") {
        return None;
    }
    first_line
        .split_whitespace()
        .nth(2)?
        .split('.')
        .map(|part| part.parse().ok())
        .collect()
}

async fn probe_version(path: &Path) -> Option<Vec<u64>> {
    let output = Command::new(path)
        .arg("--version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(VERSION_PROBE_TIMEOUT, output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("Cannot run {}: {}", path.display(), e);
            return None;
        }
        Err(_) => {
            debug!("{} --version timed out", path.display());
            return None;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(stdout.lines().next()?)
}

fn format_version(version: &[u64]) -> String {
    version.iter().map(u64::to_string).collect::<Vec<_>>().join(".")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
