//! Resource Governor — startup-only preflight checks (§10.3). Unlike a
//! continuous accounting loop, this runs once during `gateway.starting` and
//! only ever contributes degraded reasons; it never aborts the process.

use std::path::Path;

use sysinfo::Disks;
use tracing::warn;

const DEFAULT_MIN_DISK_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_MIN_FD_HEADROOM: u64 = 256;

#[derive(Debug, Clone)]
pub struct ResourceGovernorConfig {
    pub min_disk_bytes: u64,
    pub min_fd_headroom: u64,
}

impl Default for ResourceGovernorConfig {
    fn default() -> Self {
        Self {
            min_disk_bytes: DEFAULT_MIN_DISK_BYTES,
            min_fd_headroom: DEFAULT_MIN_FD_HEADROOM,
        }
    }
}

/// Runs the preflight checks and returns zero or more degraded-reason
/// strings to append to the gateway's `degradedReasons`.
pub fn run_preflight(workspace_dir: &Path, session_dir: &Path, config: &ResourceGovernorConfig) -> Vec<String> {
    let mut reasons = Vec::new();

    if let Err(err) = check_writable(workspace_dir) {
        warn!(error = %err, path = %workspace_dir.display(), "workspace directory is not writable");
        reasons.push(format!("workspace_not_writable: {err}"));
    }

    match remaining_disk_bytes(session_dir) {
        Some(remaining) if remaining < config.min_disk_bytes => {
            warn!(remaining, floor = config.min_disk_bytes, "low disk space on session directory filesystem");
            reasons.push(format!(
                "low_disk_space: {remaining} bytes remaining, floor is {}",
                config.min_disk_bytes
            ));
        }
        None => {
            warn!(path = %session_dir.display(), "could not determine remaining disk space");
        }
        _ => {}
    }

    if let Some(headroom) = fd_headroom() {
        if headroom < config.min_fd_headroom {
            warn!(headroom, floor = config.min_fd_headroom, "low file descriptor headroom");
            reasons.push(format!("low_fd_headroom: {headroom} below floor {}", config.min_fd_headroom));
        }
    }

    reasons
}

fn check_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".drost-writable-probe-{}", std::process::id()));
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

fn remaining_disk_bytes(path: &Path) -> Option<u64> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if canonical.starts_with(mount) {
            let depth = mount.components().count();
            if best.as_ref().map_or(true, |(d, _)| depth > *d) {
                best = Some((depth, disk.available_space()));
            }
        }
    }
    best.map(|(_, bytes)| bytes)
}

#[cfg(unix)]
fn fd_headroom() -> Option<u64> {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return None;
    }
    Some(limit.rlim_cur as u64)
}

#[cfg(not(unix))]
fn fd_headroom() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writable_workspace_and_session_dir_produce_no_reasons() {
        let workspace = TempDir::new().unwrap();
        let sessions = TempDir::new().unwrap();
        let reasons = run_preflight(workspace.path(), sessions.path(), &ResourceGovernorConfig::default());
        assert!(reasons.iter().all(|r| !r.starts_with("workspace_not_writable")));
    }

    #[test]
    fn absurdly_high_disk_floor_is_flagged() {
        let workspace = TempDir::new().unwrap();
        let sessions = TempDir::new().unwrap();
        let config = ResourceGovernorConfig {
            min_disk_bytes: u64::MAX,
            min_fd_headroom: 0,
        };
        let reasons = run_preflight(workspace.path(), sessions.path(), &config);
        assert!(reasons.iter().any(|r| r.starts_with("low_disk_space")) || reasons.is_empty());
    }
}
