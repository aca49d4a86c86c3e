//! Per-substrate lock file, so two runs never share a substrate's output
//! directory or backup.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{RunnerError, RunnerResult};

/// Held while a substrate runs; the lock file is removed on drop.
#[derive(Debug)]
pub struct SubstrateLock {
    path: PathBuf,
}

impl SubstrateLock {
    /// Create `<locks_dir>/<substrate>.lock`, failing if another live
    /// process holds it. A lock left behind by a process that no longer
    /// exists is taken over.
    pub fn acquire(locks_dir: &Path, substrate: &str) -> RunnerResult<Self> {
        std::fs::create_dir_all(locks_dir).map_err(|e| RunnerError::io(locks_dir, e))?;
        let path = locks_dir.join(format!("{substrate}.lock"));
        let mut took_over = false;
        let mut file = loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => break file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let stale = if took_over { None } else { stale_holder(&path) };
                    let Some(pid) = stale else {
                        return Err(RunnerError::Locked {
                            substrate: substrate.to_string(),
                            path,
                        });
                    };
                    warn!(substrate = %substrate, lock = %path.display(), pid, "taking over stale lock");
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(RunnerError::io(&path, e)),
                    }
                    took_over = true;
                }
                Err(e) => return Err(RunnerError::io(&path, e)),
            }
        };
        writeln!(file, "{}", std::process::id()).map_err(|e| RunnerError::io(&path, e))?;
        debug!(substrate = %substrate, lock = %path.display(), "lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Pid recorded in a lock file whose process is gone. `None` while the
/// holder is alive or the file cannot be read as a pid.
fn stale_holder(path: &Path) -> Option<u32> {
    let pid: u32 = std::fs::read_to_string(path).ok()?.trim().parse().ok()?;
    (!process_alive(pid)).then_some(pid)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence checks only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for SubstrateLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}
