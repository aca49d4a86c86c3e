//! Restore-on-failure for substrate output directories.
//!
//! An [`OutputTransaction`] moves the previous output into a private
//! temporary backup and hands the substrate an empty directory. It ends in
//! exactly one of two ways: [`OutputTransaction::commit`] keeps the new
//! output, [`OutputTransaction::restore`] puts the previous output back.
//! Dropping an unfinished transaction restores.
//!
//! Symlinks are copied as links, not followed.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, error, warn};

use crate::error::{RunnerError, RunnerResult};

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEnd {
    Committed,
    /// `had_prior` is false when there was nothing to put back
    Restored { had_prior: bool },
}

/// Backup of one substrate's output directory for the duration of a run.
#[derive(Debug)]
pub struct OutputTransaction {
    output_dir: PathBuf,
    backup: TempDir,
    had_prior: bool,
    finished: bool,
}

fn is_non_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Recursively copy `from` into `to`, overwriting what is already there.
fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            copy_link(&entry.path(), &target)?;
        } else if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_link(link: &Path, target: &Path) -> std::io::Result<()> {
    let points_to = std::fs::read_link(link)?;
    match std::fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(target)?,
        Ok(_) => std::fs::remove_file(target)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(points_to, target)
}

#[cfg(not(unix))]
fn copy_link(link: &Path, target: &Path) -> std::io::Result<()> {
    if std::fs::metadata(link)?.is_dir() {
        copy_tree(link, target)
    } else {
        std::fs::copy(link, target).map(|_| ())
    }
}

fn reset_dir(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(path)
}

impl OutputTransaction {
    /// Back up `output_dir` into a fresh directory under `backups_root` and
    /// leave `output_dir` empty for the substrate.
    pub fn begin(output_dir: &Path, backups_root: &Path) -> RunnerResult<Self> {
        Self::begin_with(output_dir, backups_root, reset_dir)
    }

    fn begin_with(
        output_dir: &Path,
        backups_root: &Path,
        reset: fn(&Path) -> std::io::Result<()>,
    ) -> RunnerResult<Self> {
        std::fs::create_dir_all(backups_root).map_err(|e| RunnerError::backup(backups_root, e))?;
        let backup = TempDir::new_in(backups_root).map_err(|e| RunnerError::backup(backups_root, e))?;

        let had_prior = is_non_empty_dir(output_dir);
        if had_prior {
            copy_tree(output_dir, backup.path()).map_err(|e| RunnerError::backup(output_dir, e))?;
        }
        if let Err(e) = reset(output_dir) {
            // The output may be half deleted; copy the backup over it
            // before the backup directory goes away.
            if had_prior {
                match copy_tree(backup.path(), output_dir) {
                    Ok(()) => warn!(
                        output = %output_dir.display(),
                        error = %e,
                        "could not clear output, previous output put back"
                    ),
                    Err(restore) => error!(
                        output = %output_dir.display(),
                        error = %e,
                        restore_error = %restore,
                        "could not clear output and could not put previous output back"
                    ),
                }
            }
            return Err(RunnerError::backup(output_dir, e));
        }
        debug!(
            output = %output_dir.display(),
            backup = %backup.path().display(),
            had_prior,
            "output backed up"
        );
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            backup,
            had_prior,
            finished: false,
        })
    }

    pub fn had_prior(&self) -> bool {
        self.had_prior
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Keep the new output; the backup is discarded.
    pub fn commit(mut self) -> TransactionEnd {
        self.finished = true;
        debug!(output = %self.output_dir.display(), "output committed");
        TransactionEnd::Committed
    }

    /// Discard the new output and put the previous output back.
    pub fn restore(mut self) -> RunnerResult<TransactionEnd> {
        self.finished = true;
        self.put_back()?;
        Ok(TransactionEnd::Restored {
            had_prior: self.had_prior,
        })
    }

    fn put_back(&self) -> RunnerResult<()> {
        reset_dir(&self.output_dir).map_err(|e| RunnerError::backup(&self.output_dir, e))?;
        if self.had_prior {
            copy_tree(self.backup.path(), &self.output_dir)
                .map_err(|e| RunnerError::backup(&self.output_dir, e))?;
        }
        debug!(output = %self.output_dir.display(), had_prior = self.had_prior, "output restored");
        Ok(())
    }
}

impl Drop for OutputTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.put_back() {
            error!(
                output = %self.output_dir.display(),
                backup = %self.backup.path().display(),
                error = %e,
                "failed to restore output of an unfinished run"
            );
        }
    }
}
