//! Substrate process execution.
//!
//! A substrate is an opaque external command. It reads the blank fixture and
//! writes answer files into its output directory; nothing else about it is
//! assumed. Combined stdout and stderr go to the run's log file whatever
//! the outcome.
//!
//! On unix the command leads its own process group, and the whole group is
//! killed once the command ends, times out or is aborted. Helpers it forked
//! cannot keep writing into the output directory after a restore.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use conform_state::RunId;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SubstrateConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::signal::StopSignal;

/// How a substrate process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    /// Killed by a signal it did not choose
    Signalled,
    TimedOut,
    /// Killed because the operator aborted the run
    Aborted,
}

/// Result of one substrate execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub substrate: String,
    pub termination: Termination,
    pub elapsed_ms: u64,
    pub log_path: PathBuf,
}

impl Execution {
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.termination == Termination::Exited(0)
    }
}

/// Inputs for one execution.
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub substrate: &'a SubstrateConfig,
    pub run_id: &'a RunId,
    pub blank_dir: &'a Path,
    pub output_dir: &'a Path,
    pub log_path: &'a Path,
    pub timeout: Duration,
}

fn append_log(path: &Path, line: &str) {
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{line}"));
    if let Err(e) = result {
        warn!(log = %path.display(), error = %e, "failed to append to substrate log");
    }
}

/// Kill every process left in the substrate's group.
#[cfg(unix)]
fn kill_group(pid: Option<u32>, substrate: &str) {
    let Some(pid) = pid else {
        return;
    };
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only delivers a signal; pgid is the group the child leads.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            warn!(substrate = %substrate, error = %e, "failed to kill substrate process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>, _substrate: &str) {}

/// Run a substrate command to completion, timeout or abort.
pub async fn run(request: RunRequest<'_>, signal: &StopSignal) -> RunnerResult<Execution> {
    let substrate = &request.substrate.name;
    let argv = request
        .substrate
        .render_command(request.blank_dir, request.output_dir);
    let Some((program, args)) = argv.split_first() else {
        return Err(RunnerError::EmptyCommand {
            substrate: substrate.clone(),
        });
    };

    if let Some(parent) = request.log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RunnerError::io(parent, e))?;
    }
    let mut log = std::fs::File::create(request.log_path)
        .map_err(|e| RunnerError::io(request.log_path, e))?;
    writeln!(
        log,
        "# conform run {} substrate {}\n# cwd: {}\n# command: {}",
        request.run_id,
        substrate,
        request.substrate.dir.display(),
        argv.join(" ")
    )
    .map_err(|e| RunnerError::io(request.log_path, e))?;
    let stderr_log = log
        .try_clone()
        .map_err(|e| RunnerError::io(request.log_path, e))?;

    let started = Instant::now();
    let mut command = Command::new(program);
    #[cfg(unix)]
    command.process_group(0);
    let spawned = command
        .args(args)
        .current_dir(&request.substrate.dir)
        .env("CONFORM_BLANK_DIR", request.blank_dir)
        .env("CONFORM_OUTPUT_DIR", request.output_dir)
        .env("CONFORM_RUN_ID", request.run_id.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr_log))
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(source) => {
            append_log(request.log_path, &format!("# spawn failed: {source}"));
            return Err(RunnerError::Spawn {
                substrate: substrate.clone(),
                source,
            });
        }
    };
    let pid = child.id();
    debug!(substrate = %substrate, pid = ?pid, "substrate started");

    let termination = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => match status.code() {
                Some(code) => Termination::Exited(code),
                None => Termination::Signalled,
            },
            Err(e) => {
                append_log(request.log_path, &format!("# wait failed: {e}"));
                Termination::Signalled
            }
        },
        _ = tokio::time::sleep(request.timeout) => Termination::TimedOut,
        _ = signal.aborted() => Termination::Aborted,
    };
    kill_group(pid, substrate);
    if matches!(termination, Termination::TimedOut | Termination::Aborted) {
        if let Err(e) = child.kill().await {
            warn!(substrate = %substrate, error = %e, "failed to kill substrate process");
        }
    }
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let footer = match termination {
        Termination::Exited(code) => format!("# exit code {code} after {elapsed_ms}ms"),
        Termination::Signalled => format!("# terminated by signal after {elapsed_ms}ms"),
        Termination::TimedOut => format!(
            "# killed after exceeding the {}s time limit",
            request.timeout.as_secs()
        ),
        Termination::Aborted => format!("# killed by operator abort after {elapsed_ms}ms"),
    };
    append_log(request.log_path, &footer);

    Ok(Execution {
        substrate: substrate.clone(),
        termination,
        elapsed_ms,
        log_path: request.log_path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use conform_state::SubstrateMode;

    fn shell(dir: &Path, script: &str) -> SubstrateConfig {
        SubstrateConfig {
            name: "sh".into(),
            dir: dir.to_path_buf(),
            command: vec!["sh".into(), "-c".into(), script.into()],
            output_dir: None,
            timeout_secs: None,
            mode: SubstrateMode::Executable,
            enabled: true,
            artifacts: vec![],
        }
    }

    async fn exec(dir: &Path, script: &str, timeout: Duration, signal: &StopSignal) -> Execution {
        let substrate = shell(dir, script);
        let run_id = RunId("test-run".into());
        let log = dir.join("logs/sh.log");
        let out = dir.join("out");
        run(
            RunRequest {
                substrate: &substrate,
                run_id: &run_id,
                blank_dir: dir,
                output_dir: &out,
                log_path: &log,
                timeout,
            },
            signal,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let e = exec(
            dir.path(),
            "echo to-out; echo to-err >&2; echo run=$CONFORM_RUN_ID",
            Duration::from_secs(10),
            &StopSignal::new(),
        )
        .await;
        assert!(e.succeeded());
        let log = std::fs::read_to_string(&e.log_path).unwrap();
        assert!(log.contains("to-out"));
        assert!(log.contains("to-err"));
        assert!(log.contains("run=test-run"));
        assert!(log.contains("# exit code 0"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let e = exec(dir.path(), "exit 3", Duration::from_secs(10), &StopSignal::new()).await;
        assert_eq!(e.termination, Termination::Exited(3));
        assert_eq!(e.exit_code(), Some(3));
        assert!(!e.succeeded());
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let e = exec(dir.path(), "sleep 30", Duration::from_millis(200), &StopSignal::new()).await;
        assert_eq!(e.termination, Termination::TimedOut);
        assert!(e.elapsed_ms < 10_000);
        let log = std::fs::read_to_string(&e.log_path).unwrap();
        assert!(log.contains("time limit"));
    }

    #[tokio::test]
    async fn abort_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let signal = StopSignal::new();
        let trigger = {
            let signal = signal.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                signal.request_abort();
            })
        };
        let e = exec(dir.path(), "sleep 30", Duration::from_secs(60), &signal).await;
        trigger.await.unwrap();
        assert_eq!(e.termination, Termination::Aborted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_forked_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let e = exec(
            dir.path(),
            r#"sh -c 'sleep 1; touch "$CONFORM_BLANK_DIR/late"'; true"#,
            Duration::from_millis(200),
            &StopSignal::new(),
        )
        .await;
        assert_eq!(e.termination, Termination::TimedOut);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_helpers_do_not_outlive_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let e = exec(
            dir.path(),
            r#"(sleep 1; touch "$CONFORM_BLANK_DIR/late") & exit 0"#,
            Duration::from_secs(10),
            &StopSignal::new(),
        )
        .await;
        assert!(e.succeeded());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late").exists());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut substrate = shell(dir.path(), "");
        substrate.command = vec!["/nonexistent/conform-substrate".into()];
        let run_id = RunId("r".into());
        let log = dir.path().join("x.log");
        let err = run(
            RunRequest {
                substrate: &substrate,
                run_id: &run_id,
                blank_dir: dir.path(),
                output_dir: dir.path(),
                log_path: &log,
                timeout: Duration::from_secs(1),
            },
            &StopSignal::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
        assert!(std::fs::read_to_string(&log).unwrap().contains("spawn failed"));
    }
}
