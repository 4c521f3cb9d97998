//! Launching and supervising the single worker (or installer) process.
//!
//! One job slot exists; whoever holds it is represented by a [`RunningJob`].
//! Kills are always hard. Patch installers are spawned stopped so the UI can
//! be told about the restart command before the installer touches anything.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::job::{exe_base_name, job_label, JobId};

/// What became of a worker once it left the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPoll {
    Running,
    /// Exited on its own with this status code (None if signal-killed).
    Exited(Option<i32>),
}

pub struct RunningJob {
    child: Child,
    pub pid: u32,
    pub job_id: JobId,
    pub priority: i32,
    pub exe_name: String,
    pub job_label: String,
    pub master_name: String,
    pub reply_addr: std::net::SocketAddr,
    pub started_at: Instant,
    /// This occupant is a self-update installer rather than a worker.
    pub patching: bool,
}

impl RunningJob {
    /// Spawn `argv` with `cwd` as working directory and take the job slot.
    ///
    /// With `suspended` set, the child is stopped (SIGSTOP) immediately
    /// after the spawn and must be [`resume`](Self::resume)d to make
    /// progress.
    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        argv: &[String],
        cwd: &Path,
        job_id: JobId,
        priority: i32,
        master_name: String,
        reply_addr: std::net::SocketAddr,
        show_output: bool,
        suspended: bool,
    ) -> Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            bail!("empty command line for job {job_id}");
        };

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);
        if show_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        // Suspended children outlive us across a patch restart; everything
        // else dies with the agent.
        cmd.kill_on_drop(!suspended);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn worker process: {program}"))?;
        let pid = child
            .id()
            .context("spawned worker has no PID (already reaped)")?;

        if suspended {
            // SAFETY: pid came from a child we just spawned and have not
            // yet waited on.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGSTOP);
            }
        }

        info!(
            pid,
            job_id = %job_id,
            priority,
            program = %program,
            suspended,
            "launched job process"
        );

        Ok(Self {
            child,
            pid,
            job_id,
            priority,
            exe_name: exe_base_name(program),
            job_label: job_label(argv),
            master_name,
            reply_addr,
            started_at: Instant::now(),
            patching: suspended,
        })
    }

    /// Non-blocking liveness check.
    pub fn poll(&mut self) -> JobPoll {
        match self.child.try_wait() {
            Ok(Some(status)) => JobPoll::Exited(status.code()),
            Ok(None) => JobPoll::Running,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "failed to poll job process");
                JobPoll::Exited(None)
            }
        }
    }

    /// Hard kill. No grace period; the wait reaps the zombie.
    pub async fn kill(&mut self) {
        debug!(pid = self.pid, job_id = %self.job_id, "killing job process");
        if let Err(e) = self.child.kill().await {
            // Already exited is the common benign case here.
            debug!(pid = self.pid, error = %e, "kill returned error");
        }
    }

    /// Continue a child launched suspended.
    pub fn resume(&self) {
        // SAFETY: pid refers to our unreaped child.
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGCONT);
        }
        debug!(pid = self.pid, "resumed suspended process");
    }

    /// Drop the handle without killing the child. Used when a patch
    /// installer must outlive the exiting agent.
    pub fn detach(self) {
        info!(pid = self.pid, "detaching from process");
        // kill_on_drop was disabled at launch for suspended children, so
        // dropping the Child here just closes the handle.
        drop(self.child);
    }

    pub fn runtime_ms(&self) -> u32 {
        self.started_at.elapsed().as_millis().min(u32::MAX as u128) as u32
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn test_addr() -> std::net::SocketAddr {
        "127.0.0.1:23400".parse().unwrap()
    }

    fn launch_shell(script: &str, suspended: bool) -> RunningJob {
        RunningJob::launch(
            &args(&["/bin/sh", "-c", script]),
            Path::new("/tmp"),
            JobId([1, 2, 3, 4]),
            5,
            "master".to_string(),
            test_addr(),
            false,
            suspended,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_exit_observed() {
        let mut job = launch_shell("exit 7", false);
        let mut result = JobPoll::Running;
        for _ in 0..100 {
            result = job.poll();
            if result != JobPoll::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(result, JobPoll::Exited(Some(7)));
    }

    #[tokio::test]
    async fn test_kill_running_process() {
        let mut job = launch_shell("sleep 30", false);
        assert_eq!(job.poll(), JobPoll::Running);
        job.kill().await;
        let mut result = JobPoll::Running;
        for _ in 0..100 {
            result = job.poll();
            if result != JobPoll::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Signal-killed, so no exit code.
        assert_eq!(result, JobPoll::Exited(None));
    }

    #[tokio::test]
    async fn test_suspended_until_resumed() {
        let mut job = launch_shell("exit 0", true);
        // A stopped child makes no progress.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(job.poll(), JobPoll::Running);

        job.resume();
        let mut result = JobPoll::Running;
        for _ in 0..100 {
            result = job.poll();
            if result != JobPoll::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(result, JobPoll::Exited(Some(0)));
    }

    #[tokio::test]
    async fn test_empty_argv_rejected() {
        let result = RunningJob::launch(
            &[],
            Path::new("/tmp"),
            JobId([0, 0, 0, 0]),
            0,
            String::new(),
            test_addr(),
            false,
            false,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_labels_extracted_from_argv() {
        let mut job = RunningJob::launch(
            &args(&["/bin/sleep", "5"]),
            Path::new("/tmp"),
            JobId([9, 9, 9, 9]),
            1,
            "buildbox".to_string(),
            test_addr(),
            false,
            false,
        )
        .unwrap();
        assert_eq!(job.exe_name, "sleep");
        assert_eq!(job.master_name, "buildbox");
        assert!(job.runtime_ms() < 5_000);
        job.kill().await;
    }
}
