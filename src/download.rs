//! Staging job files through the transfer subprocess.
//!
//! An accepted offer first becomes a [`PendingDownload`]: the cache is
//! cleared, the transfer tool is spawned against the master's downloader
//! port, and the tick loop polls until the tool drops its completion
//! sentinel in the cache.  Only then is the worker command line handed back
//! for launch.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::job::{JobId, JobOffer};

/// File the transfer tool creates in the cache once every job file landed.
pub const TRANSFER_COMPLETE_FILE: &str = "transfer_complete";

/// Outcome of polling an in-flight download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadPoll {
    InProgress,
    /// Transfer died, produced no sentinel, or overran its deadline.
    Failed,
    /// All files staged; launch the worker with this command line.
    Ready(Vec<String>),
}

pub struct PendingDownload {
    child: Child,
    cache_dir: PathBuf,
    worker_args: Vec<String>,
    pub job_id: JobId,
    pub priority: i32,
    pub show_output: bool,
    pub patching: bool,
    pub reply_addr: SocketAddr,
    started_at: Instant,
    timeout: Duration,
}

impl PendingDownload {
    /// Clear the cache and start the transfer tool for `offer`.
    pub fn begin(
        offer: &JobOffer,
        transfer: &TransferConfig,
        cache_dir: &Path,
        installer_name: &str,
    ) -> Result<Self> {
        // Fresh cache per job; leftovers from the previous job are garbage.
        let _ = std::fs::remove_dir_all(cache_dir);
        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("failed to create cache dir: {}", cache_dir.display()))?;

        let downloader_addr = SocketAddr::new(offer.reply_addr.ip(), offer.downloader_port);
        let mut worker_args = offer.args.clone();
        if worker_args.is_empty() {
            bail!("empty command line in offer {}", offer.job_id);
        }

        // Whatever the master named, the job runs the binary that was just
        // staged into the cache, never a PATH lookup.
        if offer.is_patch() {
            // The installer artifact lands in the cache under a fixed name;
            // run it from there, quietly, leaving the UI to us.
            worker_args[0] = cache_dir.join(installer_name).to_string_lossy().into_owned();
            worker_args.insert(1, "-Install_Quiet".to_string());
            worker_args.insert(2, "-DontTouchUI".to_string());
        } else {
            let base = base_name(&worker_args[0]).to_string();
            worker_args[0] = cache_dir.join(base).to_string_lossy().into_owned();
        }
        ensure_worker_endpoint(&mut worker_args, downloader_addr);

        let transfer_args = transfer_command_args(&worker_args, cache_dir, downloader_addr);
        let mut cmd = Command::new(&transfer.path);
        cmd.args(&transfer_args).kill_on_drop(true);
        if offer.show_worker_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn transfer tool: {}", transfer.path))?;

        // The transfer pulls from the downloader port, but the worker itself
        // must dial the master's main port once it starts.
        ensure_worker_endpoint(&mut worker_args, offer.reply_addr);

        info!(
            job_id = %offer.job_id,
            priority = offer.priority,
            downloader = %downloader_addr,
            patch = offer.is_patch(),
            "transfer started"
        );

        Ok(Self {
            child,
            cache_dir: cache_dir.to_path_buf(),
            worker_args,
            job_id: offer.job_id,
            priority: offer.priority,
            show_output: offer.show_worker_output,
            patching: offer.is_patch(),
            reply_addr: offer.reply_addr,
            started_at: Instant::now(),
            timeout: Duration::from_secs(transfer.timeout_sec),
        })
    }

    /// Advance the download state machine by one observation.
    pub async fn poll(&mut self) -> DownloadPoll {
        if self.cache_dir.join(TRANSFER_COMPLETE_FILE).exists() {
            debug!(job_id = %self.job_id, "transfer complete");
            return DownloadPoll::Ready(self.worker_args.clone());
        }

        if self.started_at.elapsed() >= self.timeout {
            warn!(
                job_id = %self.job_id,
                timeout_sec = self.timeout.as_secs(),
                "transfer timed out"
            );
            self.cancel().await;
            return DownloadPoll::Failed;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                // Exit without the sentinel means the transfer gave up.
                warn!(job_id = %self.job_id, ?status, "transfer exited without completing");
                DownloadPoll::Failed
            }
            Ok(None) => DownloadPoll::InProgress,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "failed to poll transfer tool");
                DownloadPoll::Failed
            }
        }
    }

    /// Hard-kill the transfer tool and abandon the job.
    pub async fn cancel(&mut self) {
        debug!(job_id = %self.job_id, "cancelling transfer");
        if let Err(e) = self.child.kill().await {
            debug!(job_id = %self.job_id, error = %e, "transfer kill returned error");
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

// ---------------------------------------------------------------------------
// Command-line plumbing
// ---------------------------------------------------------------------------

/// Build the transfer tool's argument list: cache destination, downloader
/// endpoint, and the `-mpi_file` / `-mpi_filebase` pairs naming what to pull.
fn transfer_command_args(
    worker_args: &[String],
    cache_dir: &Path,
    downloader_addr: SocketAddr,
) -> Vec<String> {
    let mut out = vec![
        "-CachePath".to_string(),
        cache_dir.to_string_lossy().into_owned(),
        "-mpi_worker".to_string(),
        downloader_addr.to_string(),
    ];
    let mut iter = worker_args.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg.eq_ignore_ascii_case("-mpi_file") || arg.eq_ignore_ascii_case("-mpi_filebase") {
            if let Some(value) = iter.next() {
                out.push(arg.clone());
                out.push(value.clone());
            }
        }
    }
    out
}

/// Point the `-mpi_worker` argument at `addr`, inserting the pair right
/// after the executable when the master's argv did not carry one.
fn ensure_worker_endpoint(args: &mut Vec<String>, addr: SocketAddr) {
    for i in 0..args.len().saturating_sub(1) {
        if args[i].eq_ignore_ascii_case("-mpi_worker") {
            args[i + 1] = addr.to_string();
            return;
        }
    }
    args.insert(1, "-mpi_worker".to_string());
    args.insert(2, addr.to_string());
}

/// Last path component, tolerating either separator style.
fn base_name(arg: &str) -> &str {
    arg.rsplit(['/', '\\']).next().unwrap_or(arg)
}

/// Rebase the worker executable into the debug binary directory and allow
/// debugger attachment.  Used in super-debug trial runs only.
pub fn rebase_for_debug(args: &mut Vec<String>, debug_bin_dir: &Path) {
    if args.is_empty() {
        return;
    }
    let base = base_name(&args[0]).to_string();
    args[0] = debug_bin_dir.join(base).to_string_lossy().into_owned();
    args.insert(1, "-allowdebug".to_string());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
