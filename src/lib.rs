//! farmhand: a build-farm compilation agent.
//!
//! Each machine on the farm runs one agent.  Masters broadcast job offers
//! over UDP; the agent admits at most one job at a time, stages its files
//! through the transfer tool, runs the worker process, and reports status
//! to anyone watching.  A small localhost link keeps the companion desktop
//! UI informed.

pub mod browser;
pub mod config;
pub mod download;
pub mod job;
pub mod memory;
pub mod perf;
pub mod persist;
pub mod process;
pub mod proto;
pub mod state;
pub mod supervisor;
pub mod ui;

use anyhow::Result;
use tokio::sync::oneshot;
use tracing::warn;

use crate::config::AgentConfig;
use crate::persist::{MemoryStateStore, StateStore, TomlStateStore};
use crate::supervisor::{Supervisor, SupervisorOptions};
use crate::ui::{NullUiLink, UiLink, UiServer};

/// Assemble and run the agent until `shutdown_rx` fires or a remote stop
/// request arrives.
///
/// Console runs keep their flags in memory instead of touching the state
/// file, so a trial run never flips a deployed agent's persisted toggles.
pub async fn serve(
    cfg: AgentConfig,
    opts: SupervisorOptions,
    console: bool,
    shutdown_rx: oneshot::Receiver<()>,
) -> Result<()> {
    if cfg.service.low_priority {
        // Workers inherit this; farm work must always yield to whoever
        // owns the machine.
        unsafe {
            libc::nice(10);
        }
    }

    let store: Box<dyn StateStore> = if console {
        Box::new(MemoryStateStore::new())
    } else {
        Box::new(TomlStateStore::new(&cfg.paths.state_file))
    };

    let ui: Box<dyn UiLink> = match UiServer::bind(&cfg.network.ui_bind).await {
        Ok(server) => Box::new(server),
        Err(e) => {
            warn!(error = %e, "UI listener unavailable, running headless");
            Box::new(NullUiLink)
        }
    };

    let supervisor = Supervisor::bind(cfg, store, ui, opts).await?;
    supervisor.run(shutdown_rx).await
}
