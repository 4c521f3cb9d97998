//! The agent's single-threaded control loop.
//!
//! Everything the agent does happens from one 50 ms tick: the worker and
//! transfer subprocesses are polled, the UDP control socket is drained (a
//! bounded number of datagrams per tick), UI commands are applied, and
//! status goes out to whichever services browsers have pinged us recently.
//! One job slot exists; admission decides who gets it.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::browser::BrowserRegistry;
use crate::config::{AgentConfig, NetworkConfig};
use crate::download::{rebase_for_debug, DownloadPoll, PendingDownload};
use crate::job::{master_name, version_is_newer, Admission, JobOffer, RejectReason};
use crate::memory::JobMemory;
use crate::perf::PerfSampler;
use crate::persist::{PersistedFlags, StateStore};
use crate::process::{JobPoll, RunningJob};
use crate::proto::ui::{UiCommand, UiMessage};
use crate::proto::wire::{self, Packet, StatusReport};
use crate::proto::PASSWORD_OVERRIDE;
use crate::state::{external_state, ui_state, StateInputs};
use crate::ui::UiLink;

/// Cadence of the control loop.
const TICK: Duration = Duration::from_millis(50);

/// Datagram notifications are fired this many times, UDP being UDP.
const NOTIFY_REPEATS: u32 = 3;
const NOTIFY_GAP: Duration = Duration::from_millis(50);

/// Minimum spacing between honored remote kill requests.
const KILL_RATE_LIMIT: Duration = Duration::from_secs(5);

/// How often status is pushed to watching browsers unprompted.
const STATUS_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// Final-state announcement window before honoring a stop request.
const STOP_ANNOUNCE_WINDOW: Duration = Duration::from_secs(1);
const STOP_ANNOUNCE_GAP: Duration = Duration::from_millis(200);

/// Startup knobs that come from the command line rather than the config.
#[derive(Default)]
pub struct SupervisorOptions {
    /// Only offers carrying this password are honored.
    pub password: Option<String>,
    /// Run worker binaries from the debug directory with `-allowdebug`.
    pub super_debug: bool,
    /// Show worker output even when the offer did not ask for it.
    pub force_show_output: bool,
}

pub struct Supervisor {
    cfg: AgentConfig,
    socket: UdpSocket,
    bound_port: u16,
    password: String,
    version: String,
    host_name: String,

    flags: PersistedFlags,
    store: Box<dyn StateStore>,

    memory: JobMemory,
    browsers: BrowserRegistry,
    running: Option<RunningJob>,
    pending: Option<PendingDownload>,
    perf: PerfSampler,
    ui: Box<dyn UiLink>,

    /// Reports whether idle-harvest conditions hold right now.
    screensaver_probe: Box<dyn Fn() -> bool + Send + Sync>,
    screensaver_active: bool,

    last_kill: Option<Instant>,
    last_status: Instant,
    started_at: Instant,
    shutdown_requested: bool,
    super_debug: bool,
    force_show_output: bool,
}

impl Supervisor {
    /// Bind the control socket and assemble the supervisor.
    pub async fn bind(
        cfg: AgentConfig,
        store: Box<dyn StateStore>,
        ui: Box<dyn UiLink>,
        opts: SupervisorOptions,
    ) -> Result<Self> {
        let flags = store.load().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load persisted flags, using defaults");
            PersistedFlags::default()
        });

        let (socket, bound_port) = bind_control_socket(&cfg.network).await?;
        info!(bound_port, disabled = flags.disabled, "control socket bound");

        let host_name = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            cfg,
            socket,
            bound_port,
            password: opts.password.unwrap_or_default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host_name,
            flags,
            store,
            memory: JobMemory::new(),
            browsers: BrowserRegistry::new(),
            running: None,
            pending: None,
            perf: PerfSampler::new(),
            ui,
            screensaver_probe: Box::new(|| false),
            screensaver_active: false,
            last_kill: None,
            last_status: Instant::now(),
            started_at: Instant::now(),
            shutdown_requested: false,
            super_debug: opts.super_debug,
            force_show_output: opts.force_show_output,
        })
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    /// Replace the idle-harvest probe.  The default never reports active,
    /// which keeps a screensaver-gated agent idle on platforms with no
    /// probe wired up.
    pub fn set_screensaver_probe(&mut self, probe: Box<dyn Fn() -> bool + Send + Sync>) {
        self.screensaver_probe = probe;
    }

    /// Run the control loop until a shutdown signal or a stop request.
    pub async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.push_ui_state().await;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    info!("shutdown signal received");
                    self.shutdown().await;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.tick().await;
                    if self.shutdown_requested {
                        self.shutdown().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.kill_slot().await;
        self.ui.notify(UiMessage::Exit).await;
        info!("supervisor stopped");
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    async fn tick(&mut self) {
        self.poll_running().await;
        self.poll_download().await;
        self.enforce_screensaver().await;
        self.pump_ui().await;
        self.pump_socket().await;

        self.memory.purge();
        self.browsers.purge();
        if !self.browsers.is_empty() && self.last_status.elapsed() >= STATUS_BROADCAST_INTERVAL {
            self.last_status = Instant::now();
            self.broadcast_status().await;
        }
    }

    async fn poll_running(&mut self) {
        let Some(job) = self.running.as_mut() else {
            return;
        };
        if let JobPoll::Exited(code) = job.poll() {
            let job = self.running.take().unwrap();
            self.perf.clear();
            info!(
                job_id = %job.job_id,
                exe = %job.exe_name,
                exit_code = ?code,
                runtime_ms = job.runtime_ms(),
                "job process exited"
            );
            self.send_repeated(job.reply_addr, &Packet::NotifyEndStatus { job_id: job.job_id })
                .await;
            self.ui
                .notify(UiMessage::ConsoleText {
                    text: format!("{} finished", job.exe_name),
                })
                .await;
            self.push_ui_state().await;
        }
    }

    async fn poll_download(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        match pending.poll().await {
            DownloadPoll::InProgress => {}
            DownloadPoll::Failed => {
                let pending = self.pending.take().unwrap();
                self.send_repeated(
                    pending.reply_addr,
                    &Packet::NotifyStartStatus {
                        job_id: pending.job_id,
                        success: false,
                    },
                )
                .await;
                self.push_ui_state().await;
            }
            DownloadPoll::Ready(args) => {
                let pending = self.pending.take().unwrap();
                self.launch_staged(pending, args).await;
            }
        }
    }

    /// Launch the worker (or installer) whose files just finished staging.
    async fn launch_staged(&mut self, pending: PendingDownload, mut args: Vec<String>) {
        if self.super_debug && !pending.patching {
            rebase_for_debug(&mut args, &self.cfg.transfer.debug_bin_dir);
        }
        let show = pending.show_output || self.force_show_output;
        let master = master_name(&args);

        let launched = RunningJob::launch(
            &args,
            pending.cache_dir(),
            pending.job_id,
            pending.priority,
            master,
            pending.reply_addr,
            show,
            pending.patching,
        );
        match launched {
            Ok(job) => {
                self.send_repeated(
                    job.reply_addr,
                    &Packet::NotifyStartStatus {
                        job_id: job.job_id,
                        success: true,
                    },
                )
                .await;
                if pending.patching {
                    self.hand_off_to_installer(job).await;
                } else {
                    self.perf.bind(job.pid);
                    self.ui
                        .notify(UiMessage::ConsoleText {
                            text: format!(
                                "running {} for {}",
                                job.exe_name, job.master_name
                            ),
                        })
                        .await;
                    self.running = Some(job);
                }
                self.push_ui_state().await;
            }
            Err(e) => {
                warn!(job_id = %pending.job_id, error = %e, "failed to launch staged job");
                self.send_repeated(
                    pending.reply_addr,
                    &Packet::NotifyStartStatus {
                        job_id: pending.job_id,
                        success: false,
                    },
                )
                .await;
                self.push_ui_state().await;
            }
        }
    }

    /// The installer was spawned stopped; tell every UI how to restart
    /// things once it finishes, let it run, and get out of its way.
    async fn hand_off_to_installer(&mut self, job: RunningJob) {
        let relaunch = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join(&self.cfg.service.ui_exe_name)))
            .map(|p| p.to_string_lossy().into_owned());
        self.ui
            .notify(UiMessage::Patching {
                exit_after: true,
                working_dir: self.cfg.paths.cache_dir.to_string_lossy().into_owned(),
                command_line: relaunch.into_iter().collect(),
            })
            .await;

        info!(pid = job.pid, "handing off to installer");
        job.resume();
        job.detach();
        self.shutdown_requested = true;
    }

    async fn enforce_screensaver(&mut self) {
        self.screensaver_active = (self.screensaver_probe)();
        if !self.flags.screensaver_mode || self.screensaver_active {
            return;
        }
        // Harvest window closed: evict everything except a self-update.
        if let Some(job) = self.running.as_mut() {
            if !job.patching {
                info!(job_id = %job.job_id, "screensaver deactivated, evicting job");
                job.kill().await;
            }
        }
        if self.pending.as_ref().is_some_and(|p| !p.patching) {
            let mut pending = self.pending.take().unwrap();
            info!(job_id = %pending.job_id, "screensaver deactivated, cancelling transfer");
            pending.cancel().await;
            self.push_ui_state().await;
        }
    }

    async fn pump_ui(&mut self) {
        let current = self.ui_state_message();
        for cmd in self.ui.poll(current).await {
            self.apply_ui_command(cmd).await;
        }
    }

    async fn pump_socket(&mut self) {
        let mut buf = [0u8; 4096];
        for _ in 0..self.cfg.network.max_packets_per_tick {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    let data = buf[..len].to_vec();
                    self.handle_datagram(&data, from).await;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "control socket receive failed");
                    break;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Datagram handling
    // -----------------------------------------------------------------------

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let (password, packet) = match wire::decode(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed datagram");
                return;
            }
        };

        match packet {
            Packet::LookingForWorkers(payload) => {
                if !self.password_ok(&password) {
                    return;
                }
                let offer = JobOffer::from_wire(payload, from, false);
                self.admit_logged(offer).await;
            }
            Packet::ServicePatch(payload) => {
                if !self.password_ok(&password) {
                    return;
                }
                let offer = JobOffer::from_wire(payload, from, true);
                self.admit_logged(offer).await;
            }
            Packet::PingRequest => {
                self.browsers.observe(from);
                let status = self.build_status();
                self.send_packet(from, &Packet::PingResponse(status)).await;
            }
            Packet::KillProcess => {
                self.browsers.observe(from);
                if self.kill_allowed() {
                    info!(%from, "remote kill request");
                    self.kill_slot().await;
                    self.push_ui_state().await;
                } else {
                    debug!(%from, "remote kill request rate-limited");
                }
            }
            Packet::StopService => {
                self.browsers.observe(from);
                info!(%from, "remote stop request");
                // Give watching browsers a last look at the state before
                // the socket goes away.
                let deadline = Instant::now() + STOP_ANNOUNCE_WINDOW;
                while Instant::now() < deadline {
                    self.broadcast_status().await;
                    tokio::time::sleep(STOP_ANNOUNCE_GAP).await;
                }
                self.shutdown_requested = true;
            }
            Packet::ForcePasswordChange { password: new } => {
                info!(%from, "password changed remotely");
                self.password = new;
                self.push_ui_state().await;
            }
            // These flow from agents to masters and browsers, never back.
            Packet::PingResponse(_)
            | Packet::NotifyStartStatus { .. }
            | Packet::NotifyEndStatus { .. } => {}
        }
    }

    fn password_ok(&self, offered: &str) -> bool {
        if offered.as_bytes().first() == Some(&PASSWORD_OVERRIDE) {
            return true;
        }
        offered.eq_ignore_ascii_case(&self.password)
    }

    fn kill_allowed(&mut self) -> bool {
        let now = Instant::now();
        match self.last_kill {
            Some(at) if now.duration_since(at) < KILL_RATE_LIMIT => false,
            _ => {
                self.last_kill = Some(now);
                true
            }
        }
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    async fn admit_logged(&mut self, offer: JobOffer) {
        let job_id = offer.job_id;
        let from = offer.reply_addr;
        match self.admit(offer).await {
            Admission::Accepted => info!(%job_id, %from, "offer accepted"),
            Admission::Rejected(RejectReason::Duplicate) => {}
            Admission::Rejected(reason) => {
                debug!(%job_id, %from, %reason, "offer rejected");
            }
        }
    }

    /// Decide what happens to one job offer.
    ///
    /// Every offer that gets this far is recorded against its job id, so a
    /// rejected offer's retransmits stay quiet instead of being re-judged.
    pub async fn admit(&mut self, offer: JobOffer) -> Admission {
        self.memory.purge();
        if self.memory.contains(offer.job_id) {
            return Admission::Rejected(RejectReason::Duplicate);
        }
        self.memory.record(offer.job_id);

        if let Some(version) = offer.patch_version.as_deref() {
            // Patches bypass the disabled and screensaver gates; keeping the
            // fleet current matters more than the operator's toggle.
            if !offer.force_patch && !version_is_newer(version, &self.version) {
                return Admission::Rejected(RejectReason::PatchAlreadyApplied);
            }
            self.kill_slot().await;
        } else {
            if self.flags.disabled {
                return Admission::Rejected(RejectReason::NotAccepting);
            }
            if self.flags.screensaver_mode && !self.screensaver_active {
                return Admission::Rejected(RejectReason::NotAccepting);
            }
            let occupant = self
                .running
                .as_ref()
                .map(|j| if j.patching { i32::MAX } else { j.priority })
                .or_else(|| self.pending.as_ref().map(|p| if p.patching { i32::MAX } else { p.priority }));
            if let Some(priority) = occupant {
                if offer.priority <= priority {
                    return Admission::Rejected(RejectReason::LowerPriority);
                }
                self.kill_slot().await;
            }
        }

        match PendingDownload::begin(
            &offer,
            &self.cfg.transfer,
            &self.cfg.paths.cache_dir,
            &self.cfg.service.installer_name,
        ) {
            Ok(pending) => {
                self.pending = Some(pending);
                self.push_ui_state().await;
                Admission::Accepted
            }
            Err(e) => {
                warn!(job_id = %offer.job_id, error = %e, "failed to start transfer");
                Admission::Rejected(RejectReason::DownloadFailed)
            }
        }
    }

    /// Evict whatever currently occupies the job slot, synchronously: the
    /// kill reaps the child and the end status goes out before anything
    /// new takes the slot, so at no point do a running job and a pending
    /// download coexist.
    async fn kill_slot(&mut self) {
        if let Some(mut job) = self.running.take() {
            job.kill().await;
            self.perf.clear();
            info!(job_id = %job.job_id, exe = %job.exe_name, "job evicted");
            self.send_repeated(job.reply_addr, &Packet::NotifyEndStatus { job_id: job.job_id })
                .await;
        }
        if let Some(mut pending) = self.pending.take() {
            pending.cancel().await;
        }
    }

    // -----------------------------------------------------------------------
    // Status and UI
    // -----------------------------------------------------------------------

    fn state_inputs(&self) -> StateInputs {
        StateInputs {
            running: self.running.is_some(),
            downloading: self.pending.is_some(),
            patching: self.running.as_ref().map(|j| j.patching).unwrap_or(false)
                || self.pending.as_ref().map(|p| p.patching).unwrap_or(false),
            disabled: self.flags.disabled,
            screensaver_mode: self.flags.screensaver_mode,
            screensaver_active: self.screensaver_active,
        }
    }

    fn build_status(&mut self) -> StatusReport {
        let sample = self.perf.sample();
        StatusReport {
            state: external_state(self.state_inputs()) as u8,
            uptime_ms: self.started_at.elapsed().as_millis().min(u32::MAX as u128) as u32,
            bound_port: self.bound_port,
            host_name: self.host_name.clone(),
            master_name: self
                .running
                .as_ref()
                .map(|j| j.master_name.clone())
                .unwrap_or_default(),
            worker_runtime_ms: self.running.as_ref().map(|j| j.runtime_ms()).unwrap_or(0),
            password: self.password.clone(),
            agent_version: self.version.clone(),
            cpu_percent: sample.cpu_percent,
            exe_name: self
                .running
                .as_ref()
                .map(|j| j.exe_name.clone())
                .unwrap_or_default(),
            memory_mb: sample.memory_mb,
            job_label: self
                .running
                .as_ref()
                .map(|j| j.job_label.clone())
                .unwrap_or_default(),
        }
    }

    async fn broadcast_status(&mut self) {
        let status = self.build_status();
        let targets: Vec<SocketAddr> = self.browsers.addrs().collect();
        for addr in targets {
            self.send_packet(addr, &Packet::PingResponse(status.clone()))
                .await;
        }
    }

    fn ui_state_message(&self) -> UiMessage {
        UiMessage::State {
            state: ui_state(self.state_inputs()),
            screensaver_mode: self.flags.screensaver_mode,
            password: self.password.clone(),
        }
    }

    async fn push_ui_state(&mut self) {
        let msg = self.ui_state_message();
        self.ui.notify(msg).await;
        // State changed; let the next tick refresh the browsers early too.
        self.last_status = Instant::now() - STATUS_BROADCAST_INTERVAL;
    }

    async fn apply_ui_command(&mut self, cmd: UiCommand) {
        match cmd {
            UiCommand::KillProcess => self.kill_slot().await,
            UiCommand::Disable => {
                self.flags.disabled = true;
                self.persist_flags();
                self.kill_slot().await;
            }
            UiCommand::Enable => {
                self.flags.disabled = false;
                self.persist_flags();
            }
            UiCommand::SetScreensaverMode { on } => {
                self.flags.screensaver_mode = on;
                self.persist_flags();
            }
            UiCommand::UpdatePassword { password } => {
                info!("password changed from UI");
                self.password = password;
            }
            UiCommand::Exit => {
                info!("stop requested from UI");
                self.shutdown_requested = true;
            }
        }
        self.push_ui_state().await;
    }

    fn persist_flags(&mut self) {
        if let Err(e) = self.store.save(&self.flags) {
            warn!(error = %e, "failed to persist service flags");
        }
    }

    // -----------------------------------------------------------------------
    // Socket helpers
    // -----------------------------------------------------------------------

    async fn send_packet(&self, addr: SocketAddr, packet: &Packet) {
        let bytes = wire::encode(&self.password, packet);
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            debug!(%addr, error = %e, "failed to send control packet");
        }
    }

    /// Fire-and-repeat for the notifications masters actually wait on.
    async fn send_repeated(&self, addr: SocketAddr, packet: &Packet) {
        for i in 0..NOTIFY_REPEATS {
            self.send_packet(addr, packet).await;
            if i + 1 < NOTIFY_REPEATS {
                tokio::time::sleep(NOTIFY_GAP).await;
            }
        }
    }
}

/// Bind the first free UDP port in the configured range.  A base port of
/// zero binds an ephemeral port instead of scanning.
async fn bind_control_socket(cfg: &NetworkConfig) -> Result<(UdpSocket, u16)> {
    if cfg.base_port == 0 {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .context("failed to bind ephemeral control port")?;
        let port = socket.local_addr()?.port();
        return Ok((socket, port));
    }

    for offset in 0..cfg.port_range {
        let port = cfg.base_port + offset;
        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => return Ok((socket, port)),
            Err(e) => {
                debug!(port, error = %e, "control port busy, trying next");
            }
        }
    }
    bail!(
        "no free control port in {}..{}",
        cfg.base_port,
        cfg.base_port + cfg.port_range
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
