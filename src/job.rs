//! Job offers and admission verdicts.

use std::fmt;
use std::net::SocketAddr;

use crate::proto::wire::OfferPayload;

/// Random 128-bit token identifying one job offer, assigned by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub [i32; 4]);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:08x}-{:08x}-{:08x}",
            self.0[0] as u32, self.0[1] as u32, self.0[2] as u32, self.0[3] as u32
        )
    }
}

/// A job offer as received from a master, with the sender address resolved.
#[derive(Debug, Clone)]
pub struct JobOffer {
    pub job_id: JobId,
    pub priority: i32,
    /// Worker command line, starting with the executable name.
    pub args: Vec<String>,
    /// Show the worker's output instead of discarding it.
    pub show_worker_output: bool,
    /// Set for self-update offers; names the version being pushed.
    pub patch_version: Option<String>,
    pub force_patch: bool,
    /// Where start/end status notifications go.
    pub reply_addr: SocketAddr,
    /// Port the transfer tool pulls files from on the master.
    pub downloader_port: u16,
}

impl JobOffer {
    /// Build an offer from a decoded payload and the datagram's source.
    ///
    /// The reply address is the sender's IP at the payload's reply port.
    /// The worker output flag is driven by the `-mpi_ShowAppWindow` argv
    /// convention the masters use.
    pub fn from_wire(payload: OfferPayload, from: SocketAddr, patch: bool) -> Self {
        let show_worker_output = payload
            .args
            .iter()
            .any(|a| a.eq_ignore_ascii_case("-mpi_ShowAppWindow"));
        let downloader_port = payload.downloader_port.unwrap_or(payload.reply_port);
        let reply_addr = SocketAddr::new(from.ip(), payload.reply_port);
        let patch_version = if patch && !payload.patch_version.is_empty() {
            Some(payload.patch_version)
        } else {
            None
        };

        JobOffer {
            job_id: payload.job_id,
            priority: payload.priority as i32,
            args: payload.args,
            show_worker_output,
            patch_version,
            force_patch: payload.force_patch,
            reply_addr,
            downloader_port,
        }
    }

    pub fn is_patch(&self) -> bool {
        self.patch_version.is_some()
    }
}

/// Outcome of running an offer through admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Same job id seen within the dedup window.
    Duplicate,
    /// Agent is disabled or screensaver-gated.
    NotAccepting,
    /// An equal-or-higher-priority job already occupies the slot.
    LowerPriority,
    /// Patch version is not newer than the running agent.
    PatchAlreadyApplied,
    /// The transfer subprocess could not be started.
    DownloadFailed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Duplicate => "duplicate job id",
            RejectReason::NotAccepting => "not accepting jobs",
            RejectReason::LowerPriority => "lower or equal priority",
            RejectReason::PatchAlreadyApplied => "patch already applied",
            RejectReason::DownloadFailed => "download could not start",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Argv inspection helpers
// ---------------------------------------------------------------------------

/// Base name of a path-ish argv entry, extension stripped.
pub fn exe_base_name(arg: &str) -> String {
    let base = arg
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(arg);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => base.to_string(),
    }
}

/// Human-readable label for a job: for the map compilers the last argument
/// is the map being built, which is what operators want to see.
pub fn job_label(args: &[String]) -> String {
    if args.is_empty() {
        return String::new();
    }
    let exe = exe_base_name(&args[0]);
    if (exe.eq_ignore_ascii_case("vrad") || exe.eq_ignore_ascii_case("vvis")) && args.len() > 1 {
        exe_base_name(args.last().unwrap())
    } else {
        String::new()
    }
}

/// Machine name of the offering master, carried in argv purely so crashed
/// jobs can be traced back to whoever ran them.
pub fn master_name(args: &[String]) -> String {
    for pair in args.windows(2) {
        if pair[0].eq_ignore_ascii_case("-mpi_MasterName") {
            return pair[1].clone();
        }
    }
    "<unknown>".to_string()
}

/// Compare two dotted version strings numerically, the way the patch gate
/// does: the leading numeric portion decides, malformed input reads as zero.
pub fn version_is_newer(candidate: &str, running: &str) -> bool {
    fn leading_number(s: &str) -> f64 {
        let end = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        s[..end].parse().unwrap_or(0.0)
    }
    leading_number(candidate) > leading_number(running)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exe_base_name() {
        assert_eq!(exe_base_name("vrad.exe"), "vrad");
        assert_eq!(exe_base_name("/opt/farm/cache/vrad"), "vrad");
        assert_eq!(exe_base_name("c:\\hl2\\bin\\vvis.exe"), "vvis");
        assert_eq!(exe_base_name("vrad"), "vrad");
    }

    #[test]
    fn test_job_label_map_compilers() {
        let args: Vec<String> = ["vrad.exe", "-game", "hl2", "maps/d1_canals_01.bsp"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(job_label(&args), "d1_canals_01");

        let other: Vec<String> = ["shadercomp.exe", "-all"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(job_label(&other), "");
    }

    #[test]
    fn test_master_name_lookup() {
        let args: Vec<String> = ["vrad", "-mpi_MasterName", "buildmaster", "map"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(master_name(&args), "buildmaster");
        assert_eq!(master_name(&["vrad".to_string()]), "<unknown>");
    }

    #[test]
    fn test_version_comparison() {
        assert!(version_is_newer("2.1", "2.0"));
        assert!(!version_is_newer("2.0", "2.0"));
        assert!(!version_is_newer("1.9", "2.0"));
        // Malformed versions read as zero, matching the original parser.
        assert!(!version_is_newer("garbage", "0.1"));
        assert!(version_is_newer("0.2", "garbage"));
    }

    #[test]
    fn test_offer_from_wire() {
        use crate::proto::wire::OfferPayload;

        let payload = OfferPayload {
            patch_version: String::new(),
            reply_port: 21140,
            priority: 5,
            job_id: JobId([1, 2, 3, 4]),
            args: vec!["vrad".into(), "-mpi_ShowAppWindow".into()],
            force_patch: false,
            downloader_port: None,
        };
        let from: SocketAddr = "10.0.0.9:50000".parse().unwrap();
        let offer = JobOffer::from_wire(payload, from, false);

        assert_eq!(offer.reply_addr, "10.0.0.9:21140".parse().unwrap());
        assert_eq!(offer.downloader_port, 21140); // falls back to reply port
        assert!(offer.show_worker_output);
        assert!(!offer.is_patch());
    }
}
