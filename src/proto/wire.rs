//! Binary codec for the UDP control protocol.
//!
//! One packet per datagram, all multi-byte fields little-endian, strings
//! NUL-terminated.  Decoding is strict about truncation: any packet that
//! runs out of bytes mid-field decodes to an error, and the listener drops
//! it silently.  That mirrors the tolerance the farm has always had for
//! retransmitted or mangled broadcasts.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use super::{kind, PROTOCOL_VERSION};
use crate::job::JobId;

/// Hard cap on argv entries in a job offer; anything larger is junk.
const MAX_OFFER_ARGS: usize = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram truncated")]
    Truncated,
    #[error("protocol version mismatch (got {0}, want {PROTOCOL_VERSION})")]
    VersionMismatch(u8),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("unreasonable field count {0}")]
    FieldCount(usize),
}

// ---------------------------------------------------------------------------
// Packet model
// ---------------------------------------------------------------------------

/// Payload of a `LOOKING_FOR_WORKERS` or `SERVICE_PATCH` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferPayload {
    /// Non-empty for patch offers; names the version being pushed.
    pub patch_version: String,
    /// Port the master listens on for accepted workers.
    pub reply_port: u16,
    /// Job priority; higher preempts lower.
    pub priority: u16,
    pub job_id: JobId,
    /// Worker command line, starting with the executable name.
    pub args: Vec<String>,
    /// Apply a patch even if the version is not newer.
    pub force_patch: bool,
    /// Port the transfer tool should pull from; older masters omit it and
    /// the reply port is used instead.
    pub downloader_port: Option<u16>,
}

/// Status block carried in a `PING_RESPONSE` to services browsers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// External state byte, see [`crate::state::ExternalState`].
    pub state: u8,
    pub uptime_ms: u32,
    pub bound_port: u16,
    pub host_name: String,
    /// Machine name of the master that offered the current job, if any.
    pub master_name: String,
    /// How long the current worker process has been running.
    pub worker_runtime_ms: u32,
    /// Current password, so browsers can display it.
    pub password: String,
    pub agent_version: String,
    pub cpu_percent: u8,
    pub exe_name: String,
    pub memory_mb: u16,
    pub job_label: String,
}

/// A decoded control packet, password already stripped off the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    LookingForWorkers(OfferPayload),
    ServicePatch(OfferPayload),
    PingRequest,
    PingResponse(StatusReport),
    KillProcess,
    StopService,
    ForcePasswordChange { password: String },
    NotifyStartStatus { job_id: JobId, success: bool },
    NotifyEndStatus { job_id: JobId },
}

impl Packet {
    pub fn kind(&self) -> u8 {
        match self {
            Packet::LookingForWorkers(_) => kind::LOOKING_FOR_WORKERS,
            Packet::ServicePatch(_) => kind::SERVICE_PATCH,
            Packet::PingRequest => kind::PING_REQUEST,
            Packet::PingResponse(_) => kind::PING_RESPONSE,
            Packet::KillProcess => kind::KILL_PROCESS,
            Packet::StopService => kind::STOP_SERVICE,
            Packet::ForcePasswordChange { .. } => kind::FORCE_PASSWORD_CHANGE,
            Packet::NotifyStartStatus { .. } => kind::NOTIFY_START_STATUS,
            Packet::NotifyEndStatus { .. } => kind::NOTIFY_END_STATUS,
        }
    }
}

// ---------------------------------------------------------------------------
// Primitive readers
// ---------------------------------------------------------------------------

fn get_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32_le())
}

fn get_i32(buf: &mut &[u8]) -> Result<i32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_i32_le())
}

/// Read a NUL-terminated string.  Missing terminator counts as truncation.
fn get_cstr(buf: &mut &[u8]) -> Result<String, WireError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::Truncated)?;
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(s)
}

fn get_job_id(buf: &mut &[u8]) -> Result<JobId, WireError> {
    Ok(JobId([
        get_i32(buf)?,
        get_i32(buf)?,
        get_i32(buf)?,
        get_i32(buf)?,
    ]))
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_job_id(buf: &mut BytesMut, id: &JobId) {
    for v in id.0 {
        buf.put_i32_le(v);
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a full control datagram: version byte, password, kind, payload.
///
/// Returns the password string and the packet.  The caller is responsible
/// for the password policy; a wrong version or any malformed payload is an
/// error here and a silent drop at the call site.
pub fn decode(datagram: &[u8]) -> Result<(String, Packet), WireError> {
    let mut buf = datagram;

    let version = get_u8(&mut buf)?;
    if version != PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch(version));
    }

    let password = get_cstr(&mut buf)?;
    let packet_kind = get_u8(&mut buf)?;

    let packet = match packet_kind {
        kind::LOOKING_FOR_WORKERS => Packet::LookingForWorkers(decode_offer(&mut buf)?),
        kind::SERVICE_PATCH => Packet::ServicePatch(decode_offer(&mut buf)?),
        kind::PING_REQUEST => Packet::PingRequest,
        kind::PING_RESPONSE => Packet::PingResponse(decode_status(&mut buf)?),
        kind::KILL_PROCESS => Packet::KillProcess,
        kind::STOP_SERVICE => Packet::StopService,
        kind::FORCE_PASSWORD_CHANGE => Packet::ForcePasswordChange {
            password: get_cstr(&mut buf)?,
        },
        kind::NOTIFY_START_STATUS => Packet::NotifyStartStatus {
            job_id: get_job_id(&mut buf)?,
            success: get_u8(&mut buf)? != 0,
        },
        kind::NOTIFY_END_STATUS => Packet::NotifyEndStatus {
            job_id: get_job_id(&mut buf)?,
        },
        other => return Err(WireError::UnknownKind(other)),
    };

    Ok((password, packet))
}

fn decode_offer(buf: &mut &[u8]) -> Result<OfferPayload, WireError> {
    let patch_version = get_cstr(buf)?;
    let reply_port = get_u16(buf)?;
    let priority = get_u16(buf)?;
    let job_id = get_job_id(buf)?;

    let argc = get_u16(buf)? as usize;
    if argc > MAX_OFFER_ARGS {
        return Err(WireError::FieldCount(argc));
    }
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        args.push(get_cstr(buf)?);
    }

    // Trailing fields are optional for compatibility with older masters.
    let force_patch = if buf.remaining() >= 1 {
        get_u8(buf)? != 0
    } else {
        false
    };
    let downloader_port = if buf.remaining() >= 2 {
        Some(get_u16(buf)?)
    } else {
        None
    };

    Ok(OfferPayload {
        patch_version,
        reply_port,
        priority,
        job_id,
        args,
        force_patch,
        downloader_port,
    })
}

fn decode_status(buf: &mut &[u8]) -> Result<StatusReport, WireError> {
    Ok(StatusReport {
        state: get_u8(buf)?,
        uptime_ms: get_u32(buf)?,
        bound_port: get_u16(buf)?,
        host_name: get_cstr(buf)?,
        master_name: get_cstr(buf)?,
        worker_runtime_ms: get_u32(buf)?,
        password: get_cstr(buf)?,
        agent_version: get_cstr(buf)?,
        cpu_percent: get_u8(buf)?,
        exe_name: get_cstr(buf)?,
        memory_mb: get_u16(buf)?,
        job_label: get_cstr(buf)?,
    })
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a control datagram with the standard header.
pub fn encode(password: &str, packet: &Packet) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_u8(PROTOCOL_VERSION);
    put_cstr(&mut buf, password);
    buf.put_u8(packet.kind());

    match packet {
        Packet::LookingForWorkers(offer) | Packet::ServicePatch(offer) => {
            put_cstr(&mut buf, &offer.patch_version);
            buf.put_u16_le(offer.reply_port);
            buf.put_u16_le(offer.priority);
            put_job_id(&mut buf, &offer.job_id);
            buf.put_u16_le(offer.args.len() as u16);
            for arg in &offer.args {
                put_cstr(&mut buf, arg);
            }
            buf.put_u8(offer.force_patch as u8);
            if let Some(port) = offer.downloader_port {
                buf.put_u16_le(port);
            }
        }
        Packet::PingResponse(status) => {
            buf.put_u8(status.state);
            buf.put_u32_le(status.uptime_ms);
            buf.put_u16_le(status.bound_port);
            put_cstr(&mut buf, &status.host_name);
            put_cstr(&mut buf, &status.master_name);
            buf.put_u32_le(status.worker_runtime_ms);
            put_cstr(&mut buf, &status.password);
            put_cstr(&mut buf, &status.agent_version);
            buf.put_u8(status.cpu_percent);
            put_cstr(&mut buf, &status.exe_name);
            buf.put_u16_le(status.memory_mb);
            put_cstr(&mut buf, &status.job_label);
        }
        Packet::ForcePasswordChange { password } => put_cstr(&mut buf, password),
        Packet::NotifyStartStatus { job_id, success } => {
            put_job_id(&mut buf, job_id);
            buf.put_u8(*success as u8);
        }
        Packet::NotifyEndStatus { job_id } => put_job_id(&mut buf, job_id),
        Packet::PingRequest | Packet::KillProcess | Packet::StopService => {}
    }

    buf.to_vec()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_offer() -> OfferPayload {
        OfferPayload {
            patch_version: String::new(),
            reply_port: 21140,
            priority: 5,
            job_id: JobId([1, 2, 3, 4]),
            args: vec![
                "vrad".to_string(),
                "-game".to_string(),
                "hl2".to_string(),
            ],
            force_patch: false,
            downloader_port: Some(21141),
        }
    }

    #[test]
    fn test_offer_round_trip() {
        let offer = sample_offer();
        let bytes = encode("secret", &Packet::LookingForWorkers(offer.clone()));
        let (password, packet) = decode(&bytes).expect("decode");
        assert_eq!(password, "secret");
        assert_eq!(packet, Packet::LookingForWorkers(offer));
    }

    #[test]
    fn test_patch_offer_round_trip() {
        let mut offer = sample_offer();
        offer.patch_version = "2.0".to_string();
        offer.force_patch = true;
        let bytes = encode("", &Packet::ServicePatch(offer.clone()));
        let (password, packet) = decode(&bytes).expect("decode");
        assert!(password.is_empty());
        assert_eq!(packet, Packet::ServicePatch(offer));
    }

    #[test]
    fn test_offer_without_trailing_fields() {
        // Older masters stop after the argv block.
        let offer = sample_offer();
        let mut bytes = encode("", &Packet::LookingForWorkers(offer.clone()));
        bytes.truncate(bytes.len() - 3); // drop force-patch byte + downloader port

        let (_, packet) = decode(&bytes).expect("decode");
        match packet {
            Packet::LookingForWorkers(decoded) => {
                assert!(!decoded.force_patch);
                assert_eq!(decoded.downloader_port, None);
                assert_eq!(decoded.args, offer.args);
            }
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[test]
    fn test_status_round_trip() {
        let status = StatusReport {
            state: 1,
            uptime_ms: 123_456,
            bound_port: 23397,
            host_name: "farm-07".to_string(),
            master_name: "buildmaster".to_string(),
            worker_runtime_ms: 9_000,
            password: "pw".to_string(),
            agent_version: "0.1.0".to_string(),
            cpu_percent: 87,
            exe_name: "vrad".to_string(),
            memory_mb: 412,
            job_label: "d1_canals_01".to_string(),
        };
        let bytes = encode("pw", &Packet::PingResponse(status.clone()));
        let (_, packet) = decode(&bytes).expect("decode");
        assert_eq!(packet, Packet::PingResponse(status));
    }

    #[test]
    fn test_notify_round_trips() {
        let id = JobId([9, 8, 7, 6]);
        for packet in [
            Packet::NotifyStartStatus {
                job_id: id,
                success: true,
            },
            Packet::NotifyStartStatus {
                job_id: id,
                success: false,
            },
            Packet::NotifyEndStatus { job_id: id },
            Packet::PingRequest,
            Packet::KillProcess,
            Packet::StopService,
            Packet::ForcePasswordChange {
                password: "hunter2".to_string(),
            },
        ] {
            let bytes = encode("", &packet);
            let (_, decoded) = decode(&bytes).expect("decode");
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut bytes = encode("", &Packet::PingRequest);
        bytes[0] = PROTOCOL_VERSION.wrapping_add(1);
        assert!(matches!(
            decode(&bytes),
            Err(WireError::VersionMismatch(_))
        ));
    }

    #[test]
    fn test_truncated_packets_rejected() {
        let bytes = encode("pw", &Packet::LookingForWorkers(sample_offer()));
        // No prefix may panic, and a cut inside the argv block must fail.
        for len in 0..bytes.len() {
            let _ = decode(&bytes[..len]);
        }
        let mid_argv = bytes.len() - 12;
        assert_eq!(decode(&bytes[..mid_argv]), Err(WireError::Truncated));
        assert_eq!(decode(&[]), Err(WireError::Truncated));
        assert_eq!(decode(&[PROTOCOL_VERSION]), Err(WireError::Truncated));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let bytes = vec![PROTOCOL_VERSION, 0, 0xEE];
        assert_eq!(decode(&bytes), Err(WireError::UnknownKind(0xEE)));
    }

    #[test]
    fn test_absurd_arg_count_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION);
        put_cstr(&mut buf, "");
        buf.put_u8(kind::LOOKING_FOR_WORKERS);
        put_cstr(&mut buf, "");
        buf.put_u16_le(100);
        buf.put_u16_le(1);
        put_job_id(&mut buf, &JobId([0, 0, 0, 0]));
        buf.put_u16_le(u16::MAX); // argc
        assert_eq!(
            decode(&buf),
            Err(WireError::FieldCount(u16::MAX as usize))
        );
    }
}
