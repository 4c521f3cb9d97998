//! Control-plane protocol definitions for the farmhand agent.
//!
//! Two surfaces live here: the binary UDP control protocol spoken with
//! build-farm masters and services browsers ([`wire`]), and the framed JSON
//! link to the companion desktop UI ([`ui`]).

pub mod ui;
pub mod wire;

/// Version byte prefixed to every control datagram.  Datagrams carrying any
/// other value are dropped without a reply.
pub const PROTOCOL_VERSION: u8 = 5;

/// A password field starting with this byte is always accepted, regardless
/// of the configured password.  The installer uses it to stop a running
/// instance it cannot know the password of.
pub const PASSWORD_OVERRIDE: u8 = b'*';

/// First UDP port the agent tries to bind.
pub const DEFAULT_BASE_PORT: u16 = 23397;

/// Number of consecutive ports probed starting at the base port.  Masters
/// broadcast job offers to every port in this range, so several agents can
/// share one machine.
pub const PORT_RANGE_LEN: u16 = 10;

/// Packet-kind bytes, one per datagram, written after the password field.
pub mod kind {
    pub const LOOKING_FOR_WORKERS: u8 = 0;
    pub const PING_REQUEST: u8 = 1;
    pub const PING_RESPONSE: u8 = 2;
    pub const KILL_PROCESS: u8 = 3;
    pub const STOP_SERVICE: u8 = 4;
    pub const SERVICE_PATCH: u8 = 5;
    pub const FORCE_PASSWORD_CHANGE: u8 = 6;
    pub const NOTIFY_START_STATUS: u8 = 7;
    pub const NOTIFY_END_STATUS: u8 = 8;
}
