//! Service state derivation.
//!
//! Only two flags are explicit (and persisted): `disabled` and
//! `screensaver_mode`.  Everything else is derived from what currently
//! occupies the job slot.  The UI sees a coarse three-state view; services
//! browsers get the finer external state including download/patch phases.

use serde::{Deserialize, Serialize};

/// Coarse state shown in the companion UI tray.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiState {
    Idle,
    Busy,
    Disabled,
}

/// State byte reported to services browsers in ping responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExternalState {
    Idle = 0,
    Busy = 1,
    Disabled = 2,
    Downloading = 3,
    Patching = 4,
    ScreensaverDisabled = 5,
}

/// Snapshot of everything the state derivation needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateInputs {
    /// A worker process is running.
    pub running: bool,
    /// A transfer subprocess is in flight.
    pub downloading: bool,
    /// The current occupant (running or downloading) is a self-update.
    pub patching: bool,
    pub disabled: bool,
    pub screensaver_mode: bool,
    pub screensaver_active: bool,
}

pub fn external_state(inputs: StateInputs) -> ExternalState {
    if inputs.running {
        if inputs.patching {
            ExternalState::Patching
        } else {
            ExternalState::Busy
        }
    } else if inputs.downloading {
        if inputs.patching {
            ExternalState::Patching
        } else {
            ExternalState::Downloading
        }
    } else if inputs.disabled {
        ExternalState::Disabled
    } else if inputs.screensaver_mode && !inputs.screensaver_active {
        ExternalState::ScreensaverDisabled
    } else {
        ExternalState::Idle
    }
}

pub fn ui_state(inputs: StateInputs) -> UiState {
    if inputs.disabled {
        UiState::Disabled
    } else if inputs.running || inputs.downloading {
        UiState::Busy
    } else {
        UiState::Idle
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
