//! Framed JSON link to the companion desktop UI.
//!
//! Length-prefixed frames over a localhost TCP connection; each frame is a
//! kind-tagged JSON message.  The agent pushes state and console text to
//! every connected UI, and accepts a small command set back (the UI is how
//! operators disable the agent or change its password locally).

use std::marker::PhantomData;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::state::UiState;

/// Maximum frame payload size: 64 KB.  UI traffic is tiny.
const MAX_FRAME_SIZE: usize = 65_536;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Agent-to-UI notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UiMessage {
    /// Current service state; sent on connect and after every change.
    State {
        state: UiState,
        screensaver_mode: bool,
        password: String,
    },
    /// A line of console output from the agent.
    ConsoleText { text: String },
    /// The agent is self-updating: run `command_line` from `working_dir`,
    /// and exit afterwards if `exit_after` is set.
    Patching {
        exit_after: bool,
        working_dir: String,
        command_line: Vec<String>,
    },
    /// The agent is shutting down; the UI should disconnect.
    Exit,
}

/// UI-to-agent commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UiCommand {
    KillProcess,
    Disable,
    Enable,
    SetScreensaverMode { on: bool },
    UpdatePassword { password: String },
    Exit,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Length-prefixed JSON frame codec, directional: encodes `Tx`, decodes `Rx`.
pub struct UiCodec<Tx, Rx> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<(Tx, Rx)>,
}

/// Codec for the agent side of the link.
pub type ServerCodec = UiCodec<UiMessage, UiCommand>;
/// Codec for the UI side of the link.
pub type ClientCodec = UiCodec<UiCommand, UiMessage>;

impl<Tx, Rx> UiCodec<Tx, Rx> {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_SIZE)
            .new_codec();
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<Tx, Rx> Default for UiCodec<Tx, Rx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx: Serialize, Rx> Encoder<Tx> for UiCodec<Tx, Rx> {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Tx, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).context("failed to serialize UI frame")?;
        self.inner
            .encode(Bytes::from(json), dst)
            .map_err(|e| anyhow::anyhow!(e))
    }
}

impl<Tx, Rx: DeserializeOwned> Decoder for UiCodec<Tx, Rx> {
    type Item = Rx;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).map_err(|e| anyhow::anyhow!(e))? {
            Some(bytes) => {
                let msg = serde_json::from_slice(&bytes).context("failed to parse UI frame")?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
