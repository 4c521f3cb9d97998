//! Companion-UI link.
//!
//! The agent listens on localhost TCP; any number of UIs may attach.  New
//! connections are greeted with the current state, every state change and
//! console line is fanned out to all of them, and commands flow back into
//! the tick loop.  Everything is non-blocking from the supervisor's point
//! of view: accepts and reads happen on spawned tasks, the supervisor only
//! drains channels.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::proto::ui::{ServerCodec, UiCommand, UiMessage};

/// Seam between the supervisor and whatever UI transport is in use.
/// `Send + Sync` so the supervisor's run future can be spawned.
#[async_trait]
pub trait UiLink: Send + Sync {
    /// Push a notification to every attached UI.
    async fn notify(&mut self, msg: UiMessage);
    /// Accept new connections (greeting them with `current`) and drain
    /// any commands the UIs sent since the last poll.
    async fn poll(&mut self, current: UiMessage) -> Vec<UiCommand>;
}

/// Link that goes nowhere; used headless and in tests.
pub struct NullUiLink;

#[async_trait]
impl UiLink for NullUiLink {
    async fn notify(&mut self, _msg: UiMessage) {}

    async fn poll(&mut self, _current: UiMessage) -> Vec<UiCommand> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// TCP server
// ---------------------------------------------------------------------------

pub struct UiServer {
    local_addr: SocketAddr,
    conn_rx: mpsc::UnboundedReceiver<TcpStream>,
    cmd_tx: mpsc::UnboundedSender<UiCommand>,
    cmd_rx: mpsc::UnboundedReceiver<UiCommand>,
    clients: Vec<FramedWrite<OwnedWriteHalf, ServerCodec>>,
}

impl UiServer {
    /// Bind the UI listener and start accepting in the background.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind UI listener on {addr}"))?;
        let local_addr = listener.local_addr().context("UI listener has no address")?;
        info!(%local_addr, "UI listener bound");

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "UI connected");
                        if conn_tx.send(stream).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "UI accept failed");
                    }
                }
            }
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Ok(Self {
            local_addr,
            conn_rx,
            cmd_tx,
            cmd_rx,
            clients: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn adopt(&mut self, stream: TcpStream) -> FramedWrite<OwnedWriteHalf, ServerCodec> {
        let (read_half, write_half) = stream.into_split();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, ServerCodec::new());
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(cmd) => {
                        if cmd_tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "UI read failed, dropping connection");
                        break;
                    }
                }
            }
        });
        FramedWrite::new(write_half, ServerCodec::new())
    }
}

#[async_trait]
impl UiLink for UiServer {
    async fn notify(&mut self, msg: UiMessage) {
        let mut alive = Vec::with_capacity(self.clients.len());
        for mut client in self.clients.drain(..) {
            if client.send(msg.clone()).await.is_ok() {
                alive.push(client);
            } else {
                debug!("UI write failed, dropping connection");
            }
        }
        self.clients = alive;
    }

    async fn poll(&mut self, current: UiMessage) -> Vec<UiCommand> {
        while let Ok(stream) = self.conn_rx.try_recv() {
            let mut writer = self.adopt(stream);
            // Greet with the current state so a freshly opened UI is never
            // blank until the next change.
            if writer.send(current.clone()).await.is_ok() {
                self.clients.push(writer);
            }
        }

        let mut cmds = Vec::new();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            cmds.push(cmd);
        }
        cmds
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ui::ClientCodec;
    use crate::state::UiState;
    use std::time::Duration;
    use tokio_util::codec::Framed;

    fn state_msg(state: UiState) -> UiMessage {
        UiMessage::State {
            state,
            screensaver_mode: false,
            password: String::new(),
        }
    }

    #[tokio::test]
    async fn test_greeting_commands_and_fanout() {
        let mut server = UiServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, ClientCodec::new());

        // Greeting arrives once the server polls.
        let mut greeted = None;
        for _ in 0..100 {
            server.poll(state_msg(UiState::Idle)).await;
            tokio::select! {
                frame = client.next() => {
                    greeted = Some(frame.unwrap().unwrap());
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        assert_eq!(greeted, Some(state_msg(UiState::Idle)));

        // A command makes it back to the poll loop.
        client.send(UiCommand::Disable).await.unwrap();
        let mut cmds = Vec::new();
        for _ in 0..100 {
            cmds = server.poll(state_msg(UiState::Idle)).await;
            if !cmds.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cmds, vec![UiCommand::Disable]);

        // Notifications fan out to the attached client.
        server.notify(UiMessage::Exit).await;
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, UiMessage::Exit);
    }

    #[tokio::test]
    async fn test_disconnected_client_dropped() {
        let mut server = UiServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();

        let stream = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            server.poll(state_msg(UiState::Idle)).await;
            if !server.clients.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.clients.len(), 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Writes to a closed socket eventually fail and the client is culled.
        for _ in 0..100 {
            server
                .notify(UiMessage::ConsoleText {
                    text: "x".to_string(),
                })
                .await;
            if server.clients.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.clients.is_empty());
    }
}
