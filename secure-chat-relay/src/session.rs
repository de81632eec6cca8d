//! One authenticated connection: its write handle and its receive loop.
//!
//! The write side (`SessionHandle`) is shared with the registry so broadcasts
//! from other sessions can reach it. The read side and its cipher stay with
//! the `Session` task that owns the connection.

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use chrono::{DateTime, Local};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, watch},
};
use tracing::{error, info, warn};

use crate::{
    crypto::{FrameOpener, FrameSealer},
    error::SessionError,
    message::{ChatMessage, FrameReader, FrameWriter, MessageKind, read_frame, write_frame},
    registry::Registry,
};

pub type SessionId = u64;
pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

pub const CLOCK_FORMAT: &str = "%H:%M:%S";
pub const SINCE_FORMAT: &str = "%a %b %d %H:%M:%S %Z %Y";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, handshake not finished; never visible in the registry.
    Handshaking,
    Authenticated,
    Closed,
}

/// What a failed write inside `write_encrypted` reports to its caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Report the failure and close the session so broadcasts prune it.
    #[default]
    Prune,
    /// Log the failure and report success; only a session that was already
    /// closed is reported as undeliverable.
    LogOnly,
}

impl FromStr for DeliveryPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "prune" => Ok(DeliveryPolicy::Prune),
            "log-only" | "log_only" | "logonly" => Ok(DeliveryPolicy::LogOnly),
            other => Err(other.to_string()),
        }
    }
}

struct SessionWriter {
    frames: FrameWriter<BoxedWriter>,
    sealer: FrameSealer,
}

pub struct SessionHandle {
    id: SessionId,
    username: String,
    peer: Option<SocketAddr>,
    connected_at: DateTime<Local>,
    policy: DeliveryPolicy,
    state: watch::Sender<SessionState>,
    writer: Mutex<SessionWriter>,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        username: String,
        peer: Option<SocketAddr>,
        writer: FrameWriter<BoxedWriter>,
        sealer: FrameSealer,
        policy: DeliveryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Authenticated);
        Self {
            id,
            username,
            peer,
            connected_at: Local::now(),
            policy,
            state,
            writer: Mutex::new(SessionWriter {
                frames: writer,
                sealer,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn mark_closed(&self) -> bool {
        self.state.send_replace(SessionState::Closed) != SessionState::Closed
    }

    /// Encrypts `text` and writes it as one frame.
    ///
    /// Returns `false` when the session was already closed. A failure during
    /// the write itself is logged; whether it is also reported depends on the
    /// session's [`DeliveryPolicy`].
    pub async fn write_encrypted(&self, text: &str) -> bool {
        if !self.is_connected() {
            return false;
        }

        let mut writer = self.writer.lock().await;
        let result = match writer.sealer.seal(text.as_bytes()) {
            Ok(frame) => write_frame(&mut writer.frames, frame)
                .await
                .map_err(SessionError::from),
            Err(err) => Err(SessionError::from(err)),
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                error!(
                    id = self.id,
                    username = %self.username,
                    peer = ?self.peer,
                    error = %err,
                    "error sending message"
                );
                match self.policy {
                    DeliveryPolicy::LogOnly => true,
                    DeliveryPolicy::Prune => {
                        self.mark_closed();
                        false
                    }
                }
            }
        }
    }

    /// Marks the session closed and shuts its transport down. Idempotent.
    pub async fn close(&self) {
        self.mark_closed();
        let mut writer = self.writer.lock().await;
        // Best effort; the peer may already be gone.
        let _ = writer.frames.get_mut().shutdown().await;
    }
}

/// Why a receive loop stopped.
#[derive(Debug)]
pub enum SessionEnd {
    Logout,
    Disconnected,
    Closed,
    Failed(SessionError),
}

pub struct Session {
    handle: Arc<SessionHandle>,
    reader: FrameReader<BoxedReader>,
    opener: FrameOpener,
    registry: Registry,
}

impl Session {
    pub fn new(
        handle: Arc<SessionHandle>,
        reader: FrameReader<BoxedReader>,
        opener: FrameOpener,
        registry: Registry,
    ) -> Self {
        Self {
            handle,
            reader,
            opener,
            registry,
        }
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Runs until logout, disconnect, close or failure, then tears down.
    pub async fn run(mut self) -> SessionEnd {
        let end = self.receive_loop().await;
        let handle = &self.handle;
        match &end {
            SessionEnd::Logout => info!(
                id = handle.id,
                username = %handle.username,
                peer = ?handle.peer,
                "disconnected with a LOGOUT message"
            ),
            SessionEnd::Disconnected => warn!(
                id = handle.id,
                username = %handle.username,
                peer = ?handle.peer,
                "connection closed by peer"
            ),
            SessionEnd::Closed => info!(
                id = handle.id,
                username = %handle.username,
                "session closed by server"
            ),
            SessionEnd::Failed(err) => warn!(
                id = handle.id,
                username = %handle.username,
                peer = ?handle.peer,
                error = %err,
                "exception reading stream"
            ),
        }
        self.teardown().await;
        end
    }

    async fn receive_loop(&mut self) -> SessionEnd {
        let mut state = self.handle.subscribe();
        loop {
            let frame = select! {
                frame = read_frame(&mut self.reader) => frame,
                _ = wait_closed(&mut state) => return SessionEnd::Closed,
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => return SessionEnd::Disconnected,
                Err(err) => return SessionEnd::Failed(err.into()),
            };

            let message = match self
                .opener
                .open(&frame)
                .map_err(SessionError::from)
                .and_then(|plaintext| ChatMessage::decode(&plaintext).map_err(SessionError::from))
            {
                Ok(message) => message,
                Err(err) => return SessionEnd::Failed(err),
            };

            match message.kind {
                MessageKind::Text => {
                    let line = format!("{}: {}", self.handle.username, message.message);
                    if let Err(err) = self.registry.broadcast(&line).await {
                        warn!(
                            id = self.handle.id,
                            username = %self.handle.username,
                            error = %err,
                            "message dropped"
                        );
                    }
                }
                MessageKind::Logout => return SessionEnd::Logout,
                MessageKind::WhoIsIn => self.reply_who_is_in().await,
            }
        }
    }

    async fn reply_who_is_in(&self) {
        let header = format!(
            "List of the users connected at {}\n",
            Local::now().format(CLOCK_FORMAT)
        );
        if !self.handle.write_encrypted(&header).await {
            return;
        }
        for (index, entry) in self.registry.snapshot().await.iter().enumerate() {
            let line = format!(
                "{}) {} since {}\n",
                index + 1,
                entry.username,
                entry.connected_at.format(SINCE_FORMAT)
            );
            if !self.handle.write_encrypted(&line).await {
                return;
            }
        }
    }

    async fn teardown(&self) {
        self.registry.remove_by_id(self.handle.id).await;
        self.handle.close().await;
    }
}

async fn wait_closed(state: &mut watch::Receiver<SessionState>) {
    let _ = state.wait_for(|state| *state == SessionState::Closed).await;
}
