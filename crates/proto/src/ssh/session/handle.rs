//! Async handles onto a running connection.
//!
//! Handles are cheap to clone. Every call is a command sent to the
//! connection task and answered over a `oneshot`, so calls from many tasks
//! are serialized in the order the task receives them. Once the connection
//! is gone every call fails with [`KestrelError::ConnectionClosed`].

use super::actor::{ClientAuth, Command, WriteOp};
use super::properties::Properties;
use crate::ssh::connection::{ChannelRequestType, ChannelType, GlobalRequest, EXTENDED_DATA_STDERR};
use crate::ssh::hostkey::HostKey;
use crate::ssh::kex::Negotiated;
use crate::ssh::message::DisconnectReason;
use crate::ssh::transport::{Role, State};
use kestrel_platform::{KestrelError, KestrelResult};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use zeroize::Zeroizing;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// SSH_DISCONNECT_* code
    pub reason_code: u32,
    /// Description text
    pub description: String,
    /// `true` when the peer ended the connection
    pub by_peer: bool,
}

impl CloseReason {
    /// Converts the reason into the error handed to pending callers.
    pub fn to_error(&self) -> KestrelError {
        match DisconnectReason::from_u32(self.reason_code) {
            Some(DisconnectReason::KeyExchangeFailed) if !self.by_peer => {
                KestrelError::Negotiation(self.description.clone())
            }
            Some(DisconnectReason::HostKeyNotVerifiable) if !self.by_peer => {
                KestrelError::HostKeyRejected(self.description.clone())
            }
            Some(DisconnectReason::MacError) if !self.by_peer => {
                KestrelError::Integrity(self.description.clone())
            }
            _ => KestrelError::ConnectionClosed(self.description.clone()),
        }
    }
}

/// Snapshot of a connection's transport state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Which end we are
    pub role: Role,
    /// Transport state
    pub state: State,
    /// Session identifier, once the first key exchange is done
    pub session_id: Option<Vec<u8>>,
    /// The peer's identification line
    pub peer_identification: Option<String>,
    /// Negotiated algorithms
    pub negotiated: Option<Negotiated>,
    /// Completed key exchanges
    pub kex_count: u64,
    /// Next inbound sequence number
    pub read_sequence: u32,
    /// Next outbound sequence number
    pub write_sequence: u32,
    /// Channels in the table
    pub channels: usize,
    /// Authenticated user, if any
    pub user: Option<String>,
}

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel data
    Data(Vec<u8>),
    /// Extended data, stderr for code 1
    ExtendedData {
        /// Data type code
        code: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// The peer sent EOF
    Eof,
    /// A channel request from the peer
    Request {
        /// The request
        request: ChannelRequestType,
        /// Whether the peer waits for an answer
        want_reply: bool,
    },
    /// The channel was released
    Closed,
}

/// Handle onto one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    closed: watch::Receiver<Option<CloseReason>>,
    activity: watch::Receiver<Instant>,
    properties: Properties,
    role: Role,
}

impl ConnectionHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        closed: watch::Receiver<Option<CloseReason>>,
        activity: watch::Receiver<Instant>,
        properties: Properties,
        role: Role,
    ) -> Self {
        Self {
            commands,
            closed,
            activity,
            properties,
            role,
        }
    }

    /// Which end of the connection this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Typed properties attached to the connection.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    fn closed_error(&self) -> KestrelError {
        match self.closed.borrow().as_ref() {
            Some(reason) => reason.to_error(),
            None => KestrelError::ConnectionClosed("connection task ended".to_string()),
        }
    }

    pub(crate) async fn send_command(&self, command: Command) -> KestrelResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.closed_error())
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> KestrelResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(make(tx)).await?;
        rx.await.map_err(|_| self.closed_error())
    }

    /// Opens a channel and waits for the peer's answer.
    pub async fn open_channel(
        &self,
        channel_type: ChannelType,
    ) -> KestrelResult<(ChannelHandle, ChannelEvents)> {
        let (local_id, rx) = self
            .call(|reply| Command::OpenChannel {
                channel_type,
                reply,
            })
            .await??;
        Ok((
            ChannelHandle::new(local_id, self.clone()),
            ChannelEvents::new(local_id, rx, self.commands.clone()),
        ))
    }

    /// Opens a `session` channel.
    pub async fn open_session(&self) -> KestrelResult<(ChannelHandle, ChannelEvents)> {
        self.open_channel(ChannelType::Session).await
    }

    /// Sends a global request. With `want_reply` the answer and its data are
    /// returned; otherwise `None`.
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        data: Vec<u8>,
    ) -> KestrelResult<Option<(bool, Vec<u8>)>> {
        let request = GlobalRequest::new(name, want_reply, data);
        self.call(|reply| Command::Global { request, reply }).await?
    }

    /// Authenticates with a password. Returns whether the server accepted.
    pub async fn authenticate_password(&self, user: &str, password: &str) -> KestrelResult<bool> {
        let method = ClientAuth::Password(Zeroizing::new(password.to_string()));
        self.call(|reply| Command::Authenticate {
            user: user.to_string(),
            method,
            reply,
        })
        .await?
    }

    /// Authenticates with a signing key. Returns whether the server accepted.
    pub async fn authenticate_publickey(&self, user: &str, key: Arc<dyn HostKey>) -> KestrelResult<bool> {
        self.call(|reply| Command::Authenticate {
            user: user.to_string(),
            method: ClientAuth::PublicKey(key),
            reply,
        })
        .await?
    }

    /// Sends SSH_MSG_IGNORE with `len` random bytes.
    pub async fn send_ignore(&self, len: usize) -> KestrelResult<()> {
        self.call(|reply| Command::Ignore { len, reply }).await?
    }

    /// Queues SSH_MSG_IGNORE without waiting. Fails if the command queue is
    /// full or the connection is gone.
    pub fn try_send_ignore(&self, len: usize) -> KestrelResult<()> {
        let (reply, _) = oneshot::channel();
        self.try_command(Command::Ignore { len, reply })
    }

    /// Queues a disconnect without waiting.
    pub fn try_disconnect(&self, reason: DisconnectReason, description: &str) -> KestrelResult<()> {
        self.try_command(Command::Disconnect {
            reason,
            description: description.to_string(),
        })
    }

    fn try_command(&self, command: Command) -> KestrelResult<()> {
        self.commands.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                KestrelError::Other("connection command queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => self.closed_error(),
        })
    }

    /// Starts a re-key.
    pub async fn request_rekey(&self) -> KestrelResult<()> {
        self.call(|reply| Command::Rekey { reply }).await?
    }

    /// Transport and channel table snapshot.
    pub async fn info(&self) -> KestrelResult<ConnectionInfo> {
        self.call(|reply| Command::Info { reply }).await
    }

    /// Sends SSH_MSG_DISCONNECT and waits for the connection to end.
    pub async fn disconnect(&self, reason: DisconnectReason, description: &str) -> CloseReason {
        let _ = self
            .send_command(Command::Disconnect {
                reason,
                description: description.to_string(),
            })
            .await;
        self.closed().await
    }

    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// The close reason, once closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }

    /// Waits until the connection ends.
    pub async fn closed(&self) -> CloseReason {
        let mut closed = self.closed.clone();
        loop {
            if let Some(reason) = closed.borrow_and_update().clone() {
                return reason;
            }
            if closed.changed().await.is_err() {
                return closed.borrow().clone().unwrap_or_else(|| CloseReason {
                    reason_code: DisconnectReason::ConnectionLost as u32,
                    description: "connection task ended".to_string(),
                    by_peer: false,
                });
            }
        }
    }

    /// When the peer last sent anything.
    pub fn last_activity(&self) -> Instant {
        *self.activity.borrow()
    }

    /// Receiver that changes every time the peer sends something.
    pub fn activity(&self) -> watch::Receiver<Instant> {
        self.activity.clone()
    }
}

/// Write and control side of one channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    local_id: u32,
    connection: ConnectionHandle,
}

impl ChannelHandle {
    pub(crate) fn new(local_id: u32, connection: ConnectionHandle) -> Self {
        Self {
            local_id,
            connection,
        }
    }

    /// Local channel number.
    pub fn id(&self) -> u32 {
        self.local_id
    }

    /// The connection this channel belongs to.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    async fn write(&self, op: impl FnOnce(oneshot::Sender<KestrelResult<()>>) -> WriteOp) -> KestrelResult<()> {
        let local_id = self.local_id;
        self.connection
            .call(|reply| Command::Write {
                local_id,
                op: op(reply),
            })
            .await?
    }

    /// Sends data. Suspends while the peer's window is exhausted; fails with
    /// [`KestrelError::ChannelClosed`] if the channel closes meanwhile.
    pub async fn send(&self, data: &[u8]) -> KestrelResult<()> {
        let data = data.to_vec();
        self.write(|reply| WriteOp::Data {
            data,
            offset: 0,
            extended: None,
            reply,
        })
        .await
    }

    /// Sends extended data with type code `code`.
    pub async fn send_extended(&self, code: u32, data: &[u8]) -> KestrelResult<()> {
        let data = data.to_vec();
        self.write(|reply| WriteOp::Data {
            data,
            offset: 0,
            extended: Some(code),
            reply,
        })
        .await
    }

    /// Sends stderr data.
    pub async fn send_stderr(&self, data: &[u8]) -> KestrelResult<()> {
        self.send_extended(EXTENDED_DATA_STDERR, data).await
    }

    /// Sends EOF after everything written before it.
    pub async fn eof(&self) -> KestrelResult<()> {
        self.write(|reply| WriteOp::Eof { reply }).await
    }

    /// Sends CLOSE after everything written before it.
    pub async fn close(&self) -> KestrelResult<()> {
        self.write(|reply| WriteOp::Close { reply }).await
    }

    /// Sends a channel request. With `want_reply` the peer's answer is
    /// returned; otherwise `true` once the request is queued.
    pub async fn request(&self, request: ChannelRequestType, want_reply: bool) -> KestrelResult<bool> {
        let local_id = self.local_id;
        self.connection
            .call(|reply| Command::Request {
                local_id,
                request,
                want_reply,
                reply,
            })
            .await?
    }

    /// Requests a subsystem, e.g. `sftp`.
    pub async fn request_subsystem(&self, name: &str) -> KestrelResult<bool> {
        self.request(
            ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
            true,
        )
        .await
    }

    /// Requests command execution.
    pub async fn exec(&self, command: &str) -> KestrelResult<bool> {
        self.request(
            ChannelRequestType::Exec {
                command: command.to_string(),
            },
            true,
        )
        .await
    }

    pub(crate) async fn reply_request(&self, success: bool) -> KestrelResult<()> {
        self.connection
            .send_command(Command::ReplyRequest {
                local_id: self.local_id,
                success,
            })
            .await
    }
}

/// Read side of one channel.
#[derive(Debug)]
pub struct ChannelEvents {
    local_id: u32,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    commands: mpsc::Sender<Command>,
}

impl ChannelEvents {
    pub(crate) fn new(
        local_id: u32,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            local_id,
            events,
            commands,
        }
    }

    /// Next event; `None` after [`ChannelEvent::Closed`] or when the
    /// connection is gone. Receiving data returns window credit to the peer.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        let event = self.events.recv().await?;
        match &event {
            ChannelEvent::Data(data) | ChannelEvent::ExtendedData { data, .. } => {
                self.consumed(data.len()).await;
            }
            _ => {}
        }
        Some(event)
    }

    pub(crate) async fn recv_unconsumed(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub(crate) async fn consumed(&self, len: usize) {
        if len > 0 {
            let _ = self
                .commands
                .send(Command::Consumed {
                    local_id: self.local_id,
                    len,
                })
                .await;
        }
    }

    /// Collects regular data until EOF or close.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(event) = self.recv().await {
            match event {
                ChannelEvent::Data(data) => out.extend_from_slice(&data),
                ChannelEvent::Eof | ChannelEvent::Closed => break,
                _ => {}
            }
        }
        out
    }
}
