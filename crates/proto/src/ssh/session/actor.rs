//! The connection task.
//!
//! One task owns the [`Transport`] and the [`Multiplexer`] of a connection
//! and is the only code touching them. It multiplexes three inputs:
//!
//! - bytes from the socket, read into a buffer leased from a [`BufferPool`]
//! - [`Command`]s from [`ConnectionHandle`]s and [`ChannelHandle`]s
//! - a periodic tick for the time based re-key limit
//!
//! After each input it drains transport events, multiplexer events and
//! multiplexer output, then hands the encrypted bytes to a writer task.
//! Writes that exceed a channel's window stay queued on the channel until
//! the peer grants more credit.

use super::config::SessionConfig;
use super::handle::{
    ChannelEvent, ChannelEvents, ChannelHandle, CloseReason, ConnectionHandle, ConnectionInfo,
};
use super::handler::{drive_handler, ChannelOpener};
use super::keepalive::{KeepaliveTask, KEEPALIVE_PAYLOAD};
use super::properties::Properties;
use crate::ssh::algorithm::AlgorithmRegistry;
use crate::ssh::auth::{
    auth_success, AuthDecision, AuthMethod, AuthRequest, AuthResponse, Authenticator,
    UserAuthServer, SERVICE_CONNECTION, SERVICE_USERAUTH,
};
use crate::ssh::buffer_pool::{BufferPool, DEFAULT_BUFFER_CAPACITY};
use crate::ssh::connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType, GlobalRequest};
use crate::ssh::hostkey::{HostKey, HostKeyVerifier};
use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::mux::{Multiplexer, MuxEvent};
use crate::ssh::transport::{Role, Transport, TransportEvent};
use bytes::Bytes;
use kestrel_platform::{system_clock, Clock, KestrelError, KestrelResult};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Decides on global requests: `Some(data)` answers REQUEST_SUCCESS with
/// `data`, `None` answers REQUEST_FAILURE.
pub type GlobalRequestFilter = Arc<dyn Fn(&GlobalRequest) -> Option<Vec<u8>> + Send + Sync>;

type Reply<T> = oneshot::Sender<KestrelResult<T>>;

/// Client credentials for one authentication attempt.
pub(crate) enum ClientAuth {
    Password(Zeroizing<String>),
    PublicKey(Arc<dyn HostKey>),
}

/// A queued channel write, completed once fully handed to the transport.
pub(crate) enum WriteOp {
    Data {
        data: Vec<u8>,
        offset: usize,
        extended: Option<u32>,
        reply: Reply<()>,
    },
    Eof {
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
}

impl WriteOp {
    fn fail(self, err: KestrelError) {
        let reply = match self {
            WriteOp::Data { reply, .. } | WriteOp::Eof { reply } | WriteOp::Close { reply } => reply,
        };
        let _ = reply.send(Err(err));
    }
}

/// Work sent to the connection task.
pub(crate) enum Command {
    OpenChannel {
        channel_type: ChannelType,
        reply: Reply<(u32, mpsc::UnboundedReceiver<ChannelEvent>)>,
    },
    Write {
        local_id: u32,
        op: WriteOp,
    },
    Request {
        local_id: u32,
        request: ChannelRequestType,
        want_reply: bool,
        reply: Reply<bool>,
    },
    ReplyRequest {
        local_id: u32,
        success: bool,
    },
    Consumed {
        local_id: u32,
        len: usize,
    },
    Global {
        request: GlobalRequest,
        reply: Reply<Option<(bool, Vec<u8>)>>,
    },
    Authenticate {
        user: String,
        method: ClientAuth,
        reply: Reply<bool>,
    },
    Ignore {
        len: usize,
        reply: Reply<()>,
    },
    Rekey {
        reply: Reply<()>,
    },
    Info {
        reply: oneshot::Sender<ConnectionInfo>,
    },
    Disconnect {
        reason: DisconnectReason,
        description: String,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::OpenChannel { .. } => "OpenChannel",
            Command::Write { .. } => "Write",
            Command::Request { .. } => "Request",
            Command::ReplyRequest { .. } => "ReplyRequest",
            Command::Consumed { .. } => "Consumed",
            Command::Global { .. } => "Global",
            Command::Authenticate { .. } => "Authenticate",
            Command::Ignore { .. } => "Ignore",
            Command::Rekey { .. } => "Rekey",
            Command::Info { .. } => "Info",
            Command::Disconnect { .. } => "Disconnect",
        };
        f.write_str(name)
    }
}

/// Per-channel bookkeeping outside the multiplexer.
struct Slot {
    events: mpsc::UnboundedSender<ChannelEvent>,
    pending_open: Option<(Reply<(u32, mpsc::UnboundedReceiver<ChannelEvent>)>, mpsc::UnboundedReceiver<ChannelEvent>)>,
    writes: VecDeque<WriteOp>,
    requests: VecDeque<Reply<bool>>,
    // Served by a ChannelHandler, which answers requests itself.
    handled: bool,
}

impl Slot {
    fn new(events: mpsc::UnboundedSender<ChannelEvent>, handled: bool) -> Self {
        Self {
            events,
            pending_open: None,
            writes: VecDeque::new(),
            requests: VecDeque::new(),
            handled,
        }
    }

    fn fail_all(&mut self, err: impl Fn() -> KestrelError) {
        if let Some((reply, _)) = self.pending_open.take() {
            let _ = reply.send(Err(err()));
        }
        for op in self.writes.drain(..) {
            op.fail(err());
        }
        for reply in self.requests.drain(..) {
            let _ = reply.send(Err(err()));
        }
    }
}

struct PendingAuth {
    user: String,
    method: ClientAuth,
    reply: Reply<bool>,
}

/// Client side of `ssh-userauth`.
#[derive(Default)]
struct ClientAuthState {
    service_requested: bool,
    service_accepted: bool,
    queue: VecDeque<PendingAuth>,
    current: Option<PendingAuth>,
}

/// Server side of `ssh-userauth`.
struct ServerAuthState {
    server: UserAuthServer,
    authenticator: Arc<dyn Authenticator>,
    service_accepted: bool,
}

/// Channel openers and the global request filter shared by both roles.
#[derive(Clone, Default)]
pub(crate) struct Services {
    openers: HashMap<String, Arc<dyn ChannelOpener>>,
    global_requests: Option<GlobalRequestFilter>,
}

struct Connection {
    transport: Transport,
    mux: Multiplexer,
    handle: ConnectionHandle,
    commands_tx: mpsc::Sender<Command>,
    services: Services,
    workers: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    slots: HashMap<u32, Slot>,
    globals: VecDeque<Reply<Option<(bool, Vec<u8>)>>>,
    client_auth: ClientAuthState,
    server_auth: Option<ServerAuthState>,
    user: Option<String>,
    peer: Option<String>,
    ready: Option<Reply<()>>,
    writer: mpsc::UnboundedSender<Bytes>,
    activity: watch::Sender<std::time::Instant>,
    closed: watch::Sender<Option<CloseReason>>,
    close_reason: Option<CloseReason>,
}

impl Connection {
    fn authenticated(&self) -> bool {
        self.user.is_some()
    }

    fn lost(&mut self, description: String) {
        if self.close_reason.is_none() {
            warn!(description = %description, "Connection lost");
            self.close_reason = Some(CloseReason {
                reason_code: DisconnectReason::ConnectionLost as u32,
                description,
                by_peer: true,
            });
        }
    }

    fn fail(&mut self, err: &KestrelError) {
        if !self.transport.is_closed() {
            self.transport
                .disconnect(DisconnectReason::for_error(err), &err.to_string());
        }
    }

    fn flush(&mut self) {
        if self.transport.has_outbound() {
            let bytes = self.transport.take_outbound().freeze();
            if self.writer.send(bytes).is_err() {
                self.lost("writer stopped".to_string());
            }
        }
    }

    async fn pump(&mut self) {
        loop {
            let mut progressed = false;
            while let Some(event) = self.transport.poll_event() {
                progressed = true;
                self.on_transport_event(event).await;
            }
            while let Some(event) = self.mux.poll_event() {
                progressed = true;
                self.on_mux_event(event);
            }
            for payload in self.mux.take_outbound() {
                progressed = true;
                if let Err(err) = self.transport.send_message(&payload) {
                    debug!(error = %err, "Dropping connection message");
                    break;
                }
            }
            if !progressed {
                break;
            }
        }
        self.flush();
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::KeysEstablished { rekey, .. } => {
                if !rekey {
                    if let Some(ready) = self.ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                }
            }
            TransportEvent::Message { sequence, payload } => {
                self.on_message(sequence, payload).await;
            }
            TransportEvent::ServiceRequest(name) => self.on_service_request(&name),
            TransportEvent::ServiceAccept(name) => {
                if self.transport.role() == Role::Client && name == SERVICE_USERAUTH {
                    self.client_auth.service_accepted = true;
                    self.start_next_auth();
                } else {
                    self.fail(&KestrelError::Protocol(format!(
                        "unexpected SERVICE_ACCEPT for {}",
                        name
                    )));
                }
            }
            TransportEvent::Debug(message) => debug!(message = %message, "Peer debug message"),
            TransportEvent::Disconnected {
                reason_code,
                description,
                by_peer,
            } => {
                self.close_reason = Some(CloseReason {
                    reason_code,
                    description,
                    by_peer,
                });
            }
        }
    }

    fn on_service_request(&mut self, name: &str) {
        let accept = match self.server_auth.as_mut() {
            Some(state) if name == SERVICE_USERAUTH && !state.service_accepted => {
                state.service_accepted = true;
                true
            }
            _ => false,
        };
        if accept {
            if let Err(err) = self.transport.service_accept(name) {
                debug!(error = %err, "Failed to accept service");
            }
        } else {
            self.transport.disconnect(
                DisconnectReason::ServiceNotAvailable,
                &format!("service not available: {}", name),
            );
        }
    }

    async fn on_message(&mut self, sequence: u32, payload: Vec<u8>) {
        let msg = payload.first().copied().unwrap_or_default();
        match msg {
            50..=79 => match self.transport.role() {
                Role::Server => self.on_server_auth(sequence, &payload).await,
                Role::Client => self.on_client_auth(&payload),
            },
            80..=100 if self.authenticated() => {
                if let Err(err) = self.mux.handle(&payload) {
                    self.fail(&err);
                }
            }
            80..=127 if !self.authenticated() => {
                self.transport.disconnect(
                    DisconnectReason::ProtocolError,
                    "connection protocol message before authentication",
                );
            }
            _ => {
                debug!(msg_type = msg, sequence, "Unimplemented message");
                let _ = self.transport.send_unimplemented(sequence);
            }
        }
    }

    async fn on_server_auth(&mut self, sequence: u32, payload: &[u8]) {
        let Some(state) = self.server_auth.as_mut() else {
            return;
        };
        if MessageType::from_u8(payload[0]) != Some(MessageType::UserauthRequest) {
            let _ = self.transport.send_unimplemented(sequence);
            return;
        }
        if !state.service_accepted {
            self.transport.disconnect(
                DisconnectReason::ProtocolError,
                "authentication request before service accept",
            );
            return;
        }
        if self.user.is_some() {
            debug!("Ignoring authentication request after success");
            return;
        }
        let session_id = self.transport.session_id().unwrap_or_default().to_vec();
        let authenticator = state.authenticator.clone();
        let decision = state
            .server
            .handle(authenticator.as_ref(), &session_id, self.peer.clone(), payload)
            .await;
        match decision {
            Ok(AuthDecision::Success { username }) => {
                info!(user = %username, "User authenticated");
                let _ = self.transport.send_message(&auth_success());
                self.user = Some(username);
            }
            Ok(AuthDecision::Reply(reply)) => {
                let _ = self.transport.send_message(&reply);
            }
            Ok(AuthDecision::Exhausted) => {
                warn!("Authentication attempts exhausted");
                self.transport.disconnect(
                    DisconnectReason::NoMoreAuthMethodsAvailable,
                    "too many authentication failures",
                );
            }
            Err(err) => self.fail(&err),
        }
    }

    fn on_client_auth(&mut self, payload: &[u8]) {
        let response = match AuthResponse::parse(payload) {
            Ok(response) => response,
            Err(err) => {
                self.fail(&err);
                return;
            }
        };
        match response {
            AuthResponse::Banner(banner) => info!(banner = banner.message(), "Server banner"),
            AuthResponse::PkOk(_) => debug!("Ignoring unsolicited USERAUTH_PK_OK"),
            AuthResponse::Success => {
                if let Some(current) = self.client_auth.current.take() {
                    info!(user = %current.user, "Authenticated");
                    self.user = Some(current.user);
                    let _ = current.reply.send(Ok(true));
                }
                for pending in self.client_auth.queue.drain(..) {
                    let _ = pending
                        .reply
                        .send(Err(KestrelError::Auth("already authenticated".to_string())));
                }
            }
            AuthResponse::Failure(failure) => {
                if let Some(current) = self.client_auth.current.take() {
                    debug!(
                        user = %current.user,
                        methods = ?failure.methods_can_continue(),
                        "Authentication rejected"
                    );
                    let _ = current.reply.send(Ok(false));
                }
                self.start_next_auth();
            }
        }
    }

    fn start_next_auth(&mut self) {
        if !self.client_auth.service_accepted || self.client_auth.current.is_some() {
            return;
        }
        let Some(pending) = self.client_auth.queue.pop_front() else {
            return;
        };
        let request = match &pending.method {
            ClientAuth::Password(password) => Ok(AuthRequest::new(
                &pending.user,
                SERVICE_CONNECTION,
                AuthMethod::Password(password.to_string()),
            )),
            ClientAuth::PublicKey(key) => AuthRequest::public_key_signed(
                &pending.user,
                SERVICE_CONNECTION,
                key.as_ref(),
                self.transport.session_id().unwrap_or_default(),
            ),
        };
        match request.and_then(|r| self.transport.send_message(&r.to_bytes())) {
            Ok(()) => self.client_auth.current = Some(pending),
            Err(err) => {
                let _ = pending.reply.send(Err(err));
                self.start_next_auth();
            }
        }
    }

    fn on_mux_event(&mut self, event: MuxEvent) {
        match event {
            MuxEvent::OpenConfirmed { local_id } => {
                let pending = self
                    .slots
                    .get_mut(&local_id)
                    .and_then(|slot| slot.pending_open.take());
                if let Some((reply, rx)) = pending {
                    if reply.send(Ok((local_id, rx))).is_err() {
                        let _ = self.mux.close(local_id);
                    }
                }
                self.flush_writes(local_id);
            }
            MuxEvent::OpenFailed { local_id, failure } => {
                if let Some(mut slot) = self.slots.remove(&local_id) {
                    if let Some((reply, _)) = slot.pending_open.take() {
                        let _ = reply.send(Err(failure.into_error()));
                    }
                }
            }
            MuxEvent::OpenRequested {
                sender_channel,
                channel_type,
                initial_window,
                max_packet,
            } => self.on_open_requested(sender_channel, channel_type, initial_window, max_packet),
            MuxEvent::Data { local_id, data } => {
                let len = data.len();
                if !self.deliver(local_id, ChannelEvent::Data(data)) {
                    self.mux.consume(local_id, len);
                }
            }
            MuxEvent::ExtendedData {
                local_id,
                code,
                data,
            } => {
                let len = data.len();
                if !self.deliver(local_id, ChannelEvent::ExtendedData { code, data }) {
                    self.mux.consume(local_id, len);
                }
            }
            MuxEvent::Eof { local_id } => {
                self.deliver(local_id, ChannelEvent::Eof);
            }
            MuxEvent::Request { local_id, request } => {
                let want_reply = request.want_reply();
                let handled = self.slots.get(&local_id).map_or(false, |slot| slot.handled);
                let delivered = self.deliver(
                    local_id,
                    ChannelEvent::Request {
                        request: request.request_type().clone(),
                        want_reply,
                    },
                );
                if want_reply && !(handled && delivered) {
                    let _ = self.mux.reply_request(local_id, false);
                }
            }
            MuxEvent::RequestReply { local_id, success } => {
                if let Some(reply) = self
                    .slots
                    .get_mut(&local_id)
                    .and_then(|slot| slot.requests.pop_front())
                {
                    let _ = reply.send(Ok(success));
                }
            }
            MuxEvent::WindowAvailable { local_id } => self.flush_writes(local_id),
            MuxEvent::GlobalRequest(request) => {
                let answer = self
                    .services
                    .global_requests
                    .as_ref()
                    .and_then(|filter| filter(&request));
                debug!(name = request.name(), accepted = answer.is_some(), "Global request");
                if request.want_reply() {
                    match answer {
                        Some(data) => self.mux.reply_global(true, &data),
                        None => self.mux.reply_global(false, &[]),
                    }
                }
            }
            MuxEvent::GlobalReply { success, data } => {
                if let Some(reply) = self.globals.pop_front() {
                    let _ = reply.send(Ok(Some((success, data))));
                }
            }
            MuxEvent::Failed { local_id, reason } => {
                warn!(local_id, reason = %reason, "Channel failed");
                if let Some(slot) = self.slots.get_mut(&local_id) {
                    slot.fail_all(|| KestrelError::ChannelClosed);
                }
            }
            MuxEvent::Closed { local_id } => {
                if let Some(mut slot) = self.slots.remove(&local_id) {
                    slot.fail_all(|| KestrelError::ChannelClosed);
                    let _ = slot.events.send(ChannelEvent::Closed);
                }
            }
        }
    }

    fn deliver(&mut self, local_id: u32, event: ChannelEvent) -> bool {
        self.slots
            .get(&local_id)
            .map_or(false, |slot| slot.events.send(event).is_ok())
    }

    fn on_open_requested(
        &mut self,
        sender_channel: u32,
        channel_type: ChannelType,
        initial_window: u32,
        max_packet: u32,
    ) {
        let Some(opener) = self.services.openers.get(channel_type.name()).cloned() else {
            self.mux.reject_open(
                sender_channel,
                ChannelOpenFailureReason::UnknownChannelType,
                &format!("unknown channel type {}", channel_type.name()),
            );
            return;
        };
        let handler = match opener.open(&channel_type, &self.handle) {
            Ok(handler) => handler,
            Err(rejection) => {
                self.mux
                    .reject_open(sender_channel, rejection.reason, &rejection.description);
                return;
            }
        };
        let local_id = match self
            .mux
            .accept_open(sender_channel, &channel_type, initial_window, max_packet)
        {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "Refused inbound channel");
                return;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.slots.insert(local_id, Slot::new(tx, true));
        tokio::spawn(drive_handler(
            handler,
            ChannelHandle::new(local_id, self.handle.clone()),
            ChannelEvents::new(local_id, rx, self.commands_tx.clone()),
            self.workers.clone(),
        ));
    }

    fn flush_writes(&mut self, local_id: u32) {
        let Some(slot) = self.slots.get_mut(&local_id) else {
            return;
        };
        if slot.pending_open.is_some() {
            return;
        }
        while let Some(op) = slot.writes.pop_front() {
            match op {
                WriteOp::Data {
                    data,
                    mut offset,
                    extended,
                    reply,
                } => {
                    if offset < data.len() {
                        match self.mux.send_data(local_id, &data[offset..], extended) {
                            Ok(taken) => offset += taken,
                            Err(err) => {
                                let _ = reply.send(Err(err));
                                continue;
                            }
                        }
                    }
                    if offset < data.len() {
                        // Window exhausted: resume on WindowAvailable.
                        slot.writes.push_front(WriteOp::Data {
                            data,
                            offset,
                            extended,
                            reply,
                        });
                        break;
                    }
                    let _ = reply.send(Ok(()));
                }
                WriteOp::Eof { reply } => {
                    let _ = reply.send(self.mux.send_eof(local_id));
                }
                WriteOp::Close { reply } => {
                    let _ = reply.send(self.mux.close(local_id));
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::OpenChannel {
                channel_type,
                reply,
            } => {
                if !self.authenticated() {
                    let _ = reply.send(Err(KestrelError::Auth("not authenticated".to_string())));
                    return;
                }
                match self.mux.open_channel(channel_type) {
                    Ok(local_id) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        let mut slot = Slot::new(tx, false);
                        slot.pending_open = Some((reply, rx));
                        self.slots.insert(local_id, slot);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::Write { local_id, op } => match self.slots.get_mut(&local_id) {
                Some(slot) => {
                    slot.writes.push_back(op);
                    self.flush_writes(local_id);
                }
                None => op.fail(KestrelError::ChannelClosed),
            },
            Command::Request {
                local_id,
                request,
                want_reply,
                reply,
            } => {
                if !self.slots.contains_key(&local_id) {
                    let _ = reply.send(Err(KestrelError::ChannelClosed));
                    return;
                }
                match self.mux.send_request(local_id, request, want_reply) {
                    Ok(()) if want_reply => {
                        if let Some(slot) = self.slots.get_mut(&local_id) {
                            slot.requests.push_back(reply);
                        }
                    }
                    Ok(()) => {
                        let _ = reply.send(Ok(true));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::ReplyRequest { local_id, success } => {
                if let Err(err) = self.mux.reply_request(local_id, success) {
                    debug!(local_id, error = %err, "Dropping request reply");
                }
            }
            Command::Consumed { local_id, len } => self.mux.consume(local_id, len),
            Command::Global { request, reply } => {
                if !self.authenticated() {
                    let _ = reply.send(Err(KestrelError::Auth("not authenticated".to_string())));
                    return;
                }
                let want_reply = request.want_reply();
                self.mux.send_global(request);
                if want_reply {
                    self.globals.push_back(reply);
                } else {
                    let _ = reply.send(Ok(None));
                }
            }
            Command::Authenticate {
                user,
                method,
                reply,
            } => {
                if self.transport.role() != Role::Client {
                    let _ = reply.send(Err(KestrelError::Auth(
                        "servers do not authenticate".to_string(),
                    )));
                    return;
                }
                if self.authenticated() {
                    let _ = reply.send(Err(KestrelError::Auth("already authenticated".to_string())));
                    return;
                }
                self.client_auth
                    .queue
                    .push_back(PendingAuth { user, method, reply });
                if !self.client_auth.service_requested {
                    self.client_auth.service_requested = true;
                    if let Err(err) = self.transport.service_request(SERVICE_USERAUTH) {
                        self.fail(&err);
                    }
                }
                self.start_next_auth();
            }
            Command::Ignore { len, reply } => {
                let _ = reply.send(self.transport.send_ignore(len));
            }
            Command::Rekey { reply } => {
                let _ = reply.send(self.transport.request_rekey());
            }
            Command::Info { reply } => {
                let _ = reply.send(self.info());
            }
            Command::Disconnect {
                reason,
                description,
            } => self.transport.disconnect(reason, &description),
        }
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            role: self.transport.role(),
            state: self.transport.state(),
            session_id: self.transport.session_id().map(<[u8]>::to_vec),
            peer_identification: self
                .transport
                .peer_identification()
                .map(|p| String::from_utf8_lossy(&p.raw).into_owned()),
            negotiated: self.transport.negotiated().cloned(),
            kex_count: self.transport.kex_count(),
            read_sequence: self.transport.read_sequence(),
            write_sequence: self.transport.write_sequence(),
            channels: self.mux.channel_count(),
            user: self.user.clone(),
        }
    }

    async fn run<R>(
        mut self,
        mut reader: R,
        mut commands: mpsc::Receiver<Command>,
        pool: Arc<BufferPool>,
        rekey_interval: std::time::Duration,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut buf = pool.lease();
        let mut rekey_tick = tokio::time::interval(rekey_interval);
        rekey_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Our identification line and KEXINIT.
        self.pump().await;

        while self.close_reason.is_none() {
            tokio::select! {
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => self.lost("connection closed by peer".to_string()),
                    Ok(_) => {
                        let _ = self.activity.send(self.clock.now());
                        if let Err(err) = self.transport.on_bytes(&buf) {
                            debug!(error = %err, "Inbound bytes rejected");
                            self.fail(&err);
                        }
                        buf.clear();
                    }
                    Err(err) => self.lost(err.to_string()),
                },
                Some(command) = commands.recv() => self.on_command(command).await,
                _ = rekey_tick.tick() => {
                    if let Err(err) = self.transport.check_rekey() {
                        self.fail(&err);
                    }
                }
            }
            self.pump().await;
        }
        pool.release(buf);
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let reason = self.close_reason.clone().unwrap_or_else(|| CloseReason {
            reason_code: DisconnectReason::ConnectionLost as u32,
            description: "connection task ended".to_string(),
            by_peer: false,
        });
        let err = || reason.to_error();
        info!(
            reason_code = reason.reason_code,
            description = %reason.description,
            by_peer = reason.by_peer,
            "Connection closed"
        );

        self.mux.teardown();
        for (_, mut slot) in self.slots.drain() {
            slot.fail_all(err);
            let _ = slot.events.send(ChannelEvent::Closed);
        }
        for reply in self.globals.drain(..) {
            let _ = reply.send(Err(err()));
        }
        let auth = self.client_auth.current.take().into_iter();
        for pending in auth.chain(self.client_auth.queue.drain(..)) {
            let _ = pending.reply.send(Err(err()));
        }
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(err()));
        }
        let _ = self.closed.send(Some(reason));
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            debug!(error = %err, "Socket write failed");
            return;
        }
        if let Err(err) = writer.flush().await {
            debug!(error = %err, "Socket flush failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Options shared by client and server sessions.
#[derive(Clone)]
struct Options {
    config: SessionConfig,
    registry: AlgorithmRegistry,
    clock: Arc<dyn Clock>,
    pool: Arc<BufferPool>,
    services: Services,
}

impl Options {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            registry: AlgorithmRegistry::with_defaults(),
            clock: system_clock(),
            pool: Arc::new(BufferPool::new(DEFAULT_BUFFER_CAPACITY)),
            services: Services::default(),
        }
    }

    fn spawn<S>(
        &self,
        transport: Transport,
        stream: S,
        server_auth: Option<ServerAuthState>,
        peer: Option<String>,
        ready: Option<Reply<()>>,
    ) -> ConnectionHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let role = transport.role();
        let (commands_tx, commands_rx) = mpsc::channel(self.config.command_queue);
        let (closed_tx, closed_rx) = watch::channel(None);
        let (activity_tx, activity_rx) = watch::channel(self.clock.now());
        let handle = ConnectionHandle::new(
            commands_tx.clone(),
            closed_rx,
            activity_rx,
            Properties::new(),
            role,
        );

        let (reader, writer) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, writer_rx));

        let keepalive = self.config.keepalive_interval.map(|interval| {
            let mut task = KeepaliveTask::new(interval);
            let conn = handle.clone();
            task.start(move || {
                let conn = conn.clone();
                async move { conn.send_ignore(KEEPALIVE_PAYLOAD).await }
            });
            task
        });

        let connection = Connection {
            transport,
            mux: Multiplexer::with_max_channels(self.config.channel.clone(), self.config.max_channels),
            handle: handle.clone(),
            commands_tx,
            services: self.services.clone(),
            workers: Arc::new(Semaphore::new(self.config.workers)),
            clock: self.clock.clone(),
            slots: HashMap::new(),
            globals: VecDeque::new(),
            client_auth: ClientAuthState::default(),
            server_auth,
            user: None,
            peer,
            ready,
            writer: writer_tx,
            activity: activity_tx,
            closed: closed_tx,
            close_reason: None,
        };
        let pool = self.pool.clone();
        let rekey_interval = self.config.rekey_check_interval;
        tokio::spawn(async move {
            connection
                .run(reader, commands_rx, pool, rekey_interval)
                .await;
            drop(keepalive);
        });
        handle
    }
}

macro_rules! session_builders {
    ($ty:ident) => {
        impl $ty {
            /// Replaces the algorithm registry.
            pub fn with_registry(mut self, registry: AlgorithmRegistry) -> Self {
                self.options.registry = registry;
                self
            }

            /// Replaces the clock used for re-key timing and activity stamps.
            pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
                self.options.clock = clock;
                self
            }

            /// Shares a read buffer pool across connections.
            pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
                self.options.pool = pool;
                self
            }

            /// Serves inbound channels of type `channel_type` with `opener`.
            pub fn with_opener(mut self, channel_type: &str, opener: Arc<dyn ChannelOpener>) -> Self {
                self.options
                    .services
                    .openers
                    .insert(channel_type.to_string(), opener);
                self
            }

            /// Answers the peer's global requests with `filter`.
            pub fn with_global_requests(mut self, filter: GlobalRequestFilter) -> Self {
                self.options.services.global_requests = Some(filter);
                self
            }

            /// The session configuration.
            pub fn config(&self) -> &SessionConfig {
                &self.options.config
            }
        }
    };
}

/// Connects as a client.
///
/// # Example
///
/// ```rust,no_run
/// use kestrel_proto::ssh::hostkey::AcceptAnyHostKey;
/// use kestrel_proto::ssh::session::{ClientSession, SessionConfig};
/// use std::sync::Arc;
/// use tokio::net::TcpStream;
///
/// # async fn example() -> kestrel_platform::KestrelResult<()> {
/// let stream = TcpStream::connect("127.0.0.1:2222").await?;
/// let session = ClientSession::new(SessionConfig::default(), Arc::new(AcceptAnyHostKey));
/// let conn = session.connect(stream).await?;
/// if conn.authenticate_password("admin", "secret").await? {
///     let (channel, mut events) = conn.open_session().await?;
///     channel.exec("uptime").await?;
///     let output = events.read_to_end().await;
///     println!("{}", String::from_utf8_lossy(&output));
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClientSession {
    options: Options,
    verifier: Arc<dyn HostKeyVerifier>,
}

session_builders!(ClientSession);

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("config", &self.options.config)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Creates a client trusting host keys `verifier` accepts.
    pub fn new(config: SessionConfig, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            options: Options::new(config),
            verifier,
        }
    }

    /// Runs the handshake over `stream` and returns once the first key
    /// exchange is complete.
    pub async fn connect<S>(&self, stream: S) -> KestrelResult<ConnectionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.options.config.validate()?;
        let transport = Transport::new_client(
            self.options.config.transport.clone(),
            self.options.registry.clone(),
            self.options.clock.clone(),
            self.verifier.clone(),
        )?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = self.options.spawn(transport, stream, None, None, Some(ready_tx));
        match ready_rx.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(KestrelError::ConnectionClosed(
                "connection task ended during handshake".to_string(),
            )),
        }
    }
}

/// Accepts connections as a server.
#[derive(Clone)]
pub struct ServerSession {
    options: Options,
    host_keys: Vec<Arc<dyn HostKey>>,
    authenticator: Arc<dyn Authenticator>,
}

session_builders!(ServerSession);

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("config", &self.options.config)
            .field("host_keys", &self.host_keys.len())
            .finish_non_exhaustive()
    }
}

impl ServerSession {
    /// Creates a server signing with `host_keys` and checking credentials
    /// with `authenticator`.
    pub fn new(
        config: SessionConfig,
        host_keys: Vec<Arc<dyn HostKey>>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            options: Options::new(config),
            host_keys,
            authenticator,
        }
    }

    /// Starts serving `stream`. The handshake runs in the background.
    pub fn accept<S>(&self, stream: S) -> KestrelResult<ConnectionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.accept_from(stream, None)
    }

    /// Like [`accept`](Self::accept), naming the peer for authenticators
    /// and logs.
    pub fn accept_from<S>(&self, stream: S, peer: Option<String>) -> KestrelResult<ConnectionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.options.config.validate()?;
        let transport = Transport::new_server(
            self.options.config.transport.clone(),
            self.options.registry.clone(),
            self.options.clock.clone(),
            self.host_keys.clone(),
        )?;
        let auth = ServerAuthState {
            server: UserAuthServer::new(
                self.options.registry.clone(),
                self.options.config.max_auth_attempts,
            ),
            authenticator: self.authenticator.clone(),
            service_accepted: false,
        };
        if let Some(peer) = &peer {
            info!(peer = %peer, "Accepted connection");
        }
        Ok(self.options.spawn(transport, stream, Some(auth), peer, None))
    }
}
