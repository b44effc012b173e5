//! SSH Transport Layer State Machine (RFC 4253).
//!
//! [`Transport`] is sans-IO: the caller feeds received bytes with
//! [`on_bytes`](Transport::on_bytes), drains bytes to send with
//! [`take_outbound`](Transport::take_outbound) and reacts to
//! [`TransportEvent`]s. No socket, task or timer lives here, which keeps the
//! whole key exchange testable by shuttling bytes between two instances.
//!
//! # Transport States
//!
//! 1. **IdentificationExchange** - Exchange `SSH-2.0-...` lines
//! 2. **AlgorithmNegotiation** - KEXINIT sent, waiting for the peer's
//! 3. **KeyExchange** - Method messages, then NEWKEYS in both directions
//! 4. **Authenticated** - Packets encrypted and MAC'd; upper layers active
//! 5. **Rekeying** - A new exchange runs under the old keys
//! 6. **Closed** - Terminal
//!
//! # Rekeying
//!
//! A new exchange starts from `Authenticated` when:
//! - Bytes since the last exchange reach `rekey_bytes_limit` (1 GiB default)
//! - Time since the last exchange reaches `rekey_time_limit` (1 hour default)
//! - [`request_rekey`](Transport::request_rekey) is called
//! - The peer sends KEXINIT
//!
//! While it runs, inbound messages keep flowing upward. Outbound messages
//! outside the transport and key exchange ranges are queued and flushed in
//! order once the new outbound keys are installed.
//!
//! # Example
//!
//! ```rust
//! use kestrel_platform::system_clock;
//! use kestrel_proto::ssh::algorithm::AlgorithmRegistry;
//! use kestrel_proto::ssh::hostkey::{AcceptAnyHostKey, Ed25519HostKey};
//! use kestrel_proto::ssh::transport::{State, Transport, TransportConfig, TransportEvent};
//! use std::sync::Arc;
//!
//! let registry = AlgorithmRegistry::with_defaults();
//! let mut client = Transport::new_client(
//!     TransportConfig::default(),
//!     registry.clone(),
//!     system_clock(),
//!     Arc::new(AcceptAnyHostKey),
//! ).unwrap();
//! let mut server = Transport::new_server(
//!     TransportConfig::default(),
//!     registry,
//!     system_clock(),
//!     vec![Arc::new(Ed25519HostKey::generate().unwrap())],
//! ).unwrap();
//!
//! for _ in 0..8 {
//!     let to_server = client.take_outbound();
//!     server.on_bytes(&to_server).unwrap();
//!     let to_client = server.take_outbound();
//!     client.on_bytes(&to_client).unwrap();
//! }
//! assert_eq!(client.state(), State::Authenticated);
//! assert!(matches!(client.poll_event(), Some(TransportEvent::KeysEstablished { rekey: false, .. })));
//! ```

use super::algorithm::{AlgorithmRegistry, ClientKexStep, KexOutput, KeyExchange, ServerKexStep};
use super::hostkey::{HostKey, HostKeyInfo, HostKeyVerifier};
use super::kex::{
    derive_directional_keys, exchange_hash, guess_is_correct, negotiate, new_keys,
    AlgorithmPreferences, ExchangeContext, HashAlgorithm, KexInit, Negotiated,
};
use super::logging;
use super::message::{self, Disconnect, DisconnectReason, MessageClass, MessageType};
use super::packet::{DirectionalKeys, PacketOpener, PacketSealer, MAX_PACKET_SIZE};
use super::version::{IdentificationReader, PeerIdentification, Version};
use super::wire::put_string;
use bytes::{BufMut, BytesMut};
use kestrel_platform::{Clock, KestrelError, KestrelResult};
use rand::RngCore;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Which end of the connection this transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiator; verifies the host key
    Client,
    /// Responder; signs the exchange hash
    Server,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Transport layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Identification lines are being exchanged.
    IdentificationExchange,
    /// Our KEXINIT is out; waiting for the peer's.
    AlgorithmNegotiation,
    /// The first key exchange is running.
    KeyExchange,
    /// Keys are in place and upper layers may run.
    Authenticated,
    /// A key exchange is replacing existing keys.
    Rekeying,
    /// The connection is finished.
    Closed,
}

impl State {
    fn as_str(&self) -> &'static str {
        match self {
            State::IdentificationExchange => "IdentificationExchange",
            State::AlgorithmNegotiation => "AlgorithmNegotiation",
            State::KeyExchange => "KeyExchange",
            State::Authenticated => "Authenticated",
            State::Rekeying => "Rekeying",
            State::Closed => "Closed",
        }
    }
}

/// Transport layer configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification line.
    pub version: Version,

    /// Algorithm preferences advertised in KEXINIT.
    pub preferences: AlgorithmPreferences,

    /// Bytes (both directions) before an automatic re-key. Default 1 GiB.
    pub rekey_bytes_limit: u64,

    /// Time before an automatic re-key. Default 1 hour.
    pub rekey_time_limit: Duration,

    /// Largest accepted packet, length field and MAC included.
    pub max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: Version::default_kestrel(),
            preferences: AlgorithmPreferences::default(),
            rekey_bytes_limit: 1 << 30,
            rekey_time_limit: Duration::from_secs(3600),
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl TransportConfig {
    /// Sets the identification line.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Sets the algorithm preferences.
    pub fn with_preferences(mut self, preferences: AlgorithmPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    /// Sets the byte threshold for automatic re-key.
    pub fn with_rekey_bytes_limit(mut self, bytes: u64) -> Self {
        self.rekey_bytes_limit = bytes;
        self
    }

    /// Sets the time threshold for automatic re-key.
    pub fn with_rekey_time_limit(mut self, limit: Duration) -> Self {
        self.rekey_time_limit = limit;
        self
    }

    /// Sets the maximum accepted packet size.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Checks the configuration for values the transport cannot work with.
    pub fn validate(&self) -> KestrelResult<()> {
        self.preferences.validate()?;
        if self.rekey_bytes_limit == 0 {
            return Err(KestrelError::Config("rekey_bytes_limit must be > 0".to_string()));
        }
        if self.rekey_time_limit.is_zero() {
            return Err(KestrelError::Config("rekey_time_limit must be > 0".to_string()));
        }
        if self.max_packet_size < 4096 {
            return Err(KestrelError::Config(format!(
                "max_packet_size {} is below the 4096 byte minimum",
                self.max_packet_size
            )));
        }
        Ok(())
    }
}

/// Something the upper layers need to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A key exchange finished and new keys are active in both directions.
    KeysEstablished {
        /// Session identifier (the first exchange hash)
        session_id: Vec<u8>,
        /// `false` for the initial exchange
        rekey: bool,
    },
    /// A message for the layers above the transport (types 50..=255).
    Message {
        /// Inbound sequence number
        sequence: u32,
        /// Payload, message type first
        payload: Vec<u8>,
    },
    /// The peer asked for a service.
    ServiceRequest(String),
    /// The peer accepted our service request.
    ServiceAccept(String),
    /// SSH_MSG_DEBUG text.
    Debug(String),
    /// The connection ended.
    Disconnected {
        /// SSH_DISCONNECT_* code
        reason_code: u32,
        /// Description text
        description: String,
        /// `true` when the peer sent the DISCONNECT
        by_peer: bool,
    },
}

/// One key exchange in progress.
struct KexRun {
    local_init: Vec<u8>,
    peer_init: Option<Vec<u8>>,
    negotiated: Option<Negotiated>,
    exchange: Option<Box<dyn KeyExchange>>,
    pending_inbound: Option<DirectionalKeys>,
    newkeys_sent: bool,
    newkeys_received: bool,
    ignore_guess: bool,
}

impl KexRun {
    fn new(local_init: Vec<u8>) -> Self {
        Self {
            local_init,
            peer_init: None,
            negotiated: None,
            exchange: None,
            pending_inbound: None,
            newkeys_sent: false,
            newkeys_received: false,
            ignore_guess: false,
        }
    }
}

/// Per-connection SSH transport.
pub struct Transport {
    role: Role,
    state: State,
    config: TransportConfig,
    registry: AlgorithmRegistry,
    clock: Arc<dyn Clock>,
    host_key_verifier: Option<Arc<dyn HostKeyVerifier>>,
    host_keys: Vec<Arc<dyn HostKey>>,

    local_id: Vec<u8>,
    id_reader: IdentificationReader,
    peer_id: Option<PeerIdentification>,

    input: BytesMut,
    output: BytesMut,
    sealer: PacketSealer,
    opener: PacketOpener,

    kex: Option<KexRun>,
    negotiated: Option<Negotiated>,
    session_id: Option<Vec<u8>>,
    kex_count: u64,
    bytes_since_kex: u64,
    last_kex: Instant,

    queued: VecDeque<Vec<u8>>,
    events: VecDeque<TransportEvent>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("kex_count", &self.kex_count)
            .field("read_sequence", &self.opener.sequence())
            .field("write_sequence", &self.sealer.sequence())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Creates a client transport.
    ///
    /// `verifier` decides whether the server's host key is trusted once its
    /// signature over the exchange hash has been checked.
    pub fn new_client(
        config: TransportConfig,
        registry: AlgorithmRegistry,
        clock: Arc<dyn Clock>,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> KestrelResult<Self> {
        let mut transport = Self::new(Role::Client, config, registry, clock)?;
        transport.host_key_verifier = Some(verifier);
        transport.start()?;
        Ok(transport)
    }

    /// Creates a server transport signing with `host_keys`.
    ///
    /// Only host key algorithms backed by one of the keys are advertised.
    pub fn new_server(
        mut config: TransportConfig,
        registry: AlgorithmRegistry,
        clock: Arc<dyn Clock>,
        host_keys: Vec<Arc<dyn HostKey>>,
    ) -> KestrelResult<Self> {
        config
            .preferences
            .host_key
            .retain(|name| host_keys.iter().any(|k| k.algorithm() == name));
        if config.preferences.host_key.is_empty() {
            return Err(KestrelError::Config(
                "server needs a host key for at least one advertised algorithm".to_string(),
            ));
        }
        let mut transport = Self::new(Role::Server, config, registry, clock)?;
        transport.host_keys = host_keys;
        transport.start()?;
        Ok(transport)
    }

    fn new(
        role: Role,
        config: TransportConfig,
        registry: AlgorithmRegistry,
        clock: Arc<dyn Clock>,
    ) -> KestrelResult<Self> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            role,
            state: State::IdentificationExchange,
            local_id: config.version.to_string().into_bytes(),
            opener: PacketOpener::with_max_packet_length(config.max_packet_size),
            config,
            registry,
            clock,
            host_key_verifier: None,
            host_keys: Vec::new(),
            id_reader: IdentificationReader::new(),
            peer_id: None,
            input: BytesMut::with_capacity(4096),
            output: BytesMut::with_capacity(4096),
            sealer: PacketSealer::new(),
            kex: None,
            negotiated: None,
            session_id: None,
            kex_count: 0,
            bytes_since_kex: 0,
            last_kex: now,
            queued: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    fn start(&mut self) -> KestrelResult<()> {
        self.output.put_slice(&self.local_id);
        self.output.put_slice(b"\r\n");
        self.send_kexinit()
    }

    /// Which end this transport is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// `true` once the transport reached [`State::Closed`].
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Session identifier, once the first exchange completed.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// The peer's identification, once received.
    pub fn peer_identification(&self) -> Option<&PeerIdentification> {
        self.peer_id.as_ref()
    }

    /// Algorithms of the most recent negotiation.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Number of completed key exchanges.
    pub fn kex_count(&self) -> u64 {
        self.kex_count
    }

    /// Next inbound sequence number.
    pub fn read_sequence(&self) -> u32 {
        self.opener.sequence()
    }

    /// Next outbound sequence number.
    pub fn write_sequence(&self) -> u32 {
        self.sealer.sequence()
    }

    /// Bytes counted toward the re-key threshold.
    pub fn bytes_since_kex(&self) -> u64 {
        self.bytes_since_kex
    }

    /// Next event for the upper layers.
    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    /// `true` when bytes are waiting to be written.
    pub fn has_outbound(&self) -> bool {
        !self.output.is_empty()
    }

    /// Takes every byte queued for the peer.
    pub fn take_outbound(&mut self) -> BytesMut {
        self.output.split()
    }

    /// Feeds bytes received from the peer.
    ///
    /// A fatal error closes the transport, queues a DISCONNECT and is
    /// returned. Events produced before the error stay queued.
    pub fn on_bytes(&mut self, data: &[u8]) -> KestrelResult<()> {
        if self.state == State::Closed {
            return Err(KestrelError::ConnectionClosed("transport closed".to_string()));
        }
        self.input.extend_from_slice(data);
        let result = self.process_input().and_then(|_| self.check_rekey());
        self.fail_on_error(result)
    }

    fn process_input(&mut self) -> KestrelResult<()> {
        if self.state == State::IdentificationExchange {
            match self.id_reader.read(&mut self.input)? {
                Some(peer) => {
                    logging::log_peer_identification(
                        self.role.as_str(),
                        &peer.version.to_string(),
                        self.id_reader.banner_lines(),
                    );
                    self.peer_id = Some(peer);
                    self.transition(State::AlgorithmNegotiation);
                }
                None => return Ok(()),
            }
        }

        while self.state != State::Closed {
            let before = self.input.len();
            let Some((sequence, payload)) = self.opener.open(&mut self.input)? else {
                break;
            };
            self.bytes_since_kex += (before - self.input.len()) as u64;
            self.handle_packet(sequence, payload)?;
        }
        Ok(())
    }

    fn handle_packet(&mut self, sequence: u32, payload: Vec<u8>) -> KestrelResult<()> {
        let msg = *payload
            .first()
            .ok_or_else(|| KestrelError::Protocol("empty packet payload".to_string()))?;
        logging::log_packet("in", sequence, msg, payload.len());

        if (30..=49).contains(&msg) {
            if let Some(run) = self.kex.as_mut() {
                if run.ignore_guess {
                    run.ignore_guess = false;
                    debug!(msg_type = msg, "Ignoring wrongly guessed key exchange packet");
                    return Ok(());
                }
            }
            return self.handle_kex_message(&payload);
        }

        match MessageType::from_u8(msg) {
            Some(MessageType::Disconnect) => {
                let disconnect = Disconnect::from_bytes(&payload)?;
                logging::log_disconnect(disconnect.reason_code, &disconnect.description, true);
                self.transition(State::Closed);
                self.events.push_back(TransportEvent::Disconnected {
                    reason_code: disconnect.reason_code,
                    description: disconnect.description,
                    by_peer: true,
                });
            }
            Some(MessageType::Ignore) => {}
            Some(MessageType::Unimplemented) => {
                let rejected = message::parse_unimplemented(&payload)?;
                logging::log_protocol_warning(
                    "transport",
                    &format!("peer rejected our packet {} as unimplemented", rejected),
                );
            }
            Some(MessageType::Debug) => {
                self.events
                    .push_back(TransportEvent::Debug(message::parse_debug(&payload)?));
            }
            Some(MessageType::ServiceRequest) => {
                self.require_keys(msg)?;
                self.events
                    .push_back(TransportEvent::ServiceRequest(message::parse_service(&payload)?));
            }
            Some(MessageType::ServiceAccept) => {
                self.require_keys(msg)?;
                self.events
                    .push_back(TransportEvent::ServiceAccept(message::parse_service(&payload)?));
            }
            Some(MessageType::KexInit) => self.handle_kexinit(payload)?,
            Some(MessageType::NewKeys) => self.handle_newkeys()?,
            _ if msg >= 50 => {
                self.require_keys(msg)?;
                self.events
                    .push_back(TransportEvent::Message { sequence, payload });
            }
            _ => {
                warn!(msg_type = msg, seq_num = sequence, "Unknown transport message");
                self.send_unimplemented(sequence)?;
            }
        }
        Ok(())
    }

    fn require_keys(&self, msg: u8) -> KestrelResult<()> {
        if self.session_id.is_none() {
            return Err(KestrelError::Protocol(format!(
                "message type {} before key exchange completed",
                msg
            )));
        }
        Ok(())
    }

    fn send_kexinit(&mut self) -> KestrelResult<()> {
        let payload = KexInit::new(&self.config.preferences).to_bytes();
        self.write_packet(&payload)?;
        self.kex = Some(KexRun::new(payload));
        Ok(())
    }

    fn handle_kexinit(&mut self, payload: Vec<u8>) -> KestrelResult<()> {
        if self.kex.is_none() {
            logging::log_rekey_start("peer", self.bytes_since_kex);
            self.send_kexinit()?;
            self.transition(State::Rekeying);
        }
        let peer = KexInit::from_bytes(&payload)?;
        let local_init = match self.kex.as_ref() {
            Some(run) if run.peer_init.is_some() => {
                return Err(KestrelError::Protocol("duplicate KEXINIT".to_string()))
            }
            Some(run) => KexInit::from_bytes(&run.local_init)?,
            None => return Err(KestrelError::Protocol("key exchange state lost".to_string())),
        };

        let (client, server) = match self.role {
            Role::Client => (&local_init, &peer),
            Role::Server => (&peer, &local_init),
        };
        let negotiated = negotiate(client, server, &self.registry)?;
        logging::log_negotiated(
            &negotiated.kex,
            &negotiated.host_key,
            &negotiated.cipher_c2s,
            &negotiated.cipher_s2c,
        );
        let ignore_guess = peer.first_kex_packet_follows() && !guess_is_correct(client, server);
        let mut exchange = self.registry.kex(&negotiated.kex)?;
        let first_message = match self.role {
            Role::Client => Some(exchange.client_start()?),
            Role::Server => None,
        };

        if let Some(run) = self.kex.as_mut() {
            run.peer_init = Some(payload);
            run.negotiated = Some(negotiated.clone());
            run.exchange = Some(exchange);
            run.ignore_guess = ignore_guess;
        }
        self.negotiated = Some(negotiated);
        if self.state == State::AlgorithmNegotiation {
            self.transition(State::KeyExchange);
        }
        if let Some(message) = first_message {
            self.write_packet(&message)?;
        }
        Ok(())
    }

    fn handle_kex_message(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let exchange = self
            .kex
            .as_mut()
            .and_then(|run| run.exchange.as_mut())
            .ok_or_else(|| {
                KestrelError::Protocol("key exchange message outside key exchange".to_string())
            })?;
        let hash = exchange.hash();
        match self.role {
            Role::Client => match exchange.client_receive(payload)? {
                ClientKexStep::Send(message) => self.write_packet(&message),
                ClientKexStep::Reply {
                    host_key,
                    signature,
                    output,
                } => self.finish_client(hash, &host_key, &signature, output),
            },
            Role::Server => match exchange.server_receive(payload)? {
                ServerKexStep::Send(message) => self.write_packet(&message),
                ServerKexStep::Reply {
                    reply_type,
                    server_public,
                    output,
                } => self.finish_server(hash, reply_type, &server_public, output),
            },
        }
    }

    fn exchange_hash(
        &self,
        hash: HashAlgorithm,
        host_key_blob: &[u8],
        output: &KexOutput,
    ) -> KestrelResult<Vec<u8>> {
        let run = self
            .kex
            .as_ref()
            .ok_or_else(|| KestrelError::Protocol("key exchange state lost".to_string()))?;
        let peer_id = self
            .peer_id
            .as_ref()
            .ok_or_else(|| KestrelError::Protocol("key exchange before identification".to_string()))?;
        let peer_init = run
            .peer_init
            .as_deref()
            .ok_or_else(|| KestrelError::Protocol("key exchange before KEXINIT".to_string()))?;

        let ctx = match self.role {
            Role::Client => ExchangeContext {
                client_version: &self.local_id,
                server_version: &peer_id.raw,
                client_kexinit: &run.local_init,
                server_kexinit: peer_init,
            },
            Role::Server => ExchangeContext {
                client_version: &peer_id.raw,
                server_version: &self.local_id,
                client_kexinit: peer_init,
                server_kexinit: &run.local_init,
            },
        };
        Ok(exchange_hash(
            hash,
            &ctx,
            host_key_blob,
            &output.hash_fields,
            &output.shared_secret,
        ))
    }

    fn current_negotiated(&self) -> KestrelResult<Negotiated> {
        self.kex
            .as_ref()
            .and_then(|run| run.negotiated.clone())
            .ok_or_else(|| KestrelError::Protocol("key exchange before negotiation".to_string()))
    }

    fn finish_client(
        &mut self,
        hash: HashAlgorithm,
        host_key: &[u8],
        signature: &[u8],
        output: KexOutput,
    ) -> KestrelResult<()> {
        let negotiated = self.current_negotiated()?;
        let h = self.exchange_hash(hash, host_key, &output)?;

        let verifier = self.registry.host_key(&negotiated.host_key)?;
        if !verifier.verify(host_key, &h, signature)? {
            return Err(KestrelError::HostKeyRejected(
                "server signature over exchange hash is invalid".to_string(),
            ));
        }
        let info = HostKeyInfo::new(&negotiated.host_key, host_key);
        if let Some(trust) = &self.host_key_verifier {
            if !trust.verify(&info) {
                return Err(KestrelError::HostKeyRejected(format!(
                    "{} key {} not trusted",
                    info.algorithm, info.fingerprint
                )));
            }
        }
        self.complete_exchange(hash, &negotiated, output, h)
    }

    fn finish_server(
        &mut self,
        hash: HashAlgorithm,
        reply_type: u8,
        server_public: &[u8],
        output: KexOutput,
    ) -> KestrelResult<()> {
        let negotiated = self.current_negotiated()?;
        let host_key = self
            .host_keys
            .iter()
            .find(|k| k.algorithm() == negotiated.host_key)
            .cloned()
            .ok_or_else(|| {
                KestrelError::Negotiation(format!("no host key for {}", negotiated.host_key))
            })?;
        let blob = host_key.public_key_blob();
        let h = self.exchange_hash(hash, &blob, &output)?;
        let signature = host_key.sign(&h)?;

        let mut reply = BytesMut::new();
        reply.put_u8(reply_type);
        put_string(&mut reply, &blob);
        reply.put_slice(server_public);
        put_string(&mut reply, &signature);
        self.write_packet(&reply)?;
        self.complete_exchange(hash, &negotiated, output, h)
    }

    fn complete_exchange(
        &mut self,
        hash: HashAlgorithm,
        negotiated: &Negotiated,
        output: KexOutput,
        h: Vec<u8>,
    ) -> KestrelResult<()> {
        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();
        let (outbound, inbound) = derive_directional_keys(
            &self.registry,
            negotiated,
            self.role,
            hash,
            &output.shared_secret,
            &h,
            &session_id,
        )?;
        drop(output);

        self.write_packet(&new_keys())?;
        self.sealer.install(outbound);
        if let Some(run) = self.kex.as_mut() {
            run.newkeys_sent = true;
            run.pending_inbound = Some(inbound);
            run.exchange = None;
        }
        self.finish_if_done()
    }

    fn handle_newkeys(&mut self) -> KestrelResult<()> {
        let inbound = self
            .kex
            .as_mut()
            .and_then(|run| run.pending_inbound.take())
            .ok_or_else(|| KestrelError::Protocol("unexpected NEWKEYS".to_string()))?;
        self.opener.install(inbound);
        if let Some(run) = self.kex.as_mut() {
            run.newkeys_received = true;
        }
        self.finish_if_done()
    }

    fn finish_if_done(&mut self) -> KestrelResult<()> {
        let done = self
            .kex
            .as_ref()
            .map_or(false, |run| run.newkeys_sent && run.newkeys_received);
        if !done {
            return Ok(());
        }

        self.kex = None;
        let rekey = self.kex_count > 0;
        self.kex_count += 1;
        self.bytes_since_kex = 0;
        self.last_kex = self.clock.now();
        self.transition(State::Authenticated);

        let session_id = self.session_id.clone().unwrap_or_default();
        logging::log_kex_complete(&session_id, self.kex_count, rekey);
        self.events
            .push_back(TransportEvent::KeysEstablished { session_id, rekey });

        while let Some(payload) = self.queued.pop_front() {
            self.write_packet(&payload)?;
        }
        Ok(())
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            logging::log_state_transition(self.role.as_str(), self.state.as_str(), next.as_str());
            self.state = next;
        }
    }

    fn write_packet(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let (sequence, written) = self.sealer.seal(payload, &mut self.output)?;
        logging::log_packet("out", sequence, payload.first().copied().unwrap_or(0), payload.len());
        self.bytes_since_kex += written as u64;
        Ok(())
    }

    /// Sends a message on behalf of the upper layers.
    ///
    /// While a key exchange runs, anything outside the transport generic
    /// and key exchange ranges waits in a FIFO queue.
    pub fn send_message(&mut self, payload: &[u8]) -> KestrelResult<()> {
        if self.state == State::Closed {
            return Err(KestrelError::ConnectionClosed("transport closed".to_string()));
        }
        let msg = *payload
            .first()
            .ok_or_else(|| KestrelError::Protocol("cannot send an empty message".to_string()))?;
        if self.kex.is_some() && !MessageClass::allowed_during_kex(msg) {
            self.queued.push_back(payload.to_vec());
            return Ok(());
        }
        let result = self.write_packet(payload).and_then(|_| self.check_rekey());
        self.fail_on_error(result)
    }

    /// Number of messages waiting for a key exchange to finish.
    pub fn queued_messages(&self) -> usize {
        self.queued.len()
    }

    /// Starts a re-key unless one is already running.
    pub fn request_rekey(&mut self) -> KestrelResult<()> {
        match self.state {
            State::Authenticated if self.kex.is_none() => {
                logging::log_rekey_start("request", self.bytes_since_kex);
                self.send_kexinit()?;
                self.transition(State::Rekeying);
                Ok(())
            }
            State::Closed => Err(KestrelError::ConnectionClosed("transport closed".to_string())),
            _ => Ok(()),
        }
    }

    /// Starts a re-key when a byte or time threshold has been reached.
    ///
    /// Called after every send and receive; the session also calls it
    /// periodically so an idle connection still honours the time limit.
    pub fn check_rekey(&mut self) -> KestrelResult<()> {
        if self.state != State::Authenticated || self.kex.is_some() {
            return Ok(());
        }
        let trigger = if self.bytes_since_kex >= self.config.rekey_bytes_limit {
            "bytes"
        } else if self.clock.now().saturating_duration_since(self.last_kex)
            >= self.config.rekey_time_limit
        {
            "time"
        } else {
            return Ok(());
        };
        logging::log_rekey_start(trigger, self.bytes_since_kex);
        self.send_kexinit()?;
        self.transition(State::Rekeying);
        Ok(())
    }

    /// Sends SSH_MSG_DISCONNECT and closes the transport.
    pub fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        if self.state == State::Closed {
            return;
        }
        let message = Disconnect::new(reason, description);
        if let Err(e) = self.write_packet(&message.to_bytes()) {
            warn!(error = %e, "Failed to encode DISCONNECT");
        }
        logging::log_disconnect(message.reason_code, description, false);
        self.transition(State::Closed);
        self.events.push_back(TransportEvent::Disconnected {
            reason_code: message.reason_code,
            description: description.to_string(),
            by_peer: false,
        });
    }

    fn fail_on_error(&mut self, result: KestrelResult<()>) -> KestrelResult<()> {
        if let Err(err) = &result {
            if err.is_fatal() || matches!(err, KestrelError::Security(_)) {
                logging::log_fatal_error(self.role.as_str(), &err.to_string());
                self.disconnect(DisconnectReason::for_error(err), &err.to_string());
            }
        }
        result
    }

    /// Sends SSH_MSG_IGNORE with `len` random bytes.
    pub fn send_ignore(&mut self, len: usize) -> KestrelResult<()> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        self.send_message(&message::ignore(&data))
    }

    /// Sends SSH_MSG_UNIMPLEMENTED for an inbound sequence number.
    pub fn send_unimplemented(&mut self, sequence: u32) -> KestrelResult<()> {
        self.send_message(&message::unimplemented(sequence))
    }

    /// Sends SSH_MSG_SERVICE_REQUEST.
    pub fn service_request(&mut self, name: &str) -> KestrelResult<()> {
        self.send_message(&message::service(MessageType::ServiceRequest, name))
    }

    /// Sends SSH_MSG_SERVICE_ACCEPT.
    pub fn service_accept(&mut self, name: &str) -> KestrelResult<()> {
        self.send_message(&message::service(MessageType::ServiceAccept, name))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ssh::hostkey::{AcceptAnyHostKey, Ed25519HostKey};
    use kestrel_platform::ManualClock;

    pub(crate) fn pair_with(
        client_config: TransportConfig,
        server_config: TransportConfig,
        clock: Arc<dyn Clock>,
    ) -> (Transport, Transport) {
        let registry = AlgorithmRegistry::with_defaults();
        let client = Transport::new_client(
            client_config,
            registry.clone(),
            clock.clone(),
            Arc::new(AcceptAnyHostKey),
        )
        .unwrap();
        let server = Transport::new_server(
            server_config,
            registry,
            clock,
            vec![Arc::new(Ed25519HostKey::generate().unwrap())],
        )
        .unwrap();
        (client, server)
    }

    pub(crate) fn pump(client: &mut Transport, server: &mut Transport) {
        for _ in 0..16 {
            let to_server = client.take_outbound();
            let to_client = server.take_outbound();
            if to_server.is_empty() && to_client.is_empty() {
                return;
            }
            if !to_server.is_empty() {
                server.on_bytes(&to_server).unwrap();
            }
            if !to_client.is_empty() {
                client.on_bytes(&to_client).unwrap();
            }
        }
    }

    fn established() -> (Transport, Transport) {
        let (mut c, mut s) = pair_with(
            TransportConfig::default(),
            TransportConfig::default(),
            kestrel_platform::system_clock(),
        );
        pump(&mut c, &mut s);
        (c, s)
    }

    fn drain_events(t: &mut Transport) -> Vec<TransportEvent> {
        std::iter::from_fn(|| t.poll_event()).collect()
    }

    fn prefs_with_cipher(cipher: &str) -> TransportConfig {
        let mut prefs = AlgorithmPreferences::default();
        prefs.ciphers = vec![cipher.to_string()];
        TransportConfig::default().with_preferences(prefs)
    }

    #[test]
    fn test_handshake_establishes_shared_session() {
        let (mut c, mut s) = established();
        assert_eq!(c.state(), State::Authenticated);
        assert_eq!(s.state(), State::Authenticated);
        assert_eq!(c.session_id(), s.session_id());
        assert_eq!(c.negotiated().unwrap().kex, "curve25519-sha256");

        let events = drain_events(&mut c);
        assert!(matches!(
            events.as_slice(),
            [TransportEvent::KeysEstablished { rekey: false, .. }]
        ));
        assert_eq!(drain_events(&mut s).len(), 1);
    }

    #[test]
    fn test_each_kex_method_and_cipher() {
        for kex in [
            "diffie-hellman-group14-sha256",
            "diffie-hellman-group-exchange-sha256",
            "curve25519-sha256@libssh.org",
        ] {
            for cipher in ["aes128-ctr", "aes256-gcm@openssh.com"] {
                let mut config = prefs_with_cipher(cipher);
                config.preferences.kex = vec![kex.to_string()];
                let (mut c, mut s) = pair_with(
                    config.clone(),
                    config,
                    kestrel_platform::system_clock(),
                );
                pump(&mut c, &mut s);
                assert_eq!(c.state(), State::Authenticated, "{} / {}", kex, cipher);

                c.send_message(&[94, 1, 2, 3]).unwrap();
                pump(&mut c, &mut s);
                let events = drain_events(&mut s);
                assert!(events.contains(&TransportEvent::Message {
                    sequence: s.read_sequence() - 1,
                    payload: vec![94, 1, 2, 3],
                }));
            }
        }
    }

    #[test]
    fn test_banner_lines_before_identification() {
        let (mut c, mut s) = pair_with(
            TransportConfig::default(),
            TransportConfig::default(),
            kestrel_platform::system_clock(),
        );
        let mut to_client = BytesMut::from(&b"hello\r\nbanner\r\n"[..]);
        to_client.extend_from_slice(&s.take_outbound());
        c.on_bytes(&to_client).unwrap();
        pump(&mut c, &mut s);

        assert_eq!(c.state(), State::Authenticated);
        let peer = c.peer_identification().unwrap();
        assert!(peer.version.software().starts_with("Kestrel_"));
        assert!(peer.raw.starts_with(b"SSH-2.0-"));
    }

    #[test]
    fn test_negotiation_failure_is_fatal_before_kex() {
        let mut client_prefs = AlgorithmPreferences::default();
        client_prefs.kex = vec!["curve25519-sha256".to_string()];
        let mut server_prefs = AlgorithmPreferences::default();
        server_prefs.kex = vec!["diffie-hellman-group14-sha256".to_string()];
        let (mut c, mut s) = pair_with(
            TransportConfig::default().with_preferences(client_prefs),
            TransportConfig::default().with_preferences(server_prefs),
            kestrel_platform::system_clock(),
        );

        let to_server = c.take_outbound();
        let err = s.on_bytes(&to_server).unwrap_err();
        assert!(matches!(err, KestrelError::Negotiation(_)));
        assert!(s.is_closed());
        assert!(s.session_id().is_none());
        assert!(matches!(
            drain_events(&mut s).last(),
            Some(TransportEvent::Disconnected { reason_code: 3, by_peer: false, .. })
        ));

        let to_client = s.take_outbound();
        let _ = c.on_bytes(&to_client);
        assert!(c.is_closed());
    }

    #[test]
    fn test_host_key_rejection() {
        let registry = AlgorithmRegistry::with_defaults();
        let clock = kestrel_platform::system_clock();
        let mut c = Transport::new_client(
            TransportConfig::default(),
            registry.clone(),
            clock.clone(),
            Arc::new(|_: &HostKeyInfo| false),
        )
        .unwrap();
        let mut s = Transport::new_server(
            TransportConfig::default(),
            registry,
            clock,
            vec![Arc::new(Ed25519HostKey::generate().unwrap())],
        )
        .unwrap();

        let mut rejected = None;
        for _ in 0..8 {
            let out = c.take_outbound();
            if !out.is_empty() {
                let _ = s.on_bytes(&out);
            }
            let out = s.take_outbound();
            if let Err(e) = c.on_bytes(&out) {
                rejected = Some(e);
                break;
            }
        }
        assert!(matches!(rejected, Some(KestrelError::HostKeyRejected(_))));
        assert!(c.is_closed());
    }

    #[test]
    fn test_upper_layer_message_before_keys_is_queued() {
        let (mut c, mut s) = pair_with(
            TransportConfig::default(),
            TransportConfig::default(),
            kestrel_platform::system_clock(),
        );
        c.service_request("ssh-userauth").unwrap();
        c.send_message(&[80, 0, 0, 0, 0]).unwrap();
        assert_eq!(c.queued_messages(), 2);

        pump(&mut c, &mut s);
        assert_eq!(c.queued_messages(), 0);
        let events = drain_events(&mut s);
        assert!(events.contains(&TransportEvent::ServiceRequest("ssh-userauth".to_string())));
        assert!(events.iter().any(|e| matches!(e, TransportEvent::Message { payload, .. } if payload[0] == 80)));
    }

    #[test]
    fn test_rekey_by_request_keeps_session_and_sequences() {
        let (mut c, mut s) = established();
        drain_events(&mut c);
        drain_events(&mut s);
        let session = c.session_id().unwrap().to_vec();
        let write_seq = c.write_sequence();

        c.request_rekey().unwrap();
        assert_eq!(c.state(), State::Rekeying);
        c.send_message(&[94, 9]).unwrap();
        assert_eq!(c.queued_messages(), 1);

        pump(&mut c, &mut s);
        assert_eq!(c.state(), State::Authenticated);
        assert_eq!(s.state(), State::Authenticated);
        assert_eq!(c.kex_count(), 2);
        assert_eq!(c.session_id().unwrap(), &session[..]);
        assert!(c.write_sequence() > write_seq);

        let events = drain_events(&mut s);
        assert!(events.contains(&TransportEvent::KeysEstablished {
            session_id: session.clone(),
            rekey: true,
        }));
        let keys_at = events
            .iter()
            .position(|e| matches!(e, TransportEvent::KeysEstablished { .. }));
        let data_at = events
            .iter()
            .position(|e| matches!(e, TransportEvent::Message { payload, .. } if payload == &vec![94, 9]));
        assert!(keys_at.unwrap() < data_at.unwrap());
    }

    #[test]
    fn test_rekey_by_byte_threshold() {
        let config = TransportConfig::default().with_rekey_bytes_limit(4096);
        let (mut c, mut s) = pair_with(config.clone(), config, kestrel_platform::system_clock());
        pump(&mut c, &mut s);
        assert_eq!(c.kex_count(), 1);

        c.send_message(&[94; 5000]).unwrap();
        assert_eq!(c.state(), State::Rekeying);
        pump(&mut c, &mut s);
        assert_eq!(c.kex_count(), 2);
        assert_eq!(s.kex_count(), 2);
    }

    #[test]
    fn test_rekey_by_time_threshold() {
        let clock = Arc::new(ManualClock::new());
        let config = TransportConfig::default().with_rekey_time_limit(Duration::from_secs(60));
        let (mut c, mut s) = pair_with(config.clone(), config, clock.clone());
        pump(&mut c, &mut s);

        clock.advance(Duration::from_secs(59));
        c.check_rekey().unwrap();
        assert_eq!(c.state(), State::Authenticated);

        clock.advance(Duration::from_secs(1));
        c.check_rekey().unwrap();
        assert_eq!(c.state(), State::Rekeying);
        pump(&mut c, &mut s);
        assert_eq!(c.kex_count(), 2);
    }

    #[test]
    fn test_peer_disconnect_surfaces_reason() {
        let (mut c, mut s) = established();
        drain_events(&mut c);
        s.disconnect(DisconnectReason::ByApplication, "shutting down");
        let bytes = s.take_outbound();
        c.on_bytes(&bytes).unwrap();
        assert!(c.is_closed());
        assert_eq!(
            drain_events(&mut c),
            vec![TransportEvent::Disconnected {
                reason_code: 11,
                description: "shutting down".to_string(),
                by_peer: true,
            }]
        );
        assert!(matches!(c.send_message(&[94]), Err(KestrelError::ConnectionClosed(_))));
    }

    #[test]
    fn test_unknown_transport_message_gets_unimplemented() {
        let (mut c, mut s) = established();
        drain_events(&mut s);
        c.send_message(&[15, 1, 2]).unwrap();
        let seq = s.read_sequence();
        pump(&mut c, &mut s);
        assert!(drain_events(&mut s).is_empty());
        assert!(!s.is_closed());
        assert_eq!(s.read_sequence(), seq + 1);
        assert!(!c.is_closed());
    }

    #[test]
    fn test_tampered_ciphertext_closes_with_mac_error() {
        let (mut c, mut s) = established();
        c.send_message(&[94, 1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut bytes = c.take_outbound();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let err = s.on_bytes(&bytes).unwrap_err();
        assert!(matches!(err, KestrelError::Integrity(_)));
        assert!(s.is_closed());
    }

    #[test]
    fn test_config_validation() {
        assert!(TransportConfig::default().validate().is_ok());
        assert!(TransportConfig::default().with_rekey_bytes_limit(0).validate().is_err());
        assert!(TransportConfig::default().with_max_packet_size(100).validate().is_err());
    }
}
