//! Channel multiplexer (RFC 4254).
//!
//! [`Multiplexer`] owns the channel table of one connection. Like
//! [`super::transport::Transport`] it does no I/O: connection protocol
//! payloads go in through [`Multiplexer::handle`], payloads to transmit come
//! out of [`Multiplexer::take_outbound`], and everything the layer above
//! must react to comes out of [`Multiplexer::poll_event`].
//!
//! # Flow control
//!
//! [`Multiplexer::send_data`] fragments by `min(remote max packet, remote
//! window)` and reports how much it could take; the caller keeps the rest
//! until a [`MuxEvent::WindowAvailable`] arrives. Inbound data is charged
//! against the local window; once the consumer reports (through
//! [`Multiplexer::consume`]) that the configured threshold of bytes has been
//! processed, a WINDOW_ADJUST restores the window.
//!
//! # Close semantics
//!
//! EOF is independent per direction. CLOSE is sent when both EOFs have been
//! seen, when [`Multiplexer::close`] is called, or when the peer closes. A
//! channel leaves the table only when CLOSE went both ways, or when
//! [`Multiplexer::teardown`] runs.
//!
//! A flow control violation on one channel closes that channel with
//! [`MuxEvent::Failed`]; the connection survives. Messages addressed to a
//! channel that does not exist are connection errors.

use super::channel::{Channel, ChannelConfig};
use super::connection::{
    request_failure, request_success, ChannelClose, ChannelData, ChannelEof, ChannelExtendedData,
    ChannelFailure, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason,
    ChannelRequest, ChannelRequestType, ChannelSuccess, ChannelType, ChannelWindowAdjust,
    ConnectionMessage, GlobalRequest,
};
use super::logging;
use kestrel_platform::{KestrelError, KestrelResult};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Default cap on simultaneously open channels.
pub const DEFAULT_MAX_CHANNELS: usize = 1024;

/// Something the layer above must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// The peer confirmed a channel we opened.
    OpenConfirmed {
        /// Local channel number
        local_id: u32,
    },
    /// The peer refused a channel we opened; the channel is gone.
    OpenFailed {
        /// Local channel number
        local_id: u32,
        /// The peer's refusal
        failure: ChannelOpenFailure,
    },
    /// The peer wants to open a channel. Answer with
    /// [`Multiplexer::accept_open`] or [`Multiplexer::reject_open`].
    OpenRequested {
        /// The peer's channel number
        sender_channel: u32,
        /// Requested type
        channel_type: ChannelType,
        /// The peer's initial window
        initial_window: u32,
        /// The peer's maximum packet
        max_packet: u32,
    },
    /// Channel data.
    Data {
        /// Local channel number
        local_id: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// Extended channel data (stderr for code 1).
    ExtendedData {
        /// Local channel number
        local_id: u32,
        /// Data type code
        code: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// The peer will send no more data.
    Eof {
        /// Local channel number
        local_id: u32,
    },
    /// A channel request. Requests wanting a reply must be answered with
    /// [`Multiplexer::reply_request`], in arrival order.
    Request {
        /// Local channel number
        local_id: u32,
        /// The request
        request: ChannelRequest,
    },
    /// Answer to a request we sent with `want_reply`.
    RequestReply {
        /// Local channel number
        local_id: u32,
        /// CHANNEL_SUCCESS or CHANNEL_FAILURE
        success: bool,
    },
    /// Send credit arrived for a channel.
    WindowAvailable {
        /// Local channel number
        local_id: u32,
    },
    /// A global request. Requests wanting a reply must be answered with
    /// [`Multiplexer::reply_global`].
    GlobalRequest(GlobalRequest),
    /// Answer to a global request we sent.
    GlobalReply {
        /// REQUEST_SUCCESS or REQUEST_FAILURE
        success: bool,
        /// Response data
        data: Vec<u8>,
    },
    /// The channel broke flow control and is being closed.
    Failed {
        /// Local channel number
        local_id: u32,
        /// What went wrong
        reason: String,
    },
    /// The channel was released.
    Closed {
        /// Local channel number
        local_id: u32,
    },
}

/// Channel table and connection protocol state machine.
#[derive(Debug)]
pub struct Multiplexer {
    config: ChannelConfig,
    max_channels: usize,
    channels: HashMap<u32, Channel>,
    next_id: u32,
    outbound: VecDeque<Vec<u8>>,
    events: VecDeque<MuxEvent>,
}

impl Multiplexer {
    /// Creates an empty multiplexer.
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_max_channels(config, DEFAULT_MAX_CHANNELS)
    }

    /// Creates an empty multiplexer holding at most `max_channels` channels.
    pub fn with_max_channels(config: ChannelConfig, max_channels: usize) -> Self {
        Self {
            config,
            max_channels,
            channels: HashMap::new(),
            next_id: 0,
            outbound: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Channel settings used for new channels.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Looks up a channel.
    pub fn channel(&self, local_id: u32) -> Option<&Channel> {
        self.channels.get(&local_id)
    }

    /// Number of channels in the table.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Next event, if any.
    pub fn poll_event(&mut self) -> Option<MuxEvent> {
        self.events.pop_front()
    }

    /// Drains payloads waiting to be sent.
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        self.outbound.drain(..).collect()
    }

    fn allocate_id(&mut self) -> KestrelResult<u32> {
        if self.channels.len() >= self.max_channels {
            return Err(KestrelError::ChannelOpenFailure {
                reason: ChannelOpenFailureReason::ResourceShortage as u32,
                description: "too many channels".to_string(),
            });
        }
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.channels.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Sends CHANNEL_OPEN with the configured window and packet size.
    pub fn open_channel(&mut self, channel_type: ChannelType) -> KestrelResult<u32> {
        let (window, max_packet) = (self.config.initial_window, self.config.max_packet);
        self.open_channel_with(channel_type, window, max_packet)
    }

    /// Sends CHANNEL_OPEN with an explicit window and packet size. The
    /// outcome arrives as [`MuxEvent::OpenConfirmed`] or
    /// [`MuxEvent::OpenFailed`].
    pub fn open_channel_with(
        &mut self,
        channel_type: ChannelType,
        initial_window: u32,
        max_packet: u32,
    ) -> KestrelResult<u32> {
        let local_id = self.allocate_id()?;
        let config = ChannelConfig {
            initial_window,
            max_packet,
            window_refill_threshold: if initial_window == self.config.initial_window {
                self.config.window_refill_threshold
            } else {
                (initial_window / 2).max(1)
            },
        };
        self.channels.insert(
            local_id,
            Channel::outbound(local_id, channel_type.name(), &config),
        );
        self.outbound.push_back(
            ChannelOpen::new(channel_type, local_id, initial_window, max_packet).to_bytes(),
        );
        debug!(local_id, "Channel open requested");
        Ok(local_id)
    }

    /// Accepts a peer's open request and confirms it.
    pub fn accept_open(
        &mut self,
        sender_channel: u32,
        channel_type: &ChannelType,
        remote_window: u32,
        remote_max_packet: u32,
    ) -> KestrelResult<u32> {
        let local_id = match self.allocate_id() {
            Ok(id) => id,
            Err(err) => {
                self.reject_open(
                    sender_channel,
                    ChannelOpenFailureReason::ResourceShortage,
                    "too many channels",
                );
                return Err(err);
            }
        };
        let channel = Channel::inbound(
            local_id,
            sender_channel,
            channel_type.name(),
            remote_window,
            remote_max_packet,
            &self.config,
        );
        self.channels.insert(local_id, channel);
        self.outbound.push_back(
            ChannelOpenConfirmation::new(
                sender_channel,
                local_id,
                self.config.initial_window,
                self.config.max_packet,
            )
            .to_bytes(),
        );
        logging::log_channel_open(local_id, sender_channel, channel_type.name());
        Ok(local_id)
    }

    /// Refuses a peer's open request.
    pub fn reject_open(
        &mut self,
        sender_channel: u32,
        reason: ChannelOpenFailureReason,
        description: &str,
    ) {
        self.outbound.push_back(
            ChannelOpenFailure::with_description(sender_channel, reason, description).to_bytes(),
        );
    }

    fn open_channel_mut(&mut self, local_id: u32) -> KestrelResult<&mut Channel> {
        self.channels
            .get_mut(&local_id)
            .ok_or(KestrelError::ChannelClosed)
    }

    /// Sends as much of `data` as the window allows, fragmenting by the
    /// remote max packet. Returns the number of bytes taken; zero means the
    /// window is exhausted. `extended` selects CHANNEL_EXTENDED_DATA.
    pub fn send_data(&mut self, local_id: u32, data: &[u8], extended: Option<u32>) -> KestrelResult<usize> {
        let channel = self.open_channel_mut(local_id)?;
        if !channel.can_send() {
            return Err(KestrelError::ChannelClosed);
        }
        let remote_id = channel.remote_id().ok_or(KestrelError::ChannelClosed)?;

        let mut offset = 0;
        let mut messages = Vec::new();
        while offset < data.len() {
            let granted = channel.take_send_credit(data.len() - offset);
            if granted == 0 {
                break;
            }
            let chunk = data[offset..offset + granted].to_vec();
            messages.push(match extended {
                Some(code) => ChannelExtendedData::new(remote_id, code, chunk).to_bytes(),
                None => ChannelData::new(remote_id, chunk).to_bytes(),
            });
            offset += granted;
        }
        self.outbound.extend(messages);
        Ok(offset)
    }

    /// Sends a channel request.
    pub fn send_request(
        &mut self,
        local_id: u32,
        request: ChannelRequestType,
        want_reply: bool,
    ) -> KestrelResult<()> {
        let channel = self.open_channel_mut(local_id)?;
        if channel.close_sent() {
            return Err(KestrelError::ChannelClosed);
        }
        let remote_id = channel.remote_id().ok_or(KestrelError::ChannelClosed)?;
        self.outbound
            .push_back(ChannelRequest::new(remote_id, request, want_reply).to_bytes());
        Ok(())
    }

    /// Answers a peer's channel request.
    pub fn reply_request(&mut self, local_id: u32, success: bool) -> KestrelResult<()> {
        let channel = self.open_channel_mut(local_id)?;
        let remote_id = channel.remote_id().ok_or(KestrelError::ChannelClosed)?;
        if channel.is_released() {
            return Err(KestrelError::ChannelClosed);
        }
        self.outbound.push_back(if success {
            ChannelSuccess::new(remote_id).to_bytes()
        } else {
            ChannelFailure::new(remote_id).to_bytes()
        });
        Ok(())
    }

    /// Sends a global request.
    pub fn send_global(&mut self, request: GlobalRequest) {
        self.outbound.push_back(request.to_bytes());
    }

    /// Answers a peer's global request.
    pub fn reply_global(&mut self, success: bool, data: &[u8]) {
        self.outbound.push_back(if success {
            request_success(data)
        } else {
            request_failure()
        });
    }

    /// Sends EOF. Closing follows once the peer's EOF is in too.
    pub fn send_eof(&mut self, local_id: u32) -> KestrelResult<()> {
        let channel = self.open_channel_mut(local_id)?;
        let remote_id = channel.remote_id().ok_or(KestrelError::ChannelClosed)?;
        if channel.close_sent() || !channel.mark_eof_sent() {
            return Ok(());
        }
        self.outbound.push_back(ChannelEof::new(remote_id).to_bytes());
        self.maybe_close(local_id);
        Ok(())
    }

    /// Sends CLOSE. The channel is released when the peer's CLOSE arrives.
    pub fn close(&mut self, local_id: u32) -> KestrelResult<()> {
        let channel = self.open_channel_mut(local_id)?;
        let remote_id = match channel.remote_id() {
            Some(id) => id,
            // Not confirmed yet: CLOSE goes out when the answer arrives.
            None => {
                channel.mark_close_sent();
                return Ok(());
            }
        };
        if channel.mark_close_sent() {
            self.outbound.push_back(ChannelClose::new(remote_id).to_bytes());
        }
        self.release_if_done(local_id);
        Ok(())
    }

    /// Records that the consumer processed `len` bytes delivered on a
    /// channel, sending WINDOW_ADJUST once the refill threshold is crossed.
    /// Unknown channels are ignored: the data may have raced a close.
    pub fn consume(&mut self, local_id: u32, len: usize) {
        let Some(channel) = self.channels.get_mut(&local_id) else {
            return;
        };
        if let (Some(adjust), Some(remote_id)) = (channel.consume(len), channel.remote_id()) {
            let window = channel.local_window();
            if !channel.close_sent() {
                self.outbound
                    .push_back(ChannelWindowAdjust::new(remote_id, adjust).to_bytes());
                logging::log_window_adjust(local_id, "in", adjust, window);
            }
        }
    }

    /// Forgets every channel, as when the connection is torn down. Returns
    /// the ids that were still in the table.
    pub fn teardown(&mut self) -> Vec<u32> {
        let ids: Vec<u32> = self.channels.keys().copied().collect();
        for id in &ids {
            logging::log_channel_closed(*id, "connection closed");
        }
        self.channels.clear();
        ids
    }

    /// Processes one connection protocol payload (message types 80..=100).
    pub fn handle(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let message = ConnectionMessage::parse(payload)?;
        if let Some(local_id) = message.recipient_channel() {
            if !self.channels.contains_key(&local_id) {
                return Err(KestrelError::Protocol(format!(
                    "message for unknown channel {}",
                    local_id
                )));
            }
        }

        match message {
            ConnectionMessage::GlobalRequest(request) => {
                self.events.push_back(MuxEvent::GlobalRequest(request));
            }
            ConnectionMessage::RequestSuccess(data) => {
                self.events.push_back(MuxEvent::GlobalReply { success: true, data });
            }
            ConnectionMessage::RequestFailure => {
                self.events.push_back(MuxEvent::GlobalReply {
                    success: false,
                    data: Vec::new(),
                });
            }
            ConnectionMessage::Open(open) => {
                self.events.push_back(MuxEvent::OpenRequested {
                    sender_channel: open.sender_channel(),
                    initial_window: open.initial_window_size(),
                    max_packet: open.maximum_packet_size(),
                    channel_type: open.channel_type().clone(),
                });
            }
            ConnectionMessage::OpenConfirmation(confirm) => self.on_open_confirmation(confirm)?,
            ConnectionMessage::OpenFailure(failure) => {
                let local_id = failure.recipient_channel();
                if self.channels.get(&local_id).and_then(Channel::remote_id).is_some() {
                    return Err(KestrelError::Protocol(format!(
                        "open failure for established channel {}",
                        local_id
                    )));
                }
                self.channels.remove(&local_id);
                logging::log_channel_open_failed(local_id, failure.reason_code(), failure.description());
                self.events.push_back(MuxEvent::OpenFailed { local_id, failure });
            }
            ConnectionMessage::WindowAdjust(adjust) => {
                let local_id = adjust.recipient_channel();
                let result = self
                    .open_channel_mut(local_id)
                    .and_then(|ch| ch.on_window_adjust(adjust.bytes_to_add()).map(|_| ch.remote_window()));
                match result {
                    Ok(window) => {
                        logging::log_window_adjust(local_id, "out", adjust.bytes_to_add(), window);
                        self.events.push_back(MuxEvent::WindowAvailable { local_id });
                    }
                    Err(err) => self.fail_channel(local_id, err.to_string()),
                }
            }
            ConnectionMessage::Data(data) => {
                let local_id = data.recipient_channel();
                if self.account_inbound(local_id, data.data().len()) {
                    self.events.push_back(MuxEvent::Data {
                        local_id,
                        data: data.into_data(),
                    });
                }
            }
            ConnectionMessage::ExtendedData(data) => {
                let local_id = data.recipient_channel();
                if self.account_inbound(local_id, data.data().len()) {
                    self.events.push_back(MuxEvent::ExtendedData {
                        local_id,
                        code: data.data_type_code(),
                        data: data.data().to_vec(),
                    });
                }
            }
            ConnectionMessage::Eof(eof) => {
                let local_id = eof.recipient_channel();
                self.open_channel_mut(local_id)?.mark_eof_received();
                self.events.push_back(MuxEvent::Eof { local_id });
                self.maybe_close(local_id);
            }
            ConnectionMessage::Close(close) => {
                let local_id = close.recipient_channel();
                let channel = self.open_channel_mut(local_id)?;
                channel.mark_close_received();
                if let Some(remote_id) = channel.remote_id() {
                    if channel.mark_close_sent() {
                        self.outbound.push_back(ChannelClose::new(remote_id).to_bytes());
                    }
                }
                self.release_if_done(local_id);
            }
            ConnectionMessage::Request(request) => {
                let local_id = request.recipient_channel();
                self.events.push_back(MuxEvent::Request { local_id, request });
            }
            ConnectionMessage::Success(msg) => {
                self.events.push_back(MuxEvent::RequestReply {
                    local_id: msg.recipient_channel(),
                    success: true,
                });
            }
            ConnectionMessage::Failure(msg) => {
                self.events.push_back(MuxEvent::RequestReply {
                    local_id: msg.recipient_channel(),
                    success: false,
                });
            }
        }
        Ok(())
    }

    fn on_open_confirmation(&mut self, confirm: ChannelOpenConfirmation) -> KestrelResult<()> {
        let local_id = confirm.recipient_channel();
        let channel = self.open_channel_mut(local_id)?;
        if channel.remote_id().is_some() {
            return Err(KestrelError::Protocol(format!(
                "duplicate confirmation for channel {}",
                local_id
            )));
        }
        channel.confirm(
            confirm.sender_channel(),
            confirm.initial_window_size(),
            confirm.maximum_packet_size(),
        );
        logging::log_channel_open(local_id, confirm.sender_channel(), channel.channel_type());

        // close() was called while the open was pending
        if channel.close_sent() {
            self.outbound
                .push_back(ChannelClose::new(confirm.sender_channel()).to_bytes());
            return Ok(());
        }
        self.events.push_back(MuxEvent::OpenConfirmed { local_id });
        Ok(())
    }

    /// Charges inbound data to the local window. Returns whether the data
    /// should be delivered.
    fn account_inbound(&mut self, local_id: u32, len: usize) -> bool {
        let Some(channel) = self.channels.get_mut(&local_id) else {
            return false;
        };
        if channel.close_sent() {
            // Draining after our CLOSE; the data is dropped.
            return false;
        }
        match channel.on_data(len) {
            Ok(()) => true,
            Err(err) => {
                self.fail_channel(local_id, err.to_string());
                false
            }
        }
    }

    fn fail_channel(&mut self, local_id: u32, reason: String) {
        warn!(local_id, reason = %reason, "Closing channel after flow control violation");
        self.events.push_back(MuxEvent::Failed { local_id, reason });
        let _ = self.close(local_id);
    }

    fn maybe_close(&mut self, local_id: u32) {
        let should = self
            .channels
            .get(&local_id)
            .map_or(false, Channel::should_close);
        if should {
            let _ = self.close(local_id);
        }
    }

    fn release_if_done(&mut self, local_id: u32) {
        if self.channels.get(&local_id).map_or(false, Channel::is_released) {
            self.channels.remove(&local_id);
            logging::log_channel_closed(local_id, "closed");
            self.events.push_back(MuxEvent::Closed { local_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ChannelConfig {
        ChannelConfig::default()
            .with_initial_window(1000)
            .with_max_packet(400)
    }

    /// Moves every outbound payload of `from` into `to`.
    fn deliver(from: &mut Multiplexer, to: &mut Multiplexer) {
        for payload in from.take_outbound() {
            to.handle(&payload).unwrap();
        }
    }

    fn events(mux: &mut Multiplexer) -> Vec<MuxEvent> {
        std::iter::from_fn(|| mux.poll_event()).collect()
    }

    /// Opens a session channel from `a` to `b`; returns (a's id, b's id).
    fn open_pair(a: &mut Multiplexer, b: &mut Multiplexer) -> (u32, u32) {
        let local = a.open_channel(ChannelType::Session).unwrap();
        deliver(a, b);
        let remote = match events(b).pop() {
            Some(MuxEvent::OpenRequested {
                sender_channel,
                channel_type,
                initial_window,
                max_packet,
            }) => b
                .accept_open(sender_channel, &channel_type, initial_window, max_packet)
                .unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        deliver(b, a);
        assert_eq!(events(a), vec![MuxEvent::OpenConfirmed { local_id: local }]);
        (local, remote)
    }

    #[test]
    fn test_open_and_data() {
        let mut a = Multiplexer::new(small());
        let mut b = Multiplexer::new(small());
        let (la, lb) = open_pair(&mut a, &mut b);

        assert_eq!(a.send_data(la, b"hello", None).unwrap(), 5);
        deliver(&mut a, &mut b);
        assert_eq!(
            events(&mut b),
            vec![MuxEvent::Data {
                local_id: lb,
                data: b"hello".to_vec()
            }]
        );
    }

    #[test]
    fn test_open_rejected() {
        let mut a = Multiplexer::new(small());
        let mut b = Multiplexer::new(small());
        let la = a
            .open_channel(ChannelType::Other {
                name: "x11".into(),
                data: vec![],
            })
            .unwrap();
        deliver(&mut a, &mut b);
        if let Some(MuxEvent::OpenRequested { sender_channel, .. }) = b.poll_event() {
            b.reject_open(sender_channel, ChannelOpenFailureReason::UnknownChannelType, "no x11");
        }
        deliver(&mut b, &mut a);
        match a.poll_event() {
            Some(MuxEvent::OpenFailed { local_id, failure }) => {
                assert_eq!(local_id, la);
                assert_eq!(failure.reason(), Some(ChannelOpenFailureReason::UnknownChannelType));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.channel_count(), 0);
    }

    #[test]
    fn test_fragmentation_and_window_exhaustion() {
        let mut a = Multiplexer::new(small());
        let mut b = Multiplexer::new(small().with_refill_threshold(1000));
        let (la, lb) = open_pair(&mut a, &mut b);

        let data = vec![7u8; 1500];
        // window 1000, packet 400
        assert_eq!(a.send_data(la, &data, None).unwrap(), 1000);
        let sent = a.take_outbound();
        assert_eq!(sent.len(), 3);
        for payload in &sent {
            b.handle(payload).unwrap();
        }
        assert_eq!(a.send_data(la, &data[1000..], None).unwrap(), 0);

        let received: usize = events(&mut b)
            .into_iter()
            .map(|e| match e {
                MuxEvent::Data { local_id, data } if local_id == lb => data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(received, 1000);

        // Nothing is refilled until the consumer catches up.
        assert!(b.take_outbound().is_empty());
        b.consume(lb, 600);
        assert!(b.take_outbound().is_empty());
        b.consume(lb, 400);
        deliver(&mut b, &mut a);
        let evs = events(&mut a);
        assert!(evs.contains(&MuxEvent::WindowAvailable { local_id: la }));
        assert_eq!(a.send_data(la, &data[1000..], None).unwrap(), 500);
    }

    #[test]
    fn test_window_violation_closes_channel() {
        let mut a = Multiplexer::new(small());
        let mut b = Multiplexer::new(small());
        let (la, lb) = open_pair(&mut a, &mut b);

        // Oversized payload ignoring b's max packet of 400.
        let bogus = ChannelData::new(lb, vec![0; 401]).to_bytes();
        b.handle(&bogus).unwrap();
        let evs = events(&mut b);
        assert!(matches!(evs[0], MuxEvent::Failed { local_id, .. } if local_id == lb));
        assert_eq!(evs.len(), 1);

        // The CLOSE reaches a, which answers and releases its side.
        deliver(&mut b, &mut a);
        assert_eq!(events(&mut a), vec![MuxEvent::Closed { local_id: la }]);
        deliver(&mut a, &mut b);
        assert_eq!(events(&mut b), vec![MuxEvent::Closed { local_id: lb }]);
    }

    #[test]
    fn test_eof_both_ways_closes() {
        let mut a = Multiplexer::new(small());
        let mut b = Multiplexer::new(small());
        let (la, lb) = open_pair(&mut a, &mut b);

        a.send_eof(la).unwrap();
        deliver(&mut a, &mut b);
        assert_eq!(events(&mut b), vec![MuxEvent::Eof { local_id: lb }]);
        assert!(a.send_data(la, b"late", None).is_err());

        // b may still send after a's EOF.
        assert_eq!(b.send_data(lb, b"reply", None).unwrap(), 5);
        b.send_eof(lb).unwrap();
        // b saw both EOFs and sent CLOSE right behind its EOF.
        deliver(&mut b, &mut a);
        let evs = events(&mut a);
        assert!(evs.contains(&MuxEvent::Eof { local_id: la }));
        assert_eq!(evs.last(), Some(&MuxEvent::Closed { local_id: la }));

        deliver(&mut a, &mut b);
        assert_eq!(events(&mut b), vec![MuxEvent::Closed { local_id: lb }]);
        assert_eq!(a.channel_count(), 0);
        assert_eq!(b.channel_count(), 0);
    }

    #[test]
    fn test_explicit_close_released_after_peer_close() {
        let mut a = Multiplexer::new(small());
        let mut b = Multiplexer::new(small());
        let (la, lb) = open_pair(&mut a, &mut b);

        a.close(la).unwrap();
        assert_eq!(a.channel_count(), 1);
        deliver(&mut a, &mut b);
        assert_eq!(events(&mut b), vec![MuxEvent::Closed { local_id: lb }]);
        deliver(&mut b, &mut a);
        assert_eq!(events(&mut a), vec![MuxEvent::Closed { local_id: la }]);
    }

    #[test]
    fn test_requests_and_replies() {
        let mut a = Multiplexer::new(small());
        let mut b = Multiplexer::new(small());
        let (la, lb) = open_pair(&mut a, &mut b);

        a.send_request(
            la,
            ChannelRequestType::Subsystem {
                name: "sftp".into(),
            },
            true,
        )
        .unwrap();
        deliver(&mut a, &mut b);
        match b.poll_event() {
            Some(MuxEvent::Request { local_id, request }) => {
                assert_eq!(local_id, lb);
                assert!(request.want_reply());
                b.reply_request(lb, true).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }
        deliver(&mut b, &mut a);
        assert_eq!(
            events(&mut a),
            vec![MuxEvent::RequestReply {
                local_id: la,
                success: true
            }]
        );
    }

    #[test]
    fn test_global_request_failure_reply() {
        let mut a = Multiplexer::new(small());
        let mut b = Multiplexer::new(small());
        a.send_global(GlobalRequest::new("keepalive@openssh.com", true, vec![]));
        deliver(&mut a, &mut b);
        match b.poll_event() {
            Some(MuxEvent::GlobalRequest(req)) if req.want_reply() => b.reply_global(false, &[]),
            other => panic!("unexpected {:?}", other),
        }
        deliver(&mut b, &mut a);
        assert_eq!(
            events(&mut a),
            vec![MuxEvent::GlobalReply {
                success: false,
                data: vec![]
            }]
        );
    }

    #[test]
    fn test_unknown_channel_is_connection_error() {
        let mut a = Multiplexer::new(small());
        assert!(a.handle(&ChannelData::new(42, vec![1]).to_bytes()).is_err());
    }

    #[test]
    fn test_max_channels() {
        let mut a = Multiplexer::with_max_channels(small(), 1);
        a.open_channel(ChannelType::Session).unwrap();
        assert!(matches!(
            a.open_channel(ChannelType::Session),
            Err(KestrelError::ChannelOpenFailure { reason: 4, .. })
        ));
    }

    #[test]
    fn test_teardown() {
        let mut a = Multiplexer::new(small());
        let mut b = Multiplexer::new(small());
        let (la, _) = open_pair(&mut a, &mut b);
        assert_eq!(a.teardown(), vec![la]);
        assert!(matches!(a.send_data(la, b"x", None), Err(KestrelError::ChannelClosed)));
    }
}
