//! Per-channel state and flow control (RFC 4254 Section 5).
//!
//! A [`Channel`] is pure bookkeeping: identifiers, both windows, both
//! maximum packet sizes and the EOF/CLOSE flags. It never touches the wire;
//! [`super::mux::Multiplexer`] turns its answers into messages.
//!
//! Window rules enforced here:
//! - the remote window never goes negative: [`Channel::take_send_credit`]
//!   hands out at most `min(remote window, remote max packet)` bytes
//! - inbound data beyond the local window or local max packet is a
//!   protocol violation
//! - a WINDOW_ADJUST that would overflow `u32` is a protocol violation

use kestrel_platform::{KestrelError, KestrelResult};

/// Flow control settings for channels opened or accepted locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Window advertised to the peer
    pub initial_window: u32,
    /// Largest data payload the peer may send in one message
    pub max_packet: u32,
    /// Consumed bytes after which a WINDOW_ADJUST restores the window
    pub window_refill_threshold: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let initial_window = 2 * 1024 * 1024;
        Self {
            initial_window,
            max_packet: 32 * 1024,
            window_refill_threshold: initial_window / 2,
        }
    }
}

impl ChannelConfig {
    /// Sets the initial window, keeping the refill threshold at half of it.
    pub fn with_initial_window(mut self, window: u32) -> Self {
        self.initial_window = window;
        self.window_refill_threshold = window / 2;
        self
    }

    /// Sets the maximum packet size.
    pub fn with_max_packet(mut self, max_packet: u32) -> Self {
        self.max_packet = max_packet;
        self
    }

    /// Sets the refill threshold in bytes.
    pub fn with_refill_threshold(mut self, threshold: u32) -> Self {
        self.window_refill_threshold = threshold;
        self
    }

    /// Checks the settings are usable.
    pub fn validate(&self) -> KestrelResult<()> {
        if self.max_packet == 0 || self.max_packet > super::connection::MAX_PACKET_SIZE {
            return Err(KestrelError::Config(format!(
                "max_packet must be in 1..={}",
                super::connection::MAX_PACKET_SIZE
            )));
        }
        if self.initial_window < self.max_packet {
            return Err(KestrelError::Config(
                "initial_window must be at least max_packet".to_string(),
            ));
        }
        if self.window_refill_threshold == 0 || self.window_refill_threshold > self.initial_window {
            return Err(KestrelError::Config(
                "window_refill_threshold must be in 1..=initial_window".to_string(),
            ));
        }
        Ok(())
    }
}

/// Channel lifecycle as observed from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, no answer yet
    Opening,
    /// Open in both directions
    Open,
    /// We sent EOF; the peer may still send data
    EofSent,
    /// The peer sent EOF; we may still send data
    EofReceived,
    /// CLOSE sent or received, not both
    Closing,
    /// CLOSE sent and received
    Closed,
}

/// One logical channel.
#[derive(Debug, Clone)]
pub struct Channel {
    local_id: u32,
    remote_id: Option<u32>,
    channel_type: String,

    local_window: u32,
    local_max_packet: u32,
    initial_window: u32,
    refill_threshold: u32,
    unacknowledged: u32,

    remote_window: u32,
    remote_max_packet: u32,

    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,
}

impl Channel {
    /// A channel we asked the peer to open.
    pub fn outbound(local_id: u32, channel_type: &str, config: &ChannelConfig) -> Self {
        Self {
            local_id,
            remote_id: None,
            channel_type: channel_type.to_string(),
            local_window: config.initial_window,
            local_max_packet: config.max_packet,
            initial_window: config.initial_window,
            refill_threshold: config.window_refill_threshold,
            unacknowledged: 0,
            remote_window: 0,
            remote_max_packet: 0,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
        }
    }

    /// A channel the peer opened and we accepted.
    pub fn inbound(
        local_id: u32,
        remote_id: u32,
        channel_type: &str,
        remote_window: u32,
        remote_max_packet: u32,
        config: &ChannelConfig,
    ) -> Self {
        let mut channel = Self::outbound(local_id, channel_type, config);
        channel.confirm(remote_id, remote_window, remote_max_packet);
        channel
    }

    /// Records the peer's confirmation.
    pub fn confirm(&mut self, remote_id: u32, remote_window: u32, remote_max_packet: u32) {
        self.remote_id = Some(remote_id);
        self.remote_window = remote_window;
        self.remote_max_packet = remote_max_packet;
    }

    /// Local channel number.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Peer channel number, once confirmed.
    pub fn remote_id(&self) -> Option<u32> {
        self.remote_id
    }

    /// Channel type name.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Bytes the peer may still send us.
    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    /// Bytes we may still send the peer.
    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    /// Largest payload the peer accepts.
    pub fn remote_max_packet(&self) -> u32 {
        self.remote_max_packet
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        match (self.close_sent, self.close_received) {
            (true, true) => return ChannelState::Closed,
            (true, false) | (false, true) => return ChannelState::Closing,
            _ => {}
        }
        if self.remote_id.is_none() {
            return ChannelState::Opening;
        }
        match (self.eof_sent, self.eof_received) {
            (true, true) => ChannelState::Closing,
            (true, false) => ChannelState::EofSent,
            (false, true) => ChannelState::EofReceived,
            (false, false) => ChannelState::Open,
        }
    }

    /// Whether we may still send data.
    pub fn can_send(&self) -> bool {
        self.remote_id.is_some() && !self.eof_sent && !self.close_sent && !self.close_received
    }

    /// Reserves up to `wanted` bytes of send credit, bounded by the remote
    /// window and the remote maximum packet. Returns the granted amount,
    /// which is zero when the window is exhausted.
    pub fn take_send_credit(&mut self, wanted: usize) -> usize {
        let limit = self.remote_window.min(self.remote_max_packet) as usize;
        let granted = wanted.min(limit);
        // granted <= remote_window, so this cannot underflow
        self.remote_window -= granted as u32;
        granted
    }

    /// Applies a WINDOW_ADJUST from the peer.
    pub fn on_window_adjust(&mut self, bytes: u32) -> KestrelResult<()> {
        self.remote_window = self.remote_window.checked_add(bytes).ok_or_else(|| {
            KestrelError::Protocol(format!(
                "window adjust of {} overflows channel {} window",
                bytes, self.local_id
            ))
        })?;
        Ok(())
    }

    /// Charges `len` inbound data bytes against the local window.
    pub fn on_data(&mut self, len: usize) -> KestrelResult<()> {
        if self.eof_received || self.close_received {
            return Err(KestrelError::Protocol(format!(
                "data on channel {} after EOF",
                self.local_id
            )));
        }
        if len > self.local_max_packet as usize {
            return Err(KestrelError::Protocol(format!(
                "data of {} bytes exceeds channel {} max packet {}",
                len, self.local_id, self.local_max_packet
            )));
        }
        if len > self.local_window as usize {
            return Err(KestrelError::Protocol(format!(
                "data of {} bytes exceeds channel {} window {}",
                len, self.local_id, self.local_window
            )));
        }
        self.local_window -= len as u32;
        Ok(())
    }

    /// Records that the consumer processed `len` delivered bytes. Returns
    /// the WINDOW_ADJUST amount once the refill threshold is crossed.
    pub fn consume(&mut self, len: usize) -> Option<u32> {
        let outstanding = self.initial_window - self.local_window - self.unacknowledged;
        self.unacknowledged += len.min(outstanding as usize) as u32;
        if self.unacknowledged < self.refill_threshold {
            return None;
        }
        let adjust = std::mem::take(&mut self.unacknowledged);
        self.local_window += adjust;
        Some(adjust)
    }

    /// Marks EOF as sent. Returns false when it already was.
    pub fn mark_eof_sent(&mut self) -> bool {
        !std::mem::replace(&mut self.eof_sent, true)
    }

    /// Marks EOF as received.
    pub fn mark_eof_received(&mut self) {
        self.eof_received = true;
    }

    /// Marks CLOSE as sent. Returns false when it already was.
    pub fn mark_close_sent(&mut self) -> bool {
        !std::mem::replace(&mut self.close_sent, true)
    }

    /// Marks CLOSE as received.
    pub fn mark_close_received(&mut self) {
        self.close_received = true;
    }

    /// Whether we already sent (or scheduled) CLOSE.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Both EOFs seen and CLOSE not sent yet.
    pub fn should_close(&self) -> bool {
        self.eof_sent && self.eof_received && !self.close_sent
    }

    /// Whether CLOSE went both ways and the entry may be released.
    pub fn is_released(&self) -> bool {
        self.close_sent && self.close_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small_config() -> ChannelConfig {
        ChannelConfig::default()
            .with_initial_window(1000)
            .with_max_packet(300)
    }

    #[test]
    fn test_config_validation() {
        assert!(ChannelConfig::default().validate().is_ok());
        assert!(small_config().validate().is_ok());
        assert!(ChannelConfig::default().with_max_packet(0).validate().is_err());
        assert!(ChannelConfig::default()
            .with_initial_window(100)
            .with_max_packet(200)
            .validate()
            .is_err());
        assert!(small_config().with_refill_threshold(2000).validate().is_err());
    }

    #[test]
    fn test_lifecycle_states() {
        let mut ch = Channel::outbound(0, "session", &small_config());
        assert_eq!(ch.state(), ChannelState::Opening);
        assert!(!ch.can_send());
        ch.confirm(7, 500, 100);
        assert_eq!(ch.state(), ChannelState::Open);
        assert!(ch.mark_eof_sent());
        assert!(!ch.mark_eof_sent());
        assert_eq!(ch.state(), ChannelState::EofSent);
        assert!(!ch.can_send());
        ch.mark_eof_received();
        assert!(ch.should_close());
        assert!(ch.mark_close_sent());
        assert_eq!(ch.state(), ChannelState::Closing);
        assert!(!ch.is_released());
        ch.mark_close_received();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(ch.is_released());
    }

    #[test]
    fn test_send_credit_bounded_by_packet_and_window() {
        let mut ch = Channel::inbound(1, 2, "session", 250, 100, &small_config());
        assert_eq!(ch.take_send_credit(1000), 100);
        assert_eq!(ch.take_send_credit(1000), 100);
        assert_eq!(ch.take_send_credit(1000), 50);
        assert_eq!(ch.take_send_credit(1000), 0);
        ch.on_window_adjust(30).unwrap();
        assert_eq!(ch.take_send_credit(1000), 30);
    }

    #[test]
    fn test_window_adjust_overflow() {
        let mut ch = Channel::inbound(1, 2, "session", u32::MAX - 10, 100, &small_config());
        assert!(ch.on_window_adjust(10).is_ok());
        assert!(matches!(ch.on_window_adjust(1), Err(KestrelError::Protocol(_))));
    }

    #[test]
    fn test_inbound_data_refill_on_consumption() {
        let mut ch = Channel::inbound(1, 2, "session", 0, 0, &small_config());
        ch.on_data(300).unwrap();
        ch.on_data(250).unwrap();
        assert_eq!(ch.local_window(), 450);
        // Delivered but not yet consumed: no credit.
        assert_eq!(ch.consume(300), None);
        assert_eq!(ch.consume(250), Some(550));
        assert_eq!(ch.local_window(), 1000);
        // Cannot consume more than was received.
        assert_eq!(ch.consume(10_000), None);
        assert_eq!(ch.local_window(), 1000);
    }

    #[test]
    fn test_inbound_data_violations() {
        let mut ch = Channel::inbound(1, 2, "session", 0, 0, &small_config().with_refill_threshold(1000));
        assert!(ch.on_data(301).is_err());
        for _ in 0..3 {
            ch.on_data(300).unwrap();
        }
        // 100 bytes left in the window
        assert!(ch.on_data(101).is_err());
        ch.on_data(100).unwrap();
        ch.mark_eof_received();
        assert!(ch.on_data(0).is_err());
    }

    proptest! {
        #[test]
        fn prop_remote_window_never_exceeded(
            initial in 0u32..10_000,
            max_packet in 1u32..4096,
            ops in proptest::collection::vec((any::<bool>(), 0u32..5000), 1..64),
        ) {
            let mut ch = Channel::inbound(0, 0, "session", initial, max_packet, &ChannelConfig::default());
            let mut credit = initial as u64;
            let mut sent = 0u64;
            for (is_send, amount) in ops {
                if is_send {
                    let granted = ch.take_send_credit(amount as usize) as u64;
                    prop_assert!(granted <= max_packet as u64);
                    sent += granted;
                } else if ch.on_window_adjust(amount).is_ok() {
                    credit += amount as u64;
                }
                prop_assert!(sent <= credit);
                prop_assert_eq!(ch.remote_window() as u64, credit - sent);
            }
        }
    }
}
