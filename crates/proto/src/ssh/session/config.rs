//! Session configuration.

use crate::ssh::channel::ChannelConfig;
use crate::ssh::mux::DEFAULT_MAX_CHANNELS;
use crate::ssh::transport::TransportConfig;
use kestrel_platform::{KestrelError, KestrelResult};
use std::time::Duration;

/// Everything one connection needs beyond its stream and credentials.
///
/// # Example
///
/// ```rust
/// use kestrel_proto::ssh::session::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig::default()
///     .with_workers(4)
///     .with_keepalive_interval(Some(Duration::from_secs(30)));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Transport settings
    pub transport: TransportConfig,
    /// Flow control for locally opened and accepted channels
    pub channel: ChannelConfig,
    /// Channels allowed at once
    pub max_channels: usize,
    /// Concurrent channel handler callbacks per connection
    pub workers: usize,
    /// Depth of the command queue feeding the connection task
    pub command_queue: usize,
    /// Failed authentication requests tolerated before disconnecting
    pub max_auth_attempts: u32,
    /// Interval for SSH_MSG_IGNORE keepalives, if any
    pub keepalive_interval: Option<Duration>,
    /// How often the connection task checks the time based re-key limit
    pub rekey_check_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            channel: ChannelConfig::default(),
            max_channels: DEFAULT_MAX_CHANNELS,
            workers: 16,
            command_queue: 256,
            max_auth_attempts: 6,
            keepalive_interval: None,
            rekey_check_interval: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Sets the transport configuration.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the channel configuration.
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Sets the channel limit.
    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels = max;
        self
    }

    /// Sets the handler worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the command queue depth.
    pub fn with_command_queue(mut self, depth: usize) -> Self {
        self.command_queue = depth;
        self
    }

    /// Sets the authentication attempt limit.
    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.max_auth_attempts = attempts;
        self
    }

    /// Enables or disables periodic keepalives.
    pub fn with_keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> KestrelResult<()> {
        self.transport.validate()?;
        self.channel.validate()?;
        // Data payload plus channel header, padding and MAC must fit a packet.
        if self.channel.max_packet as usize + 64 > self.transport.max_packet_size {
            return Err(KestrelError::Config(format!(
                "channel max_packet {} does not fit transport max_packet_size {}",
                self.channel.max_packet, self.transport.max_packet_size
            )));
        }
        if self.workers == 0 {
            return Err(KestrelError::Config("workers must be > 0".to_string()));
        }
        if self.command_queue == 0 {
            return Err(KestrelError::Config("command_queue must be > 0".to_string()));
        }
        if self.max_channels == 0 {
            return Err(KestrelError::Config("max_channels must be > 0".to_string()));
        }
        if self.rekey_check_interval.is_zero() {
            return Err(KestrelError::Config(
                "rekey_check_interval must be > 0".to_string(),
            ));
        }
        if matches!(self.keepalive_interval, Some(d) if d.is_zero()) {
            return Err(KestrelError::Config(
                "keepalive_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        assert!(SessionConfig::default().with_workers(0).validate().is_err());
        assert!(SessionConfig::default().with_command_queue(0).validate().is_err());
        assert!(SessionConfig::default().with_max_channels(0).validate().is_err());
        assert!(SessionConfig::default()
            .with_keepalive_interval(Some(Duration::ZERO))
            .validate()
            .is_err());
        assert!(SessionConfig::default()
            .with_channel(ChannelConfig::default().with_max_packet(0))
            .validate()
            .is_err());
    }
}
