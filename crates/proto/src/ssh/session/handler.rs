//! Channel behaviour behind one capability trait.
//!
//! A channel the peer opens is served by a [`ChannelHandler`] chosen by the
//! [`ChannelOpener`] registered for its type. Session/SFTP, direct-tcpip and
//! custom channel kinds are all just different handlers; EOF, CLOSE and
//! window bookkeeping stay in the multiplexer.
//!
//! Each accepted channel gets its own task that feeds events to the handler
//! one at a time, so requests on a channel are answered in order. Every
//! callback runs under a permit of the connection's worker semaphore.

use super::handle::{ChannelEvent, ChannelEvents, ChannelHandle, ConnectionHandle};
use crate::ssh::connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType};
use async_trait::async_trait;
use kestrel_platform::KestrelResult;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Serves one channel.
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    /// Answers a channel request; `true` means CHANNEL_SUCCESS.
    async fn on_request(&self, _channel: &ChannelHandle, _request: &ChannelRequestType) -> bool {
        false
    }

    /// Handles channel data. An error closes the channel.
    async fn on_data(&self, channel: &ChannelHandle, data: Vec<u8>) -> KestrelResult<()>;

    /// Handles extended data. Ignored by default.
    async fn on_extended_data(
        &self,
        _channel: &ChannelHandle,
        _code: u32,
        _data: Vec<u8>,
    ) -> KestrelResult<()> {
        Ok(())
    }

    /// The peer sent EOF. By default EOF is returned so the channel closes.
    async fn on_eof(&self, channel: &ChannelHandle) -> KestrelResult<()> {
        channel.eof().await
    }

    /// The channel was released.
    async fn on_close(&self, _channel: &ChannelHandle) {}
}

/// Why an inbound open was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRejection {
    /// RFC 4254 reason
    pub reason: ChannelOpenFailureReason,
    /// Text sent to the peer
    pub description: String,
}

impl OpenRejection {
    /// Creates a rejection.
    pub fn new(reason: ChannelOpenFailureReason, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
        }
    }
}

/// Decides whether to accept an inbound channel and who serves it.
pub trait ChannelOpener: Send + Sync {
    /// Returns the handler for an accepted channel, or a rejection.
    fn open(
        &self,
        channel_type: &ChannelType,
        connection: &ConnectionHandle,
    ) -> Result<Arc<dyn ChannelHandler>, OpenRejection>;
}

impl<F> ChannelOpener for F
where
    F: Fn(&ChannelType, &ConnectionHandle) -> Result<Arc<dyn ChannelHandler>, OpenRejection>
        + Send
        + Sync,
{
    fn open(
        &self,
        channel_type: &ChannelType,
        connection: &ConnectionHandle,
    ) -> Result<Arc<dyn ChannelHandler>, OpenRejection> {
        self(channel_type, connection)
    }
}

/// Feeds one channel's events to its handler until the channel is released.
pub(crate) async fn drive_handler(
    handler: Arc<dyn ChannelHandler>,
    channel: ChannelHandle,
    mut events: ChannelEvents,
    workers: Arc<Semaphore>,
) {
    let local_id = channel.id();
    while let Some(event) = events.recv_unconsumed().await {
        let Ok(_permit) = workers.acquire().await else {
            break;
        };
        let result = match event {
            ChannelEvent::Data(data) => {
                let len = data.len();
                let result = handler.on_data(&channel, data).await;
                events.consumed(len).await;
                result
            }
            ChannelEvent::ExtendedData { code, data } => {
                let len = data.len();
                let result = handler.on_extended_data(&channel, code, data).await;
                events.consumed(len).await;
                result
            }
            ChannelEvent::Eof => handler.on_eof(&channel).await,
            ChannelEvent::Request {
                request,
                want_reply,
            } => {
                let success = handler.on_request(&channel, &request).await;
                if want_reply {
                    channel.reply_request(success).await
                } else {
                    Ok(())
                }
            }
            ChannelEvent::Closed => {
                handler.on_close(&channel).await;
                break;
            }
        };
        if let Err(err) = result {
            warn!(local_id, error = %err, "Channel handler failed; closing channel");
            let _ = channel.close().await;
        }
    }
    debug!(local_id, "Channel handler finished");
}
