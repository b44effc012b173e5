//! Keepalive heartbeat.
//!
//! A background task that calls a send function every `interval`. Sessions
//! use it to emit SSH_MSG_IGNORE so idle NAT mappings and the peer's idle
//! supervision see traffic. The first failure ends the task.

use kestrel_platform::KestrelResult;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Random bytes carried by each keepalive SSH_MSG_IGNORE.
pub const KEEPALIVE_PAYLOAD: usize = 16;

/// Periodic keepalive task. Stopped on drop.
#[derive(Debug)]
pub struct KeepaliveTask {
    interval: Duration,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl KeepaliveTask {
    /// Creates a task that is not running yet.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop: None,
            task: None,
        }
    }

    /// Heartbeat interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts calling `send` every interval. Restarts if already running.
    pub fn start<F, Fut>(&mut self, send: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = KestrelResult<()>> + Send + 'static,
    {
        self.stop();
        let interval = self.interval;
        let (stop_tx, mut stop_rx) = oneshot::channel();

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(err) = send().await {
                            warn!(error = %err, "Keepalive failed; stopping");
                            break;
                        }
                        debug!("Keepalive sent");
                    }
                }
            }
        }));
        self.stop = Some(stop_tx);
    }

    /// Stops the task.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_platform::KestrelError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_not_running_until_started() {
        let task = KeepaliveTask::new(Duration::from_secs(60));
        assert!(!task.is_running());
        assert_eq!(task.interval(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_every_interval() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let mut task = KeepaliveTask::new(Duration::from_secs(10));
        task.start(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        task.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_error() {
        let mut task = KeepaliveTask::new(Duration::from_secs(1));
        task.start(|| async { Err(KestrelError::ConnectionClosed("gone".to_string())) });
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(!task.is_running());
    }
}
