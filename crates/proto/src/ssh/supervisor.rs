//! Idle connection supervision.
//!
//! [`IdleSupervisor`] keeps a last-activity instant per registered
//! [`IdleListener`]. A sweep ([`IdleSupervisor::service`]) calls
//! [`IdleListener::idle`] on every listener that has been quiet for
//! `service_period × inactive_periods_per_idle`; a listener that returns
//! `true` is deregistered.
//!
//! The supervisor does not schedule itself. [`SupervisorTask`] polls
//! [`IdleSupervisor::is_ready`] on a tokio interval, and
//! [`IdleSupervisor::watch_connection`] wires a live
//! [`ConnectionHandle`]: inbound traffic resets the listener, idleness first
//! sends SSH_MSG_IGNORE and, after a configured number of further idle
//! sweeps, disconnects.
//!
//! Listener callbacks run without any supervisor lock held, so they may call
//! back into the supervisor. Removals requested while a sweep is running
//! are applied when the sweep ends.
//!
//! # Example
//!
//! ```rust
//! use kestrel_platform::ManualClock;
//! use kestrel_proto::ssh::supervisor::{IdleListener, IdleSupervisor};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Expire;
//! impl IdleListener for Expire {
//!     fn idle(&self) -> bool {
//!         true
//!     }
//! }
//!
//! let clock = Arc::new(ManualClock::new());
//! let supervisor = IdleSupervisor::new(Duration::from_secs(1), 3, clock.clone());
//! supervisor.register(Arc::new(Expire));
//!
//! clock.advance(Duration::from_secs(3));
//! supervisor.service();
//! assert_eq!(supervisor.len(), 0);
//! ```

use super::logging;
use super::message::DisconnectReason;
use super::session::{ConnectionHandle, KEEPALIVE_PAYLOAD};
use dashmap::DashMap;
use kestrel_platform::{system_clock, Clock, KestrelError, KestrelResult};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Identifies a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Something that wants to hear about inactivity.
pub trait IdleListener: Send + Sync {
    /// Called during a sweep once the listener has been quiet long enough.
    /// Returning `true` deregisters it.
    fn idle(&self) -> bool;
}

/// Supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Time between sweeps
    pub service_period: Duration,
    /// Quiet service periods before a listener counts as idle
    pub inactive_periods_per_idle: u32,
    /// Idle sweeps answered with a keepalive before a connection is
    /// disconnected
    pub keepalives_before_disconnect: u32,
    /// How often [`SupervisorTask`] checks [`IdleSupervisor::is_ready`]
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            service_period: Duration::from_secs(1),
            inactive_periods_per_idle: 300,
            keepalives_before_disconnect: 3,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl SupervisorConfig {
    /// Sets the service period.
    pub fn with_service_period(mut self, period: Duration) -> Self {
        self.service_period = period;
        self
    }

    /// Sets the number of quiet periods before idling.
    pub fn with_inactive_periods_per_idle(mut self, periods: u32) -> Self {
        self.inactive_periods_per_idle = periods;
        self
    }

    /// Sets the keepalive allowance before disconnecting.
    pub fn with_keepalives_before_disconnect(mut self, count: u32) -> Self {
        self.keepalives_before_disconnect = count;
        self
    }

    /// Sets the readiness poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> KestrelResult<()> {
        if self.service_period.is_zero() {
            return Err(KestrelError::Config("service_period must be > 0".to_string()));
        }
        if self.inactive_periods_per_idle == 0 {
            return Err(KestrelError::Config(
                "inactive_periods_per_idle must be > 0".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(KestrelError::Config("poll_interval must be > 0".to_string()));
        }
        if self
            .service_period
            .checked_mul(self.inactive_periods_per_idle)
            .is_none()
        {
            return Err(KestrelError::Config(
                "service_period × inactive_periods_per_idle overflows".to_string(),
            ));
        }
        Ok(())
    }

    /// Time without activity before a listener is idle. Saturates at
    /// [`Duration::MAX`].
    pub fn idle_after(&self) -> Duration {
        idle_threshold(self.service_period, self.inactive_periods_per_idle)
    }
}

fn idle_threshold(service_period: Duration, periods: u32) -> Duration {
    service_period.checked_mul(periods).unwrap_or(Duration::MAX)
}

struct Registration {
    listener: Arc<dyn IdleListener>,
    last_reset: Instant,
}

#[derive(Default)]
struct SweepState {
    last_service: Option<Instant>,
    servicing: bool,
    deferred: HashSet<ListenerId>,
}

/// Tracks listener activity and runs idle sweeps.
pub struct IdleSupervisor {
    service_period: Duration,
    inactive_periods_per_idle: u32,
    idle_after: Duration,
    clock: Arc<dyn Clock>,
    listeners: DashMap<ListenerId, Registration>,
    next_id: AtomicU64,
    sweep: Mutex<SweepState>,
    // Serializes whole sweeps; registration state lives in `sweep`.
    service_lock: Mutex<()>,
}

impl std::fmt::Debug for IdleSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleSupervisor")
            .field("service_period", &self.service_period)
            .field("inactive_periods_per_idle", &self.inactive_periods_per_idle)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl IdleSupervisor {
    /// Creates a supervisor sweeping every `service_period`; a listener is
    /// idle after `inactive_periods_per_idle` quiet periods.
    pub fn new(service_period: Duration, inactive_periods_per_idle: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            service_period,
            inactive_periods_per_idle,
            idle_after: idle_threshold(service_period, inactive_periods_per_idle),
            clock,
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
            sweep: Mutex::new(SweepState::default()),
            service_lock: Mutex::new(()),
        }
    }

    /// Creates a supervisor from a validated configuration on the system clock.
    pub fn from_config(config: &SupervisorConfig) -> KestrelResult<Self> {
        config.validate()?;
        Ok(Self::new(
            config.service_period,
            config.inactive_periods_per_idle,
            system_clock(),
        ))
    }

    /// Time between sweeps.
    pub fn service_period(&self) -> Duration {
        self.service_period
    }

    /// Registers a listener, active as of now.
    pub fn register(&self, listener: Arc<dyn IdleListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(
            id,
            Registration {
                listener,
                last_reset: self.clock.now(),
            },
        );
        id
    }

    /// Records activity. Does nothing for unknown ids.
    pub fn reset(&self, id: ListenerId) {
        if let Some(mut entry) = self.listeners.get_mut(&id) {
            entry.last_reset = self.clock.now();
        }
    }

    /// Deregisters a listener. During a sweep the removal waits for the
    /// sweep to end.
    pub fn remove(&self, id: ListenerId) {
        let mut sweep = self.sweep.lock();
        if sweep.servicing {
            sweep.deferred.insert(id);
        } else {
            self.listeners.remove(&id);
        }
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: ListenerId) -> bool {
        self.listeners.contains_key(&id)
    }

    /// Registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Whether a service period has passed since the last sweep.
    pub fn is_ready(&self) -> bool {
        match self.sweep.lock().last_service {
            Some(last) => self.clock.now().saturating_duration_since(last) >= self.service_period,
            None => true,
        }
    }

    /// Runs one sweep. Returns the number of listeners deregistered.
    pub fn service(&self) -> usize {
        let _guard = self.service_lock.lock();
        let now = self.clock.now();
        {
            let mut sweep = self.sweep.lock();
            sweep.last_service = Some(now);
            sweep.servicing = true;
        }

        let threshold = self.idle_after;
        let idle: Vec<(ListenerId, Arc<dyn IdleListener>)> = self
            .listeners
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_reset) >= threshold)
            .map(|entry| (*entry.key(), entry.listener.clone()))
            .collect();

        let mut removed: Vec<ListenerId> = idle
            .iter()
            .filter(|(_, listener)| listener.idle())
            .map(|(id, _)| *id)
            .collect();

        let deferred: Vec<ListenerId> = {
            let mut sweep = self.sweep.lock();
            sweep.servicing = false;
            sweep.deferred.drain().collect()
        };
        removed.extend(deferred);
        let mut count = 0;
        for id in removed {
            if self.listeners.remove(&id).is_some() {
                count += 1;
            }
        }
        logging::log_idle_sweep(self.listeners.len() + count, idle.len(), count);
        count
    }

    /// Supervises a connection: inbound traffic resets it; once idle it gets
    /// a keepalive on each sweep and is disconnected after
    /// `keepalives_before_disconnect` of them. The registration ends with
    /// the connection.
    pub fn watch_connection(
        self: &Arc<Self>,
        connection: ConnectionHandle,
        keepalives_before_disconnect: u32,
    ) -> ListenerId {
        let listener = Arc::new(ConnectionIdleListener::new(
            connection.clone(),
            keepalives_before_disconnect,
        ));
        let id = self.register(listener.clone());
        let supervisor = Arc::clone(self);
        let mut activity = connection.activity();
        tokio::spawn(async move {
            while activity.changed().await.is_ok() {
                supervisor.reset(id);
                listener.reset();
            }
            supervisor.remove(id);
            debug!(listener = id.0, "Connection left supervision");
        });
        id
    }
}

/// Adapts a connection to [`IdleListener`].
#[derive(Debug)]
pub struct ConnectionIdleListener {
    connection: ConnectionHandle,
    keepalives_before_disconnect: u32,
    strikes: AtomicU32,
}

impl ConnectionIdleListener {
    /// Wraps `connection`.
    pub fn new(connection: ConnectionHandle, keepalives_before_disconnect: u32) -> Self {
        Self {
            connection,
            keepalives_before_disconnect,
            strikes: AtomicU32::new(0),
        }
    }

    /// Forgets earlier idle sweeps after the peer was heard from.
    pub fn reset(&self) {
        self.strikes.store(0, Ordering::Relaxed);
    }

    /// Idle sweeps seen since the last activity.
    pub fn strikes(&self) -> u32 {
        self.strikes.load(Ordering::Relaxed)
    }
}

impl IdleListener for ConnectionIdleListener {
    fn idle(&self) -> bool {
        if self.connection.is_closed() {
            return true;
        }
        let strikes = self.strikes.fetch_add(1, Ordering::Relaxed) + 1;
        if strikes > self.keepalives_before_disconnect {
            info!(strikes, "Disconnecting idle connection");
            let _ = self
                .connection
                .try_disconnect(DisconnectReason::ByApplication, "idle timeout");
            return true;
        }
        debug!(strikes, "Connection idle; sending keepalive");
        self.connection.try_send_ignore(KEEPALIVE_PAYLOAD).is_err()
    }
}

/// Background task driving an [`IdleSupervisor`]. Stopped on drop.
#[derive(Debug)]
pub struct SupervisorTask {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SupervisorTask {
    /// Checks readiness every `poll_interval` and sweeps when ready.
    pub fn spawn(supervisor: Arc<IdleSupervisor>, poll_interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if supervisor.is_ready() {
                            supervisor.service();
                        }
                    }
                }
            }
        });
        Self {
            stop: Some(stop_tx),
            task: Some(task),
        }
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

impl Drop for SupervisorTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_platform::ManualClock;

    #[derive(Default)]
    struct Counting {
        calls: AtomicU32,
        release_after: u32,
    }

    impl Counting {
        fn releasing_after(calls: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                release_after: calls,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl IdleListener for Counting {
        fn idle(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.release_after
        }
    }

    fn supervisor() -> (Arc<ManualClock>, IdleSupervisor) {
        let clock = Arc::new(ManualClock::new());
        let supervisor = IdleSupervisor::new(Duration::from_secs(1), 3, clock.clone());
        (clock, supervisor)
    }

    #[test]
    fn test_idle_only_after_threshold() {
        let (clock, supervisor) = supervisor();
        let listener = Arc::new(Counting::releasing_after(1));
        supervisor.register(listener.clone());

        clock.advance(Duration::from_millis(2999));
        supervisor.service();
        assert_eq!(listener.calls(), 0);

        clock.advance(Duration::from_millis(1));
        assert_eq!(supervisor.service(), 1);
        assert_eq!(listener.calls(), 1);
        assert!(supervisor.is_empty());
    }

    #[test]
    fn test_reset_postpones_idle() {
        let (clock, supervisor) = supervisor();
        let listener = Arc::new(Counting::releasing_after(1));
        let id = supervisor.register(listener.clone());

        clock.advance(Duration::from_secs(2));
        supervisor.reset(id);
        clock.advance(Duration::from_secs(2));
        supervisor.service();
        assert_eq!(listener.calls(), 0);

        clock.advance(Duration::from_secs(1));
        supervisor.service();
        assert_eq!(listener.calls(), 1);
    }

    #[test]
    fn test_reset_unknown_is_ignored() {
        let (_clock, supervisor) = supervisor();
        let id = supervisor.register(Arc::new(Counting::default()));
        supervisor.remove(id);
        supervisor.reset(id);
        assert!(!supervisor.contains(id));
    }

    #[test]
    fn test_listener_kept_while_it_returns_false() {
        let (clock, supervisor) = supervisor();
        let listener = Arc::new(Counting::releasing_after(3));
        let id = supervisor.register(listener.clone());

        clock.advance(Duration::from_secs(3));
        for expected in 1..=2 {
            supervisor.service();
            assert_eq!(listener.calls(), expected);
            assert!(supervisor.contains(id));
            clock.advance(Duration::from_secs(1));
        }
        supervisor.service();
        assert!(!supervisor.contains(id));
    }

    #[test]
    fn test_is_ready_tracks_service_period() {
        let (clock, supervisor) = supervisor();
        assert!(supervisor.is_ready());
        supervisor.service();
        assert!(!supervisor.is_ready());
        clock.advance(Duration::from_millis(999));
        assert!(!supervisor.is_ready());
        clock.advance(Duration::from_millis(1));
        assert!(supervisor.is_ready());
    }

    struct SelfRemoving {
        supervisor: Arc<IdleSupervisor>,
        id: Mutex<Option<ListenerId>>,
    }

    impl IdleListener for SelfRemoving {
        fn idle(&self) -> bool {
            if let Some(id) = *self.id.lock() {
                self.supervisor.remove(id);
                // Still registered until the sweep ends.
                assert!(self.supervisor.contains(id));
            }
            false
        }
    }

    #[test]
    fn test_remove_during_sweep_is_deferred() {
        let clock = Arc::new(ManualClock::new());
        let supervisor = Arc::new(IdleSupervisor::new(Duration::from_secs(1), 1, clock.clone()));
        let listener = Arc::new(SelfRemoving {
            supervisor: supervisor.clone(),
            id: Mutex::new(None),
        });
        let id = supervisor.register(listener.clone());
        *listener.id.lock() = Some(id);
        let other = supervisor.register(Arc::new(Counting::releasing_after(10)));

        clock.advance(Duration::from_secs(1));
        assert_eq!(supervisor.service(), 1);
        assert!(!supervisor.contains(id));
        assert!(supervisor.contains(other));
    }

    #[test]
    fn test_concurrent_registration_during_sweeps() {
        let clock = Arc::new(ManualClock::new());
        let supervisor = Arc::new(IdleSupervisor::new(Duration::from_secs(1), 1, clock.clone()));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let supervisor = supervisor.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let id = supervisor.register(Arc::new(Counting::releasing_after(u32::MAX)));
                        supervisor.reset(id);
                        supervisor.remove(id);
                    }
                })
            })
            .collect();
        for _ in 0..50 {
            clock.advance(Duration::from_secs(1));
            supervisor.service();
        }
        for worker in workers {
            worker.join().unwrap();
        }
        supervisor.service();
        assert!(supervisor.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(SupervisorConfig::default().validate().is_ok());
        assert_eq!(
            SupervisorConfig::default()
                .with_service_period(Duration::from_secs(2))
                .with_inactive_periods_per_idle(5)
                .idle_after(),
            Duration::from_secs(10)
        );
        assert!(SupervisorConfig::default()
            .with_inactive_periods_per_idle(0)
            .validate()
            .is_err());
        assert!(SupervisorConfig::default()
            .with_service_period(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_overflowing_idle_threshold() {
        let config = SupervisorConfig::default()
            .with_service_period(Duration::from_secs(u64::MAX / 2))
            .with_inactive_periods_per_idle(3);
        assert!(matches!(config.validate(), Err(KestrelError::Config(_))));
        assert!(IdleSupervisor::from_config(&config).is_err());
        assert_eq!(config.idle_after(), Duration::MAX);

        // Built directly, the threshold saturates and sweeps keep working.
        let clock = Arc::new(ManualClock::new());
        let supervisor = IdleSupervisor::new(Duration::from_secs(u64::MAX / 2), 3, clock.clone());
        let listener = Arc::new(Counting::releasing_after(1));
        supervisor.register(listener.clone());
        clock.advance(Duration::from_secs(3600));
        assert_eq!(supervisor.service(), 0);
        assert_eq!(listener.calls(), 0);
        assert!(!supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_task_sweeps_when_ready() {
        let supervisor = Arc::new(IdleSupervisor::new(Duration::from_secs(1), 1, system_clock()));
        let listener = Arc::new(Counting::releasing_after(1));
        supervisor.register(listener.clone());

        let mut task = SupervisorTask::spawn(supervisor.clone(), Duration::from_millis(100));
        assert!(task.is_running());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(listener.calls(), 1);
        task.stop();
        assert!(!task.is_running());
    }
}
