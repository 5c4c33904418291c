//! Media-path liveness and the periodic monitor loops

use super::state::SessionState;
use crate::peer::TransportState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Heartbeat bookkeeping
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    last_activity: Instant,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatState {
    /// Start tracking with `now` as the last activity
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            last_activity: now,
            interval,
            timeout,
        }
    }

    /// Heartbeat period
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Silence tolerated before declaring a partition
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Last heartbeat sent or received
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Record heartbeat traffic in either direction
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Silence since the last activity
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// True when the transport claims to be up but heartbeats went silent
    ///
    /// Only meaningful while the session is connected; any other state is
    /// handled by the transport state callbacks.
    pub fn is_timed_out(&self, now: Instant, session: SessionState, transport: TransportState) -> bool {
        session == SessionState::Connected
            && transport == TransportState::Connected
            && self.silence(now) > self.timeout
    }
}

/// Tick produced by the monitor loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorTick {
    /// Time to send a heartbeat and check for silence
    Heartbeat {
        /// Loop generation
        epoch: u64,
    },
    /// Time to sample connection quality
    Quality {
        /// Loop generation
        epoch: u64,
    },
}

/// Heartbeat and quality loops, started and stopped together
///
/// Loops check a shared liveness flag on every tick and exit once it is
/// cleared; ticks carry an epoch so a tick already in flight when the loops
/// were stopped can be recognized as stale.
#[derive(Debug, Default)]
pub struct MonitorLoops {
    epoch: u64,
    alive: Option<Arc<AtomicBool>>,
}

impl MonitorLoops {
    /// Current loop generation
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// True while loops are running
    pub fn is_active(&self) -> bool {
        self.alive.is_some()
    }

    /// True if `epoch` belongs to the running loops
    pub fn is_current(&self, epoch: u64) -> bool {
        self.is_active() && epoch == self.epoch
    }

    /// (Re)start both loops; `on_tick` returning false stops the loop
    pub fn start<F>(&mut self, heartbeat_every: Duration, quality_every: Duration, on_tick: F)
    where
        F: Fn(MonitorTick) -> bool + Send + Sync + Clone + 'static,
    {
        self.stop();
        self.epoch += 1;
        let alive = Arc::new(AtomicBool::new(true));
        self.alive = Some(Arc::clone(&alive));

        let epoch = self.epoch;
        spawn_ticker(
            heartbeat_every,
            Arc::clone(&alive),
            MonitorTick::Heartbeat { epoch },
            on_tick.clone(),
        );
        spawn_ticker(quality_every, alive, MonitorTick::Quality { epoch }, on_tick);
        debug!(epoch, "Monitor loops started");
    }

    /// Stop both loops; idempotent
    pub fn stop(&mut self) {
        if let Some(alive) = self.alive.take() {
            alive.store(false, Ordering::SeqCst);
            debug!(epoch = self.epoch, "Monitor loops stopped");
        }
    }
}

impl Drop for MonitorLoops {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_ticker<F>(period: Duration, alive: Arc<AtomicBool>, tick: MonitorTick, on_tick: F)
where
    F: Fn(MonitorTick) -> bool + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !alive.load(Ordering::SeqCst) || !on_tick(tick) {
                break;
            }
        }
    });
}
