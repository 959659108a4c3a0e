//! Virtual clocks
//!
//! Two clock domains drive an experiment: an absolute wall clock (loosely
//! NTP-synchronized across machines) used to agree on the start instant, and
//! a simulation clock that reads zero the moment the scenario begins, used
//! for all scripted event timings. Both expose an async wait-until-time; a
//! shutdown wakes every waiter.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::warn;

/// A clock that can be started, queried, waited on, and shut down.
///
/// Waiting on a clock that has not started yet blocks until it starts.
/// Stopping freezes the reported time at the stop instant; shutting down
/// additionally releases every waiter.
#[async_trait]
pub trait VirtualClock: Send + Sync {
    /// Start the clock. Starting an already-running clock is a logged no-op.
    fn start(&self);

    /// Stop the clock, freezing [`VirtualClock::now`] at the stop instant.
    fn stop(&self);

    /// Terminal: wake all waiters and refuse further use.
    fn shutdown(&self);

    fn is_started(&self) -> bool;

    fn is_shutdown(&self) -> bool;

    /// Current time on this clock, in milliseconds.
    fn now(&self) -> u64;

    /// Block the calling task until the clock reads `time_ms`, the clock is
    /// stopped, or the clock is shut down.
    async fn wait_until(&self, time_ms: u64);

    /// Block the calling task for `duration` of this clock's time.
    async fn wait_for(&self, duration: Duration);
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ----------------------------------------------------------------------------
// Shared implementation
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Running; the reported time is wall time minus `base`.
    Running { base: u64 },
    Stopped { at: u64 },
    Shutdown { at: u64 },
}

/// State machine common to both clock domains. The only difference between
/// the absolute and simulation clocks is the base subtracted from wall time.
struct ClockCore {
    phase: watch::Sender<Phase>,
}

impl ClockCore {
    fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        ClockCore { phase }
    }

    fn start(&self, base: u64) {
        self.phase.send_modify(|phase| match *phase {
            Phase::Idle => *phase = Phase::Running { base },
            Phase::Running { .. } => warn!("Clock is already running, ignoring start"),
            Phase::Stopped { .. } | Phase::Shutdown { .. } => {
                warn!("Clock can no longer be started, ignoring")
            }
        });
    }

    fn stop(&self) {
        self.phase.send_modify(|phase| {
            if let Phase::Running { base } = *phase {
                *phase = Phase::Stopped {
                    at: epoch_ms().saturating_sub(base),
                };
            } else {
                warn!("Clock is not running, ignoring stop");
            }
        });
    }

    fn shutdown(&self) {
        self.phase.send_modify(|phase| {
            let at = match *phase {
                Phase::Running { base } => epoch_ms().saturating_sub(base),
                Phase::Stopped { at } => at,
                _ => 0,
            };
            *phase = Phase::Shutdown { at };
        });
    }

    fn is_started(&self) -> bool {
        matches!(*self.phase.borrow(), Phase::Running { .. })
    }

    fn is_shutdown(&self) -> bool {
        matches!(*self.phase.borrow(), Phase::Shutdown { .. })
    }

    fn now(&self) -> u64 {
        match *self.phase.borrow() {
            Phase::Idle => 0,
            Phase::Running { base } => epoch_ms().saturating_sub(base),
            Phase::Stopped { at } | Phase::Shutdown { at } => at,
        }
    }

    /// Wait until the clock is running; returns false if it was shut down
    /// or stopped before (or instead of) starting.
    async fn wait_for_start(&self, rx: &mut watch::Receiver<Phase>) -> bool {
        loop {
            match *rx.borrow() {
                Phase::Running { .. } => return true,
                Phase::Shutdown { .. } | Phase::Stopped { .. } => return false,
                Phase::Idle => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    async fn wait_until(&self, time_ms: u64) {
        let mut rx = self.phase.subscribe();
        if !self.wait_for_start(&mut rx).await {
            return;
        }

        loop {
            let now = match *rx.borrow() {
                Phase::Running { base } => epoch_ms().saturating_sub(base),
                // stopped or shut down while waiting
                _ => return,
            };
            if now >= time_ms {
                return;
            }
            let remaining = Duration::from_millis(time_ms - now);
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Clock domains
// ----------------------------------------------------------------------------

/// Wall-clock domain: [`VirtualClock::now`] is epoch milliseconds, so a
/// deadline agreed over the wire means the same instant on every machine
/// with a synchronized system clock.
pub struct AbsoluteClock {
    core: ClockCore,
}

impl AbsoluteClock {
    pub fn new() -> Self {
        AbsoluteClock {
            core: ClockCore::new(),
        }
    }
}

impl Default for AbsoluteClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VirtualClock for AbsoluteClock {
    fn start(&self) {
        self.core.start(0);
    }

    fn stop(&self) {
        self.core.stop();
    }

    fn shutdown(&self) {
        self.core.shutdown();
    }

    fn is_started(&self) -> bool {
        self.core.is_started()
    }

    fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }

    fn now(&self) -> u64 {
        self.core.now()
    }

    async fn wait_until(&self, time_ms: u64) {
        self.core.wait_until(time_ms).await
    }

    async fn wait_for(&self, duration: Duration) {
        let deadline = self.now() + duration.as_millis() as u64;
        self.core.wait_until(deadline).await
    }
}

/// Simulation-relative domain: reads zero at the instant [`VirtualClock::start`]
/// is called. All scripted failure times are measured on this clock.
pub struct SimulationClock {
    core: ClockCore,
}

impl SimulationClock {
    pub fn new() -> Self {
        SimulationClock {
            core: ClockCore::new(),
        }
    }
}

impl Default for SimulationClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VirtualClock for SimulationClock {
    fn start(&self) {
        self.core.start(epoch_ms());
    }

    fn stop(&self) {
        self.core.stop();
    }

    fn shutdown(&self) {
        self.core.shutdown();
    }

    fn is_started(&self) -> bool {
        self.core.is_started()
    }

    fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }

    fn now(&self) -> u64 {
        self.core.now()
    }

    async fn wait_until(&self, time_ms: u64) {
        self.core.wait_until(time_ms).await
    }

    async fn wait_for(&self, duration: Duration) {
        let deadline = self.now() + duration.as_millis() as u64;
        self.core.wait_until(deadline).await
    }
}
