use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

/// The independent timing concerns of a session; each owns exactly one timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerConcern {
    /// No liveness ping within the connection window
    Staleness,
    /// Grace period after the degraded notification
    PendingTermination,
    /// Grace period after "driving stopped"
    DrivingTrim,
}

/// Delivered to the fire callback; `generation` identifies the arm-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub concern: TimerConcern,
    pub generation: u64,
}

pub type FireCallback = Arc<dyn Fn(TimerFired) + Send + Sync>;

/// Cancel-and-reschedule timer.
///
/// `reset` replaces any pending fire, so there is never more than one pending
/// fire per timer. A fire that raced a reset or disarm carries an old
/// generation and is refused by `accept`.
pub struct RearmableTimer {
    concern: TimerConcern,
    scheduler: Handle,
    on_fire: FireCallback,
    generation: u64,
    pending: Option<JoinHandle<()>>,
    duration: Option<Duration>,
    last_reset_at: Option<Instant>,
}

impl RearmableTimer {
    pub fn new(concern: TimerConcern, scheduler: Handle, on_fire: FireCallback) -> Self {
        Self {
            concern,
            scheduler,
            on_fire,
            generation: 0,
            pending: None,
            duration: None,
            last_reset_at: None,
        }
    }

    pub fn concern(&self) -> TimerConcern {
        self.concern
    }

    /// Cancel any pending fire and schedule a new one `duration` from now
    pub fn reset(&mut self, duration: Duration) {
        self.cancel_pending();
        self.generation += 1;

        let fired = TimerFired {
            concern: self.concern,
            generation: self.generation,
        };
        let on_fire = self.on_fire.clone();
        self.pending = Some(self.scheduler.spawn(async move {
            sleep(duration).await;
            on_fire(fired);
        }));
        self.duration = Some(duration);
        self.last_reset_at = Some(Instant::now());
    }

    /// Cancel the pending fire for good (until the next reset)
    pub fn disarm(&mut self) {
        if self.pending.is_some() {
            log::debug!("Disarming {:?} timer", self.concern);
        }
        self.cancel_pending();
        self.generation += 1;
        self.duration = None;
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Duration of the current arm-cycle, if armed
    pub fn duration(&self) -> Option<Duration> {
        self.pending.as_ref().and(self.duration)
    }

    pub fn last_reset_at(&self) -> Option<Instant> {
        self.last_reset_at
    }

    /// Time left before the pending fire
    pub fn remaining(&self) -> Option<Duration> {
        match (self.duration(), self.last_reset_at) {
            (Some(duration), Some(at)) => Some(duration.saturating_sub(at.elapsed())),
            _ => None,
        }
    }

    /// Consume a fire. Returns true only for the fire of the current arm-cycle,
    /// after which the timer is unarmed.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        if fired.concern != self.concern || fired.generation != self.generation {
            return false;
        }
        if self.pending.take().is_none() {
            return false;
        }
        self.duration = None;
        true
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for RearmableTimer {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

/// Outcome of a timer fire routed through the liveness watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Stale fire or another concern's timer
    Ignored,
    /// Link went quiet; pending termination is now armed
    Degraded,
    /// Still quiet after the pending-termination window
    Terminate,
}

/// Two-stage liveness tracking: staleness, then pending termination.
pub struct LivenessWatchdog {
    staleness: RearmableTimer,
    pending_termination: RearmableTimer,
    degraded: bool,
}

impl LivenessWatchdog {
    pub fn new(scheduler: Handle, on_fire: FireCallback) -> Self {
        Self {
            staleness: RearmableTimer::new(
                TimerConcern::Staleness,
                scheduler.clone(),
                on_fire.clone(),
            ),
            pending_termination: RearmableTimer::new(
                TimerConcern::PendingTermination,
                scheduler,
                on_fire,
            ),
            degraded: false,
        }
    }

    /// Record a liveness ping. Cancels a pending termination and restarts the
    /// staleness window. Returns true if the link had been reported degraded.
    pub fn ping(&mut self, stale_after: Duration) -> bool {
        self.pending_termination.disarm();
        self.staleness.reset(stale_after);
        std::mem::replace(&mut self.degraded, false)
    }

    /// Route a fire. `pending_after` is read by the caller from the settings
    /// current at fire time, since it arms a new timer.
    pub fn handle_fire(&mut self, fired: TimerFired, pending_after: Duration) -> WatchdogVerdict {
        match fired.concern {
            TimerConcern::Staleness if self.staleness.accept(fired) => {
                self.degraded = true;
                self.pending_termination.reset(pending_after);
                WatchdogVerdict::Degraded
            }
            TimerConcern::PendingTermination if self.pending_termination.accept(fired) => {
                WatchdogVerdict::Terminate
            }
            _ => WatchdogVerdict::Ignored,
        }
    }

    pub fn disarm(&mut self) {
        self.staleness.disarm();
        self.pending_termination.disarm();
        self.degraded = false;
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_armed(&self) -> bool {
        self.staleness.is_armed() || self.pending_termination.is_armed()
    }

    pub fn termination_pending(&self) -> bool {
        self.pending_termination.is_armed()
    }
}
