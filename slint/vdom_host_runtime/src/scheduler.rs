use crate::protocol::{VDomEvent, VDomRefUpdate, VDomStateSync};
use crate::timer::Alarm;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Work accumulated since the last request was handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequestState {
    pub events: Vec<VDomEvent>,
    pub ref_updates: Vec<VDomRefUpdate>,
    pub resync_needed: bool,
    pub render_context_dirty: bool,
}

impl Default for PendingRequestState {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            ref_updates: Vec::new(),
            resync_needed: true,
            render_context_dirty: false,
        }
    }
}

/// What one outgoing request carried, kept until its round completes so a
/// failed round can put everything back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingSnapshot {
    pub events: Vec<VDomEvent>,
    pub ref_updates: Vec<VDomRefUpdate>,
    pub state_sync: Vec<VDomStateSync>,
    pub resync: bool,
    pub render_context_dirty: bool,
}

impl PendingRequestState {
    pub fn has_news(&self) -> bool {
        !self.events.is_empty()
            || !self.ref_updates.is_empty()
            || self.resync_needed
            || self.render_context_dirty
    }

    pub fn take(&mut self) -> PendingSnapshot {
        PendingSnapshot {
            events: std::mem::take(&mut self.events),
            ref_updates: std::mem::take(&mut self.ref_updates),
            state_sync: Vec::new(),
            resync: std::mem::replace(&mut self.resync_needed, false),
            render_context_dirty: std::mem::replace(&mut self.render_context_dirty, false),
        }
    }

    /// Requeues a snapshot ahead of anything recorded since it was taken.
    pub fn restore(&mut self, snapshot: PendingSnapshot) {
        let newer_events = std::mem::replace(&mut self.events, snapshot.events);
        self.events.extend(newer_events);

        let newer_refs = std::mem::replace(&mut self.ref_updates, snapshot.ref_updates);
        self.ref_updates.extend(newer_refs);

        self.resync_needed |= snapshot.resync;
        self.render_context_dirty |= snapshot.render_context_dirty;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundDecision {
    /// Build a request with this id and hand it to the transport.
    Send(u64),
    /// A round is already outstanding.
    Busy,
    /// Nothing to report; the interval timer is armed.
    Idle,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmAction {
    Tick,
    TimedOut(u64),
    Ignore,
}

/// Enforces at most one outstanding round and decides when the next one runs.
pub struct UpdateScheduler {
    alarm: Box<dyn Alarm>,
    interval: Duration,
    round_timeout: Option<Duration>,
    in_flight: Option<u64>,
    force_next_immediate: bool,
    next_request_id: u64,
    disposed: bool,
}

impl fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("interval", &self.interval)
            .field("round_timeout", &self.round_timeout)
            .field("in_flight", &self.in_flight)
            .field("force_next_immediate", &self.force_next_immediate)
            .field("timer_armed", &self.alarm.is_armed())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl UpdateScheduler {
    pub fn new(alarm: Box<dyn Alarm>, interval: Duration, round_timeout: Option<Duration>) -> Self {
        Self {
            alarm,
            interval,
            round_timeout,
            in_flight: None,
            force_next_immediate: false,
            next_request_id: 1,
            disposed: false,
        }
    }

    pub fn begin_round(&mut self, force: bool, has_news: bool) -> RoundDecision {
        if self.disposed {
            return RoundDecision::Disposed;
        }

        if let Some(request_id) = self.in_flight {
            if force {
                debug!(request_id, "round in flight; next round will run immediately");
                self.force_next_immediate = true;
            }
            return RoundDecision::Busy;
        }

        if !force && !has_news {
            if !self.alarm.is_armed() {
                self.alarm.arm(self.interval);
            }
            return RoundDecision::Idle;
        }

        self.alarm.cancel();
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.in_flight = Some(request_id);
        if let Some(timeout) = self.round_timeout {
            self.alarm.arm(timeout);
        }

        debug!(request_id, force, "starting sync round");
        RoundDecision::Send(request_id)
    }

    /// Closes the round `request_id` and re-arms for the next one. Returns
    /// `false` for responses that do not belong to the outstanding round.
    pub fn finish_round(&mut self, request_id: u64) -> bool {
        if self.disposed || self.in_flight != Some(request_id) {
            return false;
        }

        self.in_flight = None;
        let delay = if std::mem::take(&mut self.force_next_immediate) {
            Duration::ZERO
        } else {
            self.interval
        };
        self.alarm.cancel();
        self.alarm.arm(delay);
        true
    }

    /// Runs the next round as soon as possible without breaking the
    /// single-outstanding-round rule.
    pub fn expedite(&mut self) {
        if self.disposed {
            return;
        }
        if self.in_flight.is_some() {
            self.force_next_immediate = true;
        } else {
            self.alarm.arm(Duration::ZERO);
        }
    }

    pub fn on_alarm(&mut self) -> AlarmAction {
        if self.disposed {
            return AlarmAction::Ignore;
        }

        match self.in_flight {
            Some(request_id) if self.round_timeout.is_some() => AlarmAction::TimedOut(request_id),
            Some(_) => AlarmAction::Ignore,
            None => AlarmAction::Tick,
        }
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
        self.in_flight = None;
        self.force_next_immediate = false;
        self.alarm.cancel();
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    pub fn force_next_immediate(&self) -> bool {
        self.force_next_immediate
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}
