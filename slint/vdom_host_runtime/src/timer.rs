use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

/// A one-shot timer. Arming an armed alarm replaces the pending deadline.
pub trait Alarm {
    fn arm(&mut self, delay: Duration);
    fn cancel(&mut self);
    fn is_armed(&self) -> bool;
}

/// Alarm backed by the Slint event loop. `on_fire` runs on the UI thread.
pub struct SlintAlarm {
    timer: slint::Timer,
    armed: Rc<Cell<bool>>,
    on_fire: Rc<dyn Fn()>,
}

impl SlintAlarm {
    pub fn new(on_fire: impl Fn() + 'static) -> Self {
        Self {
            timer: slint::Timer::default(),
            armed: Rc::new(Cell::new(false)),
            on_fire: Rc::new(on_fire),
        }
    }
}

impl Alarm for SlintAlarm {
    fn arm(&mut self, delay: Duration) {
        let armed = self.armed.clone();
        let on_fire = self.on_fire.clone();
        self.armed.set(true);
        self.timer
            .start(slint::TimerMode::SingleShot, delay, move || {
                armed.set(false);
                on_fire();
            });
    }

    fn cancel(&mut self) {
        self.armed.set(false);
        self.timer.stop();
    }

    fn is_armed(&self) -> bool {
        self.armed.get()
    }
}

#[derive(Debug, Default)]
struct ManualAlarmState {
    deadline: Option<Duration>,
    arm_count: u32,
    cancel_count: u32,
}

/// Alarm driven by hand, for exercising scheduling without a clock. Clones
/// share state, so a test can keep one and give another to the session.
#[derive(Debug, Clone, Default)]
pub struct ManualAlarm {
    state: Rc<RefCell<ManualAlarmState>>,
}

impl ManualAlarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// The delay the alarm is currently armed with.
    pub fn armed_delay(&self) -> Option<Duration> {
        self.state.borrow().deadline
    }

    pub fn arm_count(&self) -> u32 {
        self.state.borrow().arm_count
    }

    pub fn cancel_count(&self) -> u32 {
        self.state.borrow().cancel_count
    }

    /// Disarms and reports whether the alarm was armed; the caller then
    /// delivers the firing to whoever owns the alarm.
    pub fn fire(&self) -> bool {
        self.state.borrow_mut().deadline.take().is_some()
    }
}

impl Alarm for ManualAlarm {
    fn arm(&mut self, delay: Duration) {
        let mut state = self.state.borrow_mut();
        state.deadline = Some(delay);
        state.arm_count += 1;
    }

    fn cancel(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.deadline.take().is_some() {
            state.cancel_count += 1;
        }
    }

    fn is_armed(&self) -> bool {
        self.state.borrow().deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_alarm_fires_once() {
        let handle = ManualAlarm::new();
        let mut alarm = handle.clone();

        alarm.arm(Duration::from_millis(10));
        assert_eq!(handle.armed_delay(), Some(Duration::from_millis(10)));
        assert!(handle.fire());
        assert!(!alarm.is_armed());
        assert!(!handle.fire());
    }

    #[test]
    fn rearming_replaces_deadline() {
        let mut alarm = ManualAlarm::new();
        alarm.arm(Duration::from_millis(10));
        alarm.arm(Duration::ZERO);

        assert_eq!(alarm.armed_delay(), Some(Duration::ZERO));
        assert_eq!(alarm.arm_count(), 2);
        alarm.cancel();
        alarm.cancel();
        assert_eq!(alarm.cancel_count(), 1);
    }
}
