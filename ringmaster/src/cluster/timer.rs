use std::time::Duration;

/// A one-shot countdown advanced by polling.
///
/// The owner calls [`tick`](ElectionTimer::tick) periodically with the current time; the tick
/// that brings the remaining time to zero disarms the timer and reports it as fired.
#[derive(Debug, Default)]
pub struct ElectionTimer {
  armed: bool,
  remaining_ms: u64,
  last_tick: u64,
}
impl ElectionTimer {
  /// A disarmed timer.
  pub fn new() -> ElectionTimer {
    Self::default()
  }

  /// (Re)starts the countdown from `now`.
  pub fn arm(&mut self, duration: Duration, now: u64) {
    self.armed = true;
    self.remaining_ms = duration.as_millis() as u64;
    self.last_tick = now;
  }

  /// Disarms without firing.
  pub fn stop(&mut self) {
    self.armed = false;
    self.remaining_ms = 0;
  }

  /// Whether a countdown is running.
  pub fn is_armed(&self) -> bool {
    self.armed
  }

  /// Returns true exactly once per arming, on the first tick at or after expiry.
  pub fn tick(&mut self, now: u64) -> bool {
    if !self.armed {
      return false;
    }
    let elapsed = now.saturating_sub(self.last_tick);
    self.last_tick = now;
    self.remaining_ms = self.remaining_ms.saturating_sub(elapsed);
    if self.remaining_ms > 0 {
      return false;
    }
    self.armed = false;
    true
  }
}

#[test]
fn test_timer_fires_once() {
  let mut timer = ElectionTimer::new();
  assert!(!timer.tick(1_000));
  timer.arm(Duration::from_millis(250), 1_000);
  assert!(!timer.tick(1_100));
  assert!(!timer.tick(1_200));
  assert!(timer.tick(1_300));
  assert!(!timer.is_armed());
  assert!(!timer.tick(1_400));
}

#[test]
fn test_timer_rearm_and_stop() {
  let mut timer = ElectionTimer::new();
  timer.arm(Duration::from_millis(100), 0);
  assert!(!timer.tick(90));
  timer.arm(Duration::from_millis(100), 90);
  assert!(!timer.tick(150));
  assert!(timer.tick(190));
  timer.arm(Duration::ZERO, 200);
  timer.stop();
  assert!(!timer.tick(1_000));
  // A clock that goes nowhere never fires a non-zero timer.
  timer.arm(Duration::from_millis(1), 5);
  assert!(!timer.tick(5));
  assert!(!timer.tick(4));
  assert!(timer.tick(6));
}
