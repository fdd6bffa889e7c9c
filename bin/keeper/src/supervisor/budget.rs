use std::{
  collections::VecDeque,
  time::{Duration, Instant},
};

/// Sliding-window restart budget: at most `count` automatic
/// restarts within `window`. Entries decay as they fall out of the
/// window, so a burst followed by quiescence earns the budget
/// back.
#[derive(Debug)]
pub struct RestartBudget {
  count: u32,
  window: Duration,
  restarts: VecDeque<Instant>,
}

impl RestartBudget {
  pub fn new(count: u32, window: Duration) -> RestartBudget {
    RestartBudget {
      count,
      window,
      restarts: VecDeque::new(),
    }
  }

  /// Try to consume one restart. False means the budget is spent
  /// and nothing was recorded.
  pub fn consume(&mut self) -> bool {
    self.decay(Instant::now());
    if self.restarts.len() as u32 >= self.count {
      return false;
    }
    self.restarts.push_back(Instant::now());
    true
  }

  pub fn exhausted(&mut self) -> bool {
    self.decay(Instant::now());
    self.restarts.len() as u32 >= self.count
  }

  /// Forget everything, used by the slow reconciler's retry.
  pub fn reset(&mut self) {
    self.restarts.clear();
  }

  fn decay(&mut self, now: Instant) {
    while let Some(oldest) = self.restarts.front() {
      if now.duration_since(*oldest) >= self.window {
        self.restarts.pop_front();
      } else {
        break;
      }
    }
  }
}

/// Exponential restart backoff, 1s doubling to a cap.
#[derive(Debug)]
pub struct Backoff {
  cap: Duration,
  current: Duration,
}

impl Backoff {
  const BASE: Duration = Duration::from_secs(1);

  pub fn new(cap: Duration) -> Backoff {
    Backoff {
      cap,
      current: Self::BASE,
    }
  }

  /// Delay to apply before the next restart attempt.
  pub fn next_delay(&mut self) -> Duration {
    let delay = self.current;
    self.current = (self.current * 2).min(self.cap);
    delay
  }

  /// A healthy run resets the progression.
  pub fn reset(&mut self) {
    self.current = Self::BASE;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn budget_allows_up_to_count() {
    let mut budget =
      RestartBudget::new(3, Duration::from_secs(60));
    assert!(budget.consume());
    assert!(budget.consume());
    assert!(budget.consume());
    assert!(!budget.consume());
    assert!(budget.exhausted());
  }

  #[test]
  fn entries_decay_out_of_the_window() {
    let mut budget =
      RestartBudget::new(2, Duration::from_millis(20));
    assert!(budget.consume());
    assert!(budget.consume());
    assert!(!budget.consume());
    std::thread::sleep(Duration::from_millis(30));
    assert!(!budget.exhausted());
    assert!(budget.consume());
  }

  #[test]
  fn reset_clears_the_window() {
    let mut budget =
      RestartBudget::new(1, Duration::from_secs(60));
    assert!(budget.consume());
    assert!(budget.exhausted());
    budget.reset();
    assert!(budget.consume());
  }

  #[test]
  fn backoff_doubles_to_cap() {
    let mut backoff = Backoff::new(Duration::from_secs(4));
    assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_secs(1));
  }
}
