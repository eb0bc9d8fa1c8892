//! Injectable time source.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
  /// Unix seconds.
  fn now(&self) -> i64;

  fn now_utc(&self) -> DateTime<Utc> {
    DateTime::from_timestamp(self.now(), 0).unwrap_or_default()
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> i64 { Utc::now().timestamp() }

  fn now_utc(&self) -> DateTime<Utc> { Utc::now() }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
  now: AtomicI64,
}

impl ManualClock {
  pub fn at(now: i64) -> Self { Self { now: AtomicI64::new(now) } }

  pub fn set(&self, now: i64) { self.now.store(now, Ordering::SeqCst); }

  pub fn advance(&self, secs: i64) { self.now.fetch_add(secs, Ordering::SeqCst); }
}

impl Clock for ManualClock {
  fn now(&self) -> i64 { self.now.load(Ordering::SeqCst) }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
  fn now(&self) -> i64 { (**self).now() }

  fn now_utc(&self) -> DateTime<Utc> { (**self).now_utc() }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn manual_clock_moves_on_demand() {
    let c = ManualClock::at(100);
    assert_eq!(c.now(), 100);
    c.advance(5);
    assert_eq!(c.now(), 105);
    c.set(0);
    assert_eq!(c.now_utc().timestamp(), 0);
  }
}
