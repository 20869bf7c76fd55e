use std::sync::Mutex;
use std::{thread, time};

use chrono::Utc;

/// Time source used by watch windows, event timestamps and ETA math
///
/// Everything that sleeps or stamps goes through this so tests can run
/// rollouts instantly against a stepped clock.
pub trait Clock: Send + Sync {
    /// Seconds since epoch
    fn epoch(&self) -> i64;
    /// Sleep for the given number of milliseconds
    fn sleep_ms(&self, ms: u64);
}

/// Wall clock used by the binary
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(time::Duration::from_millis(ms));
    }
}

/// Stepped clock for tests
///
/// `sleep_ms` advances the clock instead of blocking, so watch windows
/// elapse immediately. Shared between threads via `Arc`.
pub struct FakeClock {
    now_ms: Mutex<u64>,
}

impl FakeClock {
    pub fn at(epoch_secs: i64) -> FakeClock {
        FakeClock {
            now_ms: Mutex::new((epoch_secs as u64) * 1000),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        let mut now = self.now_ms.lock().unwrap();
        *now += ms;
    }
}

impl Clock for FakeClock {
    fn epoch(&self) -> i64 {
        (*self.now_ms.lock().unwrap() / 1000) as i64
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance_ms(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, FakeClock};

    #[test]
    fn fake_clock_advances_on_sleep() {
        let c = FakeClock::at(100);
        assert_eq!(c.epoch(), 100);
        c.sleep_ms(2500);
        assert_eq!(c.epoch(), 102);
        c.sleep_ms(500);
        assert_eq!(c.epoch(), 103);
    }
}
