use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};

use crate::shutdown::StopSignal;

const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Wall clock and blocking waits used by the measurement run.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;

    /// Blocks for `duration`. Returns `false` if `stop` was raised first.
    fn pause(&mut self, duration: Duration, stop: &StopSignal) -> bool;

    /// Uninterruptible wait, for delays the device needs before the next command.
    fn settle(&mut self, duration: Duration) {
        self.pause(duration, &StopSignal::new());
    }
}

/// Local time, sleeping in short slices so an interrupt is noticed quickly.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn pause(&mut self, duration: Duration, stop: &StopSignal) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if stop.is_raised() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use crate::devices::mock::{Event, EventLog};
    use chrono::NaiveDate;

    /// Virtual time: pauses return immediately and advance `now`.
    /// Raises the stop signal once `pauses_before_stop` pauses have elapsed.
    pub struct FakeClock {
        now: NaiveDateTime,
        log: EventLog,
        stop_after: Option<(usize, StopSignal)>,
        pauses: usize,
    }

    impl FakeClock {
        pub fn new(log: EventLog) -> Self {
            let now = NaiveDate::from_ymd_opt(2024, 3, 1)
                .and_then(|d| d.and_hms_opt(12, 0, 0))
                .expect("valid start time");
            FakeClock {
                now,
                log,
                stop_after: None,
                pauses: 0,
            }
        }

        pub fn stop_after(mut self, pauses: usize, stop: StopSignal) -> Self {
            self.stop_after = Some((pauses, stop));
            self
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> NaiveDateTime {
            self.now
        }

        fn pause(&mut self, duration: Duration, stop: &StopSignal) -> bool {
            if stop.is_raised() {
                return false;
            }
            self.log.borrow_mut().push(Event::Pause(duration));
            self.now += chrono::Duration::from_std(duration).expect("duration in range");
            self.pauses += 1;
            if let Some((limit, signal)) = &self.stop_after {
                if self.pauses >= *limit {
                    signal.raise();
                }
            }
            !stop.is_raised()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_pause_returns_early_when_stopped() {
        let stop = StopSignal::new();
        stop.raise();
        let started = Instant::now();
        assert!(!SystemClock.pause(Duration::from_secs(5), &stop));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn system_pause_waits_full_duration() {
        let stop = StopSignal::new();
        let started = Instant::now();
        assert!(SystemClock.pause(Duration::from_millis(60), &stop));
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
