use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// 时间来源：窗口到期判断全部基于它，测试里可替换为手动时钟。
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::Clock;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    /// 手动推进的时钟，clone 后共享同一时间点。
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            let start = Utc
                .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
                .single()
                .expect("valid start time");
            Self {
                now: Arc::new(Mutex::new(start)),
            }
        }

        pub fn advance_secs(&self, secs: i64) {
            let mut now = self.now.lock().expect("clock lock");
            *now += TimeDelta::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().expect("clock lock")
        }
    }
}
