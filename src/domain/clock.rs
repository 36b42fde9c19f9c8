use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time for timestamps, rates and inactivity checks.
pub trait Clock: std::fmt::Debug + Send + Sync {
    fn get_current_time_in_s(&self) -> i64 {
        self.get_current_time_in_ms() / 1000
    }

    fn get_current_time_in_ms(&self) -> i64;
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn get_current_time_in_ms(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as i64
    }
}

/// Settable clock shared between a test and the scheduler it drives.
#[derive(Debug, Clone)]
pub struct MockClock {
    time_ms: Arc<RwLock<i64>>,
}

impl MockClock {
    pub fn new(time_s: i64) -> Self {
        MockClock { time_ms: Arc::new(RwLock::new(time_s * 1000)) }
    }

    pub fn set_time_in_s(&self, time_s: i64) {
        *self.time_ms.write().unwrap_or_else(|e| e.into_inner()) = time_s * 1000;
    }

    pub fn advance_s(&self, seconds: i64) {
        *self.time_ms.write().unwrap_or_else(|e| e.into_inner()) += seconds * 1000;
    }
}

impl Clock for MockClock {
    fn get_current_time_in_ms(&self) -> i64 {
        *self.time_ms.read().unwrap_or_else(|e| e.into_inner())
    }
}
