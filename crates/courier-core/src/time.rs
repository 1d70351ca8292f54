//! Clock abstraction for deterministic scheduling.
//!
//! Rate windows, backoff schedules and secret-rotation expiry all read time
//! through `Clock`, so tests can jump minutes or days ahead without sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, TimeZone, Utc};

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    ///
    /// `RealClock` maps this to `tokio::time::sleep`; `TestClock` advances
    /// virtual time and yields.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Current wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Production clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same timeline, so a clock handed to the engine can be
/// advanced from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Microseconds since the Unix epoch.
    micros: Arc<AtomicI64>,
    base_instant: Instant,
    base_micros: i64,
}

impl TestClock {
    /// Creates a test clock frozen at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock frozen at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        let micros = start.timestamp_micros();
        Self {
            micros: Arc::new(AtomicI64::new(micros)),
            base_instant: Instant::now(),
            base_micros: micros,
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        let delta = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(delta, Ordering::AcqRel);
    }

    /// Moves the clock forward by whole minutes.
    pub fn advance_minutes(&self, minutes: u64) {
        self.advance(Duration::from_secs(minutes * 60));
    }

    /// Sets the clock to `time`. Monotonic reads clamp to the creation
    /// instant if `time` is earlier than the starting point.
    pub fn set(&self, time: DateTime<Utc>) {
        self.micros.store(time.timestamp_micros(), Ordering::Release);
    }

    /// Virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        let delta = self.micros.load(Ordering::Acquire) - self.base_micros;
        Duration::from_micros(u64::try_from(delta).unwrap_or(0))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::from(self.now_utc())
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_micros(self.micros.load(Ordering::Acquire))
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}
