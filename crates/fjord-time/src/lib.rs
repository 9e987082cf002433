//! Clock sources for the fjord broker client.
//!
//! Every timeout the client computes (refresh deadlines, command deadlines,
//! snapshot age) is read through a [`TimeProvider`]. Production code uses
//! [`SystemTimeProvider`]; tests use [`SimulatedTimeProvider`] (behind the
//! `simulation` feature) to pin the clock and move it forward explicitly,
//! so timeout behaviour is exercised without sleeping.
//!
//! # Panic Freedom
//!
//! Reading the wall clock never panics: a system clock set before the Unix
//! epoch reads as 0.

#[cfg(feature = "simulation")]
use std::sync::atomic::AtomicU64;
#[cfg(feature = "simulation")]
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Get current Unix timestamp in milliseconds.
#[inline]
pub fn current_time_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Get current Unix timestamp in seconds.
#[inline]
pub fn current_time_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Saturating conversion of a duration to whole milliseconds.
#[inline]
pub fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A source of "now" shared by every deadline computation in the client.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use fjord_time::{SystemTimeProvider, TimeProvider};
///
/// let clock = SystemTimeProvider;
/// let deadline = clock.deadline_after(Duration::from_secs(5));
/// assert!(!clock.is_past(deadline));
/// ```
pub trait TimeProvider: std::fmt::Debug + Send + Sync {
    /// Get current Unix timestamp in milliseconds.
    fn now_unix_ms(&self) -> u64;

    /// Get current Unix timestamp in seconds.
    fn now_unix_secs(&self) -> u64 {
        self.now_unix_ms() / 1000
    }

    /// Absolute deadline, in Unix milliseconds, `timeout` from now.
    fn deadline_after(&self, timeout: Duration) -> u64 {
        self.now_unix_ms().saturating_add(duration_to_ms(timeout))
    }

    /// Whether `deadline_ms` has been reached.
    fn is_past(&self, deadline_ms: u64) -> bool {
        self.now_unix_ms() >= deadline_ms
    }
}

/// Shared, type-erased clock handle as stored by client components.
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// The process-wide default clock.
pub fn system_clock() -> SharedTimeProvider {
    Arc::new(SystemTimeProvider)
}

/// Production time provider backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    #[inline]
    fn now_unix_ms(&self) -> u64 {
        current_time_ms()
    }

    #[inline]
    fn now_unix_secs(&self) -> u64 {
        current_time_secs()
    }
}

/// Time provider whose clock only moves when told to.
///
/// Clones share the same clock, so a test can keep one handle and give
/// another to the client.
///
/// ```ignore
/// use std::time::Duration;
/// use fjord_time::{SimulatedTimeProvider, TimeProvider};
///
/// let clock = SimulatedTimeProvider::new(1_000_000);
/// clock.advance(Duration::from_secs(6));
/// assert_eq!(clock.now_unix_ms(), 1_006_000);
/// ```
#[cfg(feature = "simulation")]
#[derive(Debug, Clone)]
pub struct SimulatedTimeProvider {
    current_time_ms: Arc<AtomicU64>,
}

#[cfg(feature = "simulation")]
impl SimulatedTimeProvider {
    /// Create a clock starting at the given timestamp.
    pub fn new(initial_time_ms: u64) -> Self {
        Self {
            current_time_ms: Arc::new(AtomicU64::new(initial_time_ms)),
        }
    }

    /// Pin the clock at the current wall-clock time.
    pub fn pinned() -> Self {
        Self::new(current_time_ms())
    }

    /// Advance time by the given number of milliseconds.
    pub fn advance_ms(&self, delta_ms: u64) {
        let _ = self.current_time_ms.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
            Some(now.saturating_add(delta_ms))
        });
    }

    /// Advance time by the given number of seconds.
    pub fn advance_secs(&self, delta_secs: u64) {
        self.advance_ms(delta_secs.saturating_mul(1000));
    }

    /// Advance time by a duration.
    pub fn advance(&self, delta: Duration) {
        self.advance_ms(duration_to_ms(delta));
    }

    /// Set the current time to a specific value.
    pub fn set_ms(&self, time_ms: u64) {
        self.current_time_ms.store(time_ms, Ordering::SeqCst);
    }

    /// Set the current time to a specific value in seconds.
    pub fn set_secs(&self, time_secs: u64) {
        self.set_ms(time_secs.saturating_mul(1000));
    }

    /// A type-erased handle sharing this clock.
    pub fn shared(&self) -> SharedTimeProvider {
        Arc::new(self.clone())
    }
}

#[cfg(feature = "simulation")]
impl Default for SimulatedTimeProvider {
    fn default() -> Self {
        Self::pinned()
    }
}

#[cfg(feature = "simulation")]
impl TimeProvider for SimulatedTimeProvider {
    #[inline]
    fn now_unix_ms(&self) -> u64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }
}
