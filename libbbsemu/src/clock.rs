use std::sync::Mutex;
use std::time::Instant;

use time::{OffsetDateTime, PrimitiveDateTime};

/// Time source handed to the timer device and the date/time services.
pub trait Clock: Send + Sync + std::fmt::Debug {
	/// Monotonic seconds since some fixed point, with a fractional part.
	fn current_tick(&self) -> f64;
	/// Local wall-clock time.
	fn now(&self) -> PrimitiveDateTime;
}

#[derive(Debug)]
pub struct SystemClock {
	started: Instant,
}

impl SystemClock {
	pub fn new() -> SystemClock {
		SystemClock { started: Instant::now() }
	}
}

impl Default for SystemClock {
	fn default() -> SystemClock {
		SystemClock::new()
	}
}

impl Clock for SystemClock {
	fn current_tick(&self) -> f64 {
		self.started.elapsed().as_secs_f64()
	}

	fn now(&self) -> PrimitiveDateTime {
		// The local offset can't always be determined (e.g. multithreaded on unix).
		let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
		PrimitiveDateTime::new(now.date(), now.time())
	}
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FakeClock {
	state: Mutex<(f64, PrimitiveDateTime)>,
}

impl FakeClock {
	pub fn new(tick: f64, now: PrimitiveDateTime) -> FakeClock {
		FakeClock { state: Mutex::new((tick, now)) }
	}

	pub fn set_tick(&self, tick: f64) {
		self.lock().0 = tick;
	}

	pub fn set_now(&self, now: PrimitiveDateTime) {
		self.lock().1 = now;
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, (f64, PrimitiveDateTime)> {
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}
}

impl Clock for FakeClock {
	fn current_tick(&self) -> f64 {
		self.lock().0
	}

	fn now(&self) -> PrimitiveDateTime {
		self.lock().1
	}
}
