use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;

/// Hands out strictly increasing server timestamps with microsecond resolution
/// (the precision Postgres keeps for `timestamptz`).
///
/// Every persisted message takes its timestamp from one shared clock, so two
/// messages in the same conversation can never tie or go backwards even when
/// the wall clock does.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_micros: AtomicI64,
}

impl MonotonicClock {
    #[must_use]
    pub const fn new() -> Self {
        Self { last_micros: AtomicI64::new(0) }
    }

    pub fn now(&self) -> OffsetDateTime {
        let wall = wall_clock_micros();
        let mut last = self.last_micros.load(Ordering::Acquire);
        loop {
            let next = wall.max(last + 1);
            match self.last_micros.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return from_micros(next),
                Err(observed) => last = observed,
            }
        }
    }
}

fn wall_clock_micros() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

fn from_micros(micros: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000).unwrap_or_else(|_| OffsetDateTime::now_utc())
}
