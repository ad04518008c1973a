//! Message id generation
//!
//! Ids are wall-clock time in 100ns units, bumped when two callers land on
//! the same tick so every id handed out by one process is unique and
//! strictly increasing.

use std::sync::atomic::{AtomicI64, Ordering};

pub struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    pub const fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    pub fn next(&self) -> i64 {
        let now = now_ticks();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = if now > last { now } else { last + 1 };
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: IdGenerator = IdGenerator::new();

/// Next process-wide message id
pub fn next_id() -> i64 {
    GLOBAL.next()
}

fn now_ticks() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|ns| ns / 100)
        .unwrap_or_default()
}
