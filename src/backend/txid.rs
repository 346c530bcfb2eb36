//! Transaction id allocation
//!
//! Ids generated here never collide with terminal-originated ids (all below
//! 2000), and the two server-side spaces are separate constants so no generator
//! can stray into the other's range.

use std::ops::Range;
use std::sync::atomic::{AtomicU16, Ordering};

/// Ids for packets core sends toward terminals.
pub const CORE_TRANSACTION_IDS: Range<u16> = 2000..3000;

/// Ids for envelopes exchanged with the site process.
pub const SITE_TRANSACTION_IDS: Range<u16> = 3000..4000;

/// Wrapping id generator over a fixed range.
#[derive(Debug)]
pub struct TransactionIds {
    range: Range<u16>,
    offset: AtomicU16,
}

impl TransactionIds {
    fn over(range: Range<u16>) -> Self {
        debug_assert!(!range.is_empty());
        Self { range, offset: AtomicU16::new(0) }
    }

    pub fn core() -> Self {
        Self::over(CORE_TRANSACTION_IDS)
    }

    pub fn site() -> Self {
        Self::over(SITE_TRANSACTION_IDS)
    }

    pub fn range(&self) -> Range<u16> {
        self.range.clone()
    }

    pub fn next(&self) -> u16 {
        let span = self.range.end - self.range.start;
        let offset = match self
            .offset
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |o| Some((o + 1) % span))
        {
            Ok(prev) | Err(prev) => prev,
        };
        self.range.start + offset
    }
}
