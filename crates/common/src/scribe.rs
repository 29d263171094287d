//! The scribe: process-wide log verbosity mask.
//!
//! Log output itself goes through `tracing`; the scribe holds the mutable
//! verbosity mask that the `@scribe` action reads and adjusts at runtime.
//! Lifecycle: initialized on first site start, lives for the process.

use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

/// Verbosity bits, combinable into a mask.
pub const ERROR: u32 = 1;
pub const WARN: u32 = 1 << 1;
pub const INFO: u32 = 1 << 2;
pub const DEBUG: u32 = 1 << 3;

const DEFAULT_MASK: u32 = ERROR | WARN | INFO;

/// Process-wide scribe singleton.
pub static SCRIBE: Lazy<Scribe> = Lazy::new(Scribe::new);

/// Runtime-adjustable verbosity mask.
pub struct Scribe {
    mask: AtomicU32,
}

impl Scribe {
    fn new() -> Self {
        Self {
            mask: AtomicU32::new(DEFAULT_MASK),
        }
    }

    pub fn mask(&self) -> u32 {
        self.mask.load(Ordering::Relaxed)
    }

    pub fn set_mask(&self, mask: u32) {
        self.mask.store(mask, Ordering::Relaxed);
    }

    pub fn enabled(&self, bit: u32) -> bool {
        self.mask() & bit != 0
    }
}

/// Install the global tracing subscriber. Idempotent: later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
