//! Login-attempt throttling.
//!
//! Every attempt is recorded into a bounded history. Failures increment a
//! per-user counter inside a rolling 10-minute window anchored at the first
//! failure; more than three failures lock the account until the window
//! passes. Any success clears the counter and anchor.

use std::collections::VecDeque;

use dashmap::DashMap;
use haven_common::HttpError;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::warn;

const WINDOW_SECS: i64 = 600;
const MAX_FAILURES: u32 = 3;
const HISTORY_LEN: usize = 100;

/// How a login attempt was made, and whether it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Basic,
    Bearer,
    Code,
    FailBasic,
    FailBearer,
    FailCode,
}

impl AttemptKind {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::FailBasic | Self::FailBearer | Self::FailCode)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Bearer => "bearer",
            Self::Code => "code",
            Self::FailBasic => "fail-basic",
            Self::FailBearer => "fail-bearer",
            Self::FailCode => "fail-code",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    anchor: i64,
}

/// Thread-safe attempt recorder and lockout gate.
pub struct Throttle {
    windows: DashMap<String, Window>,
    history: Mutex<VecDeque<Value>>,
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

impl Throttle {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    /// Gate an attempt before credentials are checked. A locked account
    /// fails here regardless of credential correctness, and the window
    /// advances so hammering keeps the lock alive.
    pub fn check(&self, user: &str) -> Result<(), HttpError> {
        let now = chrono::Utc::now().timestamp();
        let Some(mut entry) = self.windows.get_mut(user) else {
            return Ok(());
        };
        if now - entry.anchor >= WINDOW_SECS {
            entry.count = 0;
            entry.anchor = now;
            return Ok(());
        }
        if entry.count > MAX_FAILURES {
            entry.anchor = now;
            warn!(user, "login attempt while locked");
            return Err(HttpError::unauthorized("Account locked"));
        }
        Ok(())
    }

    /// Record an attempt. Failures advance the per-user counter; successes
    /// clear it.
    pub fn record(&self, user: &str, kind: AttemptKind) {
        let now = chrono::Utc::now().timestamp();
        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(json!({
                "user": user,
                "kind": kind.as_str(),
                "at": now,
            }));
        }

        if kind.is_failure() {
            let mut entry = self.windows.entry(user.to_string()).or_insert(Window {
                count: 0,
                anchor: now,
            });
            if now - entry.anchor >= WINDOW_SECS {
                entry.count = 0;
                entry.anchor = now;
            }
            entry.count += 1;
        } else {
            self.windows.remove(user);
        }
    }

    /// Recent attempts, oldest first.
    pub fn history(&self) -> Value {
        Value::Array(self.history.lock().iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifth_attempt_locks_after_four_failures() {
        let throttle = Throttle::new();
        for _ in 0..4 {
            assert!(throttle.check("bob").is_ok());
            throttle.record("bob", AttemptKind::FailBasic);
        }
        // Fifth attempt is refused before credentials are looked at.
        let err = throttle.check("bob").unwrap_err();
        assert_eq!(err, HttpError::unauthorized("Account locked"));
    }

    #[test]
    fn three_failures_do_not_lock() {
        let throttle = Throttle::new();
        for _ in 0..3 {
            throttle.record("bob", AttemptKind::FailBasic);
        }
        assert!(throttle.check("bob").is_ok());
    }

    #[test]
    fn success_clears_the_counter() {
        let throttle = Throttle::new();
        for _ in 0..4 {
            throttle.record("bob", AttemptKind::FailBasic);
        }
        assert!(throttle.check("bob").is_err());

        throttle.record("bob", AttemptKind::Basic);
        assert!(throttle.check("bob").is_ok());
    }

    #[test]
    fn users_are_isolated() {
        let throttle = Throttle::new();
        for _ in 0..4 {
            throttle.record("bob", AttemptKind::FailBasic);
        }
        assert!(throttle.check("alice").is_ok());
    }

    #[test]
    fn history_records_kinds() {
        let throttle = Throttle::new();
        throttle.record("bob", AttemptKind::FailBasic);
        throttle.record("bob", AttemptKind::Basic);
        let history = throttle.history();
        let entries = history.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["kind"], "fail-basic");
        assert_eq!(entries[1]["kind"], "basic");
    }
}
