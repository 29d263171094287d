//! Short codes: time-limited one-shot login credentials.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A generated code with its issue time and lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShortCode {
    pub code: String,
    /// Unix seconds at generation.
    pub iat: i64,
    /// Lifetime in seconds.
    pub exp: i64,
}

/// Generate `size` uniformly random characters in base `base` (≤ 36),
/// expiring `exp_min` minutes from now.
pub fn gen_code(size: usize, base: u32, exp_min: i64) -> ShortCode {
    let base = base.clamp(2, 36) as usize;
    let mut rng = rand::thread_rng();
    let code = (0..size)
        .map(|_| ALPHABET[rng.gen_range(0..base)] as char)
        .collect();
    ShortCode {
        code,
        iat: chrono::Utc::now().timestamp(),
        exp: exp_min * 60,
    }
}

/// Compare a challenge against a stored passcode object `{code, iat, exp}`.
/// Missing fields or an elapsed lifetime fail the check.
pub fn check_code(challenge: &str, stored: &Value) -> bool {
    let Some(code) = stored.get("code").and_then(Value::as_str) else {
        return false;
    };
    let Some(iat) = stored.get("iat").and_then(Value::as_i64) else {
        return false;
    };
    let Some(exp) = stored.get("exp").and_then(Value::as_i64) else {
        return false;
    };
    code == challenge && chrono::Utc::now().timestamp() < iat + exp
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn codes_have_requested_size_and_base() {
        let sc = gen_code(8, 16, 15);
        assert_eq!(sc.code.len(), 8);
        assert!(sc.code.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sc.exp, 15 * 60);
    }

    #[test]
    fn check_accepts_fresh_matching_code() {
        let sc = gen_code(6, 36, 10);
        let stored = serde_json::to_value(&sc).unwrap();
        assert!(check_code(&sc.code, &stored));
        assert!(!check_code("nope", &stored));
    }

    #[test]
    fn check_rejects_expired_code() {
        let stored = json!({"code": "abc123", "iat": 0, "exp": 60});
        assert!(!check_code("abc123", &stored));
    }

    #[test]
    fn check_rejects_empty_passcode() {
        assert!(!check_code("abc123", &json!({})));
    }
}
