//! Compact signed tokens.
//!
//! Three URL-safe-base64 parts without padding: `header.payload.signature`.
//! The header declares HMAC-SHA256; the payload is the caller's object
//! augmented with `iat` (unix seconds), `exp` (lifetime in seconds) and
//! `ext` (renewal flag); the signature is HMAC over `header.payload`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::{json, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Token mint/verify service bound to one secret.
pub struct TokenService {
    secret: Vec<u8>,
    exp_secs: u64,
    renewal: bool,
}

impl TokenService {
    /// Create a service. A `None` secret picks a 256-bit random value,
    /// which invalidates outstanding tokens on process restart.
    pub fn new(secret: Option<&str>, exp_secs: u64, renewal: bool) -> Self {
        let secret = match secret {
            Some(s) => s.as_bytes().to_vec(),
            None => {
                let mut buf = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut buf);
                buf
            }
        };
        Self {
            secret,
            exp_secs,
            renewal,
        }
    }

    /// Whether bearer-authenticated callers may mint replacement tokens.
    pub fn renewal(&self) -> bool {
        self.renewal
    }

    pub fn exp_secs(&self) -> u64 {
        self.exp_secs
    }

    /// Mint a token carrying `payload` plus `iat`/`exp`/`ext`.
    pub fn create_token(&self, payload: &Value, exp_secs: Option<u64>) -> String {
        let header = json!({"alg": "HS256", "typ": "JWT"});
        let mut claims = payload.clone();
        if !claims.is_object() {
            claims = json!({});
        }
        claims["iat"] = json!(chrono::Utc::now().timestamp());
        claims["exp"] = json!(exp_secs.unwrap_or(self.exp_secs));
        claims["ext"] = json!(self.renewal);

        let head = URL_SAFE_NO_PAD.encode(header.to_string());
        let body = URL_SAFE_NO_PAD.encode(claims.to_string());
        let sig = self.sign(&head, &body);
        format!("{head}.{body}.{sig}")
    }

    /// Verify signature and expiry; return the payload, or `None`.
    pub fn verify_token(&self, token: &str) -> Option<Value> {
        let (head, body, sig) = split(token)?;
        let expected = self.sign(head, body);
        if !constant_time_eq(sig.as_bytes(), expected.as_bytes()) {
            return None;
        }
        let payload: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(body).ok()?).ok()?;
        let iat = payload.get("iat")?.as_i64()?;
        let exp = payload.get("exp")?.as_i64()?;
        if chrono::Utc::now().timestamp() >= iat + exp {
            return None;
        }
        Some(payload)
    }

    fn sign(&self, head: &str, body: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(head.as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

/// Parse a token without validating it.
pub fn extract(token: &str) -> Option<(Value, Value, String)> {
    let (head, body, sig) = split(token)?;
    let header: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(head).ok()?).ok()?;
    let payload: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(body).ok()?).ok()?;
    Some((header, payload, sig.to_string()))
}

fn split(token: &str) -> Option<(&str, &str, &str)> {
    let mut parts = token.splitn(3, '.');
    let head = parts.next()?;
    let body = parts.next()?;
    let sig = parts.next()?;
    if head.is_empty() || body.is_empty() || sig.is_empty() {
        return None;
    }
    Some((head, body, sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_then_verify_roundtrips_payload() {
        let svc = TokenService::new(Some("top secret"), 3600, true);
        let token = svc.create_token(&json!({"username": "alice", "member": ["users"]}), None);

        let payload = svc.verify_token(&token).expect("token verifies");
        assert_eq!(payload["username"], "alice");
        assert_eq!(payload["member"], json!(["users"]));
        assert_eq!(payload["exp"], 3600);
        assert_eq!(payload["ext"], true);
        assert!(payload["iat"].as_i64().unwrap() > 0);
    }

    #[test]
    fn tampered_tokens_fail() {
        let svc = TokenService::new(Some("top secret"), 3600, true);
        let token = svc.create_token(&json!({"username": "alice"}), None);

        let mut forged = token.clone();
        forged.pop();
        forged.push('x');
        assert!(svc.verify_token(&forged).is_none());

        let other = TokenService::new(Some("different"), 3600, true);
        assert!(other.verify_token(&token).is_none());
    }

    #[test]
    fn expired_tokens_fail() {
        let svc = TokenService::new(Some("top secret"), 3600, true);
        let token = svc.create_token(&json!({"username": "alice"}), Some(0));
        assert!(svc.verify_token(&token).is_none());
    }

    #[test]
    fn extract_parses_without_validation() {
        let svc = TokenService::new(Some("top secret"), 60, false);
        let token = svc.create_token(&json!({"username": "bob"}), None);
        let (header, payload, sig) = extract(&token).unwrap();
        assert_eq!(header["alg"], "HS256");
        assert_eq!(payload["username"], "bob");
        assert_eq!(payload["ext"], false);
        assert!(!sig.is_empty());
    }

    #[test]
    fn tokens_are_url_safe() {
        let svc = TokenService::new(None, 60, true);
        let token = svc.create_token(&json!({"u": "x"}), None);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'));
    }
}
