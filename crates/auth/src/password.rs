//! Password hashing.
//!
//! PBKDF2-HMAC-SHA256 with a per-hash random salt. The round count is the
//! cost knob; hashes record their own rounds so the count can be raised
//! without invalidating existing credentials. Stored format:
//! `$pbkdf2-sha256$<rounds>$<salt-b64>$<hash-b64>` (URL-safe base64, no
//! padding).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Hash a password with `rounds` PBKDF2 iterations.
pub fn create_pw(password: &str, rounds: u32) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let derived = pbkdf2(password.as_bytes(), &salt, rounds);
    format!(
        "$pbkdf2-sha256${}${}${}",
        rounds,
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(derived),
    )
}

/// Verify a password against a stored hash. Malformed hashes verify false.
pub fn check_pw(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let ok = matches!(parts.next(), Some("")) && matches!(parts.next(), Some("pbkdf2-sha256"));
    if !ok {
        return false;
    }
    let Some(rounds) = parts.next().and_then(|r| r.parse::<u32>().ok()) else {
        return false;
    };
    let Some(salt) = parts.next().and_then(|s| URL_SAFE_NO_PAD.decode(s).ok()) else {
        return false;
    };
    let Some(expected) = parts.next().and_then(|h| URL_SAFE_NO_PAD.decode(h).ok()) else {
        return false;
    };
    let derived = pbkdf2(password.as_bytes(), &salt, rounds);
    constant_time_eq(&derived, &expected)
}

/// PBKDF2-HMAC-SHA256, single 32-byte block.
fn pbkdf2(password: &[u8], salt: &[u8], rounds: u32) -> [u8; HASH_LEN] {
    let rounds = rounds.max(1);
    let mut mac = HmacSha256::new_from_slice(password).expect("hmac accepts any key length");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u: [u8; HASH_LEN] = mac.finalize().into_bytes().into();
    let mut out = u;
    for _ in 1..rounds {
        let mut mac = HmacSha256::new_from_slice(password).expect("hmac accepts any key length");
        mac.update(&u);
        u = mac.finalize().into_bytes().into();
        for (o, b) in out.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let hash = create_pw("s3cret", 64);
        assert!(hash.starts_with("$pbkdf2-sha256$64$"));
        assert!(check_pw("s3cret", &hash));
        assert!(!check_pw("wrong", &hash));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let a = create_pw("same", 64);
        let b = create_pw("same", 64);
        assert_ne!(a, b);
        assert!(check_pw("same", &a));
        assert!(check_pw("same", &b));
    }

    #[test]
    fn malformed_hashes_verify_false() {
        assert!(!check_pw("pw", ""));
        assert!(!check_pw("pw", "plaintext"));
        assert!(!check_pw("pw", "$pbkdf2-sha256$notanumber$abc$def"));
        assert!(!check_pw("pw", "$bcrypt$10$abc$def"));
    }

    #[test]
    fn rounds_change_the_hash() {
        let salt = [7u8; 16];
        assert_ne!(pbkdf2(b"pw", &salt, 1), pbkdf2(b"pw", &salt, 2));
    }
}
