//! Credential services for the Haven hosting runtime.
//!
//! - **Passwords**: PBKDF2-HMAC-SHA256 with a configurable round count
//! - **Tokens**: compact three-part HMAC-SHA256 signed tokens
//! - **Short codes**: time-limited one-shot login codes
//! - **Throttle**: per-user login attempt counting with lockout

pub mod code;
pub mod password;
pub mod throttle;
pub mod token;

pub use code::{check_code, gen_code, ShortCode};
pub use password::{check_pw, create_pw};
pub use throttle::{AttemptKind, Throttle};
pub use token::{extract, TokenService};
