//! Site scope: the services one site's middleware chain runs against.
//!
//! Factories receive the scope explicitly instead of reaching for
//! per-module globals; everything here is shared by reference across the
//! site's concurrent requests.

use std::collections::HashMap;
use std::sync::Arc;

use std::path::PathBuf;

use haven_auth::{Throttle, TokenService};
use haven_config::{ContentConfig, LimitsConfig};
use haven_store::Store;
use regex::Regex;
use serde_json::Value;

use crate::cache::FileCache;
use crate::outbound::{Mailer, NoMailer, NoTexter, Texter};

/// Shared state for one site.
pub struct SiteScope {
    pub name: String,
    pub limits: LimitsConfig,

    /// Default response headers, site layered over shared.
    pub headers: Vec<(String, String)>,

    /// Databases by name; `users` is the user directory.
    pub databases: HashMap<String, Arc<Store>>,

    pub tokens: TokenService,
    pub throttle: Throttle,
    pub mailer: Arc<dyn Mailer>,
    pub texter: Arc<dyn Texter>,
    pub cache: Arc<FileCache>,

    /// PBKDF2 rounds for newly hashed passwords.
    pub rounds: u32,

    /// URL rewrites applied after body parse, in order.
    pub rewrites: Vec<(Regex, String)>,

    /// 404 redirect rewrite.
    pub redirect: Option<(Regex, String)>,

    /// Number texted when a Twilio status webhook reports `undelivered`.
    pub sms_callback: Option<String>,

    /// Default static content root, when the site has one.
    pub content_root: Option<PathBuf>,

    /// Static content options shared by the site's content handlers.
    pub content_cfg: ContentConfig,
}

impl SiteScope {
    /// A bare scope with stub transports; callers fill in the rest.
    pub fn new(name: impl Into<String>, limits: LimitsConfig, tokens: TokenService) -> Self {
        let cache_max = 1024 * 1024;
        Self {
            name: name.into(),
            limits,
            headers: Vec::new(),
            databases: HashMap::new(),
            tokens,
            throttle: Throttle::new(),
            mailer: Arc::new(NoMailer),
            texter: Arc::new(NoTexter),
            cache: Arc::new(FileCache::new(None, cache_max, None)),
            rounds: 2048,
            rewrites: Vec::new(),
            redirect: None,
            sms_callback: None,
            content_root: None,
            content_cfg: ContentConfig::default(),
        }
    }

    pub fn db(&self, name: &str) -> Option<Arc<Store>> {
        self.databases.get(name).cloned()
    }

    /// The user directory.
    pub fn users(&self) -> Option<Arc<Store>> {
        self.db("users")
    }

    /// Look up a user record by (lowercase) username.
    pub fn find_user(&self, username: &str) -> Option<Value> {
        let users = self.users()?;
        users
            .find("users", "username", &Value::String(username.to_string()))
            .map(|(_, record)| record)
    }

    /// A user record as it may leave the process: everything except
    /// `credentials`.
    pub fn public_profile(record: &Value) -> Value {
        let mut profile = record.clone();
        if let Some(map) = profile.as_object_mut() {
            map.remove("credentials");
        }
        profile
    }
}
