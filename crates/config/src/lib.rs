//! Configuration schema for the Haven hosting runtime.
//!
//! The configuration tree is one JSON document describing the proxies
//! (front-end listeners), the sites behind them, shared databases and
//! headers, token settings, body limits and outbound mail/SMS credentials.
//! Loading is a thin serde pass; validation happens where each value is
//! consumed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HavenConfig {
    /// Front-end listeners.
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,

    /// Site apps.
    #[serde(default)]
    pub sites: Vec<SiteConfig>,

    /// Databases shared by every site, by name.
    #[serde(default)]
    pub databases: HashMap<String, DatabaseConfig>,

    /// Default response headers shared by every site.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Signed-token settings.
    #[serde(default)]
    pub token: TokenConfig,

    /// Body-parsing ceilings and temp directory.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// SendGrid credentials, if outbound mail is enabled.
    #[serde(default)]
    pub mail: Option<MailConfig>,

    /// Twilio credentials, if outbound SMS is enabled.
    #[serde(default)]
    pub sms: Option<SmsConfig>,
}

impl HavenConfig {
    /// Load and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    /// The site owning `host`, by primary host or alias.
    pub fn site_for_host(&self, host: &str) -> Option<&SiteConfig> {
        self.sites
            .iter()
            .find(|s| s.host == host || s.aliases.iter().any(|a| a == host))
    }
}

/// One front-end listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// TCP port to listen on.
    pub port: u16,

    /// TLS material. Present = HTTPS listener, absent = plain HTTP.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Log and count unmatched hosts even from private addresses.
    #[serde(default)]
    pub verbose: bool,

    /// Names of the sites this proxy routes to. Empty = all sites.
    #[serde(default)]
    pub sites: Vec<String>,
}

/// Certificate bundle paths for an HTTPS listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// One site app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site name, referenced by proxies.
    pub name: String,

    /// Primary hostname.
    pub host: String,

    /// Backend port the site listens on.
    pub port: u16,

    /// Additional hostnames routed to this site.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Static content root. When set, a default open content handler is
    /// appended to the route table.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Enable the account and login middlewares.
    #[serde(default)]
    pub auth: bool,

    /// User-configured handlers, in route-table order.
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,

    /// Site response headers, layered over the shared headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Site-private databases, layered over the shared ones.
    #[serde(default)]
    pub databases: HashMap<String, DatabaseConfig>,

    /// CORS policy. Absent disables the CORS middleware.
    #[serde(default)]
    pub cors: Option<CorsConfig>,

    /// 404 redirect rewrite, e.g. `{"pattern": "^/old/(.*)", "replace": "/new/$1"}`.
    #[serde(default)]
    pub redirect: Option<RewriteRule>,

    /// URL rewrites applied after body parse, in order.
    #[serde(default)]
    pub rewrite: Vec<RewriteRule>,

    /// Static content options.
    #[serde(default)]
    pub content: ContentConfig,
}

/// One entry in a site's handler list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Handler code: `content`, `api`, or a custom registry name.
    pub code: String,

    /// Route pattern, Express style (`/files/:name`, `/*`).
    pub route: String,

    /// HTTP verb, `any` by default.
    #[serde(default = "default_any")]
    pub method: String,

    /// Database name for `api` handlers.
    #[serde(default)]
    pub database: Option<String>,

    /// Content root override for `content` handlers.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Groups permitted to GET through this handler. Absent = open.
    #[serde(default)]
    pub get_auth: Option<Vec<String>>,

    /// Groups permitted to POST through this handler. Absent = open.
    #[serde(default)]
    pub post_auth: Option<Vec<String>>,
}

/// Static content options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Directory index file name.
    #[serde(default = "default_index")]
    pub index: String,

    /// Allow HTML directory listings.
    #[serde(default)]
    pub indexing: bool,

    /// `Cache-Control` header value.
    #[serde(default = "default_cache_header")]
    pub cache_header: String,

    /// File extensions eligible for gzip.
    #[serde(default = "default_compress")]
    pub compress: Vec<String>,

    /// Per-entry payload ceiling; larger files are streamed.
    #[serde(default = "default_cache_max")]
    pub cache_max: u64,

    /// Optional global cache entry count.
    #[serde(default)]
    pub cache_limit: Option<usize>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            index: default_index(),
            indexing: false,
            cache_header: default_cache_header(),
            compress: default_compress(),
            cache_max: default_cache_max(),
            cache_limit: None,
        }
    }
}

/// CORS policy for a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins, exact match.
    pub origins: Vec<String>,

    /// `Access-Control-Allow-Headers` value for preflights.
    #[serde(default = "default_cors_headers")]
    pub headers: String,

    /// `Access-Control-Allow-Methods` value for preflights.
    #[serde(default = "default_cors_methods")]
    pub methods: String,

    /// Emit `Access-Control-Allow-Credentials: true`.
    #[serde(default)]
    pub credentials: bool,
}

/// A regex rewrite applied to the request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    pub pattern: String,
    pub replace: String,
}

/// One file-backed JSON database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the JSON store file.
    pub path: PathBuf,
}

/// Signed-token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// HMAC secret. Absent picks a 256-bit random value at process start,
    /// invalidating outstanding tokens on restart.
    #[serde(default)]
    pub secret: Option<String>,

    /// Token lifetime in seconds.
    #[serde(default = "default_token_exp")]
    pub exp_secs: u64,

    /// Whether a bearer token may mint a replacement via `/login`.
    #[serde(default = "default_true")]
    pub renewal: bool,

    /// PBKDF2 round count for password hashes.
    #[serde(default = "default_rounds")]
    pub rounds: u32,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            exp_secs: default_token_exp(),
            renewal: default_true(),
            rounds: default_rounds(),
        }
    }
}

/// Body-parsing ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Total in-memory body ceiling in bytes.
    #[serde(default = "default_request_max")]
    pub request_max: u64,

    /// Per-file upload ceiling in bytes.
    #[serde(default = "default_upload_max")]
    pub upload_max: u64,

    /// Directory for streamed upload temp files.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_max: default_request_max(),
            upload_max: default_upload_max(),
            temp_dir: default_temp_dir(),
            timeout_secs: default_timeout(),
        }
    }
}

/// SendGrid credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    pub api_key: String,
    pub from: String,
}

/// Twilio credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from: String,
    /// Number texted when Twilio reports an undelivered message.
    #[serde(default)]
    pub callback: Option<String>,
}

fn default_any() -> String {
    "any".into()
}
fn default_index() -> String {
    "index.html".into()
}
fn default_cache_header() -> String {
    "public, max-age=3600".into()
}
fn default_compress() -> Vec<String> {
    ["html", "css", "js", "mjs", "json", "svg", "txt", "xml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_cache_max() -> u64 {
    1024 * 1024
}
fn default_cors_headers() -> String {
    "Content-Type, Authorization".into()
}
fn default_cors_methods() -> String {
    "POST, GET, OPTIONS".into()
}
fn default_token_exp() -> u64 {
    604_800
}
fn default_true() -> bool {
    true
}
fn default_rounds() -> u32 {
    2048
}
fn default_request_max() -> u64 {
    1024 * 1024
}
fn default_upload_max() -> u64 {
    10 * 1024 * 1024
}
fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("haven")
}
fn default_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: HavenConfig = serde_json::from_str(
            r#"{
                "proxies": [{"port": 8443, "tls": {"cert": "c.pem", "key": "k.pem"}}],
                "sites": [{"name": "main", "host": "example.net", "port": 9000}]
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.proxies.len(), 1);
        assert!(cfg.proxies[0].tls.is_some());
        assert_eq!(cfg.sites[0].content.index, "index.html");
        assert_eq!(cfg.token.exp_secs, 604_800);
        assert!(cfg.token.renewal);
        assert_eq!(cfg.limits.upload_max, 10 * 1024 * 1024);
    }

    #[test]
    fn site_lookup_matches_aliases() {
        let cfg: HavenConfig = serde_json::from_str(
            r#"{
                "sites": [
                    {"name": "a", "host": "a.net", "port": 9000, "aliases": ["www.a.net"]},
                    {"name": "b", "host": "b.net", "port": 9001}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.site_for_host("a.net").unwrap().name, "a");
        assert_eq!(cfg.site_for_host("www.a.net").unwrap().name, "a");
        assert_eq!(cfg.site_for_host("b.net").unwrap().name, "b");
        assert!(cfg.site_for_host("c.net").is_none());
    }

    #[test]
    fn load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haven.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(HavenConfig::load(&path).is_err());
    }
}
