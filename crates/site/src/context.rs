//! Per-request context.
//!
//! One [`RequestCtx`] is built for each request and destroyed after the
//! response. It carries the parsed request, the recognized user, the
//! authorization predicate, the response-header accumulator and the
//! routing cursor the pipeline advances.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use http::{HeaderMap, Method};
use serde_json::{json, Map, Value};

use crate::body::ParsedBody;

/// Parsed pieces of the request URL.
#[derive(Debug, Clone, Default)]
pub struct UrlParts {
    /// `scheme://host`.
    pub origin: String,
    /// `host[:port]` as sent by the client.
    pub host: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub pathname: String,
    /// Raw query string including the leading `?`, or empty.
    pub search: String,
    pub query: HashMap<String, String>,
}

/// How the request authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    None,
    Basic,
    Bearer,
}

impl AuthKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Bearer => "bearer",
        }
    }
}

/// Client transport address, overridden by `X-Forwarded-For`.
#[derive(Debug, Clone)]
pub struct Remote {
    pub ip: String,
    pub port: u16,
}

/// Per-request state threaded through the middleware chain.
pub struct RequestCtx {
    pub method: Method,
    pub url: UrlParts,
    pub headers: HeaderMap,
    pub remote: Remote,
    pub content_type: Option<String>,
    pub body: ParsedBody,

    /// Recognized user record, without credentials. Empty object when
    /// unauthenticated.
    pub user: Value,
    pub auth: AuthKind,

    /// Verbose error payload, enabled by a trailing `!` on the URL.
    pub debug: bool,

    /// Named params extracted by the matched route.
    pub params: HashMap<String, String>,

    /// Response headers accumulated by middleware.
    pub resp_headers: Vec<(String, String)>,

    /// Temp files created for this request; removed after the response
    /// unless a middleware took ownership.
    pub temp_files: Vec<PathBuf>,

    /// Scratch space middleware may share down the chain.
    pub state: Map<String, Value>,
}

impl RequestCtx {
    /// Build a context from the request head. The trailing-`!` debug flag
    /// is consumed here, before routing sees the path.
    pub fn new(method: Method, uri: &http::Uri, headers: HeaderMap, remote: SocketAddr) -> Self {
        let mut pathname = uri.path().to_string();
        let mut debug = false;
        if let Some(stripped) = pathname.strip_suffix('!') {
            debug = true;
            pathname = if stripped.is_empty() {
                "/".into()
            } else {
                stripped.to_string()
            };
        }

        let search = uri
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();
        let query: HashMap<String, String> = uri
            .query()
            .map(|q| serde_urlencoded::from_str(q).unwrap_or_default())
            .unwrap_or_default();

        let host = headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();
        let (hostname, port) = match host.rsplit_once(':') {
            Some((name, p)) => match p.parse::<u16>() {
                Ok(p) => (name.to_string(), Some(p)),
                Err(_) => (host.clone(), None),
            },
            None => (host.clone(), None),
        };
        let proto = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        let origin = format!("{proto}://{host}");

        let ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| remote.ip().to_string());
        let content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Self {
            method,
            url: UrlParts {
                origin,
                host,
                hostname,
                port,
                pathname,
                search,
                query,
            },
            headers,
            remote: Remote {
                ip,
                port: remote.port(),
            },
            content_type,
            body: ParsedBody::Empty,
            user: json!({}),
            auth: AuthKind::None,
            debug,
            params: HashMap::new(),
            resp_headers: Vec::new(),
            temp_files: Vec::new(),
            state: Map::new(),
        }
    }

    pub fn authenticated(&self) -> bool {
        self.auth != AuthKind::None
    }

    pub fn username(&self) -> Option<&str> {
        self.user.get("username").and_then(Value::as_str)
    }

    /// True when the user's groups intersect `allowed`, or the user is an
    /// admin.
    pub fn authorize(&self, allowed: &[impl AsRef<str>]) -> bool {
        let Some(member) = self.user.get("member").and_then(Value::as_array) else {
            return false;
        };
        member.iter().filter_map(Value::as_str).any(|group| {
            group == "admin" || allowed.iter().any(|a| a.as_ref() == group)
        })
    }

    pub fn is_admin(&self) -> bool {
        self.user
            .get("member")
            .and_then(Value::as_array)
            .map(|m| m.iter().any(|g| g == "admin"))
            .unwrap_or(false)
    }

    /// A request header as text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Accumulate a response header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.resp_headers.push((name.into(), value.into()));
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Whole-context snapshot for debug-flagged responses.
    pub fn debug_view(&self, payload: &Value) -> Value {
        json!({
            "method": self.method.as_str(),
            "url": {
                "origin": self.url.origin,
                "host": self.url.host,
                "hostname": self.url.hostname,
                "port": self.url.port,
                "pathname": self.url.pathname,
                "search": self.url.search,
                "query": self.url.query,
            },
            "remote": {"ip": self.remote.ip, "port": self.remote.port},
            "auth": self.auth.as_str(),
            "user": self.user,
            "params": self.params,
            "state": self.state,
            "payload": payload,
        })
    }
}
