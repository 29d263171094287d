//! Built-in middlewares.
//!
//! Analytics and CORS run at the head of every route table; login and
//! account are appended for auth-enabled sites; content serves the static
//! tree.

pub mod account;
pub mod content;

use async_trait::async_trait;
use haven_auth::extract;
use haven_common::{HttpError, REGISTRY};
use haven_config::CorsConfig;
use serde_json::{json, Value};
use tracing::debug;

use crate::context::{AuthKind, RequestCtx};
use crate::pipeline::{Middleware, Outcome};
use crate::scope::SiteScope;

pub use account::AccountWare;
pub use content::ContentWare;

/// Counts requests into the `ip`, `page` and `user` analytics namespaces,
/// then always continues the chain.
pub struct AnalyticsWare;

#[async_trait]
impl Middleware for AnalyticsWare {
    async fn handle(
        &self,
        ctx: &mut RequestCtx,
        _scope: &SiteScope,
    ) -> Result<Outcome, HttpError> {
        REGISTRY.bump_analytics("ip", &ctx.remote.ip);
        REGISTRY.bump_analytics("page", &ctx.url.pathname);
        REGISTRY.bump_analytics("user", ctx.username().unwrap_or("-"));
        Ok(Outcome::Next)
    }
}

/// Origin allowlist with preflight handling.
pub struct CorsWare {
    origins: Vec<String>,
    headers: String,
    methods: String,
    credentials: bool,
}

impl CorsWare {
    pub fn new(cfg: &CorsConfig) -> Self {
        Self {
            origins: cfg.origins.clone(),
            headers: cfg.headers.clone(),
            methods: cfg.methods.clone(),
            credentials: cfg.credentials,
        }
    }
}

#[async_trait]
impl Middleware for CorsWare {
    async fn handle(
        &self,
        ctx: &mut RequestCtx,
        _scope: &SiteScope,
    ) -> Result<Outcome, HttpError> {
        let Some(origin) = ctx.header("origin").map(str::to_string) else {
            return Ok(Outcome::Next);
        };
        if !self.origins.iter().any(|o| o == &origin) {
            debug!(%origin, "origin refused");
            return Err(HttpError::forbidden("origin not allowed"));
        }

        ctx.set_header("Access-Control-Allow-Origin", origin);
        ctx.set_header("Access-Control-Expose-Headers", "*");

        if ctx.method == http::Method::OPTIONS {
            ctx.set_header("Access-Control-Allow-Methods", self.methods.clone());
            ctx.set_header("Access-Control-Allow-Headers", self.headers.clone());
            if self.credentials {
                ctx.set_header("Access-Control-Allow-Credentials", "true");
            }
            return Ok(Outcome::Status(204));
        }
        Ok(Outcome::Next)
    }
}

/// `/login` and `/logout`.
///
/// Login mints a fresh token carrying the caller's public profile and
/// repeats it in the `Authorization` response header. A bearer caller may
/// only do this when token renewal is enabled.
pub struct LoginWare;

#[async_trait]
impl Middleware for LoginWare {
    async fn handle(&self, ctx: &mut RequestCtx, scope: &SiteScope) -> Result<Outcome, HttpError> {
        if ctx.url.pathname == "/logout" {
            return Ok(Outcome::Json(json!({})));
        }

        if !ctx.authenticated() {
            return Err(HttpError::unauthorized("Authentication required"));
        }
        if ctx.auth == AuthKind::Bearer && !scope.tokens.renewal() {
            return Err(HttpError::unauthorized("Token renewal requires login"));
        }

        // A bearer profile still carries the old token's claim stamps.
        let mut profile = ctx.user.clone();
        if let Some(map) = profile.as_object_mut() {
            map.remove("iat");
            map.remove("exp");
            map.remove("ext");
        }

        let token = scope.tokens.create_token(&profile, None);
        let payload = extract(&token)
            .map(|(_, payload, _)| payload)
            .unwrap_or(Value::Null);

        ctx.set_header("Authorization", format!("Bearer {token}"));
        debug!(user = ?ctx.username(), "token minted");
        Ok(Outcome::Json(json!({"token": token, "payload": payload})))
    }
}
