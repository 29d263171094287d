//! The request pipeline.
//!
//! Context construction, body parse, rewrites, authentication, ordered
//! route dispatch, response serialization and the error funnel. Within a
//! request everything runs strictly in chain order; middleware hands
//! control onward by returning [`Outcome::Next`].

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use haven_auth::{check_code, check_pw, AttemptKind};
use haven_common::HttpError;
use http::{Method, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use serde_json::{json, Value};
use std::io::Write as _;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use crate::body;
use crate::context::{AuthKind, RequestCtx};
use crate::router::Route;
use crate::scope::SiteScope;

/// Response body type shared by buffered and streamed responses.
pub type RespBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// A middleware's verdict on a request.
pub enum Outcome {
    /// Serialize this payload as JSON.
    Json(Value),
    /// An already-constructed content response.
    Content(ContentResponse),
    /// Status-only response, no body.
    Status(u16),
    /// Decline; the router tries the next matching route.
    Next,
}

/// Typed response a content middleware builds itself.
pub struct ContentResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ContentBody,
}

pub enum ContentBody {
    Bytes(Bytes),
    Stream(RespBody),
}

/// One link of a site's middleware chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut RequestCtx, scope: &SiteScope)
        -> Result<Outcome, HttpError>;
}

pub fn full_body(bytes: impl Into<Bytes>) -> RespBody {
    Full::new(bytes.into())
        .map_err(|e: std::convert::Infallible| match e {})
        .boxed_unsync()
}

pub fn empty_body() -> RespBody {
    full_body(Bytes::new())
}

/// Stream a file in 64 KiB frames, counting bytes for the log.
pub fn stream_file(file: tokio::fs::File, path: PathBuf) -> RespBody {
    let state = (Some(file), path, 0u64);
    let stream = futures::stream::unfold(state, |(file, path, sent)| async move {
        let mut file = file?;
        let mut buf = vec![0u8; 64 * 1024];
        match file.read(&mut buf).await {
            Ok(0) => {
                debug!(bytes = sent, path = %path.display(), "file stream complete");
                None
            }
            Ok(n) => {
                buf.truncate(n);
                let sent = sent + n as u64;
                Some((Ok(Frame::data(Bytes::from(buf))), (Some(file), path, sent)))
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "file stream failed");
                Some((Err(e), (None, path, sent)))
            }
        }
    });
    StreamBody::new(stream).boxed_unsync()
}

/// Stream a file gzipped on the fly. The length is unknown up front, so
/// the response goes out chunked.
pub fn stream_file_gzip(file: tokio::fs::File, path: PathBuf) -> RespBody {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let state = (Some((file, encoder)), path, 0u64);
    let stream = futures::stream::unfold(state, |(inner, path, sent)| async move {
        let (mut file, mut encoder) = inner?;
        loop {
            let mut buf = vec![0u8; 64 * 1024];
            match file.read(&mut buf).await {
                Ok(0) => {
                    return match encoder.finish() {
                        Ok(tail) => {
                            let sent = sent + tail.len() as u64;
                            debug!(bytes = sent, path = %path.display(), "gzip stream complete");
                            if tail.is_empty() {
                                None
                            } else {
                                Some((Ok(Frame::data(Bytes::from(tail))), (None, path, sent)))
                            }
                        }
                        Err(e) => Some((Err(e), (None, path, sent))),
                    };
                }
                Ok(n) => {
                    if let Err(e) = encoder.write_all(&buf[..n]) {
                        return Some((Err(e), (None, path, sent)));
                    }
                    let ready = std::mem::take(encoder.get_mut());
                    if ready.is_empty() {
                        continue;
                    }
                    let sent = sent + ready.len() as u64;
                    return Some((
                        Ok(Frame::data(Bytes::from(ready))),
                        (Some((file, encoder)), path, sent),
                    ));
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "file stream failed");
                    return Some((Err(e), (None, path, sent)));
                }
            }
        }
    });
    StreamBody::new(stream).boxed_unsync()
}

/// Process one request end to end.
pub async fn run<B>(
    scope: &SiteScope,
    routes: &[Route],
    req: http::Request<B>,
    remote: SocketAddr,
) -> Response<RespBody>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();
    let mut ctx = RequestCtx::new(parts.method, &parts.uri, parts.headers, remote);

    let response = match handle(scope, routes, &mut ctx, body).await {
        Ok(outcome) => respond(scope, &ctx, outcome),
        Err(err) => funnel(scope, &ctx, err),
    };

    // Temp files not moved by a middleware die with the request.
    let leftovers: Vec<PathBuf> = ctx.temp_files.drain(..).collect();
    if !leftovers.is_empty() {
        tokio::spawn(async move {
            for path in leftovers {
                let _ = tokio::fs::remove_file(path).await;
            }
        });
    }

    response
}

async fn handle<B>(
    scope: &SiteScope,
    routes: &[Route],
    ctx: &mut RequestCtx,
    body: B,
) -> Result<Outcome, HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    if ctx.content_type.is_some()
        || matches!(ctx.method, Method::POST | Method::PUT | Method::PATCH)
    {
        let (parsed, temps) = body::parse(ctx.content_type.as_deref(), body, &scope.limits).await?;
        ctx.body = parsed;
        ctx.temp_files.extend(temps);
    }

    apply_rewrites(scope, ctx);
    authenticate(scope, ctx)?;

    for route in routes {
        if !route.verb_match(&ctx.method) {
            continue;
        }
        let Some(params) = route.path_match(&ctx.url.pathname) else {
            continue;
        };
        ctx.params = params;
        match route.handler.handle(ctx, scope).await? {
            Outcome::Next => continue,
            outcome => return Ok(outcome),
        }
    }
    Err(HttpError::not_found(ctx.url.pathname.clone()))
}

/// Ordered regex rewrites over the path; a change replaces the parsed
/// pieces and is logged.
fn apply_rewrites(scope: &SiteScope, ctx: &mut RequestCtx) {
    for (pattern, replace) in &scope.rewrites {
        let rewritten = pattern
            .replace(&ctx.url.pathname, replace.as_str())
            .into_owned();
        if rewritten != ctx.url.pathname {
            info!(from = %ctx.url.pathname, to = %rewritten, "url rewritten");
            ctx.url.pathname = rewritten;
        }
    }
}

/// Resolve the `Authorization` header into `ctx.user`. Absence is not an
/// error; a present-but-bad credential is.
fn authenticate(scope: &SiteScope, ctx: &mut RequestCtx) -> Result<(), HttpError> {
    let Some(header) = ctx.header("authorization").map(str::to_string) else {
        return Ok(());
    };

    if let Some(encoded) = header.strip_prefix("Basic ") {
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| HttpError::bad_request("malformed Basic authorization"))?;
        let text = String::from_utf8(decoded)
            .map_err(|_| HttpError::bad_request("malformed Basic authorization"))?;
        let (username, password) = text
            .split_once(':')
            .ok_or_else(|| HttpError::bad_request("malformed Basic authorization"))?;
        let username = username.to_lowercase();

        scope.throttle.check(&username)?;

        let denied = |kind| {
            scope.throttle.record(&username, kind);
            warn!(user = %username, "authentication failed");
            HttpError::unauthorized("Authentication failed")
        };

        let Some(record) = scope.find_user(&username) else {
            return Err(denied(AttemptKind::FailBasic));
        };
        if record.get("status").and_then(Value::as_str) != Some("ACTIVE") {
            return Err(denied(AttemptKind::FailBasic));
        }

        let credentials = record.get("credentials").cloned().unwrap_or(json!({}));
        let hash = credentials.get("hash").and_then(Value::as_str).unwrap_or("");
        let passcode = credentials.get("passcode").cloned().unwrap_or(json!({}));

        let kind = if check_pw(password, hash) {
            AttemptKind::Basic
        } else if check_code(password, &passcode) {
            AttemptKind::Code
        } else {
            return Err(denied(AttemptKind::FailBasic));
        };

        scope.throttle.record(&username, kind);
        ctx.user = SiteScope::public_profile(&record);
        ctx.auth = AuthKind::Basic;
        return Ok(());
    }

    if let Some(token) = header.strip_prefix("Bearer ") {
        let payload = scope
            .tokens
            .verify_token(token.trim())
            .ok_or_else(|| HttpError::unauthorized("Invalid token"))?;
        ctx.user = SiteScope::public_profile(&payload);
        ctx.auth = AuthKind::Bearer;
        return Ok(());
    }

    Err(HttpError::bad_request("unsupported authorization scheme"))
}

/// Serialize a middleware outcome into an HTTP response.
fn respond(scope: &SiteScope, ctx: &RequestCtx, outcome: Outcome) -> Response<RespBody> {
    let response = match outcome {
        Outcome::Json(payload) => {
            let payload = if ctx.debug {
                ctx.debug_view(&payload)
            } else {
                payload
            };
            json_response(StatusCode::OK, &payload)
        }
        Outcome::Status(code) => Response::builder()
            .status(StatusCode::from_u16(code).unwrap_or(StatusCode::NO_CONTENT))
            .body(empty_body())
            .expect("static response builds"),
        Outcome::Content(content) => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(content.status).unwrap_or(StatusCode::OK));
            for (name, value) in &content.headers {
                builder = builder.header(name, value);
            }
            let result = match content.body {
                ContentBody::Bytes(bytes) => builder
                    .header(http::header::CONTENT_LENGTH, bytes.len())
                    .body(full_body(bytes)),
                ContentBody::Stream(stream) => builder.body(stream),
            };
            match result {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "content response build failed");
                    return funnel(scope, ctx, HttpError::internal("response build failed"));
                }
            }
        }
        // The router never returns Next; treat a stray one as a miss.
        Outcome::Next => return funnel(scope, ctx, HttpError::not_found("no route")),
    };

    finish(scope, ctx, response)
}

/// Map an error into the canonical envelope, honoring the 404 redirect
/// rewrite and the status-only rule for sub-400 codes.
fn funnel(scope: &SiteScope, ctx: &RequestCtx, err: HttpError) -> Response<RespBody> {
    let code = err.code();

    if code == 404 {
        if let Some((pattern, replace)) = &scope.redirect {
            let target = pattern
                .replace(&ctx.url.pathname, replace.as_str())
                .into_owned();
            if target != ctx.url.pathname {
                info!(from = %ctx.url.pathname, to = %target, "redirecting missing page");
                let response = Response::builder()
                    .status(StatusCode::MOVED_PERMANENTLY)
                    .header(http::header::LOCATION, target)
                    .body(empty_body())
                    .expect("static response builds");
                return finish(scope, ctx, response);
            }
        }
    }

    if code < 400 {
        let response = Response::builder()
            .status(StatusCode::from_u16(code).unwrap_or(StatusCode::NO_CONTENT))
            .body(empty_body())
            .expect("static response builds");
        return finish(scope, ctx, response);
    }

    if code >= 500 {
        error!(code, error = %err, path = %ctx.url.pathname, "request failed");
    } else {
        debug!(code, error = %err, path = %ctx.url.pathname, "request refused");
    }

    let mut envelope = err.envelope();
    if ctx.debug {
        envelope = ctx.debug_view(&envelope);
    }
    let response = json_response(
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        &envelope,
    );
    finish(scope, ctx, response)
}

/// Apply site default headers and the context's accumulated headers, then
/// strip the body for HEAD.
fn finish(
    scope: &SiteScope,
    ctx: &RequestCtx,
    mut response: Response<RespBody>,
) -> Response<RespBody> {
    for (name, value) in scope.headers.iter().chain(ctx.resp_headers.iter()) {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::header::HeaderValue::try_from(value.as_str()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    if ctx.method == Method::HEAD {
        let (parts, _) = response.into_parts();
        return Response::from_parts(parts, empty_body());
    }
    response
}

fn json_response(status: StatusCode, payload: &Value) -> Response<RespBody> {
    let bytes = serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(http::header::CONTENT_LENGTH, bytes.len())
        .body(full_body(bytes))
        .expect("static response builds")
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_auth::TokenService;
    use haven_config::LimitsConfig;

    fn scope() -> SiteScope {
        SiteScope::new(
            "test",
            LimitsConfig::default(),
            TokenService::new(Some("secret"), 3600, true),
        )
    }

    fn ctx(path: &str) -> RequestCtx {
        RequestCtx::new(
            Method::GET,
            &path.parse().unwrap(),
            http::HeaderMap::new(),
            "127.0.0.1:9999".parse().unwrap(),
        )
    }

    #[test]
    fn funnel_emits_the_canonical_envelope() {
        let scope = scope();
        let ctx = ctx("/missing");
        let response = funnel(&scope, &ctx, HttpError::not_found("no such page"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[http::header::CONTENT_TYPE],
            "application/json"
        );
    }

    #[test]
    fn funnel_redirects_404_when_configured() {
        let mut scope = scope();
        scope.redirect = Some((
            regex::Regex::new("^/old/(.*)$").unwrap(),
            "/new/$1".to_string(),
        ));
        let ctx = ctx("/old/page.html");
        let response = funnel(&scope, &ctx, HttpError::not_found("miss"));
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[http::header::LOCATION], "/new/page.html");
    }

    #[test]
    fn sub_400_codes_are_status_only() {
        let scope = scope();
        let ctx = ctx("/x");
        let response = funnel(&scope, &ctx, HttpError::Status(204));
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn site_headers_are_applied() {
        let mut scope = scope();
        scope
            .headers
            .push(("x-powered-by".to_string(), "haven".to_string()));
        let ctx = ctx("/x");
        let response = respond(&scope, &ctx, Outcome::Json(json!({"ok": true})));
        assert_eq!(response.headers()["x-powered-by"], "haven");
    }

    #[test]
    fn head_responses_have_no_body() {
        let scope = scope();
        let mut ctx = ctx("/x");
        ctx.method = Method::HEAD;
        let response = respond(&scope, &ctx, Outcome::Json(json!({"ok": true})));
        // Content-Length survives; the payload does not.
        assert!(response.headers().contains_key(http::header::CONTENT_LENGTH));
    }
}
