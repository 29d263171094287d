//! Recipe-driven API middleware.
//!
//! One middleware handles the whole `/<prefix><recipe>[/opts…]` scheme:
//! `$` runs data recipes against the bound database, `@` dispatches
//! actions (grant, scribe, mail, text, twilio) and `!` serves info.
//! Paths without a recognized prefix fall through to the next route.

use async_trait::async_trait;
use haven_auth::gen_code;
use haven_common::{HttpError, REGISTRY, SCRIBE};
use haven_store::{apply_filter, ModifyEntry, Store};
use serde_json::{json, Map, Value};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::RequestCtx;
use crate::outbound::MailMessage;
use crate::pipeline::{ContentBody, ContentResponse, Middleware, Outcome};
use crate::scope::SiteScope;

const GRANT_CODE_SIZE: usize = 6;
const GRANT_CODE_BASE: u32 = 36;
/// Grant expirations clamp to one week.
const GRANT_EXP_CAP_MIN: i64 = 7 * 24 * 60;

const XML_EMPTY: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response/>"#;
const XML_NO_REPLIES: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    "<Response><Message>This number does not take replies.</Message></Response>",
);

pub struct ApiWare {
    pub database: String,
}

#[async_trait]
impl Middleware for ApiWare {
    async fn handle(&self, ctx: &mut RequestCtx, scope: &SiteScope) -> Result<Outcome, HttpError> {
        let segments: Vec<String> = ctx
            .url
            .pathname
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let Some(first) = segments.first() else {
            return Ok(Outcome::Next);
        };
        let prefix = first.chars().next().unwrap_or(' ');
        if !matches!(prefix, '$' | '@' | '!') {
            return Ok(Outcome::Next);
        }
        let recipe = first[prefix.len_utf8()..].to_string();
        if recipe.is_empty() {
            return Err(HttpError::bad_request("missing recipe name"));
        }
        let opts = &segments[1..];

        let db = scope.db(&self.database).ok_or_else(|| {
            HttpError::internal(format!("database `{}` not attached", self.database))
        })?;

        match prefix {
            '$' => self.data(ctx, scope, &db, &recipe, opts),
            '@' => self.action(ctx, scope, &recipe, opts).await,
            '!' => self.info(ctx, scope, &recipe),
            _ => unreachable!(),
        }
    }
}

impl ApiWare {
    /// `$recipe`: GET queries, POST modifies.
    fn data(
        &self,
        ctx: &mut RequestCtx,
        _scope: &SiteScope,
        db: &Arc<Store>,
        name: &str,
        opts: &[String],
    ) -> Result<Outcome, HttpError> {
        let recipe = db
            .lookup(name)
            .ok_or_else(|| HttpError::NotImplemented(format!("no recipe `{name}`")))?;
        if let Some(groups) = &recipe.auth {
            if !ctx.authorize(groups) {
                return Err(HttpError::unauthorized("not permitted"));
            }
        }

        match ctx.method {
            http::Method::GET | http::Method::HEAD => {
                let mut bindings = Map::new();
                for (key, value) in &ctx.url.query {
                    bindings.insert(key.clone(), json!(value));
                }
                for (i, opt) in opts.iter().enumerate() {
                    bindings.insert(i.to_string(), json!(opt));
                }
                let mut result = db.query(&recipe, &bindings);
                if let Some(filter) = &recipe.filter {
                    result = apply_filter(&result, filter);
                }
                Ok(Outcome::Json(result))
            }
            http::Method::POST => {
                let Some(Value::Array(raw_entries)) = ctx.body.as_json() else {
                    return Err(HttpError::bad_request(
                        "body must be a list of {ref, record}",
                    ));
                };
                let mut entries = Vec::with_capacity(raw_entries.len());
                for raw in raw_entries {
                    let mut entry: ModifyEntry = serde_json::from_value(raw)
                        .map_err(|e| HttpError::bad_request(format!("bad entry: {e}")))?;
                    if let Some(filter) = &recipe.filter {
                        if let Some(record) = entry.record.take() {
                            entry.record = Some(apply_filter(&record, filter));
                        }
                    }
                    entries.push(entry);
                }
                let ops = db.modify(&recipe, &entries)?;
                Ok(Outcome::Json(Value::Array(ops)))
            }
            _ => Err(HttpError::MethodNotAllowed),
        }
    }

    /// `@recipe`: actions. POST-only except the Twilio webhook.
    async fn action(
        &self,
        ctx: &mut RequestCtx,
        scope: &SiteScope,
        name: &str,
        opts: &[String],
    ) -> Result<Outcome, HttpError> {
        if name == "twilio" {
            return self.twilio(ctx, scope, opts).await;
        }
        if ctx.method != http::Method::POST {
            return Err(HttpError::MethodNotAllowed);
        }
        match name {
            "grant" => self.grant(ctx, scope, opts).await,
            "scribe" => self.scribe(ctx),
            "mail" => self.mail(ctx, scope).await,
            "text" => self.text(ctx, scope).await,
            other => Err(HttpError::NotImplemented(format!("no action `{other}`"))),
        }
    }

    /// Issue login codes to a list of users and dispatch them.
    async fn grant(
        &self,
        ctx: &mut RequestCtx,
        scope: &SiteScope,
        opts: &[String],
    ) -> Result<Outcome, HttpError> {
        if !ctx.authenticated() {
            return Err(HttpError::unauthorized("Authentication required"));
        }
        if !ctx.authorize(&["grant"]) {
            return Err(HttpError::forbidden("not permitted"));
        }
        let users = scope
            .users()
            .ok_or_else(|| HttpError::NotImplemented("no user directory".into()))?;

        let body = ctx.body.as_json().unwrap_or(json!({}));
        let names: Vec<String> = match body.get("to") {
            Some(Value::Array(list)) => list
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.to_lowercase())
                .collect(),
            Some(Value::String(one)) => vec![one.to_lowercase()],
            _ => return Err(HttpError::bad_request("missing `to` user list")),
        };
        let exp_min = body
            .get("exp")
            .and_then(Value::as_i64)
            .unwrap_or(GRANT_EXP_CAP_MIN)
            .clamp(1, GRANT_EXP_CAP_MIN);
        let by_mail = opts.first().map(String::as_str) == Some("mail");

        let recipe = haven_store::Recipe {
            name: "grant".into(),
            collection: Some("users".into()),
            reference: Some("$.users[?username==$ref]".into()),
            ..Default::default()
        };

        let mut report = Vec::new();
        for username in names {
            let Some(record) = scope.find_user(&username) else {
                report.push(json!({"user": username, "ok": false, "error": "unknown user"}));
                continue;
            };
            let code = gen_code(GRANT_CODE_SIZE, GRANT_CODE_BASE, exp_min);
            users.modify(
                &recipe,
                &[ModifyEntry {
                    reference: Some(json!(username)),
                    record: Some(json!({"credentials": {"passcode": code}})),
                }],
            )?;

            let text = format!("Your login code: {}", code.code);
            let sent = if by_mail {
                match record.get("email").and_then(Value::as_str) {
                    Some(email) => {
                        scope
                            .mailer
                            .send(&MailMessage {
                                to: vec![email.to_string()],
                                subject: "Login code".into(),
                                text,
                                ..Default::default()
                            })
                            .await
                    }
                    None => Err(HttpError::bad_request("no email on record")),
                }
            } else {
                match record.get("phone").and_then(Value::as_str) {
                    Some(phone) => scope.texter.send(phone, &text).await,
                    None => Err(HttpError::bad_request("no phone on record")),
                }
            };

            match sent {
                Ok(response) => {
                    info!(user = %username, by_mail, "grant code dispatched");
                    report.push(json!({"user": username, "ok": true, "report": response}));
                }
                Err(e) => {
                    warn!(user = %username, error = %e, "grant dispatch failed");
                    report.push(json!({"user": username, "ok": false, "error": e.msg()}));
                }
            }
        }
        Ok(Outcome::Json(Value::Array(report)))
    }

    /// Get or set the scribe verbosity mask.
    fn scribe(&self, ctx: &mut RequestCtx) -> Result<Outcome, HttpError> {
        if !ctx.authenticated() {
            return Err(HttpError::unauthorized("Authentication required"));
        }
        if !ctx.authorize(&["server"]) {
            return Err(HttpError::forbidden("not permitted"));
        }
        if let Some(mask) = ctx
            .body
            .as_json()
            .and_then(|b| b.get("mask").and_then(Value::as_u64))
        {
            SCRIBE.set_mask(mask as u32);
            info!(mask, "scribe mask adjusted");
        }
        Ok(Outcome::Json(json!({"mask": SCRIBE.mask()})))
    }

    async fn mail(&self, ctx: &mut RequestCtx, scope: &SiteScope) -> Result<Outcome, HttpError> {
        if !ctx.authenticated() {
            return Err(HttpError::unauthorized("Authentication required"));
        }
        if !ctx.authorize(&["contact"]) {
            return Err(HttpError::forbidden("not permitted"));
        }
        let body = ctx
            .body
            .as_json()
            .ok_or_else(|| HttpError::bad_request("mail body required"))?;

        let translate = |key: &str| -> Vec<String> {
            list_of(&body, key)
                .into_iter()
                .map(|entry| contact_of(scope, &entry, "email"))
                .collect()
        };
        let msg = MailMessage {
            to: translate("to"),
            cc: translate("cc"),
            bcc: translate("bcc"),
            from: body
                .get("from")
                .and_then(Value::as_str)
                .map(|f| contact_of(scope, f, "email")),
            subject: body
                .get("subject")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            text: body
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        };
        if msg.to.is_empty() {
            return Err(HttpError::bad_request("missing `to` recipients"));
        }

        let report = scope.mailer.send(&msg).await?;
        Ok(Outcome::Json(json!({"sent": msg.to.len(), "report": report})))
    }

    async fn text(&self, ctx: &mut RequestCtx, scope: &SiteScope) -> Result<Outcome, HttpError> {
        if !ctx.authenticated() {
            return Err(HttpError::unauthorized("Authentication required"));
        }
        if !ctx.authorize(&["contact"]) {
            return Err(HttpError::forbidden("not permitted"));
        }
        let body = ctx
            .body
            .as_json()
            .ok_or_else(|| HttpError::bad_request("text body required"))?;
        let message = body
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| HttpError::bad_request("missing `text`"))?
            .to_string();
        let to = list_of(&body, "to");
        if to.is_empty() {
            return Err(HttpError::bad_request("missing `to` recipients"));
        }

        let mut report = Vec::new();
        for entry in to {
            let number = contact_of(scope, &entry, "phone");
            match scope.texter.send(&number, &message).await {
                Ok(response) => report.push(json!({"to": entry, "ok": true, "report": response})),
                Err(e) => report.push(json!({"to": entry, "ok": false, "error": e.msg()})),
            }
        }
        Ok(Outcome::Json(Value::Array(report)))
    }

    /// Twilio webhook. Status callbacks for undelivered messages raise an
    /// operator SMS; everything else gets quiet XML.
    async fn twilio(
        &self,
        ctx: &mut RequestCtx,
        scope: &SiteScope,
        opts: &[String],
    ) -> Result<Outcome, HttpError> {
        if opts.first().map(String::as_str) != Some("status") {
            return Ok(xml_response(XML_NO_REPLIES));
        }
        let body = ctx.body.as_json().unwrap_or(json!({}));
        let status = body
            .get("MessageStatus")
            .and_then(Value::as_str)
            .unwrap_or("");
        if status == "undelivered" {
            let to = body.get("To").and_then(Value::as_str).unwrap_or("?");
            warn!(to, "twilio reports an undelivered message");
            if let Some(callback) = &scope.sms_callback {
                let note = format!("Message to {to} undelivered");
                if let Err(e) = scope.texter.send(callback, &note).await {
                    warn!(error = %e, "undelivered-callback SMS failed");
                }
            }
        }
        Ok(xml_response(XML_EMPTY))
    }

    /// `!recipe`: info endpoints, GET only.
    fn info(&self, ctx: &mut RequestCtx, scope: &SiteScope, name: &str) -> Result<Outcome, HttpError> {
        if !matches!(ctx.method, http::Method::GET | http::Method::HEAD) {
            return Err(HttpError::MethodNotAllowed);
        }
        let now = chrono::Utc::now();

        if name == "iot" {
            return Ok(Outcome::Json(json!({
                "ip": ctx.remote.ip,
                "time": now.timestamp_millis(),
                "iso": now.to_rfc3339(),
            })));
        }

        let (v4, v6) = match ctx.remote.ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => (Some(ip.to_string()), Some(format!("::ffff:{ip}"))),
            Ok(IpAddr::V6(ip)) => (
                ip.to_ipv4_mapped().map(|v4| v4.to_string()),
                Some(ip.to_string()),
            ),
            Err(_) => (None, None),
        };
        let mut out = json!({
            "ip": {
                "raw": ctx.remote.ip,
                "v4": v4,
                "v6": v6,
                "port": ctx.remote.port,
            },
            "date": {
                "iso": now.to_rfc3339(),
                "unix": now.timestamp(),
                "ms": now.timestamp_millis(),
            },
        });

        if ctx.authorize(&["server"]) {
            out["statistics"] = REGISTRY.statistics_snapshot();
            out["analytics"] = REGISTRY.analytics_snapshot();
            out["blacklist"] = REGISTRY.blacklist_snapshot();
            out["logins"] = scope.throttle.history();
        }
        Ok(Outcome::Json(out))
    }
}

fn xml_response(xml: &str) -> Outcome {
    Outcome::Content(ContentResponse {
        status: 200,
        headers: vec![("Content-Type".into(), "text/xml".into())],
        body: ContentBody::Bytes(bytes::Bytes::from(xml.to_string())),
    })
}

/// A `to`/`cc`/`bcc` field as a list of strings.
fn list_of(body: &Value, key: &str) -> Vec<String> {
    match body.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(one)) => vec![one.clone()],
        _ => Vec::new(),
    }
}

/// Translate a username through the user directory; unknown names pass
/// through as literal addresses.
fn contact_of(scope: &SiteScope, entry: &str, field: &str) -> String {
    scope
        .find_user(&entry.to_lowercase())
        .and_then(|record| {
            record
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| entry.to_string())
}
