//! Account management middleware: `/user/:action/:user?/:opt?`.
//!
//! Short-code issue and validation, the contact/group/name recipes, and
//! the `change`/`groups` mutation endpoints. All writes go through the
//! user directory's store so persistence and watches behave like any
//! other modify.

use async_trait::async_trait;
use haven_auth::{check_code, create_pw, gen_code, AttemptKind};
use haven_common::HttpError;
use haven_store::{apply_filter, ModifyEntry, Recipe, Store};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::RequestCtx;
use crate::outbound::MailMessage;
use crate::pipeline::{Middleware, Outcome};
use crate::scope::SiteScope;

const CODE_SIZE: usize = 6;
const CODE_BASE: u32 = 36;
const CODE_EXP_MIN: i64 = 15;

/// Internal recipe for the `users` collection.
fn users_recipe() -> Recipe {
    Recipe {
        name: "users".into(),
        collection: Some("users".into()),
        reference: Some("$.users[?username==$ref]".into()),
        defaults: Some(json!({
            "status": "PENDING",
            "member": [],
            "credentials": {},
        })),
        ..Default::default()
    }
}

/// Internal recipe for the `groups` collection.
fn groups_recipe() -> Recipe {
    Recipe {
        name: "groups".into(),
        collection: Some("groups".into()),
        reference: Some("$.groups[?name==$ref]".into()),
        ..Default::default()
    }
}

pub struct AccountWare;

#[async_trait]
impl Middleware for AccountWare {
    async fn handle(&self, ctx: &mut RequestCtx, scope: &SiteScope) -> Result<Outcome, HttpError> {
        let users = scope
            .users()
            .ok_or_else(|| HttpError::NotImplemented("no user directory".into()))?;
        let action = ctx
            .param("action")
            .ok_or_else(|| HttpError::bad_request("missing account action"))?
            .to_string();

        let method = if ctx.method == http::Method::HEAD {
            http::Method::GET
        } else {
            ctx.method.clone()
        };
        match (method, action.as_str()) {
            (http::Method::GET, "code") => self.send_code(ctx, scope, &users).await,
            (http::Method::GET, "contacts" | "groups" | "users") => {
                if !ctx.authenticated() {
                    return Err(HttpError::unauthorized("Authentication required"));
                }
                if !ctx.authorize(&["manager"]) {
                    return Err(HttpError::forbidden("not permitted"));
                }
                self.run_recipe(&users, &action)
            }
            (http::Method::GET, "names") => {
                if !ctx.authenticated() {
                    return Err(HttpError::unauthorized("Authentication required"));
                }
                self.run_recipe(&users, "names")
            }
            (http::Method::POST, "code") => self.validate_code(ctx, scope, &users),
            (http::Method::POST, "change") => self.change(ctx, scope, &users, false),
            (http::Method::POST, "groups") => self.change(ctx, scope, &users, true),
            (http::Method::GET | http::Method::HEAD | http::Method::POST, _) => {
                Err(HttpError::bad_request(format!(
                    "unknown account action `{action}`"
                )))
            }
            _ => Err(HttpError::MethodNotAllowed),
        }
    }
}

impl AccountWare {
    /// Run one of the directory recipes (`contacts`, `groups`, `users`,
    /// `names`), honoring its safe-data filter.
    fn run_recipe(&self, users: &Arc<Store>, name: &str) -> Result<Outcome, HttpError> {
        let recipe = users
            .lookup(name)
            .ok_or_else(|| HttpError::NotImplemented(format!("no recipe `{name}`")))?;
        let mut result = users.query(&recipe, &Map::new());
        if let Some(filter) = &recipe.filter {
            result = apply_filter(&result, filter);
        }
        Ok(Outcome::Json(result))
    }

    /// Issue a fresh short code and dispatch it by SMS (default) or email
    /// (`opt` present). The code itself is only echoed to managers.
    async fn send_code(
        &self,
        ctx: &mut RequestCtx,
        scope: &SiteScope,
        users: &Arc<Store>,
    ) -> Result<Outcome, HttpError> {
        let username = ctx
            .param("user")
            .ok_or_else(|| HttpError::bad_request("missing user"))?
            .to_lowercase();
        let record = scope
            .find_user(&username)
            .ok_or_else(|| HttpError::not_found(format!("no user `{username}`")))?;

        let code = gen_code(CODE_SIZE, CODE_BASE, CODE_EXP_MIN);
        users.modify(
            &users_recipe(),
            &[ModifyEntry {
                reference: Some(json!(username)),
                record: Some(json!({
                    "credentials": {"passcode": code},
                })),
            }],
        )?;

        let by_mail = ctx.param("opt").is_some();
        let text = format!("Your login code: {}", code.code);
        let dispatch = if by_mail {
            let email = record
                .get("email")
                .and_then(Value::as_str)
                .ok_or_else(|| HttpError::bad_request("no email on record"))?;
            scope
                .mailer
                .send(&MailMessage {
                    to: vec![email.to_string()],
                    subject: "Login code".into(),
                    text,
                    ..Default::default()
                })
                .await
        } else {
            let phone = record
                .get("phone")
                .and_then(Value::as_str)
                .ok_or_else(|| HttpError::bad_request("no phone on record"))?;
            scope.texter.send(phone, &text).await
        };
        let dispatch = dispatch?;

        info!(user = %username, by_mail, "login code issued");
        let mut out = json!({"user": username, "sent": true, "report": dispatch});
        if ctx.authorize(&["manager"]) {
            out["code"] = json!(code.code);
        }
        Ok(Outcome::Json(out))
    }

    /// Validate `POST /user/code/<user>/<code>`; a match on a PENDING
    /// account activates it.
    fn validate_code(
        &self,
        ctx: &mut RequestCtx,
        scope: &SiteScope,
        users: &Arc<Store>,
    ) -> Result<Outcome, HttpError> {
        let username = ctx
            .param("user")
            .ok_or_else(|| HttpError::bad_request("missing user"))?
            .to_lowercase();
        let challenge = ctx
            .param("opt")
            .ok_or_else(|| HttpError::bad_request("missing code"))?
            .to_string();

        scope.throttle.check(&username)?;
        let record = scope
            .find_user(&username)
            .ok_or_else(|| HttpError::not_found(format!("no user `{username}`")))?;
        let passcode = record
            .get("credentials")
            .and_then(|c| c.get("passcode"))
            .cloned()
            .unwrap_or(json!({}));

        if !check_code(&challenge, &passcode) {
            scope.throttle.record(&username, AttemptKind::FailCode);
            return Err(HttpError::unauthorized("Authentication failed"));
        }
        scope.throttle.record(&username, AttemptKind::Code);

        let mut status = record
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("PENDING")
            .to_string();
        if status == "PENDING" {
            status = "ACTIVE".into();
            users.modify(
                &users_recipe(),
                &[ModifyEntry {
                    reference: Some(json!(username)),
                    record: Some(json!({"status": "ACTIVE"})),
                }],
            )?;
            info!(user = %username, "account activated");
        }
        Ok(Outcome::Json(json!({"username": username, "status": status})))
    }

    /// Apply a `[{ref, record}…]` batch to the users or groups collection,
    /// emitting per-item `[op, ref, idx]`.
    fn change(
        &self,
        ctx: &mut RequestCtx,
        scope: &SiteScope,
        users: &Arc<Store>,
        groups: bool,
    ) -> Result<Outcome, HttpError> {
        if !ctx.authenticated() {
            return Err(HttpError::unauthorized("Authentication required"));
        }
        if groups && !ctx.is_admin() {
            return Err(HttpError::forbidden("group maintenance is admin-only"));
        }

        let Some(Value::Array(entries)) = ctx.body.as_json() else {
            return Err(HttpError::bad_request("body must be a list of {ref, record}"));
        };
        let recipe = if groups { groups_recipe() } else { users_recipe() };

        let mut ops = Vec::with_capacity(entries.len());
        for raw in entries {
            let entry: ModifyEntry = match serde_json::from_value(raw.clone()) {
                Ok(e) => e,
                Err(_) => {
                    ops.push(json!(["bad", null, null]));
                    continue;
                }
            };

            let entry = if groups {
                entry
            } else {
                match self.vet_user_entry(ctx, scope, entry) {
                    Ok(e) => e,
                    Err(op) => {
                        ops.push(op);
                        continue;
                    }
                }
            };

            ops.extend(users.modify(&recipe, &[entry])?);
        }
        Ok(Outcome::Json(Value::Array(ops)))
    }

    /// Per-entry permission and normalization rules for user changes.
    fn vet_user_entry(
        &self,
        ctx: &RequestCtx,
        scope: &SiteScope,
        mut entry: ModifyEntry,
    ) -> Result<ModifyEntry, Value> {
        let reference = entry.reference.clone().unwrap_or(Value::Null);

        let Some(record) = entry.record.as_mut() else {
            // Deletion is admin territory.
            if !ctx.is_admin() {
                warn!(caller = ?ctx.username(), "non-admin tried to delete a user");
                return Err(json!(["bad", reference, null]));
            }
            return Ok(entry);
        };

        let target = record
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_lowercase)
            .or_else(|| reference.as_str().map(str::to_lowercase));
        let own = match (&target, ctx.username()) {
            (Some(t), Some(me)) => t == me,
            _ => false,
        };
        if !own && !ctx.is_admin() {
            warn!(caller = ?ctx.username(), user = ?target, "user change refused");
            return Err(json!(["bad", reference, null]));
        }

        let map = match record.as_object_mut() {
            Some(m) => m,
            None => return Err(json!(["bad", reference, null])),
        };

        // Only admins steer membership and status.
        if !ctx.is_admin() {
            map.remove("member");
            map.remove("status");
        }
        if let Some(name) = target {
            map.insert("username".into(), json!(name));
        }

        // A plaintext password never reaches the store.
        let password = map.remove("password");
        if let Some(password) = password.as_ref().and_then(Value::as_str) {
            let hash = create_pw(password, scope.rounds);
            let creds = map
                .entry("credentials")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(creds) = creds.as_object_mut() {
                creds.insert("hash".into(), json!(hash));
            }
        }

        Ok(entry)
    }
}
