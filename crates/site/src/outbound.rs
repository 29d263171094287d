//! Outbound mail and SMS collaborators.
//!
//! The runtime talks to SendGrid and Twilio over HTTPS; both are behind
//! traits so sites without credentials get a refusing stub and tests get
//! mocks. Provider responses pass through unchanged into action reports.

use async_trait::async_trait;
use haven_common::HttpError;
use haven_config::{MailConfig, SmsConfig};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// One outbound email.
#[derive(Debug, Clone, Default)]
pub struct MailMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub from: Option<String>,
    pub subject: String,
    pub text: String,
}

/// Email transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, msg: &MailMessage) -> Result<Value, HttpError>;
}

/// SMS transport.
#[async_trait]
pub trait Texter: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<Value, HttpError>;
}

/// SendGrid v3 mail send.
pub struct SendGrid {
    client: reqwest::Client,
    api_key: String,
    from: String,
}

impl SendGrid {
    pub fn new(cfg: &MailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: cfg.api_key.clone(),
            from: cfg.from.clone(),
        }
    }
}

#[async_trait]
impl Mailer for SendGrid {
    async fn send(&self, msg: &MailMessage) -> Result<Value, HttpError> {
        let addresses = |list: &[String]| -> Vec<Value> {
            list.iter().map(|a| json!({"email": a})).collect()
        };
        let mut personalization = json!({"to": addresses(&msg.to)});
        if !msg.cc.is_empty() {
            personalization["cc"] = Value::Array(addresses(&msg.cc));
        }
        if !msg.bcc.is_empty() {
            personalization["bcc"] = Value::Array(addresses(&msg.bcc));
        }
        let payload = json!({
            "personalizations": [personalization],
            "from": {"email": msg.from.clone().unwrap_or_else(|| self.from.clone())},
            "subject": msg.subject,
            "content": [{"type": "text/plain", "value": msg.text}],
        });

        let response = self
            .client
            .post("https://api.sendgrid.com/v3/mail/send")
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| HttpError::upstream("mail dispatch failed", e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            warn!(%status, "sendgrid refused the message");
            return Err(HttpError::upstream(
                "mail dispatch failed",
                format!("sendgrid status {status}: {body}"),
            ));
        }
        debug!(recipients = msg.to.len(), "mail dispatched");
        Ok(json!({"status": status.as_u16(), "response": body}))
    }
}

/// Twilio Messages API.
pub struct Twilio {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from: String,
}

impl Twilio {
    pub fn new(cfg: &SmsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid: cfg.account_sid.clone(),
            auth_token: cfg.auth_token.clone(),
            from: cfg.from.clone(),
        }
    }
}

#[async_trait]
impl Texter for Twilio {
    async fn send(&self, to: &str, body: &str) -> Result<Value, HttpError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );
        let params = [("To", to), ("From", self.from.as_str()), ("Body", body)];

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| HttpError::upstream("sms dispatch failed", e.to_string()))?;

        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            warn!(%status, "twilio refused the message");
            return Err(HttpError::upstream(
                "sms dispatch failed",
                format!("twilio status {status}: {payload}"),
            ));
        }
        debug!(to, "sms dispatched");
        Ok(payload)
    }
}

/// Stand-in for sites without mail credentials.
pub struct NoMailer;

#[async_trait]
impl Mailer for NoMailer {
    async fn send(&self, _msg: &MailMessage) -> Result<Value, HttpError> {
        Err(HttpError::NotImplemented("mail transport not configured".into()))
    }
}

/// Stand-in for sites without SMS credentials.
pub struct NoTexter;

#[async_trait]
impl Texter for NoTexter {
    async fn send(&self, _to: &str, _body: &str) -> Result<Value, HttpError> {
        Err(HttpError::NotImplemented("sms transport not configured".into()))
    }
}
