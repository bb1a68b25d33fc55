use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::services::credentials::{AuthError, TokenExchange};

const STATS_PATH: &str = "/transfer/stats";
const LOGIN_PATH: &str = "/auth/login-with-password";
const FIELD_PAID_BYTES: &str = "paid_bytes_provided";
const FIELD_UNPAID_BYTES: &str = "unpaid_bytes_provided";
const NOT_AUTHORIZED_MARKER: &str = "not authorized";
const ERROR_BODY_PREVIEW_CHARS: usize = 200;

/// Cumulative counters as reported by the account API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCounters {
    pub paid_bytes: i64,
    pub unpaid_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote rejected the token")]
    Unauthorized,
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("malformed stats response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait RemoteStatsClient: Send + Sync {
    async fn fetch(&self, token: &str) -> Result<TransferCounters, RemoteError>;
}

/// HTTP client for the account API: the stats endpoint and the password login exchange.
#[derive(Debug, Clone)]
pub struct BringYourClient {
    http: Client,
    api_base: String,
}

impl BringYourClient {
    pub fn new(http: Client, api_base: impl Into<String>) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self { http, api_base }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }
}

#[async_trait]
impl RemoteStatsClient for BringYourClient {
    async fn fetch(&self, token: &str) -> Result<TransferCounters, RemoteError> {
        let url = format!("{}{STATS_PATH}", self.api_base);
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header(ACCEPT, "*/*")
            .send()
            .await
            .map_err(|err| RemoteError::Unavailable(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RemoteError::Unavailable(err.to_string()))?;
        debug!(status = %status, bytes = body.len(), "transfer stats response received");
        classify_stats_response(status, &body)
    }
}

#[async_trait]
impl TokenExchange for BringYourClient {
    async fn exchange(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let url = format!("{}{LOGIN_PATH}", self.api_base);
        let response = self
            .http
            .post(url)
            .json(&json!({
                "user_auth": username,
                "password": password,
            }))
            .send()
            .await
            .map_err(|err| AuthError::ExchangeFailed(format!("login request failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| AuthError::ExchangeFailed(format!("login response unreadable: {err}")))?;
        if status.is_server_error() {
            return Err(AuthError::ExchangeFailed(format!(
                "login endpoint returned {status}"
            )));
        }
        parse_login_body(&body)
    }
}

pub(crate) fn classify_stats_response(
    status: StatusCode,
    body: &str,
) -> Result<TransferCounters, RemoteError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RemoteError::Unauthorized);
    }
    if !status.is_success() {
        return Err(RemoteError::Unavailable(format!(
            "stats endpoint returned {status}"
        )));
    }

    let value: JsonValue = serde_json::from_str(body)
        .map_err(|err| RemoteError::Malformed(format!("body is not JSON: {err}")))?;
    if value
        .get("message")
        .map(message_text)
        .is_some_and(|message| message.to_lowercase().contains(NOT_AUTHORIZED_MARKER))
    {
        return Err(RemoteError::Unauthorized);
    }

    Ok(TransferCounters {
        paid_bytes: counter_field(&value, FIELD_PAID_BYTES)?,
        unpaid_bytes: counter_field(&value, FIELD_UNPAID_BYTES)?,
    })
}

fn counter_field(value: &JsonValue, key: &str) -> Result<i64, RemoteError> {
    let field = value
        .get(key)
        .ok_or_else(|| RemoteError::Malformed(format!("missing field {key}")))?;
    match field.as_i64() {
        Some(count) if count >= 0 => Ok(count),
        Some(count) => Err(RemoteError::Malformed(format!(
            "field {key} is negative ({count})"
        ))),
        None => Err(RemoteError::Malformed(format!(
            "field {key} is not an integer byte count"
        ))),
    }
}

fn message_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn parse_login_body(body: &str) -> Result<String, AuthError> {
    let value: JsonValue = serde_json::from_str(body).map_err(|_| {
        AuthError::ExchangeFailed(format!("login failed: {}", preview(body)))
    })?;
    let token = value
        .get("network")
        .and_then(|network| network.get("by_jwt"))
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = token {
        return Ok(token.to_string());
    }

    let reason = ["message", "error"]
        .iter()
        .filter_map(|key| value.get(*key))
        .filter(|field| !field.is_null())
        .map(message_text)
        .find(|text| !text.trim().is_empty())
        .unwrap_or_else(|| preview(body));
    Err(AuthError::ExchangeFailed(format!("login failed: {reason}")))
}

fn preview(body: &str) -> String {
    body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect()
}
