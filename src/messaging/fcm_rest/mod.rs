//! Wire protocol of the checkin and registration backends.
//!
//! The token manager only sees the [`CheckinBackend`] and
//! [`RegistrationBackend`] traits; [`FcmClient`] is the HTTP implementation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messaging::constants::{
    IDENTITY_RESET_COMMAND, PARAM_INSTANCE_ID, SEC_MISSING_ENTITLEMENT_ERROR_CODE,
    TOKEN_OPTIONS_APNS_IS_SANDBOX_KEY, TOKEN_OPTIONS_APNS_KEY, TOKEN_OPTIONS_FIREBASE_APP_ID_KEY,
};
use crate::messaging::error::{
    entitlement_error, internal_error, registration_failed, server_error, MessagingResult,
    RegistrationFailure,
};
use crate::messaging::types::{Identity, TokenOptions};

mod native;
pub use native::FcmClient;

const CHECKIN_PROTOCOL_VERSION: u32 = 3;
const CHECKIN_DEVICE_TYPE: u32 = 2;
pub(crate) const AUTHORIZATION_SCHEME: &str = "AidLogin";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckinRequest {
    /// Previous identity, sent so the backend can renew instead of re-provisioning.
    pub previous: Option<Identity>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckinResponse {
    Identity(Identity),
    /// The backend asked the client to discard its identity.
    IdentityReset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub app_id: String,
    pub scope: String,
    pub identity: Identity,
    pub options: TokenOptions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationResponse {
    Token(String),
    IdentityReset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeletionResponse {
    Deleted,
    IdentityReset,
}

#[async_trait]
pub trait CheckinBackend: Send + Sync {
    async fn checkin(&self, request: &CheckinRequest) -> MessagingResult<CheckinResponse>;
}

#[async_trait]
pub trait RegistrationBackend: Send + Sync {
    async fn register(&self, request: &RegistrationRequest)
        -> MessagingResult<RegistrationResponse>;

    async fn unregister(&self, request: &RegistrationRequest) -> MessagingResult<DeletionResponse>;
}

#[derive(Serialize)]
struct CheckinRequestBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    security_token: Option<&'a str>,
    version: u32,
    checkin: CheckinDeviceBody,
}

#[derive(Serialize)]
struct CheckinDeviceBody {
    #[serde(rename = "type")]
    device_type: u32,
}

#[derive(Deserialize)]
struct CheckinResponseBody {
    #[serde(default)]
    android_id: Option<Value>,
    #[serde(default)]
    security_token: Option<Value>,
    #[serde(default)]
    time_msec: Option<u64>,
    #[serde(default)]
    ttl_secs: Option<u64>,
    #[serde(default)]
    command: Option<String>,
}

fn build_checkin_body(request: &CheckinRequest) -> CheckinRequestBody<'_> {
    CheckinRequestBody {
        id: request.previous.as_ref().map(|identity| identity.device_id.as_str()),
        security_token: request.previous.as_ref().map(|identity| identity.secret.as_str()),
        version: CHECKIN_PROTOCOL_VERSION,
        checkin: CheckinDeviceBody {
            device_type: CHECKIN_DEVICE_TYPE,
        },
    }
}

fn parse_checkin_body(bytes: &[u8]) -> MessagingResult<CheckinResponse> {
    let body: CheckinResponseBody = serde_json::from_slice(bytes)
        .map_err(|err| internal_error(format!("Invalid checkin response: {err}")))?;

    if body.command.as_deref() == Some(IDENTITY_RESET_COMMAND) {
        return Ok(CheckinResponse::IdentityReset);
    }

    let device_id = body
        .android_id
        .as_ref()
        .and_then(id_value)
        .ok_or_else(|| internal_error("Checkin response is missing the device id"))?;
    let secret = body
        .security_token
        .as_ref()
        .and_then(id_value)
        .ok_or_else(|| internal_error("Checkin response is missing the security token"))?;
    let last_checkin = body
        .time_msec
        .map(|ms| UNIX_EPOCH + Duration::from_millis(ms))
        .unwrap_or_else(SystemTime::now);

    Ok(CheckinResponse::Identity(Identity {
        device_id,
        secret,
        last_checkin,
        ttl: body.ttl_secs.map(Duration::from_secs),
    }))
}

/// Device ids are 64-bit integers that some backends emit as JSON numbers.
fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn registration_params(request: &RegistrationRequest, delete: bool) -> Vec<(String, String)> {
    let options = &request.options;
    let mut params: Vec<(String, String)> = vec![
        ("sender".into(), request.app_id.clone()),
        ("X-subtype".into(), request.app_id.clone()),
        ("scope".into(), request.scope.clone()),
        ("X-scope".into(), request.scope.clone()),
        ("device".into(), request.identity.device_id.clone()),
    ];
    if let Some(instance_id) = &options.instance_id {
        params.push((PARAM_INSTANCE_ID.into(), instance_id.clone()));
    }
    if let Some(firebase_app_id) = &options.firebase_app_id {
        params.push((TOKEN_OPTIONS_FIREBASE_APP_ID_KEY.into(), firebase_app_id.clone()));
    }
    if let Some(apns) = options.apns_request_value() {
        params.push((TOKEN_OPTIONS_APNS_KEY.into(), apns));
    }
    if let Some(sandbox) = options.apns_sandbox {
        let flag = if sandbox { "1" } else { "0" };
        params.push((TOKEN_OPTIONS_APNS_IS_SANDBOX_KEY.into(), flag.into()));
    }
    for (key, value) in &options.extras {
        params.push((key.clone(), value.clone()));
    }
    if delete {
        params.push(("delete".into(), "true".into()));
    }
    params
}

fn authorization_value(identity: &Identity) -> String {
    format!(
        "{} {}:{}",
        AUTHORIZATION_SCHEME, identity.device_id, identity.secret
    )
}

#[derive(Debug, PartialEq, Eq)]
enum RegistrationReply {
    Token(String),
    Deleted,
    IdentityReset,
}

/// Parses the `key=value` body returned by the registration backend.
fn parse_registration_body(status: u16, body: &str) -> MessagingResult<RegistrationReply> {
    let line = body.lines().next().unwrap_or_default().trim();

    if let Some(code) = line.strip_prefix("Error=") {
        return map_registration_error(status, code.trim());
    }

    let success = (200..300).contains(&status);
    if !success {
        if status == 429 {
            return Err(registration_failed(
                RegistrationFailure::RateLimited,
                "Registration backend is throttling requests",
            ));
        }
        return Err(server_error(
            status,
            format!("Registration request failed with status {status}"),
        ));
    }

    if let Some(token) = line.strip_prefix("token=") {
        if token.is_empty() {
            return Err(registration_failed(
                RegistrationFailure::Unknown,
                "Registration backend returned an empty token",
            ));
        }
        return Ok(RegistrationReply::Token(token.to_string()));
    }
    if line.starts_with("deleted=") {
        return Ok(RegistrationReply::Deleted);
    }

    Err(registration_failed(
        RegistrationFailure::Unknown,
        format!("Unexpected registration response: {line}"),
    ))
}

fn map_registration_error(status: u16, code: &str) -> MessagingResult<RegistrationReply> {
    if code == IDENTITY_RESET_COMMAND {
        return Ok(RegistrationReply::IdentityReset);
    }
    if code == "MISSING_ENTITLEMENT" || code == SEC_MISSING_ENTITLEMENT_ERROR_CODE.to_string() {
        return Err(entitlement_error(format!(
            "Secure storage entitlement missing (error {SEC_MISSING_ENTITLEMENT_ERROR_CODE})"
        )));
    }
    let kind = match code {
        "INVALID_SCOPE" | "INVALID_PARAMETERS" => RegistrationFailure::InvalidScope,
        "TOO_MANY_REGISTRATIONS" | "QUOTA_EXCEEDED" | "RATE_LIMITED" => {
            RegistrationFailure::RateLimited
        }
        _ if status == 429 => RegistrationFailure::RateLimited,
        _ => RegistrationFailure::Unknown,
    };
    Err(registration_failed(
        kind,
        format!("Registration rejected with error {code} (status {status})"),
    ))
}
