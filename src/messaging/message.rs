use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value};

use crate::messaging::constants::{
    COLLAPSE_KEY, FROM_KEY, IDENTITY_RESET_COMMAND, IID_COMMAND_KEY, IID_MESSAGE_SENDER,
    MESSAGE_APNS_CONTENT_AVAILABLE_KEY, MESSAGE_APS_KEY, MESSAGE_GOOGLE_RESERVED_PREFIX,
    MESSAGE_ID_KEY, MESSAGE_INTERNAL_RESERVED_PREFIX, MESSAGE_LINK_KEY, MESSAGE_PERSISTENT_ID_KEY,
    MESSAGE_SYNC_MESSAGE_TTL_KEY, MESSAGE_SYNC_VIA_MCS_KEY, RAW_DATA_KEY,
};
use crate::messaging::error::{invalid_argument, MessagingResult};

/// A message delivered to the app, split into backend metadata and the
/// sender's own data keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: Option<String>,
    pub from: Option<String>,
    pub collapse_key: Option<String>,
    pub persistent_id: Option<String>,
    pub link: Option<String>,
    pub content_available: bool,
    pub sync_via_mcs: bool,
    pub sync_ttl: Option<Duration>,
    pub raw_data: Option<Vec<u8>>,
    /// Every key that is not reserved by the backend.
    pub data: BTreeMap<String, Value>,
}

impl ReceivedMessage {
    pub fn from_payload(payload: &Map<String, Value>) -> MessagingResult<Self> {
        let raw_data = match payload.get(RAW_DATA_KEY) {
            Some(Value::String(encoded)) => Some(STANDARD.decode(encoded).map_err(|err| {
                invalid_argument(format!("Message raw data is not valid base64: {err}"))
            })?),
            Some(Value::Null) | None => None,
            Some(_) => return Err(invalid_argument("Message raw data must be a string")),
        };

        let content_available = payload
            .get(MESSAGE_APS_KEY)
            .and_then(Value::as_object)
            .and_then(|aps| aps.get(MESSAGE_APNS_CONTENT_AVAILABLE_KEY))
            .and_then(as_u64)
            == Some(1);

        let data = payload
            .iter()
            .filter(|(key, _)| !is_reserved_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            message_id: string_field(payload, MESSAGE_ID_KEY),
            from: string_field(payload, FROM_KEY),
            collapse_key: string_field(payload, COLLAPSE_KEY),
            persistent_id: string_field(payload, MESSAGE_PERSISTENT_ID_KEY),
            link: string_field(payload, MESSAGE_LINK_KEY),
            content_available,
            sync_via_mcs: payload
                .get(MESSAGE_SYNC_VIA_MCS_KEY)
                .map(is_truthy)
                .unwrap_or(false),
            sync_ttl: payload
                .get(MESSAGE_SYNC_MESSAGE_TTL_KEY)
                .and_then(as_u64)
                .map(Duration::from_secs),
            raw_data,
            data,
        })
    }

    /// Whether this is an instance-id control message asking the client to
    /// discard its identity.
    pub fn is_identity_reset(&self) -> bool {
        self.from.as_deref() == Some(IID_MESSAGE_SENDER)
            && self.data.get(IID_COMMAND_KEY).and_then(Value::as_str) == Some(IDENTITY_RESET_COMMAND)
    }
}

fn is_reserved_key(key: &str) -> bool {
    key.starts_with(MESSAGE_INTERNAL_RESERVED_PREFIX)
        || key.starts_with(MESSAGE_GOOGLE_RESERVED_PREFIX)
        || matches!(
            key,
            MESSAGE_APS_KEY | FROM_KEY | COLLAPSE_KEY | MESSAGE_PERSISTENT_ID_KEY | RAW_DATA_KEY
        )
}

fn string_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

// Numbers arrive either as JSON numbers or as decimal strings.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        other => as_u64(other).is_some_and(|number| number != 0),
    }
}
