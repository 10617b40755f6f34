use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// APNS environment a device token belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ApnsTokenType {
    #[default]
    Production,
    Sandbox,
}

impl ApnsTokenType {
    pub fn is_sandbox(self) -> bool {
        matches!(self, ApnsTokenType::Sandbox)
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Some(ApnsTokenType::Production),
            "sandbox" | "development" => Some(ApnsTokenType::Sandbox),
            _ => None,
        }
    }
}

/// Device checkin identity used to authorize token requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub device_id: String,
    pub secret: String,
    pub last_checkin: SystemTime,
    /// Lifetime announced by the server; `None` falls back to the configured default.
    pub ttl: Option<Duration>,
}

impl Identity {
    pub fn is_fresh(&self, default_ttl: Duration, now: SystemTime) -> bool {
        let ttl = self.ttl.unwrap_or(default_ttl);
        match now.duration_since(self.last_checkin) {
            Ok(age) => age < ttl,
            // Checkin time in the future: clock moved backwards, trust it until it is re-fetched.
            Err(_) => true,
        }
    }
}

/// Options sent along with a registration request.
///
/// Every field corresponds to a documented request key; `extras` carries
/// parameters this crate does not know about yet and is forwarded verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenOptions {
    pub apns_token: Option<Vec<u8>>,
    pub apns_sandbox: Option<bool>,
    pub firebase_app_id: Option<String>,
    pub instance_id: Option<String>,
    pub extras: BTreeMap<String, String>,
}

impl TokenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_apns_token(mut self, token: impl Into<Vec<u8>>, token_type: ApnsTokenType) -> Self {
        self.apns_token = Some(token.into());
        self.apns_sandbox = Some(token_type.is_sandbox());
        self
    }

    pub fn with_apns_sandbox(mut self, sandbox: bool) -> Self {
        self.apns_sandbox = Some(sandbox);
        self
    }

    pub fn with_firebase_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.firebase_app_id = Some(app_id.into());
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// APNS token in the wire form expected by the registration backend:
    /// `p_` or `s_` followed by the lowercase hex bytes.
    pub(crate) fn apns_request_value(&self) -> Option<String> {
        let bytes = self.apns_token.as_ref()?;
        let prefix = if self.apns_sandbox.unwrap_or(false) {
            "s_"
        } else {
            "p_"
        };
        let mut value = String::with_capacity(prefix.len() + bytes.len() * 2);
        value.push_str(prefix);
        for byte in bytes {
            value.push_str(&format!("{byte:02x}"));
        }
        Some(value)
    }
}

/// Registration token issued for one `(app_id, scope)` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopedToken {
    pub app_id: String,
    pub scope: String,
    pub token: String,
    pub issued_at: SystemTime,
    /// Device id of the identity that produced the token.
    pub device_id: String,
    pub options: TokenOptions,
}

impl ScopedToken {
    /// A token is reusable when it was issued for the same options by the
    /// current identity within the refresh interval.
    pub fn is_fresh(
        &self,
        options: &TokenOptions,
        identity: Option<&Identity>,
        refresh_interval: Duration,
        now: SystemTime,
    ) -> bool {
        if &self.options != options {
            return false;
        }
        match identity {
            Some(identity) if identity.device_id == self.device_id => {}
            _ => return false,
        }
        match now.duration_since(self.issued_at) {
            Ok(age) => age < refresh_interval,
            Err(_) => true,
        }
    }
}

/// Lifecycle of a `(app_id, scope)` registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenState {
    Unregistered,
    Pending,
    Registered,
    Stale,
    Revoked,
}

/// Successful outcome of a token operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenResult {
    Issued(ScopedToken),
    /// The backend reset the device identity; every token of the app was discarded.
    IdentityReset,
}

impl TokenResult {
    pub fn token(&self) -> Option<&ScopedToken> {
        match self {
            TokenResult::Issued(token) => Some(token),
            TokenResult::IdentityReset => None,
        }
    }

    pub fn into_token(self) -> Option<ScopedToken> {
        match self {
            TokenResult::Issued(token) => Some(token),
            TokenResult::IdentityReset => None,
        }
    }

    pub fn is_identity_reset(&self) -> bool {
        matches!(self, TokenResult::IdentityReset)
    }
}
