use std::path::PathBuf;
use std::time::Duration;

use crate::messaging::constants::{
    CHECKIN_API_URL, REGISTRATION_API_URL, SEND_TTL_DEFAULT, TOKEN_REFRESH_INTERVAL_DEFAULT,
};
use crate::messaging::error::{internal_error, invalid_argument, MessagingResult};
use crate::messaging::types::ApnsTokenType;

pub const CACHE_DIR_ENV: &str = "FIREBASE_MESSAGING_CACHE_DIR";
pub const CHECKIN_ENDPOINT_ENV: &str = "FIREBASE_MESSAGING_CHECKIN_ENDPOINT";
pub const REGISTRATION_ENDPOINT_ENV: &str = "FIREBASE_MESSAGING_REGISTRATION_ENDPOINT";
pub const APNS_TOKEN_TYPE_ENV: &str = "FIREBASE_MESSAGING_APNS_TOKEN_TYPE";
pub const PROXY_ENABLED_ENV: &str = "FIREBASE_APP_DELEGATE_PROXY_ENABLED";

/// Host-supplied configuration for the messaging token lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessagingConfig {
    pub apns_token_type: ApnsTokenType,
    /// Whether the host lets the SDK proxy its app-delegate callbacks. Stored
    /// for the host integration layer; nothing in this crate hooks the host.
    pub proxy_enabled: bool,
    /// Fetch the default token automatically when an APNS token arrives.
    pub auto_init_enabled: bool,
    /// Identity lifetime used when the checkin response carries no TTL.
    pub checkin_ttl: Duration,
    pub token_refresh_interval: Duration,
    /// Applied to every checkin and registration call. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    pub cache_dir: PathBuf,
    pub checkin_endpoint: String,
    pub registration_endpoint: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            apns_token_type: ApnsTokenType::Production,
            proxy_enabled: true,
            auto_init_enabled: true,
            checkin_ttl: SEND_TTL_DEFAULT,
            token_refresh_interval: TOKEN_REFRESH_INTERVAL_DEFAULT,
            request_timeout: None,
            cache_dir: PathBuf::from(".firebase"),
            checkin_endpoint: CHECKIN_API_URL.to_string(),
            registration_endpoint: REGISTRATION_API_URL.to_string(),
        }
    }
}

impl MessagingConfig {
    /// Builds the default configuration, then applies environment overrides.
    pub fn from_env() -> MessagingResult<Self> {
        let mut config = Self::default();
        match std::env::var(CACHE_DIR_ENV) {
            Ok(dir) => config.cache_dir = PathBuf::from(dir),
            Err(_) => {
                config.cache_dir = std::env::current_dir()
                    .map_err(|err| {
                        internal_error(format!("Failed to obtain working directory: {err}"))
                    })?
                    .join(".firebase")
            }
        }
        if let Ok(endpoint) = std::env::var(CHECKIN_ENDPOINT_ENV) {
            config.checkin_endpoint = endpoint;
        }
        if let Ok(endpoint) = std::env::var(REGISTRATION_ENDPOINT_ENV) {
            config.registration_endpoint = endpoint;
        }
        if let Ok(raw) = std::env::var(APNS_TOKEN_TYPE_ENV) {
            config.apns_token_type = ApnsTokenType::parse(&raw).ok_or_else(|| {
                invalid_argument(format!("Invalid {APNS_TOKEN_TYPE_ENV} value \"{raw}\""))
            })?;
        }
        if let Ok(raw) = std::env::var(PROXY_ENABLED_ENV) {
            config.proxy_enabled = parse_flag(&raw).ok_or_else(|| {
                invalid_argument(format!("Invalid {PROXY_ENABLED_ENV} value \"{raw}\""))
            })?;
        }
        Ok(config)
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_apns_token_type(mut self, token_type: ApnsTokenType) -> Self {
        self.apns_token_type = token_type;
        self
    }

    pub fn with_proxy_enabled(mut self, enabled: bool) -> Self {
        self.proxy_enabled = enabled;
        self
    }

    pub fn with_auto_init_enabled(mut self, enabled: bool) -> Self {
        self.auto_init_enabled = enabled;
        self
    }

    pub fn with_checkin_ttl(mut self, ttl: Duration) -> Self {
        self.checkin_ttl = ttl;
        self
    }

    pub fn with_token_refresh_interval(mut self, interval: Duration) -> Self {
        self.token_refresh_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_endpoints(
        mut self,
        checkin: impl Into<String>,
        registration: impl Into<String>,
    ) -> Self {
        self.checkin_endpoint = checkin.into();
        self.registration_endpoint = registration.into();
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
