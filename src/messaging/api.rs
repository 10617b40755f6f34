use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::messaging::config::MessagingConfig;
use crate::messaging::constants::DEFAULT_TOKEN_SCOPE;
use crate::messaging::error::{MessagingError, MessagingErrorCode, MessagingResult};
use crate::messaging::fcm_rest::{CheckinBackend, FcmClient, RegistrationBackend};
use crate::messaging::message::ReceivedMessage;
use crate::messaging::notifications::NotificationCenter;
use crate::messaging::token_manager::TokenManager;
use crate::messaging::token_store::{CredentialStore, FileCredentialStore};
use crate::messaging::types::{ApnsTokenType, TokenOptions, TokenResult};

/// Messaging entry point for one app (sender) id.
#[derive(Clone, Debug)]
pub struct Messaging {
    inner: Arc<MessagingInner>,
}

#[derive(Debug)]
struct MessagingInner {
    app_id: String,
    config: MessagingConfig,
    tokens: TokenManager,
    apns: Mutex<Option<ApnsRegistration>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ApnsRegistration {
    token: Vec<u8>,
    token_type: ApnsTokenType,
}

impl Messaging {
    /// Creates a messaging instance backed by the REST endpoints and the
    /// file store under `config.cache_dir`.
    pub fn new(app_id: impl Into<String>, config: MessagingConfig) -> MessagingResult<Self> {
        let store = Arc::new(FileCredentialStore::open(&config.cache_dir)?);
        let client = Arc::new(FcmClient::new(&config)?);
        Ok(Self::with_components(
            app_id,
            config,
            store,
            client.clone(),
            client,
            NotificationCenter::new(),
        ))
    }

    pub fn with_components(
        app_id: impl Into<String>,
        config: MessagingConfig,
        store: Arc<dyn CredentialStore>,
        checkin: Arc<dyn CheckinBackend>,
        registration: Arc<dyn RegistrationBackend>,
        notifications: NotificationCenter,
    ) -> Self {
        let tokens = TokenManager::new(&config, store, checkin, registration, notifications);
        Self {
            inner: Arc::new(MessagingInner {
                app_id: app_id.into(),
                config,
                tokens,
                apns: Mutex::new(None),
            }),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.inner.app_id
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.inner.config
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub fn notifications(&self) -> &NotificationCenter {
        self.inner.tokens.notifications()
    }

    /// Whether the host asked this crate to hook its delegate callbacks.
    pub fn is_proxy_enabled(&self) -> bool {
        self.inner.config.proxy_enabled
    }

    pub fn is_auto_init_enabled(&self) -> bool {
        self.inner.config.auto_init_enabled
    }

    /// Returns the default registration token, registering one when needed.
    ///
    /// An identity reset during the request is followed by exactly one more
    /// attempt with a freshly checked-in identity.
    pub async fn token(&self) -> MessagingResult<String> {
        for attempt in 0..2 {
            let result = self
                .inner
                .tokens
                .get_token(self.app_id(), DEFAULT_TOKEN_SCOPE, self.default_options())
                .await?;
            match result {
                TokenResult::Issued(token) => return Ok(token.token),
                TokenResult::IdentityReset => {
                    log::info!(
                        "identity of app '{}' was reset during token request (attempt {})",
                        self.app_id(),
                        attempt + 1
                    );
                }
            }
        }
        Err(MessagingError::new(
            MessagingErrorCode::IdentityUnavailable,
            "Identity was reset again while requesting the default token",
        ))
    }

    pub async fn delete_token(&self) -> MessagingResult<()> {
        self.inner
            .tokens
            .delete_token(self.app_id(), DEFAULT_TOKEN_SCOPE)
            .await
    }

    /// Records the APNS device token. `None` uses the configured token type.
    ///
    /// With auto-init enabled, a cached default token issued for other APNS
    /// options is re-registered right away.
    pub async fn set_apns_token(
        &self,
        token: impl Into<Vec<u8>>,
        token_type: Option<ApnsTokenType>,
    ) -> MessagingResult<()> {
        let registration = ApnsRegistration {
            token: token.into(),
            token_type: token_type.unwrap_or(self.inner.config.apns_token_type),
        };
        {
            let mut apns = self.inner.apns.lock().unwrap();
            if apns.as_ref() == Some(&registration) {
                return Ok(());
            }
            *apns = Some(registration);
        }

        if !self.is_auto_init_enabled() {
            return Ok(());
        }
        let options = self.default_options();
        let cached = self
            .inner
            .tokens
            .store()
            .get(self.app_id(), DEFAULT_TOKEN_SCOPE)?;
        match cached {
            Some(token) if token.options != options => {
                log::debug!("APNS token changed; refreshing default token of '{}'", self.app_id());
                self.inner
                    .tokens
                    .get_token(self.app_id(), DEFAULT_TOKEN_SCOPE, options)
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn apns_token(&self) -> Option<Vec<u8>> {
        self.inner
            .apns
            .lock()
            .unwrap()
            .as_ref()
            .map(|apns| apns.token.clone())
    }

    /// Parses a delivered message and acts on instance-id control commands.
    pub async fn app_did_receive_message(
        &self,
        payload: &Map<String, Value>,
    ) -> MessagingResult<ReceivedMessage> {
        let message = ReceivedMessage::from_payload(payload)?;
        if message.is_identity_reset() {
            log::info!("received identity reset command for app '{}'", self.app_id());
            self.inner.tokens.invalidate_identity(self.app_id()).await?;
        }
        Ok(message)
    }

    fn default_options(&self) -> TokenOptions {
        match self.inner.apns.lock().unwrap().as_ref() {
            Some(apns) => TokenOptions::new().with_apns_token(apns.token.clone(), apns.token_type),
            None => TokenOptions::new(),
        }
    }
}
