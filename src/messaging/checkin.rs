use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::messaging::error::{invalid_argument, network_error, MessagingResult};
use crate::messaging::fcm_rest::{CheckinBackend, CheckinRequest, CheckinResponse};
use crate::messaging::notifications::{Notification, NotificationCenter};
use crate::messaging::token_store::CredentialStore;
use crate::messaging::types::Identity;
use crate::platform::runtime::with_timeout;
use crate::util::KeyedLocks;

/// Result of [`CheckinClient::fetch_identity`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckinOutcome {
    /// The stored identity was still fresh; no request was made.
    Cached(Identity),
    Fetched(Identity),
    /// The backend reset the identity; it and every derived token are gone.
    Reset,
}

impl CheckinOutcome {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            CheckinOutcome::Cached(identity) | CheckinOutcome::Fetched(identity) => Some(identity),
            CheckinOutcome::Reset => None,
        }
    }
}

/// Owns the device checkin identity of each app.
#[derive(Clone)]
pub struct CheckinClient {
    inner: Arc<CheckinInner>,
}

struct CheckinInner {
    backend: Arc<dyn CheckinBackend>,
    store: Arc<dyn CredentialStore>,
    notifications: NotificationCenter,
    default_ttl: Duration,
    request_timeout: Option<Duration>,
    locks: KeyedLocks<String>,
}

impl std::fmt::Debug for CheckinClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckinClient")
            .field("default_ttl", &self.inner.default_ttl)
            .field("request_timeout", &self.inner.request_timeout)
            .finish()
    }
}

impl CheckinClient {
    pub fn new(
        backend: Arc<dyn CheckinBackend>,
        store: Arc<dyn CredentialStore>,
        notifications: NotificationCenter,
        default_ttl: Duration,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(CheckinInner {
                backend,
                store,
                notifications,
                default_ttl,
                request_timeout,
                locks: KeyedLocks::new(),
            }),
        }
    }

    /// Returns the stored identity without touching the network.
    pub fn cached_identity(&self, app_id: &str) -> MessagingResult<Option<Identity>> {
        self.inner.store.get_identity(app_id)
    }

    /// Returns a usable identity for `app_id`, checking in with the backend
    /// when the stored one is missing or expired.
    ///
    /// Concurrent calls for the same app share a single checkin request.
    pub async fn fetch_identity(&self, app_id: &str) -> MessagingResult<CheckinOutcome> {
        if app_id.is_empty() {
            return Err(invalid_argument("App id must not be empty"));
        }
        if let Some(identity) = self.fresh_identity(app_id)? {
            return Ok(CheckinOutcome::Cached(identity));
        }

        let lock = self.inner.locks.lock_for(&app_id.to_string());
        let _guard = lock.lock().await;

        // Another caller may have finished a checkin while this one waited.
        let previous = self.inner.store.get_identity(app_id)?;
        if let Some(identity) = &previous {
            if identity.is_fresh(self.inner.default_ttl, SystemTime::now()) {
                return Ok(CheckinOutcome::Cached(identity.clone()));
            }
        }

        log::debug!("checking in for app '{app_id}'");
        let request = CheckinRequest { previous };
        let response = with_timeout(self.inner.request_timeout, self.inner.backend.checkin(&request))
            .await
            .ok_or_else(|| network_error("Checkin request timed out"))??;

        match response {
            CheckinResponse::Identity(identity) => {
                self.inner.store.put_identity(app_id, &identity)?;
                self.inner.notifications.emit(Notification::CheckinFetched {
                    app_id: app_id.to_string(),
                    device_id: identity.device_id.clone(),
                });
                Ok(CheckinOutcome::Fetched(identity))
            }
            CheckinResponse::IdentityReset => {
                log::info!("checkin backend reset the identity of app '{app_id}'");
                self.invalidate_locked(app_id)?;
                Ok(CheckinOutcome::Reset)
            }
        }
    }

    /// Discards the identity of `app_id` together with every token it produced.
    pub async fn invalidate_identity(&self, app_id: &str) -> MessagingResult<()> {
        let lock = self.inner.locks.lock_for(&app_id.to_string());
        let _guard = lock.lock().await;
        self.invalidate_locked(app_id)
    }

    /// Runs `commit` while no checkin or invalidation of `app_id` can
    /// interleave, provided the stored identity still has `device_id`.
    ///
    /// Returns `None` without running `commit` when the identity changed.
    pub(crate) async fn with_identity<T, F>(
        &self,
        app_id: &str,
        device_id: &str,
        commit: F,
    ) -> MessagingResult<Option<T>>
    where
        F: FnOnce() -> MessagingResult<T>,
    {
        let lock = self.inner.locks.lock_for(&app_id.to_string());
        let _guard = lock.lock().await;
        match self.inner.store.get_identity(app_id)? {
            Some(identity) if identity.device_id == device_id => commit().map(Some),
            _ => Ok(None),
        }
    }

    fn fresh_identity(&self, app_id: &str) -> MessagingResult<Option<Identity>> {
        Ok(self
            .inner
            .store
            .get_identity(app_id)?
            .filter(|identity| identity.is_fresh(self.inner.default_ttl, SystemTime::now())))
    }

    fn invalidate_locked(&self, app_id: &str) -> MessagingResult<()> {
        let removed = self.inner.store.delete_all(app_id)?;
        self.inner.store.clear_identity(app_id)?;
        log::info!("invalidated identity of app '{app_id}', removed {removed} token(s)");
        self.inner.notifications.emit(Notification::IdentityInvalidated {
            app_id: app_id.to_string(),
        });
        Ok(())
    }
}
