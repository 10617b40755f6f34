use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::messaging::checkin::{CheckinClient, CheckinOutcome};
use crate::messaging::config::MessagingConfig;
use crate::messaging::constants::{ALL_SCOPE_IDENTIFIER, DEFAULT_TOKEN_SCOPE};
use crate::messaging::error::{
    identity_unavailable, invalid_argument, network_error, MessagingResult,
};
use crate::messaging::fcm_rest::{
    CheckinBackend, DeletionResponse, RegistrationBackend, RegistrationRequest,
    RegistrationResponse,
};
use crate::messaging::notifications::{
    Notification, NotificationCenter, NotificationKind, ObserverHandle,
};
use crate::messaging::token_store::CredentialStore;
use crate::messaging::types::{Identity, ScopedToken, TokenOptions, TokenResult, TokenState};
use crate::platform::runtime::with_timeout;
use crate::util::KeyedLocks;

type TokenKey = (String, String);
type Registry = Mutex<HashMap<TokenKey, KeyStatus>>;

/// Revoked keys remembered for `TokenState::Revoked`; the oldest revocation
/// is forgotten past this.
const REVOKED_KEYS_LIMIT: usize = 256;

/// Issues, caches, refreshes and revokes registration tokens per `(app_id, scope)`.
///
/// Operations on the same key are serialized and concurrent callers share the
/// in-flight result. Distinct keys proceed independently.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenManagerInner>,
}

struct TokenManagerInner {
    checkin: CheckinClient,
    registration: Arc<dyn RegistrationBackend>,
    store: Arc<dyn CredentialStore>,
    notifications: NotificationCenter,
    refresh_interval: Duration,
    request_timeout: Option<Duration>,
    locks: KeyedLocks<TokenKey>,
    registry: Arc<Registry>,
    revocations: AtomicU64,
    _reset_observer: ObserverHandle,
}

#[derive(Debug, Default)]
struct KeyStatus {
    pending: usize,
    /// Revocation sequence number while the key is revoked.
    revoked_at: Option<u64>,
    /// Bumped on every committed registration; lets queued refreshes detect
    /// that the work they waited for already happened.
    generation: u64,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("checkin", &self.inner.checkin)
            .field("refresh_interval", &self.inner.refresh_interval)
            .field("request_timeout", &self.inner.request_timeout)
            .finish()
    }
}

impl TokenManager {
    pub fn new(
        config: &MessagingConfig,
        store: Arc<dyn CredentialStore>,
        checkin_backend: Arc<dyn CheckinBackend>,
        registration_backend: Arc<dyn RegistrationBackend>,
        notifications: NotificationCenter,
    ) -> Self {
        let checkin = CheckinClient::new(
            checkin_backend,
            store.clone(),
            notifications.clone(),
            config.checkin_ttl,
            config.request_timeout,
        );
        let registry: Arc<Registry> = Arc::new(Mutex::new(HashMap::new()));
        let reset_observer = {
            let registry = Arc::clone(&registry);
            notifications.add_observer_for(
                NotificationKind::IdentityInvalidated,
                move |notification| forget_app(&registry, notification.app_id()),
            )
        };
        Self {
            inner: Arc::new(TokenManagerInner {
                checkin,
                registration: registration_backend,
                store,
                notifications,
                refresh_interval: config.token_refresh_interval,
                request_timeout: config.request_timeout,
                locks: KeyedLocks::new(),
                registry,
                revocations: AtomicU64::new(0),
                _reset_observer: reset_observer,
            }),
        }
    }

    pub fn checkin(&self) -> &CheckinClient {
        &self.inner.checkin
    }

    pub fn store(&self) -> Arc<dyn CredentialStore> {
        self.inner.store.clone()
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.inner.notifications
    }

    /// Returns the token for `(app_id, scope)`, registering a new one when
    /// nothing fresh is cached for `options`.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use std::sync::Arc;
    /// # use firebase_messaging_rs::messaging::{
    /// #     FcmClient, MemoryCredentialStore, MessagingConfig, NotificationCenter, TokenManager,
    /// #     TokenOptions,
    /// # };
    /// # async fn run() -> firebase_messaging_rs::messaging::MessagingResult<()> {
    /// let config = MessagingConfig::default();
    /// let client = Arc::new(FcmClient::new(&config)?);
    /// let manager = TokenManager::new(
    ///     &config,
    ///     Arc::new(MemoryCredentialStore::new()),
    ///     client.clone(),
    ///     client,
    ///     NotificationCenter::new(),
    /// );
    /// let result = manager.get_token("1234567890", "*", TokenOptions::new()).await?;
    /// if let Some(token) = result.token() {
    ///     println!("registration token: {}", token.token);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_token(
        &self,
        app_id: &str,
        scope: &str,
        options: TokenOptions,
    ) -> MessagingResult<TokenResult> {
        validate_key(app_id, scope)?;
        let result = self.get_token_inner(app_id, scope, options).await;
        self.report_default_failure(app_id, scope, &result);
        result
    }

    async fn get_token_inner(
        &self,
        app_id: &str,
        scope: &str,
        options: TokenOptions,
    ) -> MessagingResult<TokenResult> {
        if let Some(token) = self.fresh_cached(app_id, scope, &options)? {
            return Ok(TokenResult::Issued(token));
        }

        let key = token_key(app_id, scope);
        let (_pending, _) = self.begin_pending(&key);
        let lock = self.inner.locks.lock_for(&key);
        let _guard = lock.lock().await;

        if let Some(token) = self.fresh_cached(app_id, scope, &options)? {
            return Ok(TokenResult::Issued(token));
        }
        self.register_locked(app_id, scope, options, false).await
    }

    /// Forces a new registration for `(app_id, scope)` with the options of the
    /// cached token, or default options when nothing is cached.
    pub async fn refresh_token(&self, app_id: &str, scope: &str) -> MessagingResult<TokenResult> {
        validate_key(app_id, scope)?;
        let result = self.refresh_token_inner(app_id, scope).await;
        self.report_default_failure(app_id, scope, &result);
        result
    }

    async fn refresh_token_inner(&self, app_id: &str, scope: &str) -> MessagingResult<TokenResult> {
        let key = token_key(app_id, scope);
        let (_pending, observed) = self.begin_pending(&key);
        let lock = self.inner.locks.lock_for(&key);
        let _guard = lock.lock().await;

        let cached = self.inner.store.get(app_id, scope)?;
        if self.generation(&key) != observed {
            if let Some(token) = cached {
                log::debug!("refresh of '{app_id}/{scope}' satisfied by a concurrent registration");
                return Ok(TokenResult::Issued(token));
            }
        }
        let options = cached.map(|token| token.options).unwrap_or_default();
        self.register_locked(app_id, scope, options, true).await
    }

    /// Revokes the token on the server, then removes it locally.
    ///
    /// Deleting a token that is not cached succeeds without a network call.
    pub async fn delete_token(&self, app_id: &str, scope: &str) -> MessagingResult<()> {
        validate_key(app_id, scope)?;
        let key = token_key(app_id, scope);
        let (_pending, _) = self.begin_pending(&key);
        let lock = self.inner.locks.lock_for(&key);
        let _guard = lock.lock().await;

        let Some(existing) = self.inner.store.get(app_id, scope)? else {
            log::debug!("no token cached for '{app_id}/{scope}', nothing to delete");
            return Ok(());
        };

        let identity = self
            .inner
            .store
            .get_identity(app_id)?
            .filter(|identity| identity.device_id == existing.device_id);
        match identity {
            Some(identity) => {
                let request = RegistrationRequest {
                    app_id: app_id.to_string(),
                    scope: scope.to_string(),
                    identity,
                    options: existing.options.clone(),
                };
                let response = with_timeout(
                    self.inner.request_timeout,
                    self.inner.registration.unregister(&request),
                )
                .await
                .ok_or_else(|| network_error("Token deletion request timed out"))??;
                if response == DeletionResponse::IdentityReset {
                    log::info!("deletion of '{app_id}/{scope}' answered with an identity reset");
                    self.inner.checkin.invalidate_identity(app_id).await?;
                    self.mark_revoked(&key);
                    return Ok(());
                }
            }
            None => {
                log::warn!(
                    "token for '{app_id}/{scope}' belongs to a discarded identity; removing it locally only"
                );
            }
        }

        self.inner.store.delete(app_id, scope)?;
        self.mark_revoked(&key);
        log::debug!("deleted token for '{app_id}/{scope}'");
        Ok(())
    }

    pub fn token_state(&self, app_id: &str, scope: &str) -> MessagingResult<TokenState> {
        let key = token_key(app_id, scope);
        let (pending, revoked) = {
            let registry = self.inner.registry.lock().unwrap();
            registry
                .get(&key)
                .map(|status| (status.pending, status.revoked_at.is_some()))
                .unwrap_or((0, false))
        };
        if pending > 0 {
            return Ok(TokenState::Pending);
        }
        let Some(token) = self.inner.store.get(app_id, scope)? else {
            return Ok(if revoked {
                TokenState::Revoked
            } else {
                TokenState::Unregistered
            });
        };
        let identity = self.inner.store.get_identity(app_id)?;
        if self.is_fresh(&token, &token.options, identity.as_ref()) {
            Ok(TokenState::Registered)
        } else {
            Ok(TokenState::Stale)
        }
    }

    /// Token to address deliveries for `scope`: the scope's own token when one
    /// is cached, else the all-scope token.
    pub fn delivery_token(&self, app_id: &str, scope: &str) -> MessagingResult<Option<ScopedToken>> {
        if let Some(token) = self.inner.store.get(app_id, scope)? {
            return Ok(Some(token));
        }
        self.inner.store.get(app_id, ALL_SCOPE_IDENTIFIER)
    }

    pub async fn invalidate_identity(&self, app_id: &str) -> MessagingResult<()> {
        self.inner.checkin.invalidate_identity(app_id).await
    }

    async fn register_locked(
        &self,
        app_id: &str,
        scope: &str,
        options: TokenOptions,
        forced: bool,
    ) -> MessagingResult<TokenResult> {
        let previous = self.inner.store.get(app_id, scope)?;
        let identity = match self.inner.checkin.fetch_identity(app_id).await {
            Ok(CheckinOutcome::Reset) => return Ok(TokenResult::IdentityReset),
            Ok(CheckinOutcome::Cached(identity)) | Ok(CheckinOutcome::Fetched(identity)) => identity,
            Err(err) => return Err(identity_unavailable(&err)),
        };

        log::debug!("registering token for '{app_id}/{scope}'");
        let request = RegistrationRequest {
            app_id: app_id.to_string(),
            scope: scope.to_string(),
            identity,
            options,
        };
        let response = with_timeout(
            self.inner.request_timeout,
            self.inner.registration.register(&request),
        )
        .await
        .ok_or_else(|| network_error("Registration request timed out"))??;

        let value = match response {
            RegistrationResponse::Token(value) => value,
            RegistrationResponse::IdentityReset => {
                log::info!("registration of '{app_id}/{scope}' answered with an identity reset");
                self.inner.checkin.invalidate_identity(app_id).await?;
                return Ok(TokenResult::IdentityReset);
            }
        };

        let RegistrationRequest {
            identity, options, ..
        } = request;
        let token = ScopedToken {
            app_id: app_id.to_string(),
            scope: scope.to_string(),
            token: value,
            issued_at: SystemTime::now(),
            device_id: identity.device_id,
            options,
        };
        let committed = self
            .inner
            .checkin
            .with_identity(app_id, &token.device_id, || self.inner.store.put(&token))
            .await?;
        if committed.is_none() {
            log::warn!(
                "identity of app '{app_id}' changed during registration; discarding token for scope '{scope}'"
            );
            return Ok(TokenResult::IdentityReset);
        }
        self.mark_registered(&token_key(app_id, scope));

        let changed = previous
            .as_ref()
            .is_some_and(|previous| previous.token != token.token);
        if forced || changed {
            self.inner.notifications.emit(Notification::TokenRefresh {
                app_id: app_id.to_string(),
                scope: scope.to_string(),
                token: token.token.clone(),
            });
        }
        Ok(TokenResult::Issued(token))
    }

    fn fresh_cached(
        &self,
        app_id: &str,
        scope: &str,
        options: &TokenOptions,
    ) -> MessagingResult<Option<ScopedToken>> {
        let Some(token) = self.inner.store.get(app_id, scope)? else {
            return Ok(None);
        };
        let identity = self.inner.store.get_identity(app_id)?;
        Ok(self
            .is_fresh(&token, options, identity.as_ref())
            .then_some(token))
    }

    fn is_fresh(
        &self,
        token: &ScopedToken,
        options: &TokenOptions,
        identity: Option<&Identity>,
    ) -> bool {
        token.is_fresh(
            options,
            identity,
            self.inner.refresh_interval,
            SystemTime::now(),
        )
    }

    fn report_default_failure(&self, app_id: &str, scope: &str, result: &MessagingResult<TokenResult>) {
        if scope != DEFAULT_TOKEN_SCOPE {
            return;
        }
        if let Err(err) = result {
            log::warn!("default token request for app '{app_id}' failed: {err}");
            self.inner
                .notifications
                .emit(Notification::DefaultTokenFetchFailed {
                    app_id: app_id.to_string(),
                    error: err.clone(),
                });
        }
    }

    fn begin_pending(&self, key: &TokenKey) -> (PendingGuard<'_>, u64) {
        let mut registry = self.inner.registry.lock().unwrap();
        let status = registry.entry(key.clone()).or_default();
        status.pending += 1;
        let generation = status.generation;
        (
            PendingGuard {
                registry: &self.inner.registry,
                key: key.clone(),
            },
            generation,
        )
    }

    fn generation(&self, key: &TokenKey) -> u64 {
        let registry = self.inner.registry.lock().unwrap();
        registry.get(key).map(|status| status.generation).unwrap_or(0)
    }

    fn mark_registered(&self, key: &TokenKey) {
        let mut registry = self.inner.registry.lock().unwrap();
        let status = registry.entry(key.clone()).or_default();
        status.revoked_at = None;
        status.generation += 1;
    }

    fn mark_revoked(&self, key: &TokenKey) {
        let sequence = self.inner.revocations.fetch_add(1, Ordering::SeqCst);
        let mut registry = self.inner.registry.lock().unwrap();
        registry.entry(key.clone()).or_default().revoked_at = Some(sequence);

        let revoked = registry
            .values()
            .filter(|status| status.revoked_at.is_some())
            .count();
        if revoked > REVOKED_KEYS_LIMIT {
            let oldest = registry
                .iter()
                .filter_map(|(candidate, status)| {
                    status.revoked_at.map(|at| (at, candidate.clone()))
                })
                .min()
                .map(|(_, key)| key);
            if let Some(oldest) = oldest {
                forget_revocation(&mut registry, &oldest);
            }
        }
    }
}

/// Drops every revocation recorded for `app_id`. Runs when the app's
/// identity is invalidated, since its tokens are gone with it.
fn forget_app(registry: &Registry, app_id: &str) {
    let mut registry = registry.lock().unwrap();
    let keys: Vec<TokenKey> = registry
        .keys()
        .filter(|(app, _)| app == app_id)
        .cloned()
        .collect();
    for key in keys {
        forget_revocation(&mut registry, &key);
    }
}

fn forget_revocation(registry: &mut HashMap<TokenKey, KeyStatus>, key: &TokenKey) {
    if let Some(status) = registry.get_mut(key) {
        status.revoked_at = None;
        if status.pending == 0 {
            registry.remove(key);
        }
    }
}

struct PendingGuard<'a> {
    registry: &'a Registry,
    key: TokenKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(status) = registry.get_mut(&self.key) {
            status.pending = status.pending.saturating_sub(1);
            if status.pending == 0 && status.revoked_at.is_none() {
                registry.remove(&self.key);
            }
        }
    }
}

fn token_key(app_id: &str, scope: &str) -> TokenKey {
    (app_id.to_string(), scope.to_string())
}

fn validate_key(app_id: &str, scope: &str) -> MessagingResult<()> {
    if app_id.is_empty() {
        return Err(invalid_argument("App id must not be empty"));
    }
    if scope.is_empty() {
        return Err(invalid_argument("Token scope must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::error::{
        entitlement_error, network_error, registration_failed, MessagingErrorCode,
        RegistrationFailure,
    };
    use crate::messaging::fcm_rest::CheckinResponse;
    use crate::messaging::notifications::NotificationKind;
    use crate::messaging::token_store::{FileCredentialStore, MemoryCredentialStore};
    use crate::messaging::types::ApnsTokenType;
    use crate::platform::runtime::sleep;
    use crate::test_support::{FakeCheckinBackend, FakeRegistrationBackend, NotificationLog};

    struct Harness {
        manager: TokenManager,
        checkin: Arc<FakeCheckinBackend>,
        registration: Arc<FakeRegistrationBackend>,
        store: Arc<MemoryCredentialStore>,
        log: NotificationLog,
    }

    fn harness_with(config: MessagingConfig, registration: FakeRegistrationBackend) -> Harness {
        let checkin = Arc::new(FakeCheckinBackend::new());
        let registration = Arc::new(registration);
        let store = Arc::new(MemoryCredentialStore::new());
        let notifications = NotificationCenter::new();
        let log = NotificationLog::attach(&notifications);
        let manager = TokenManager::new(
            &config,
            store.clone(),
            checkin.clone(),
            registration.clone(),
            notifications,
        );
        Harness {
            manager,
            checkin,
            registration,
            store,
            log,
        }
    }

    fn harness() -> Harness {
        harness_with(MessagingConfig::default(), FakeRegistrationBackend::new())
    }

    fn sandbox() -> TokenOptions {
        TokenOptions::new().with_apns_sandbox(true)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn second_get_returns_cached_token_without_network() {
        let h = harness();

        let first = h.manager.get_token("app1", "default", sandbox()).await.unwrap();
        let t1 = first.into_token().unwrap();
        assert_eq!(h.checkin.calls(), 1);
        assert_eq!(h.registration.register_calls(), 1);

        let second = h.manager.get_token("app1", "default", sandbox()).await.unwrap();
        assert_eq!(second.into_token().unwrap(), t1);
        assert_eq!(h.checkin.calls(), 1);
        assert_eq!(h.registration.register_calls(), 1);
        assert_eq!(
            h.manager.token_state("app1", "default").unwrap(),
            TokenState::Registered
        );
        // The first issuance is not a refresh.
        assert!(!h.log.kinds().contains(&NotificationKind::TokenRefresh));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn refresh_issues_new_token_and_notifies_once() {
        let h = harness();
        let t1 = h
            .manager
            .get_token("app1", "default", sandbox())
            .await
            .unwrap()
            .into_token()
            .unwrap();

        let t2 = h
            .manager
            .refresh_token("app1", "default")
            .await
            .unwrap()
            .into_token()
            .unwrap();
        assert_ne!(t1.token, t2.token);
        assert_eq!(t2.options, sandbox());
        assert_eq!(h.registration.register_calls(), 2);

        let refreshes: Vec<_> = h
            .log
            .events()
            .into_iter()
            .filter(|event| event.kind() == NotificationKind::TokenRefresh)
            .collect();
        assert_eq!(
            refreshes,
            vec![Notification::TokenRefresh {
                app_id: "app1".into(),
                scope: "default".into(),
                token: t2.token.clone(),
            }]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn delete_then_get_registers_again() {
        let h = harness();
        let t1 = h
            .manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap()
            .into_token()
            .unwrap();

        h.manager.delete_token("app1", "*").await.unwrap();
        assert_eq!(h.registration.unregister_calls(), 1);
        assert_eq!(h.store.get("app1", "*").unwrap(), None);
        assert_eq!(h.manager.token_state("app1", "*").unwrap(), TokenState::Revoked);

        let t2 = h
            .manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap()
            .into_token()
            .unwrap();
        assert_ne!(t1.token, t2.token);
        assert_eq!(h.registration.register_calls(), 2);
        assert_eq!(
            h.manager.token_state("app1", "*").unwrap(),
            TokenState::Registered
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn deleting_absent_token_is_silent_noop() {
        let h = harness();
        h.manager.delete_token("app1", "*").await.unwrap();
        h.manager.delete_token("app1", "*").await.unwrap();
        assert_eq!(h.registration.unregister_calls(), 0);
        assert_eq!(h.checkin.calls(), 0);
        assert_eq!(
            h.manager.token_state("app1", "*").unwrap(),
            TokenState::Unregistered
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_revocation_keeps_local_token() {
        let h = harness();
        h.manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap();
        h.registration
            .push_unregister(Err(network_error("connection reset")));

        let err = h.manager.delete_token("app1", "*").await.unwrap_err();
        assert_eq!(err.code, MessagingErrorCode::Network);
        assert!(h.store.get("app1", "*").unwrap().is_some());
        assert_eq!(
            h.manager.token_state("app1", "*").unwrap(),
            TokenState::Registered
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn concurrent_gets_share_one_registration() {
        let h = harness_with(
            MessagingConfig::default(),
            FakeRegistrationBackend::new().with_delay(Duration::from_millis(20)),
        );

        let results = futures::future::join_all(
            (0..5).map(|_| h.manager.get_token("app1", "*", TokenOptions::new())),
        )
        .await;
        let tokens: Vec<String> = results
            .into_iter()
            .map(|result| result.unwrap().into_token().unwrap().token)
            .collect();
        assert!(tokens.iter().all(|token| token == &tokens[0]));
        assert_eq!(h.registration.register_calls(), 1);
        assert_eq!(h.checkin.calls(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn concurrent_refreshes_share_one_registration() {
        let h = harness_with(
            MessagingConfig::default(),
            FakeRegistrationBackend::new().with_delay(Duration::from_millis(20)),
        );
        h.manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap();

        let results =
            futures::future::join_all((0..3).map(|_| h.manager.refresh_token("app1", "*"))).await;
        for result in results {
            assert!(result.unwrap().token().is_some());
        }
        assert_eq!(h.registration.register_calls(), 2);
        assert_eq!(
            h.log
                .kinds()
                .iter()
                .filter(|kind| **kind == NotificationKind::TokenRefresh)
                .count(),
            1
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn distinct_scopes_do_not_coalesce() {
        let h = harness_with(
            MessagingConfig::default(),
            FakeRegistrationBackend::new().with_delay(Duration::from_millis(10)),
        );
        let (a, b) = futures::join!(
            h.manager.get_token("app1", "*", TokenOptions::new()),
            h.manager.get_token("app1", "fcm", TokenOptions::new()),
        );
        assert_ne!(
            a.unwrap().into_token().unwrap().token,
            b.unwrap().into_token().unwrap().token
        );
        assert_eq!(h.registration.register_calls(), 2);
        assert_eq!(h.checkin.calls(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn state_is_pending_while_registration_in_flight() {
        let h = harness_with(
            MessagingConfig::default(),
            FakeRegistrationBackend::new().with_delay(Duration::from_millis(50)),
        );
        let (result, observed) = futures::join!(
            h.manager.get_token("app1", "*", TokenOptions::new()),
            async {
                sleep(Duration::from_millis(10)).await;
                h.manager.token_state("app1", "*").unwrap()
            }
        );
        result.unwrap();
        assert_eq!(observed, TokenState::Pending);
        assert_eq!(
            h.manager.token_state("app1", "*").unwrap(),
            TokenState::Registered
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn expired_token_is_stale_and_reregistered() {
        let h = harness_with(
            MessagingConfig::default().with_token_refresh_interval(Duration::ZERO),
            FakeRegistrationBackend::new(),
        );
        let t1 = h
            .manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap()
            .into_token()
            .unwrap();
        assert_eq!(h.manager.token_state("app1", "*").unwrap(), TokenState::Stale);

        let t2 = h
            .manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap()
            .into_token()
            .unwrap();
        assert_ne!(t1.token, t2.token);
        assert_eq!(h.registration.register_calls(), 2);
        assert!(h.log.kinds().contains(&NotificationKind::TokenRefresh));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn changed_options_trigger_registration() {
        let h = harness();
        h.manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap();
        let options = TokenOptions::new().with_apns_token(vec![1, 2, 3], ApnsTokenType::Sandbox);
        let token = h
            .manager
            .get_token("app1", "*", options.clone())
            .await
            .unwrap()
            .into_token()
            .unwrap();
        assert_eq!(token.options, options);
        assert_eq!(h.registration.register_calls(), 2);
        assert_eq!(
            h.registration.last_register().unwrap().options.apns_token,
            Some(vec![1, 2, 3])
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn entitlement_error_leaves_store_untouched() {
        let h = harness();
        h.registration
            .push_register(Err(entitlement_error("keychain access denied")));

        let err = h
            .manager
            .get_token("app1", "default", sandbox())
            .await
            .unwrap_err();
        assert_eq!(err.code, MessagingErrorCode::Entitlement);
        assert_eq!(err.diagnostic_code(), Some(-34018));
        assert!(h.store.scopes("app1").unwrap().is_empty());
        assert_eq!(
            h.manager.token_state("app1", "default").unwrap(),
            TokenState::Unregistered
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_refresh_keeps_previous_token() {
        let h = harness();
        let t1 = h
            .manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap()
            .into_token()
            .unwrap();
        h.registration.push_register(Err(registration_failed(
            RegistrationFailure::RateLimited,
            "slow down",
        )));

        let err = h.manager.refresh_token("app1", "*").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.store.get("app1", "*").unwrap(), Some(t1));
        assert!(h.log.kinds().contains(&NotificationKind::DefaultTokenFetchFailed));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn checkin_failure_surfaces_as_identity_unavailable() {
        let h = harness();
        h.checkin
            .push_response(Err(network_error("connection refused")));

        let err = h
            .manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, MessagingErrorCode::IdentityUnavailable);
        assert_eq!(h.registration.register_calls(), 0);
        assert_eq!(
            h.log.kinds(),
            vec![NotificationKind::DefaultTokenFetchFailed]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failures_outside_default_scope_are_not_broadcast() {
        let h = harness();
        h.registration.push_register(Err(registration_failed(
            RegistrationFailure::InvalidScope,
            "bad scope",
        )));
        let err = h
            .manager
            .get_token("app1", "custom", TokenOptions::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.code,
            MessagingErrorCode::Registration(RegistrationFailure::InvalidScope)
        );
        assert!(!h
            .log
            .kinds()
            .contains(&NotificationKind::DefaultTokenFetchFailed));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn registration_reset_cascades_to_every_scope() {
        let h = harness();
        for scope in ["*", "fcm", ALL_SCOPE_IDENTIFIER] {
            h.manager
                .get_token("app1", scope, TokenOptions::new())
                .await
                .unwrap();
        }
        h.manager
            .get_token("app2", "*", TokenOptions::new())
            .await
            .unwrap();
        h.registration
            .push_register(Ok(RegistrationResponse::IdentityReset));

        let result = h.manager.refresh_token("app1", "fcm").await.unwrap();
        assert!(result.is_identity_reset());
        assert!(h.store.scopes("app1").unwrap().is_empty());
        assert_eq!(h.store.get_identity("app1").unwrap(), None);
        assert!(h.store.get("app2", "*").unwrap().is_some());
        assert!(h.log.kinds().contains(&NotificationKind::IdentityInvalidated));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn checkin_reset_returns_reset_result() {
        let h = harness();
        h.checkin.push_response(Ok(CheckinResponse::IdentityReset));
        let result = h
            .manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap();
        assert_eq!(result, TokenResult::IdentityReset);
        assert_eq!(h.registration.register_calls(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn token_from_replaced_identity_is_discarded() {
        let h = harness_with(
            MessagingConfig::default(),
            FakeRegistrationBackend::new().with_delay(Duration::from_millis(40)),
        );
        let (result, invalidated) = futures::join!(
            h.manager.get_token("app1", "*", TokenOptions::new()),
            async {
                sleep(Duration::from_millis(10)).await;
                h.manager.invalidate_identity("app1").await
            }
        );
        invalidated.unwrap();
        assert!(result.unwrap().is_identity_reset());
        assert_eq!(h.store.get("app1", "*").unwrap(), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn delivery_token_prefers_specific_scope() {
        let h = harness();
        let all = h
            .manager
            .get_token("app1", ALL_SCOPE_IDENTIFIER, TokenOptions::new())
            .await
            .unwrap()
            .into_token()
            .unwrap();
        assert_eq!(h.manager.delivery_token("app1", "*").unwrap(), Some(all));

        let specific = h
            .manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap()
            .into_token()
            .unwrap();
        assert_eq!(
            h.manager.delivery_token("app1", "*").unwrap(),
            Some(specific)
        );
        assert_eq!(h.manager.delivery_token("app2", "*").unwrap(), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_scope_is_rejected() {
        let h = harness();
        let err = h
            .manager
            .get_token("app1", "", TokenOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, MessagingErrorCode::InvalidArgument);
        assert!(h.manager.refresh_token("", "*").await.is_err());
        assert!(h.manager.delete_token("app1", "").await.is_err());
        assert_eq!(h.checkin.calls(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeout_applies_to_registration() {
        let h = harness_with(
            MessagingConfig::default().with_request_timeout(Duration::from_millis(10)),
            FakeRegistrationBackend::new().with_delay(Duration::from_secs(5)),
        );
        let err = h
            .manager
            .get_token("app1", "fcm", TokenOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, MessagingErrorCode::Network);
        assert!(h.store.get("app1", "fcm").unwrap().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn identity_invalidation_forgets_revocations() {
        let h = harness();
        h.manager
            .get_token("app1", "fcm", TokenOptions::new())
            .await
            .unwrap();
        h.manager.delete_token("app1", "fcm").await.unwrap();
        assert_eq!(
            h.manager.token_state("app1", "fcm").unwrap(),
            TokenState::Revoked
        );

        h.manager.invalidate_identity("app1").await.unwrap();
        assert_eq!(
            h.manager.token_state("app1", "fcm").unwrap(),
            TokenState::Unregistered
        );
        assert!(h.manager.inner.registry.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn oldest_revocation_is_forgotten_past_limit() {
        let h = harness();
        for index in 0..=REVOKED_KEYS_LIMIT {
            let scope = format!("scope-{index}");
            h.manager
                .get_token("app1", &scope, TokenOptions::new())
                .await
                .unwrap();
            h.manager.delete_token("app1", &scope).await.unwrap();
        }

        assert_eq!(
            h.manager.inner.registry.lock().unwrap().len(),
            REVOKED_KEYS_LIMIT
        );
        assert_eq!(
            h.manager.token_state("app1", "scope-0").unwrap(),
            TokenState::Unregistered
        );
        assert_eq!(
            h.manager
                .token_state("app1", &format!("scope-{REVOKED_KEYS_LIMIT}"))
                .unwrap(),
            TokenState::Revoked
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unreadable_token_record_is_registered_again() {
        let dir = crate::test_support::temp_dir("token-manager");
        let store = Arc::new(FileCredentialStore::open(&dir).unwrap());
        let registration = Arc::new(FakeRegistrationBackend::new());
        let manager = TokenManager::new(
            &MessagingConfig::default(),
            store.clone(),
            Arc::new(FakeCheckinBackend::new()),
            registration.clone(),
            NotificationCenter::new(),
        );
        manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap();

        let record = store
            .root()
            .join("app1")
            .join("tokens")
            .join("%2A.json");
        std::fs::write(&record, b"{truncated").unwrap();

        let token = manager
            .get_token("app1", "*", TokenOptions::new())
            .await
            .unwrap()
            .into_token()
            .unwrap();
        assert_eq!(token.token, "token-2");
        assert_eq!(registration.register_calls(), 2);

        std::fs::write(&record, b"{truncated").unwrap();
        manager.delete_token("app1", "*").await.unwrap();
        assert_eq!(registration.unregister_calls(), 0);
        assert!(store.get("app1", "*").unwrap().is_none());
        std::fs::remove_dir_all(dir).ok();
    }
}
