use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_channel::{Receiver, Sender};

use crate::messaging::constants::{
    CHECKIN_FETCHED_NOTIFICATION, DEFAULT_GCM_TOKEN_FAIL_NOTIFICATION,
    IDENTITY_INVALIDATED_NOTIFICATION, REGISTRATION_TOKEN_REFRESH_NOTIFICATION,
};
use crate::messaging::error::MessagingError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    CheckinFetched,
    TokenRefresh,
    IdentityInvalidated,
    DefaultTokenFetchFailed,
}

impl NotificationKind {
    pub fn name(self) -> &'static str {
        match self {
            NotificationKind::CheckinFetched => CHECKIN_FETCHED_NOTIFICATION,
            NotificationKind::TokenRefresh => REGISTRATION_TOKEN_REFRESH_NOTIFICATION,
            NotificationKind::IdentityInvalidated => IDENTITY_INVALIDATED_NOTIFICATION,
            NotificationKind::DefaultTokenFetchFailed => DEFAULT_GCM_TOKEN_FAIL_NOTIFICATION,
        }
    }
}

/// Lifecycle event delivered to in-process observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    CheckinFetched {
        app_id: String,
        device_id: String,
    },
    TokenRefresh {
        app_id: String,
        scope: String,
        token: String,
    },
    IdentityInvalidated {
        app_id: String,
    },
    DefaultTokenFetchFailed {
        app_id: String,
        error: MessagingError,
    },
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::CheckinFetched { .. } => NotificationKind::CheckinFetched,
            Notification::TokenRefresh { .. } => NotificationKind::TokenRefresh,
            Notification::IdentityInvalidated { .. } => NotificationKind::IdentityInvalidated,
            Notification::DefaultTokenFetchFailed { .. } => {
                NotificationKind::DefaultTokenFetchFailed
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn app_id(&self) -> &str {
        match self {
            Notification::CheckinFetched { app_id, .. }
            | Notification::TokenRefresh { app_id, .. }
            | Notification::IdentityInvalidated { app_id }
            | Notification::DefaultTokenFetchFailed { app_id, .. } => app_id,
        }
    }
}

pub type NotificationObserver = Arc<dyn Fn(&Notification) + Send + Sync + 'static>;

struct ObserverEntry {
    id: u64,
    kind: Option<NotificationKind>,
    callback: NotificationObserver,
}

#[derive(Default)]
struct CenterInner {
    observers: Mutex<Vec<ObserverEntry>>,
    streams: Mutex<Vec<Sender<Notification>>>,
}

static OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-scoped dispatcher for lifecycle notifications.
///
/// Delivery is synchronous, best-effort and in-process. Nothing is queued for
/// observers that attach later.
#[derive(Clone, Default)]
pub struct NotificationCenter {
    inner: Arc<CenterInner>,
}

impl std::fmt::Debug for NotificationCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationCenter")
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for every notification. The observer stays
    /// attached until the returned handle is removed or dropped.
    pub fn add_observer<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(callback))
    }

    pub fn add_observer_for<F>(&self, kind: NotificationKind, callback: F) -> ObserverHandle
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(callback))
    }

    /// Returns a stream of every notification emitted from now on. Dropping
    /// the receiver detaches it.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (sender, receiver) = async_channel::unbounded();
        self.inner.streams.lock().unwrap().push(sender);
        receiver
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().unwrap().len()
    }

    pub fn emit(&self, notification: Notification) {
        log::debug!(
            "emitting {} for app '{}'",
            notification.name(),
            notification.app_id()
        );
        let kind = notification.kind();
        let callbacks: Vec<NotificationObserver> = self
            .inner
            .observers
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.kind.map_or(true, |wanted| wanted == kind))
            .map(|entry| entry.callback.clone())
            .collect();

        // Callbacks run outside the lock so they may add or remove observers.
        for callback in callbacks {
            callback(&notification);
        }

        self.inner
            .streams
            .lock()
            .unwrap()
            .retain(|sender| sender.try_send(notification.clone()).is_ok());
    }

    fn insert(&self, kind: Option<NotificationKind>, callback: NotificationObserver) -> ObserverHandle {
        let id = OBSERVER_ID.fetch_add(1, Ordering::SeqCst);
        self.inner
            .observers
            .lock()
            .unwrap()
            .push(ObserverEntry { id, kind, callback });
        ObserverHandle {
            id,
            center: Arc::downgrade(&self.inner),
            removed: AtomicBool::new(false),
        }
    }
}

/// Keeps an observer attached. Dropping it detaches the observer.
pub struct ObserverHandle {
    id: u64,
    center: Weak<CenterInner>,
    removed: AtomicBool,
}

impl ObserverHandle {
    pub fn remove(&self) {
        if self
            .removed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Some(center) = self.center.upgrade() {
                center
                    .observers
                    .lock()
                    .unwrap()
                    .retain(|entry| entry.id != self.id);
            }
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.remove();
    }
}
