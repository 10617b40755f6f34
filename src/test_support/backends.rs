use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::messaging::error::MessagingResult;
use crate::messaging::fcm_rest::{
    CheckinBackend, CheckinRequest, CheckinResponse, DeletionResponse, RegistrationBackend,
    RegistrationRequest, RegistrationResponse,
};
use crate::messaging::{
    Identity, Notification, NotificationCenter, NotificationKind, ObserverHandle,
};
use crate::platform::runtime::sleep;

pub fn identity(device_id: &str) -> Identity {
    Identity {
        device_id: device_id.to_string(),
        secret: format!("{device_id}-secret"),
        last_checkin: SystemTime::now(),
        ttl: None,
    }
}

/// Checkin backend that hands out `device-N` identities unless a scripted
/// response is queued.
#[derive(Default)]
pub struct FakeCheckinBackend {
    calls: AtomicUsize,
    delay: Duration,
    scripted: Mutex<VecDeque<MessagingResult<CheckinResponse>>>,
    last_request: Mutex<Option<CheckinRequest>>,
}

impl FakeCheckinBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_response(&self, response: MessagingResult<CheckinResponse>) {
        self.scripted.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CheckinRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckinBackend for FakeCheckinBackend {
    async fn checkin(&self, request: &CheckinRequest) -> MessagingResult<CheckinResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_request.lock().unwrap() = Some(request.clone());
        sleep(self.delay).await;
        let scripted = self.scripted.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(CheckinResponse::Identity(identity(&format!("device-{call}"))))
        })
    }
}

/// Registration backend issuing `token-N` values unless a scripted response
/// is queued.
#[derive(Default)]
pub struct FakeRegistrationBackend {
    register_calls: AtomicUsize,
    unregister_calls: AtomicUsize,
    delay: Duration,
    scripted_register: Mutex<VecDeque<MessagingResult<RegistrationResponse>>>,
    scripted_unregister: Mutex<VecDeque<MessagingResult<DeletionResponse>>>,
    last_register: Mutex<Option<RegistrationRequest>>,
}

impl FakeRegistrationBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_register(&self, response: MessagingResult<RegistrationResponse>) {
        self.scripted_register.lock().unwrap().push_back(response);
    }

    pub fn push_unregister(&self, response: MessagingResult<DeletionResponse>) {
        self.scripted_unregister.lock().unwrap().push_back(response);
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn unregister_calls(&self) -> usize {
        self.unregister_calls.load(Ordering::SeqCst)
    }

    pub fn last_register(&self) -> Option<RegistrationRequest> {
        self.last_register.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistrationBackend for FakeRegistrationBackend {
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> MessagingResult<RegistrationResponse> {
        let call = self.register_calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_register.lock().unwrap() = Some(request.clone());
        sleep(self.delay).await;
        let scripted = self.scripted_register.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(RegistrationResponse::Token(format!("token-{call}"))))
    }

    async fn unregister(&self, _request: &RegistrationRequest) -> MessagingResult<DeletionResponse> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        let scripted = self.scripted_unregister.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(DeletionResponse::Deleted))
    }
}

/// Records every notification emitted on a center while it is alive.
pub struct NotificationLog {
    events: Arc<Mutex<Vec<Notification>>>,
    _handle: ObserverHandle,
}

impl NotificationLog {
    pub fn attach(center: &NotificationCenter) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handle = center.add_observer(move |notification| {
            sink.lock().unwrap().push(notification.clone());
        });
        Self {
            events,
            _handle: handle,
        }
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.events().iter().map(Notification::kind).collect()
    }
}
