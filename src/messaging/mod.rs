#![doc = include_str!("README.md")]
mod api;
mod checkin;
pub mod config;
pub mod constants;
pub mod error;
pub mod fcm_rest;
mod message;
mod notifications;
mod token_manager;
pub mod token_store;
mod types;

pub use api::Messaging;
pub use checkin::{CheckinClient, CheckinOutcome};
pub use config::MessagingConfig;
pub use error::{MessagingError, MessagingErrorCode, MessagingResult, RegistrationFailure};
pub use fcm_rest::{CheckinBackend, FcmClient, RegistrationBackend};
pub use message::ReceivedMessage;
pub use notifications::{
    Notification, NotificationCenter, NotificationKind, NotificationObserver, ObserverHandle,
};
pub use token_manager::TokenManager;
pub use token_store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use types::{ApnsTokenType, Identity, ScopedToken, TokenOptions, TokenResult, TokenState};
