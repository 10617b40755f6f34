use std::fmt::{Display, Formatter};

use crate::messaging::constants::SEC_MISSING_ENTITLEMENT_ERROR_CODE;

/// Reason a registration request was rejected by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationFailure {
    InvalidScope,
    RateLimited,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessagingErrorCode {
    InvalidArgument,
    /// Transport failure or timeout. Callers may retry with backoff.
    Network,
    /// The backend answered with a non-success status.
    Server { status: u16 },
    /// The process cannot reach platform secure storage. Not retryable.
    Entitlement,
    /// No checkin identity could be obtained for the request.
    IdentityUnavailable,
    Registration(RegistrationFailure),
    Storage,
    Internal,
}

impl MessagingErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagingErrorCode::InvalidArgument => "messaging/invalid-argument",
            MessagingErrorCode::Network => "messaging/network-error",
            MessagingErrorCode::Server { .. } => "messaging/server-error",
            MessagingErrorCode::Entitlement => "messaging/missing-entitlement",
            MessagingErrorCode::IdentityUnavailable => "messaging/identity-unavailable",
            MessagingErrorCode::Registration(RegistrationFailure::InvalidScope) => {
                "messaging/registration-invalid-scope"
            }
            MessagingErrorCode::Registration(RegistrationFailure::RateLimited) => {
                "messaging/registration-rate-limited"
            }
            MessagingErrorCode::Registration(RegistrationFailure::Unknown) => {
                "messaging/registration-failed"
            }
            MessagingErrorCode::Storage => "messaging/storage-error",
            MessagingErrorCode::Internal => "messaging/internal",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessagingError {
    pub code: MessagingErrorCode,
    message: String,
}

impl MessagingError {
    pub fn new(code: MessagingErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self.code {
            MessagingErrorCode::Network => true,
            MessagingErrorCode::Server { status } => status >= 500,
            MessagingErrorCode::Registration(RegistrationFailure::RateLimited) => true,
            _ => false,
        }
    }

    /// Platform diagnostic code attached to the error, if any.
    pub fn diagnostic_code(&self) -> Option<i32> {
        match self.code {
            MessagingErrorCode::Entitlement => Some(SEC_MISSING_ENTITLEMENT_ERROR_CODE),
            _ => None,
        }
    }
}

impl Display for MessagingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for MessagingError {}

pub type MessagingResult<T> = Result<T, MessagingError>;

pub fn invalid_argument(message: impl Into<String>) -> MessagingError {
    MessagingError::new(MessagingErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> MessagingError {
    MessagingError::new(MessagingErrorCode::Internal, message)
}

pub fn network_error(message: impl Into<String>) -> MessagingError {
    MessagingError::new(MessagingErrorCode::Network, message)
}

pub fn server_error(status: u16, message: impl Into<String>) -> MessagingError {
    MessagingError::new(MessagingErrorCode::Server { status }, message)
}

pub fn entitlement_error(message: impl Into<String>) -> MessagingError {
    MessagingError::new(MessagingErrorCode::Entitlement, message)
}

pub fn storage_error(message: impl Into<String>) -> MessagingError {
    MessagingError::new(MessagingErrorCode::Storage, message)
}

pub fn registration_failed(kind: RegistrationFailure, message: impl Into<String>) -> MessagingError {
    MessagingError::new(MessagingErrorCode::Registration(kind), message)
}

/// Wraps a checkin failure so callers of token operations see why no identity was available.
pub fn identity_unavailable(cause: &MessagingError) -> MessagingError {
    MessagingError::new(
        MessagingErrorCode::IdentityUnavailable,
        format!("Checkin identity unavailable: {cause}"),
    )
}
