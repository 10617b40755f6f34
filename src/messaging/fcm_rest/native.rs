use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Url};

use super::{
    authorization_value, build_checkin_body, parse_checkin_body, parse_registration_body,
    registration_params, CheckinBackend, CheckinRequest, CheckinResponse, DeletionResponse,
    RegistrationBackend, RegistrationReply, RegistrationRequest, RegistrationResponse,
};
use crate::messaging::config::MessagingConfig;
use crate::messaging::error::{
    internal_error, invalid_argument, network_error, registration_failed, server_error,
    MessagingResult, RegistrationFailure,
};

/// HTTP client for the checkin and registration backends.
#[derive(Clone, Debug)]
pub struct FcmClient {
    http: Client,
    checkin_url: Url,
    registration_url: Url,
}

impl FcmClient {
    pub fn new(config: &MessagingConfig) -> MessagingResult<Self> {
        Self::build(
            &config.checkin_endpoint,
            &config.registration_endpoint,
            config.request_timeout,
        )
    }

    pub fn with_endpoints(checkin: &str, registration: &str) -> MessagingResult<Self> {
        Self::build(checkin, registration, None)
    }

    fn build(
        checkin: &str,
        registration: &str,
        timeout: Option<Duration>,
    ) -> MessagingResult<Self> {
        let checkin_url = Url::parse(checkin).map_err(|err| {
            invalid_argument(format!("Invalid checkin endpoint '{checkin}': {err}"))
        })?;
        let registration_url = Url::parse(registration).map_err(|err| {
            invalid_argument(format!(
                "Invalid registration endpoint '{registration}': {err}"
            ))
        })?;
        let mut builder = Client::builder()
            .user_agent(format!("firebase-messaging-rs/{}", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|err| internal_error(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self {
            http,
            checkin_url,
            registration_url,
        })
    }

    async fn post_registration(
        &self,
        request: &RegistrationRequest,
        delete: bool,
    ) -> MessagingResult<RegistrationReply> {
        let authorization = HeaderValue::from_str(&authorization_value(&request.identity))
            .map_err(|err| invalid_argument(format!("Invalid authorization header: {err}")))?;

        let response = self
            .http
            .post(self.registration_url.clone())
            .header(AUTHORIZATION, authorization)
            .form(&registration_params(request, delete))
            .send()
            .await
            .map_err(|err| network_error(format!("Network error registering token: {err}")))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|err| {
            network_error(format!("Failed to read registration response: {err}"))
        })?;
        parse_registration_body(status, &body)
    }
}

#[async_trait]
impl CheckinBackend for FcmClient {
    async fn checkin(&self, request: &CheckinRequest) -> MessagingResult<CheckinResponse> {
        let response = self
            .http
            .post(self.checkin_url.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .json(&build_checkin_body(request))
            .send()
            .await
            .map_err(|err| network_error(format!("Network error during checkin: {err}")))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| network_error(format!("Failed to read checkin response: {err}")))?;

        if !status.is_success() {
            let snippet = String::from_utf8_lossy(&bytes);
            return Err(server_error(
                status.as_u16(),
                format!("Checkin failed with status {status}: {snippet}"),
            ));
        }
        parse_checkin_body(&bytes)
    }
}

#[async_trait]
impl RegistrationBackend for FcmClient {
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> MessagingResult<RegistrationResponse> {
        match self.post_registration(request, false).await? {
            RegistrationReply::Token(token) => Ok(RegistrationResponse::Token(token)),
            RegistrationReply::IdentityReset => Ok(RegistrationResponse::IdentityReset),
            RegistrationReply::Deleted => Err(registration_failed(
                RegistrationFailure::Unknown,
                "Registration backend answered a token request with a deletion",
            )),
        }
    }

    async fn unregister(&self, request: &RegistrationRequest) -> MessagingResult<DeletionResponse> {
        match self.post_registration(request, true).await? {
            // Some backends echo the revoked token instead of `deleted=`.
            RegistrationReply::Deleted | RegistrationReply::Token(_) => Ok(DeletionResponse::Deleted),
            RegistrationReply::IdentityReset => Ok(DeletionResponse::IdentityReset),
        }
    }
}
