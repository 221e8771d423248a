use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::models::payload::{ChargePayload, EmailPayload};
use crate::services::actions::{EmailTransport, PaymentGateway};
use crate::services::executor::ActionError;

/// Forwards rendered emails to an HTTP mail relay.
pub struct HttpEmailRelay {
    http: Client,
    url: String,
}

impl HttpEmailRelay {
    pub fn new(url: String) -> Self {
        Self {
            http: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl EmailTransport for HttpEmailRelay {
    async fn send(&self, message: &EmailPayload) -> Result<(), ActionError> {
        let response = self
            .http
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(RelayError::Http)?;

        check_status(response.status())?;
        Ok(())
    }
}

/// Client for the payment gateway's stored-method charge endpoint.
pub struct HttpPaymentGateway {
    http: Client,
    url: String,
    api_token: Option<String>,
}

#[derive(Deserialize)]
struct ChargeResponse {
    payment_id: String,
}

impl HttpPaymentGateway {
    pub fn new(url: String, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            url,
            api_token,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(&self, charge: &ChargePayload) -> Result<String, ActionError> {
        let mut request = self.http.post(&self.url).json(charge);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(RelayError::Http)?;
        check_status(response.status())?;

        let body: ChargeResponse = response.json().await.map_err(RelayError::Http)?;
        Ok(body.payment_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream rejected request with status {0}")]
    Rejected(StatusCode),

    #[error("Upstream unavailable with status {0}")]
    Unavailable(StatusCode),
}

impl From<RelayError> for ActionError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Rejected(_) => ActionError::Permanent(err.to_string()),
            RelayError::Http(_) | RelayError::Unavailable(_) => {
                ActionError::Transient(err.to_string())
            }
        }
    }
}

/// Client errors are permanent, except timeouts and rate limiting.
fn check_status(status: StatusCode) -> Result<(), RelayError> {
    if status.is_success() {
        Ok(())
    } else if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        Err(RelayError::Rejected(status))
    } else {
        Err(RelayError::Unavailable(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_permanent() {
        let err: ActionError = check_status(StatusCode::UNPROCESSABLE_ENTITY)
            .unwrap_err()
            .into();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_throttling_and_server_errors_are_transient() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::BAD_GATEWAY,
        ] {
            let err: ActionError = check_status(status).unwrap_err().into();
            assert!(!err.is_permanent(), "{status} should be retried");
        }
        assert!(check_status(StatusCode::ACCEPTED).is_ok());
    }
}
