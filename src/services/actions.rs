use async_trait::async_trait;
use garde::Validate;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::models::payload::{ChargePayload, EmailPayload};
use crate::services::executor::{ActionError, ActionRegistry, JobHandler};
use crate::services::retry::RetryPolicy;

pub const SEND_EMAIL: &str = "send-email";
pub const RETRY_CHARGE: &str = "retry-charge";

/// Delivers a rendered email.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailPayload) -> Result<(), ActionError>;
}

/// Charges a stored payment method. Returns the gateway's payment id.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, charge: &ChargePayload) -> Result<String, ActionError>;
}

fn decode<P>(payload: &serde_json::Value) -> Result<P, ActionError>
where
    P: DeserializeOwned + Validate<Context = ()>,
{
    let decoded: P = serde_json::from_value(payload.clone())
        .map_err(|e| ActionError::InvalidPayload(e.to_string()))?;
    decoded
        .validate()
        .map_err(|e| ActionError::InvalidPayload(e.to_string()))?;
    Ok(decoded)
}

/// `send-email` action.
pub struct SendEmailAction {
    transport: Arc<dyn EmailTransport>,
}

impl SendEmailAction {
    pub fn new(transport: Arc<dyn EmailTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl JobHandler for SendEmailAction {
    fn validate(&self, payload: &serde_json::Value) -> Result<(), ActionError> {
        decode::<EmailPayload>(payload).map(|_| ())
    }

    async fn handle(&self, payload: &serde_json::Value) -> Result<(), ActionError> {
        let message: EmailPayload = decode(payload)?;
        self.transport.send(&message).await?;
        tracing::info!(to = %message.to, subject = %message.subject, "Email delivered");
        Ok(())
    }
}

/// `retry-charge` action.
pub struct RetryChargeAction {
    gateway: Arc<dyn PaymentGateway>,
}

impl RetryChargeAction {
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl JobHandler for RetryChargeAction {
    fn validate(&self, payload: &serde_json::Value) -> Result<(), ActionError> {
        decode::<ChargePayload>(payload).map(|_| ())
    }

    async fn handle(&self, payload: &serde_json::Value) -> Result<(), ActionError> {
        let charge: ChargePayload = decode(payload)?;
        let payment_id = self.gateway.charge(&charge).await?;
        metrics::counter!("payments_retry_success_total").increment(1);
        tracing::info!(
            order_id = %charge.order_id,
            customer_id = %charge.customer_id,
            amount_cents = charge.amount_cents,
            payment_id = %payment_id,
            "Charge retry succeeded"
        );
        Ok(())
    }
}

/// Register the two application actions with their retry policies.
pub fn register_defaults(
    registry: &mut ActionRegistry,
    email: Arc<dyn EmailTransport>,
    gateway: Arc<dyn PaymentGateway>,
    email_policy: RetryPolicy,
    charge_policy: RetryPolicy,
) {
    registry
        .register(SEND_EMAIL, Arc::new(SendEmailAction::new(email)), email_policy)
        .register(
            RETRY_CHARGE,
            Arc::new(RetryChargeAction::new(gateway)),
            charge_policy,
        );
}
