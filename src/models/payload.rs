use garde::Validate;
use serde::{Deserialize, Serialize};

/// Payload of a `send-email` job.
///
/// Carries the fully rendered message so the action never re-queries the
/// lead or trip it was generated from.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct EmailPayload {
    #[garde(email)]
    pub to: String,

    #[garde(length(min = 1, max = 998))]
    pub subject: String,

    #[garde(length(min = 1))]
    pub html: String,
}

/// Payload of a `retry-charge` job.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ChargePayload {
    #[garde(length(min = 1, max = 128))]
    pub customer_id: String,

    #[garde(length(min = 1, max = 128))]
    pub payment_method_id: String,

    #[garde(range(min = 1))]
    pub amount_cents: u64,

    #[garde(length(min = 1, max = 128))]
    pub order_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_payload_rejects_bad_recipient() {
        let payload = EmailPayload {
            to: "not-an-address".to_string(),
            subject: "Your trip".to_string(),
            html: "<p>hi</p>".to_string(),
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_email_payload_accepts_valid_message() {
        let payload = EmailPayload {
            to: "traveller@example.com".to_string(),
            subject: "Your trip".to_string(),
            html: "<p>hi</p>".to_string(),
        };
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn test_charge_payload_rejects_zero_amount() {
        let payload = ChargePayload {
            customer_id: "cust_1".to_string(),
            payment_method_id: "pm_1".to_string(),
            amount_cents: 0,
            order_id: "order_1".to_string(),
        };
        assert!(payload.validate().is_err());
    }
}
