//! Typed views over Stripe webhook event envelopes.
//!
//! Only the fields the billing flow reads are modelled; everything else in the
//! payload is ignored during deserialisation.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;

/// Event envelope as posted to the webhook endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub livemode: bool,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: Value,
}

/// Event types the application reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    CustomerSubscriptionDeleted,
    Other,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self.event_type.as_str() {
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "invoice.payment_succeeded" => EventKind::InvoicePaymentSucceeded,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            "customer.subscription.deleted" => EventKind::CustomerSubscriptionDeleted,
            _ => EventKind::Other,
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    /// Deserialises `data.object` into a typed view.
    pub fn object<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data.object)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionObject {
    /// Trimmed, non-empty metadata value.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub attempt_count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}
