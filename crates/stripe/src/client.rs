use std::collections::HashMap;

use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// Minimal client for the Stripe REST API.
#[derive(Clone)]
pub struct StripeClient {
    http: Client,
    base_url: Url,
    secret_key: String,
}

impl StripeClient {
    /// `base_url` must end with a slash, e.g. `https://api.stripe.com/v1/`.
    pub fn new(secret_key: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            secret_key: secret_key.into(),
        }
    }

    /// Creates a hosted checkout session in subscription mode.
    pub async fn create_checkout_session(
        &self,
        request: &CreateCheckoutSession<'_>,
    ) -> Result<CheckoutSession, StripeError> {
        let url = self.base_url.join("checkout/sessions")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.secret_key)
            .form(&request.form_fields())
            .send()
            .await?;
        parse_json(response).await
    }

    pub async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, StripeError> {
        let url = self
            .base_url
            .join(&format!("checkout/sessions/{session_id}"))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        parse_json(response).await
    }
}

/// Parameters for a subscription checkout.
pub struct CreateCheckoutSession<'a> {
    pub price_id: &'a str,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
    pub customer_email: Option<&'a str>,
    pub client_reference_id: &'a str,
    pub metadata: &'a [(&'a str, &'a str)],
}

impl CreateCheckoutSession<'_> {
    fn form_fields(&self) -> Vec<(String, String)> {
        let success_url = if self.success_url.contains('?') {
            format!("{}&session_id={{CHECKOUT_SESSION_ID}}", self.success_url)
        } else {
            format!("{}?session_id={{CHECKOUT_SESSION_ID}}", self.success_url)
        };

        let mut fields = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("success_url".to_string(), success_url),
            ("cancel_url".to_string(), self.cancel_url.to_string()),
            ("line_items[0][price]".to_string(), self.price_id.to_string()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            (
                "client_reference_id".to_string(),
                self.client_reference_id.to_string(),
            ),
        ];
        if let Some(email) = self.customer_email {
            fields.push(("customer_email".to_string(), email.to_string()));
        }
        for (key, value) in self.metadata {
            fields.push((format!("metadata[{key}]"), value.to_string()));
            fields.push((
                format!("subscription_data[metadata][{key}]"),
                value.to_string(),
            ));
        }
        fields
    }
}

/// Subset of the checkout session object used by the application.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum StripeError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stripe returned {status}: {message}")]
    Api { status: StatusCode, message: String },
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

async fn parse_json<T>(response: Response) -> Result<T, StripeError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .ok()
            .and_then(|envelope| envelope.error.message)
            .unwrap_or(body);
        return Err(StripeError::Api { status, message });
    }

    Ok(response.json().await?)
}
