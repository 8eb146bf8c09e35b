//! HTTP webhook collaborator.
//!
//! POSTs the JSON-encoded [`StorefrontEvent`] to a fixed URL. Transport
//! failures and 5xx responses are retried with a fixed backoff; 4xx
//! responses are not.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{RetryPolicy, retry};

use super::{Collaborator, DeliveryError};
use crate::StorefrontEvent;

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookCollaborator {
    name: String,
    url: String,
    event_types: &'static [&'static str],
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl WebhookCollaborator {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        event_types: &'static [&'static str],
        retry: RetryPolicy,
    ) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            name: name.into(),
            url: url.into(),
            event_types,
            retry,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Execute a single POST request and check the response status.
    async fn try_send(&self, body: &serde_json::Value) -> Result<(), DeliveryError> {
        let response = self.client.post(&self.url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(DeliveryError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Collaborator for WebhookCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, event: &StorefrontEvent) -> bool {
        self.event_types.contains(&event.event_type())
    }

    #[tracing::instrument(skip(self, event), fields(collaborator = %self.name, event_type = event.event_type()))]
    async fn deliver(&self, event: &StorefrontEvent) -> Result<(), DeliveryError> {
        let body = serde_json::json!({
            "sent_at": Utc::now(),
            "event": event,
        });

        let body = &body;
        retry(
            &self.retry,
            || async move {
                self.try_send(body).await.inspect_err(|e| {
                    tracing::warn!(url = %self.url, error = %e, "webhook delivery attempt failed");
                })
            },
            DeliveryError::is_retryable,
        )
        .await
    }
}
