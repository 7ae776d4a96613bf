//! Webhook-backed notification gateway

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error};

use super::gateway::{DeliveryId, DispatchRequest, GatewayError, NotificationGateway};

#[derive(Debug, Default, Deserialize)]
struct WebhookResponse {
    delivery_id: Option<String>,
}

/// Posts each dispatch request as JSON to a webhook
///
/// 4xx responses are [`GatewayError::Rejected`]; transport failures and
/// 5xx responses are [`GatewayError::Unavailable`]. The delivery id is read
/// from the response body, or minted when the webhook does not return one.
pub struct HttpNotificationGateway {
    client: Client,
    url: String,
}

impl HttpNotificationGateway {
    pub fn new(url: impl Into<String>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationGateway for HttpNotificationGateway {
    async fn queue(&self, request: DispatchRequest) -> Result<DeliveryId, GatewayError> {
        debug!(
            url = %self.url,
            channel = %request.channel,
            instance_id = %request.instance_id,
            "Posting notification"
        );

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = %status, body = %body, "Notification webhook failed");

            let message = format!("HTTP {}: {}", status, body);
            return Err(if status.is_client_error() {
                GatewayError::Rejected(message)
            } else {
                GatewayError::Unavailable(message)
            });
        }

        // An empty or non-JSON body still counts as accepted
        let body = response.text().await.unwrap_or_default();
        let parsed: WebhookResponse = serde_json::from_str(&body).unwrap_or_default();

        Ok(parsed
            .delivery_id
            .filter(|id| !id.is_empty())
            .map(DeliveryId)
            .unwrap_or_else(DeliveryId::generate))
    }
}
