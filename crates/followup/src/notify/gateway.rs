//! Notification gateway seam

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::Channel;

/// Errors returned by a notification gateway
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Transient failure; the step unit is rolled back and retried later
    #[error("notification gateway unavailable: {0}")]
    Unavailable(String),

    /// The gateway refused this request; retrying will not help
    #[error("notification rejected: {0}")]
    Rejected(String),

    /// Delivery is switched off; the step is logged as skipped
    #[error("notification delivery is disabled")]
    Disabled,
}

/// Identifier the gateway assigns to an accepted notification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub String);

impl DeliveryId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One notification handed to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub tenant_id: Uuid,
    pub instance_id: Uuid,
    pub step_id: Uuid,
    pub recipient_id: Uuid,
    pub channel: Channel,

    /// Contact for member-facing channels, staff address for staff channels
    pub address: String,

    /// Step metadata merged with recipient and template fields
    pub payload: serde_json::Value,
}

/// Accepts dispatch requests for asynchronous delivery
///
/// Called while the step unit is open; `Unavailable` rolls that unit back.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn queue(&self, request: DispatchRequest) -> Result<DeliveryId, GatewayError>;
}

/// Gateway for deployments without a delivery endpoint
///
/// Logs each request and keeps nothing. Every step it sees is logged as
/// skipped so the execution log never claims a send that did not happen.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyGateway;

#[async_trait]
impl NotificationGateway for LogOnlyGateway {
    async fn queue(&self, request: DispatchRequest) -> Result<DeliveryId, GatewayError> {
        tracing::info!(
            channel = %request.channel,
            instance_id = %request.instance_id,
            step_id = %request.step_id,
            "Notification delivery disabled, dropping request"
        );
        Err(GatewayError::Disabled)
    }
}

/// In-memory gateway that records requests for tests
#[derive(Default)]
pub struct RecordingGateway {
    requests: Mutex<Vec<DispatchRequest>>,
    failure: Mutex<Option<GatewayError>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with `error` until [`RecordingGateway::recover`]
    pub fn fail_with(&self, error: GatewayError) {
        *self.failure.lock() = Some(error);
    }

    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn queue(&self, request: DispatchRequest) -> Result<DeliveryId, GatewayError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }

        let delivery_id = DeliveryId::generate();
        tracing::debug!(
            delivery_id = %delivery_id,
            channel = %request.channel,
            instance_id = %request.instance_id,
            "Recorded notification"
        );
        self.requests.lock().push(request);
        Ok(delivery_id)
    }
}
