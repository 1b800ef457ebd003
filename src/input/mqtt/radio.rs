//! [`RadioStack`] over MQTT request/response.

use super::protocol::{
    self, AddressBody, CancelBody, CommandBody, Request, RequestKind, Response, SubscribeBody,
    WriteBody,
};
use crate::error::RadioError;
use crate::radio::{AttributeAddress, ClusterAddress, RadioStack, ReportHandle};
use crate::registry::ReportingPolicy;
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Publishes requests and matches responses by transaction id.
///
/// Callers bound each request with their own timeout; an abandoned request
/// drops its pending entry and a late response is ignored.
pub struct MqttRadio {
    client: AsyncClient,
    base_topic: String,
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

/// Removes the pending entry when the request future goes away.
struct PendingRequest<'a> {
    radio: &'a MqttRadio,
    transaction: String,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.radio.pending.lock().remove(&self.transaction);
    }
}

impl MqttRadio {
    pub fn new(client: AsyncClient, base_topic: impl Into<String>) -> Self {
        Self {
            client,
            base_topic: base_topic.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    /// Hand a response payload to the waiting request.
    pub fn complete(&self, payload: &str) {
        let response: Response = match serde_json::from_str(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!("[MQTT] Malformed response: {}", e);
                return;
            }
        };
        match self.pending.lock().remove(&response.transaction) {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => debug!(
                "[MQTT] Response for unknown or abandoned transaction {}",
                response.transaction
            ),
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    async fn request<T: Serialize>(
        &self,
        kind: RequestKind,
        body: T,
        cluster: u16,
    ) -> Result<Option<String>, RadioError> {
        let transaction = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(transaction.clone(), tx);
        let _guard = PendingRequest {
            radio: self,
            transaction: transaction.clone(),
        };

        let payload = serde_json::to_vec(&Request {
            transaction: &transaction,
            body,
        })
        .map_err(|e| RadioError::Transport(e.to_string()))?;

        let topic = protocol::request_topic(&self.base_topic, kind);
        debug!("[MQTT] {} -> {}", topic, transaction);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| RadioError::Transport(e.to_string()))?;

        match rx.await {
            Ok(response) => response.into_result(cluster),
            Err(_) => Err(RadioError::Transport("response channel closed".into())),
        }
    }

    fn expect_value(value: Option<String>) -> Result<String, RadioError> {
        value.ok_or_else(|| RadioError::Transport("response without value".into()))
    }

    fn expect_hex(value: Option<String>) -> Result<Vec<u8>, RadioError> {
        let value = Self::expect_value(value)?;
        hex::decode(value.trim_start_matches("0x")).map_err(|e| RadioError::Transport(e.to_string()))
    }
}

#[async_trait]
impl RadioStack for MqttRadio {
    async fn subscribe_report(
        &self,
        address: AttributeAddress,
        policy: ReportingPolicy,
    ) -> Result<ReportHandle, RadioError> {
        let body = SubscribeBody {
            address: AddressBody::from(address),
            reporting: policy,
        };
        let value = self.request(RequestKind::Subscribe, body, address.cluster).await?;
        Self::expect_value(value).map(ReportHandle)
    }

    async fn cancel_report(&self, handle: &ReportHandle) -> Result<(), RadioError> {
        let body = CancelBody { handle: &handle.0 };
        self.request(RequestKind::Cancel, body, 0).await.map(|_| ())
    }

    async fn read_attribute(&self, address: AttributeAddress) -> Result<Vec<u8>, RadioError> {
        let value = self
            .request(RequestKind::Read, AddressBody::from(address), address.cluster)
            .await?;
        Self::expect_hex(value)
    }

    async fn write_attribute(
        &self,
        address: AttributeAddress,
        raw: Vec<u8>,
    ) -> Result<Vec<u8>, RadioError> {
        let body = WriteBody {
            address: AddressBody::from(address),
            value: hex::encode(&raw),
        };
        let value = self.request(RequestKind::Write, body, address.cluster).await?;
        // Coordinators that do not echo the value confirm the one written.
        match value {
            Some(_) => Self::expect_hex(value),
            None => Ok(raw),
        }
    }

    async fn send_command(
        &self,
        address: ClusterAddress,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<(), RadioError> {
        let body = CommandBody::new(address, command, &payload);
        self.request(RequestKind::Command, body, address.cluster).await.map(|_| ())
    }
}
