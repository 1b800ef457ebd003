//! Connects to the broker and routes coordinator messages.

use super::client::{MqttClient, MqttMessage};
use super::protocol;
use super::radio::MqttRadio;
use crate::config::MqttConfig;
use crate::error::{GatewayError, Result};
use crate::radio::RadioEvent;
use log::{info, warn};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect to the broker and start routing.
///
/// Responses are handed to the returned [`MqttRadio`]; events are decoded
/// and forwarded on the returned channel. The router stops the MQTT event
/// loop once the event receiver is dropped.
pub async fn connect(
    config: &MqttConfig,
) -> Result<(Arc<MqttRadio>, mpsc::Receiver<RadioEvent>, JoinHandle<()>)> {
    info!(
        "[MQTT] Connecting to {}:{}",
        config.broker_host, config.broker_port
    );

    let mqtt_client = MqttClient::new(config);
    let client = mqtt_client.client();
    let radio = Arc::new(MqttRadio::new(client.clone(), config.base_topic.clone()));

    let (msg_tx, mut msg_rx) = mpsc::channel::<MqttMessage>(256);
    let (event_tx, event_rx) = mpsc::channel::<RadioEvent>(256);
    let (connected_tx, connected_rx) = oneshot::channel();

    // Start the event loop first so it can establish the connection
    let mqtt_loop = tokio::spawn(async move {
        mqtt_client.run(msg_tx, Some(connected_tx)).await;
    });

    match tokio::time::timeout(CONNECT_TIMEOUT, connected_rx).await {
        Ok(Ok(())) => info!("[MQTT] Connection established, subscribing to topics"),
        Ok(Err(_)) => {
            mqtt_loop.abort();
            return Err(GatewayError::Config("MQTT event loop stopped before connecting".into()));
        }
        Err(_) => {
            mqtt_loop.abort();
            return Err(GatewayError::Config(format!(
                "no connection to {}:{} after {:?}",
                config.broker_host, config.broker_port, CONNECT_TIMEOUT
            )));
        }
    }

    let base = config.base_topic.clone();
    client
        .subscribe(protocol::response_topic(&base), QoS::AtLeastOnce)
        .await?;
    client
        .subscribe(protocol::event_topic(&base), QoS::AtLeastOnce)
        .await?;

    let router_radio = radio.clone();
    let router = tokio::spawn(async move {
        let response_topic = protocol::response_topic(&base);
        while let Some(msg) = msg_rx.recv().await {
            if msg.topic == response_topic {
                router_radio.complete(&msg.payload);
                continue;
            }
            match protocol::decode_event(&base, &msg.topic, &msg.payload) {
                Ok(Some(event)) => {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("[MQTT] Dropping message on {}: {}", msg.topic, e),
            }
        }
        mqtt_loop.abort();
    });

    info!("[MQTT] Radio link up on '{}'", config.base_topic);
    Ok((radio, event_rx, router))
}
