//! Wire format spoken with the radio coordinator.
//!
//! Events arrive on `{base}/event/{announce|report|command|offline|removed}`.
//! Requests go to `{base}/request/{subscribe|cancel|read|write|command}` and
//! carry a transaction id that the coordinator echoes on `{base}/response`.
//! Raw attribute and command payloads are hex strings, node addresses
//! `0x`-prefixed hex.

use crate::error::{ProtocolError, RadioError};
use crate::fingerprint::{DeviceFingerprint, EndpointCluster, NodeId};
use crate::radio::{AttributeAddress, ClusterAddress, RadioEvent};
use crate::registry::ReportingPolicy;
use serde::{Deserialize, Serialize};

pub fn event_topic(base: &str) -> String {
    format!("{}/event/+", base)
}

pub fn response_topic(base: &str) -> String {
    format!("{}/response", base)
}

pub fn request_topic(base: &str, kind: RequestKind) -> String {
    format!("{}/request/{}", base, kind.as_str())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Subscribe,
    Cancel,
    Read,
    Write,
    /// Cluster-specific command, e.g. Tuya datapoints.
    Command,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Subscribe => "subscribe",
            RequestKind::Cancel => "cancel",
            RequestKind::Read => "read",
            RequestKind::Write => "write",
            RequestKind::Command => "command",
        }
    }
}

pub fn format_node(node: NodeId) -> String {
    format!("0x{:016x}", node.0)
}

pub fn parse_node(s: &str) -> Result<NodeId, ProtocolError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map(NodeId)
        .map_err(|_| ProtocolError::InvalidNode(s.to_string()))
}

#[derive(Debug, Deserialize)]
struct AnnounceMessage {
    node: String,
    manufacturer: String,
    model: String,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    clusters: Vec<EndpointCluster>,
}

#[derive(Debug, Deserialize)]
struct ReportMessage {
    node: String,
    endpoint: u8,
    cluster: u16,
    attribute: u16,
    value: String,
}

#[derive(Debug, Deserialize)]
struct CommandMessage {
    node: String,
    endpoint: u8,
    cluster: u16,
    command: u8,
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Deserialize)]
struct NodeMessage {
    node: String,
}

/// Decode a message received on an event topic.
///
/// Returns `Ok(None)` when `topic` is not an event topic under `base`.
pub fn decode_event(base: &str, topic: &str, payload: &str) -> Result<Option<RadioEvent>, ProtocolError> {
    let Some(kind) = topic
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix("/event/"))
    else {
        return Ok(None);
    };

    let event = match kind {
        "announce" => {
            let msg: AnnounceMessage = serde_json::from_str(payload)?;
            let mut fingerprint = DeviceFingerprint::new(parse_node(&msg.node)?, msg.manufacturer, msg.model);
            fingerprint.product = msg.product.filter(|p| !p.is_empty());
            fingerprint.clusters = msg.clusters.into_iter().collect();
            RadioEvent::NodeAnnounce { fingerprint }
        }
        "report" => {
            let msg: ReportMessage = serde_json::from_str(payload)?;
            RadioEvent::AttributeReport {
                node: parse_node(&msg.node)?,
                endpoint: msg.endpoint,
                cluster: msg.cluster,
                attribute: msg.attribute,
                raw: hex::decode(msg.value.trim_start_matches("0x"))?,
            }
        }
        "command" => {
            let msg: CommandMessage = serde_json::from_str(payload)?;
            RadioEvent::ClusterCommand {
                node: parse_node(&msg.node)?,
                endpoint: msg.endpoint,
                cluster: msg.cluster,
                command: msg.command,
                payload: hex::decode(msg.payload.trim_start_matches("0x"))?,
            }
        }
        "offline" => {
            let msg: NodeMessage = serde_json::from_str(payload)?;
            RadioEvent::NodeOffline {
                node: parse_node(&msg.node)?,
            }
        }
        "removed" => {
            let msg: NodeMessage = serde_json::from_str(payload)?;
            RadioEvent::NodeRemoved {
                node: parse_node(&msg.node)?,
            }
        }
        other => return Err(ProtocolError::UnknownEvent(other.to_string())),
    };
    Ok(Some(event))
}

#[derive(Debug, Serialize)]
pub struct AddressBody {
    pub node: String,
    pub endpoint: u8,
    pub cluster: u16,
    pub attribute: u16,
}

impl From<AttributeAddress> for AddressBody {
    fn from(address: AttributeAddress) -> Self {
        Self {
            node: format_node(address.node),
            endpoint: address.endpoint,
            cluster: address.cluster,
            attribute: address.attribute,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubscribeBody {
    #[serde(flatten)]
    pub address: AddressBody,
    #[serde(flatten)]
    pub reporting: ReportingPolicy,
}

#[derive(Debug, Serialize)]
pub struct CancelBody<'a> {
    pub handle: &'a str,
}

#[derive(Debug, Serialize)]
pub struct WriteBody {
    #[serde(flatten)]
    pub address: AddressBody,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct CommandBody {
    pub node: String,
    pub endpoint: u8,
    pub cluster: u16,
    pub command: u8,
    pub payload: String,
}

impl CommandBody {
    pub fn new(address: ClusterAddress, command: u8, payload: &[u8]) -> Self {
        Self {
            node: format_node(address.node),
            endpoint: address.endpoint,
            cluster: address.cluster,
            command,
            payload: hex::encode(payload),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Request<'a, T> {
    pub transaction: &'a str,
    #[serde(flatten)]
    pub body: T,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Response {
    pub transaction: String,
    pub status: ResponseStatus,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    /// The `value` field on success, the mapped error otherwise.
    ///
    /// `cluster` fills in [`RadioError::ClusterUnsupported`].
    pub fn into_result(self, cluster: u16) -> Result<Option<String>, RadioError> {
        match self.status {
            ResponseStatus::Ok => Ok(self.value),
            ResponseStatus::Error => Err(map_error(self.error.as_deref().unwrap_or(""), cluster)),
        }
    }
}

pub fn map_error(error: &str, cluster: u16) -> RadioError {
    match error {
        "timeout" => RadioError::Timeout,
        "cluster_unsupported" => RadioError::ClusterUnsupported(cluster),
        "reporting_unsupported" => RadioError::ReportingUnsupported,
        "node_gone" => RadioError::NodeGone,
        other => RadioError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "zigbee-radio";

    #[test]
    fn test_decode_announce() {
        let payload = r#"{
            "node": "0x00124b0001a1b2c3",
            "manufacturer": "_TZE200_bjawzodf",
            "model": "TS0601",
            "clusters": [{"endpoint": 1, "cluster": 1026}, {"endpoint": 1, "cluster": 0}]
        }"#;
        let event = decode_event(BASE, "zigbee-radio/event/announce", payload)
            .unwrap()
            .unwrap();
        let RadioEvent::NodeAnnounce { fingerprint } = event else {
            panic!("expected announce, got {:?}", event);
        };
        assert_eq!(fingerprint.node_id, NodeId(0x00124b0001a1b2c3));
        assert_eq!(fingerprint.product, None);
        assert_eq!(fingerprint.endpoint_for(0x0402), Some(1));
    }

    #[test]
    fn test_decode_report_hex() {
        let payload = r#"{"node": "00124b0001a1b2c3", "endpoint": 1, "cluster": 1026, "attribute": 0, "value": "6608"}"#;
        let event = decode_event(BASE, "zigbee-radio/event/report", payload)
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            RadioEvent::AttributeReport {
                node: NodeId(0x00124b0001a1b2c3),
                endpoint: 1,
                cluster: 0x0402,
                attribute: 0,
                raw: vec![0x66, 0x08],
            }
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_event(BASE, "zigbee-radio/event/report", r#"{"node":"zz","endpoint":1,"cluster":6,"attribute":0,"value":"01"}"#),
            Err(ProtocolError::InvalidNode(_))
        ));
        assert!(matches!(
            decode_event(BASE, "zigbee-radio/event/report", r#"{"node":"0x1","endpoint":1,"cluster":6,"attribute":0,"value":"0g"}"#),
            Err(ProtocolError::InvalidHex(_))
        ));
        assert!(matches!(
            decode_event(BASE, "zigbee-radio/event/rename", r#"{"node":"0x1"}"#),
            Err(ProtocolError::UnknownEvent(_))
        ));
        assert!(decode_event(BASE, "other/event/report", "{}").unwrap().is_none());
    }

    #[test]
    fn test_offline_and_removed() {
        let offline = decode_event(BASE, "zigbee-radio/event/offline", r#"{"node":"0x2a"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(offline, RadioEvent::NodeOffline { node: NodeId(42) });
        let removed = decode_event(BASE, "zigbee-radio/event/removed", r#"{"node":"0x2a"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(removed, RadioEvent::NodeRemoved { node: NodeId(42) });
    }

    #[test]
    fn test_subscribe_request_shape() {
        let address = AttributeAddress {
            node: NodeId(0x2a),
            endpoint: 1,
            cluster: 6,
            attribute: 0,
        };
        let request = Request {
            transaction: "t-1",
            body: SubscribeBody {
                address: address.into(),
                reporting: ReportingPolicy::default(),
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["transaction"], "t-1");
        assert_eq!(json["node"], "0x000000000000002a");
        assert_eq!(json["cluster"], 6);
        assert_eq!(json["max_interval"], 300);
    }

    #[test]
    fn test_decode_tuya_command() {
        let payload = r#"{"node": "0x2a", "endpoint": 1, "cluster": 61184, "command": 2, "payload": "000101020004000000d7"}"#;
        let event = decode_event(BASE, "zigbee-radio/event/command", payload)
            .unwrap()
            .unwrap();
        let RadioEvent::ClusterCommand { cluster, command, payload, .. } = event else {
            panic!("expected a cluster command, got {:?}", event);
        };
        assert_eq!(cluster, 0xEF00);
        assert_eq!(command, 2);
        assert_eq!(payload.len(), 10);

        let empty = decode_event(BASE, "zigbee-radio/event/command", r#"{"node":"0x2a","endpoint":1,"cluster":61184,"command":6}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(empty, RadioEvent::ClusterCommand { ref payload, .. } if payload.is_empty()));
    }

    #[test]
    fn test_command_request_shape() {
        let address = ClusterAddress {
            node: NodeId(0x2a),
            endpoint: 1,
            cluster: 0xEF00,
        };
        let request = Request {
            transaction: "t-2",
            body: CommandBody::new(address, 0x00, &[0x00, 0x01, 0x10, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0xE1]),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["cluster"], 0xEF00);
        assert_eq!(json["command"], 0);
        assert_eq!(json["payload"], "000110020004000000e1");
        assert_eq!(request_topic(BASE, RequestKind::Command), "zigbee-radio/request/command");
    }

    #[test]
    fn test_error_mapping() {
        let response: Response =
            serde_json::from_str(r#"{"transaction":"t","status":"error","error":"cluster_unsupported"}"#).unwrap();
        assert_eq!(response.into_result(0x0405), Err(RadioError::ClusterUnsupported(0x0405)));
        assert_eq!(map_error("timeout", 0), RadioError::Timeout);
        assert_eq!(map_error("reporting_unsupported", 0), RadioError::ReportingUnsupported);
        assert_eq!(map_error("boom", 0), RadioError::Transport("boom".into()));
    }
}
