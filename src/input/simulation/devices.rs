//! Demo devices for running the gateway without a coordinator.

use super::{SimOutcome, SimulatedRadio};
use crate::error::RadioError;
use crate::fingerprint::{DeviceFingerprint, NodeId};
use crate::radio::{AttributeAddress, RadioEvent};
use crate::zcl::tuya::{self, Datapoint, DatapointFrame};
use crate::zcl::{attribute, cluster, zone_status};
use log::info;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};

const CLIMATE: NodeId = NodeId(0xa4c1_3800_6e2f_11aa);
const SWITCH: NodeId = NodeId(0xa4c1_3800_9b01_22bb);
const DOOR: NodeId = NodeId(0xa4c1_3800_4c7d_33cc);
const MYSTERY: NodeId = NodeId(0xa4c1_3800_f00d_44dd);

/// A climate sensor, a wall switch, a door contact and one device no
/// profile knows.
pub fn demo_fingerprints() -> Vec<DeviceFingerprint> {
    vec![
        DeviceFingerprint::new(CLIMATE, "_TZE200_bjawzodf", "TS0601")
            .with_cluster(1, cluster::BASIC)
            .with_cluster(1, cluster::TUYA_PRIVATE),
        DeviceFingerprint::new(SWITCH, "_TZ3000_ji4araar", "TS0011")
            .with_cluster(1, cluster::BASIC)
            .with_cluster(1, cluster::ON_OFF),
        DeviceFingerprint::new(DOOR, "_TZ3000_26fmupbb", "TS0203")
            .with_cluster(1, cluster::BASIC)
            .with_cluster(1, cluster::POWER_CONFIG)
            .with_cluster(1, cluster::IAS_ZONE),
        DeviceFingerprint::new(MYSTERY, "_TZ3000_mystery", "TS0049")
            .with_cluster(1, cluster::BASIC)
            .with_cluster(1, cluster::ON_OFF),
    ]
}

fn address(node: NodeId, cluster: u16, attribute: u16) -> AttributeAddress {
    AttributeAddress {
        node,
        endpoint: 1,
        cluster,
        attribute,
    }
}

fn climate_datapoints(step: u32) -> Vec<Datapoint> {
    // Every tenth reading is far below the sensor's range
    let decidegrees = if step % 10 == 0 { -1000 } else { 200 + (step % 8) as i32 * 3 };
    vec![
        Datapoint::value(1, decidegrees),
        Datapoint::value(2, 50 + (step % 5) as i32),
        Datapoint::value(4, 100 - (step % 40) as i32),
    ]
}

/// Announce the demo devices, then feed them reports every `period`.
///
/// The climate sensor speaks Tuya datapoints. The switch refuses reporting so
/// its binding is polled.
pub fn run_device_simulation(
    radio: Arc<SimulatedRadio>,
    events: mpsc::Sender<RadioEvent>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        radio.script_subscribe(
            cluster::ON_OFF,
            attribute::ON_OFF,
            vec![SimOutcome::Fail(RadioError::ReportingUnsupported)],
        );
        radio.set_attribute(address(SWITCH, cluster::ON_OFF, attribute::ON_OFF), vec![0]);
        for datapoint in climate_datapoints(1) {
            radio.set_datapoint(CLIMATE, 1, datapoint);
        }

        for fingerprint in demo_fingerprints() {
            info!("[Sim] Announcing {} [{}]", fingerprint.node_id, fingerprint);
            if events.send(RadioEvent::NodeAnnounce { fingerprint }).await.is_err() {
                return;
            }
        }

        let mut interval = interval(period);
        let mut step: u32 = 0;
        loop {
            interval.tick().await;
            step += 1;

            let datapoints = climate_datapoints(step);
            let door_open = step % 2 == 1;
            info!(
                "[Sim] Tick {}: {}, door {}",
                step,
                datapoints[0],
                if door_open { "open" } else { "closed" }
            );
            for datapoint in &datapoints {
                radio.set_datapoint(CLIMATE, 1, datapoint.clone());
            }

            let reports = [
                RadioEvent::ClusterCommand {
                    node: CLIMATE,
                    endpoint: 1,
                    cluster: cluster::TUYA_PRIVATE,
                    command: tuya::command::DATA_REPORT,
                    payload: DatapointFrame::new(step as u16, datapoints).encode(),
                },
                RadioEvent::AttributeReport {
                    node: DOOR,
                    endpoint: 1,
                    cluster: cluster::IAS_ZONE,
                    attribute: attribute::ZONE_STATUS,
                    raw: (if door_open { zone_status::ALARM1 as u16 } else { 0 })
                        .to_le_bytes()
                        .to_vec(),
                },
            ];
            for report in reports {
                if events.send(report).await.is_err() {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_demo_nodes_are_distinct() {
        let nodes: HashSet<_> = demo_fingerprints().iter().map(|f| f.node_id).collect();
        assert_eq!(nodes.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_announces_then_reports() {
        let radio = Arc::new(SimulatedRadio::new());
        let (tx, mut rx) = mpsc::channel(16);
        let task = run_device_simulation(radio, tx, Duration::from_secs(30));

        for _ in 0..4 {
            assert!(matches!(rx.recv().await, Some(RadioEvent::NodeAnnounce { .. })));
        }
        let Some(RadioEvent::ClusterCommand { node, payload, .. }) = rx.recv().await else {
            panic!("expected a datapoint report first");
        };
        assert_eq!(node, CLIMATE);
        let frame = DatapointFrame::parse(&payload).unwrap();
        assert_eq!(frame.datapoints[0], Datapoint::value(1, 203));
        assert!(matches!(
            rx.recv().await,
            Some(RadioEvent::AttributeReport { node: DOOR, .. })
        ));
        task.abort();
    }
}
