//! In-process radio stack with scripted outcomes.

use crate::error::RadioError;
use crate::fingerprint::NodeId;
use crate::radio::{AttributeAddress, ClusterAddress, RadioEvent, RadioStack, ReportHandle};
use crate::registry::ReportingPolicy;
use crate::zcl::cluster;
use crate::zcl::tuya::{self, Datapoint, DatapointFrame};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;

/// Scripted result of one radio call.
#[derive(Clone, Debug, PartialEq)]
pub enum SimOutcome {
    Ok,
    Fail(RadioError),
    /// Never answers.
    Hang,
}

#[derive(Default)]
struct SimState {
    subscribe_scripts: HashMap<(u16, u16), VecDeque<SimOutcome>>,
    write_scripts: HashMap<(u16, u16), VecDeque<SimOutcome>>,
    command_scripts: HashMap<(u16, u8), VecDeque<SimOutcome>>,
    attributes: HashMap<AttributeAddress, Vec<u8>>,
    active: HashMap<ReportHandle, AttributeAddress>,
    subscribe_calls: Vec<AttributeAddress>,
    cancelled: Vec<ReportHandle>,
    writes: Vec<(AttributeAddress, Vec<u8>)>,
    commands: Vec<(ClusterAddress, u8, Vec<u8>)>,
    datapoints: HashMap<(NodeId, u8), Vec<Datapoint>>,
    next_handle: u64,
}

/// Radio stack that answers from memory.
///
/// Calls succeed unless a script for the (cluster, attribute) pair says
/// otherwise; scripts are consumed one outcome per call. Reads answer from
/// values set with [`SimulatedRadio::set_attribute`] or written earlier.
///
/// Tuya devices are modelled too: a data query reports every datapoint
/// stored with [`SimulatedRadio::set_datapoint`], and a data request stores
/// its datapoints and is answered with a data response.
#[derive(Default)]
pub struct SimulatedRadio {
    state: Mutex<SimState>,
    events: Option<mpsc::Sender<RadioEvent>>,
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo successful writes back as attribute reports on `events`.
    pub fn with_events(events: mpsc::Sender<RadioEvent>) -> Self {
        Self {
            state: Mutex::default(),
            events: Some(events),
        }
    }

    pub fn script_subscribe(&self, cluster: u16, attribute: u16, outcomes: Vec<SimOutcome>) {
        self.state
            .lock()
            .subscribe_scripts
            .entry((cluster, attribute))
            .or_default()
            .extend(outcomes);
    }

    pub fn script_write(&self, cluster: u16, attribute: u16, outcomes: Vec<SimOutcome>) {
        self.state
            .lock()
            .write_scripts
            .entry((cluster, attribute))
            .or_default()
            .extend(outcomes);
    }

    pub fn script_command(&self, cluster: u16, command: u8, outcomes: Vec<SimOutcome>) {
        self.state
            .lock()
            .command_scripts
            .entry((cluster, command))
            .or_default()
            .extend(outcomes);
    }

    /// Store a datapoint on a Tuya device, replacing any with the same id.
    pub fn set_datapoint(&self, node: NodeId, endpoint: u8, datapoint: Datapoint) {
        let mut state = self.state.lock();
        let stored = state.datapoints.entry((node, endpoint)).or_default();
        stored.retain(|dp| dp.id != datapoint.id);
        stored.push(datapoint);
    }

    pub fn datapoints(&self, node: NodeId, endpoint: u8) -> Vec<Datapoint> {
        self.state
            .lock()
            .datapoints
            .get(&(node, endpoint))
            .cloned()
            .unwrap_or_default()
    }

    /// Every cluster command sent, in order.
    pub fn commands(&self) -> Vec<(ClusterAddress, u8, Vec<u8>)> {
        self.state.lock().commands.clone()
    }

    pub fn set_attribute(&self, address: AttributeAddress, raw: Vec<u8>) {
        self.state.lock().attributes.insert(address, raw);
    }

    /// Addresses with a live subscription, one entry per subscription.
    pub fn active_subscriptions(&self) -> Vec<AttributeAddress> {
        self.state.lock().active.values().copied().collect()
    }

    /// Every subscribe request received, in order.
    pub fn subscribe_calls(&self) -> Vec<AttributeAddress> {
        self.state.lock().subscribe_calls.clone()
    }

    pub fn cancelled_reports(&self) -> Vec<ReportHandle> {
        self.state.lock().cancelled.clone()
    }

    pub fn writes(&self) -> Vec<(AttributeAddress, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    fn next_outcome(
        scripts: &mut HashMap<(u16, u16), VecDeque<SimOutcome>>,
        address: &AttributeAddress,
    ) -> SimOutcome {
        scripts
            .get_mut(&(address.cluster, address.attribute))
            .and_then(|queue| queue.pop_front())
            .unwrap_or(SimOutcome::Ok)
    }
}

#[async_trait]
impl RadioStack for SimulatedRadio {
    async fn subscribe_report(
        &self,
        address: AttributeAddress,
        _policy: ReportingPolicy,
    ) -> Result<ReportHandle, RadioError> {
        let outcome = {
            let mut state = self.state.lock();
            state.subscribe_calls.push(address);
            let outcome = Self::next_outcome(&mut state.subscribe_scripts, &address);
            if outcome == SimOutcome::Ok {
                state.next_handle += 1;
                let handle = ReportHandle(format!("sim-{}", state.next_handle));
                state.active.insert(handle.clone(), address);
                debug!("[Sim] {} subscribed as {}", address, handle);
                return Ok(handle);
            }
            outcome
        };

        match outcome {
            SimOutcome::Fail(e) => Err(e),
            _ => std::future::pending().await,
        }
    }

    async fn cancel_report(&self, handle: &ReportHandle) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        state.active.remove(handle);
        state.cancelled.push(handle.clone());
        Ok(())
    }

    async fn read_attribute(&self, address: AttributeAddress) -> Result<Vec<u8>, RadioError> {
        self.state
            .lock()
            .attributes
            .get(&address)
            .cloned()
            .ok_or(RadioError::ClusterUnsupported(address.cluster))
    }

    async fn write_attribute(
        &self,
        address: AttributeAddress,
        raw: Vec<u8>,
    ) -> Result<Vec<u8>, RadioError> {
        let outcome = {
            let mut state = self.state.lock();
            let outcome = Self::next_outcome(&mut state.write_scripts, &address);
            if outcome == SimOutcome::Ok {
                state.writes.push((address, raw.clone()));
                state.attributes.insert(address, raw.clone());
            }
            outcome
        };

        match outcome {
            SimOutcome::Ok => {
                if let Some(events) = &self.events {
                    let _ = events.try_send(RadioEvent::AttributeReport {
                        node: address.node,
                        endpoint: address.endpoint,
                        cluster: address.cluster,
                        attribute: address.attribute,
                        raw: raw.clone(),
                    });
                }
                Ok(raw)
            }
            SimOutcome::Fail(e) => Err(e),
            SimOutcome::Hang => std::future::pending().await,
        }
    }

    async fn send_command(
        &self,
        address: ClusterAddress,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<(), RadioError> {
        let outcome = {
            let mut state = self.state.lock();
            state.commands.push((address, command, payload.clone()));
            state
                .command_scripts
                .get_mut(&(address.cluster, command))
                .and_then(|queue| queue.pop_front())
                .unwrap_or(SimOutcome::Ok)
        };
        match outcome {
            SimOutcome::Ok => {}
            SimOutcome::Fail(e) => return Err(e),
            SimOutcome::Hang => std::future::pending().await,
        }
        if address.cluster != cluster::TUYA_PRIVATE {
            return Ok(());
        }

        let answer = match command {
            tuya::command::DATA_QUERY => {
                let stored = self.datapoints(address.node, address.endpoint);
                (!stored.is_empty()).then(|| {
                    (tuya::command::DATA_REPORT, DatapointFrame::new(0, stored))
                })
            }
            tuya::command::DATA_REQUEST => {
                let frame = DatapointFrame::parse(&payload)
                    .map_err(|e| RadioError::Transport(e.to_string()))?;
                for dp in &frame.datapoints {
                    self.set_datapoint(address.node, address.endpoint, dp.clone());
                }
                Some((tuya::command::DATA_RESPONSE, frame))
            }
            _ => None,
        };

        if let (Some((reply, frame)), Some(events)) = (answer, &self.events) {
            debug!("[Sim] {} answering 0x{:02X} with 0x{:02X}", address, command, reply);
            let event = RadioEvent::ClusterCommand {
                node: address.node,
                endpoint: address.endpoint,
                cluster: address.cluster,
                command: reply,
                payload: frame.encode(),
            };
            if events.try_send(event).is_err() {
                warn!("[Sim] {} event queue full, dropped 0x{:02X}", address, reply);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(cluster: u16) -> AttributeAddress {
        AttributeAddress {
            node: NodeId(7),
            endpoint: 1,
            cluster,
            attribute: 0,
        }
    }

    #[tokio::test]
    async fn test_scripts_are_consumed_in_order() {
        let radio = SimulatedRadio::new();
        radio.script_subscribe(6, 0, vec![SimOutcome::Fail(RadioError::Timeout)]);

        let first = radio.subscribe_report(address(6), ReportingPolicy::default()).await;
        assert_eq!(first, Err(RadioError::Timeout));
        let second = radio.subscribe_report(address(6), ReportingPolicy::default()).await;
        assert!(second.is_ok());
        assert_eq!(radio.subscribe_calls().len(), 2);
        assert_eq!(radio.active_subscriptions(), vec![address(6)]);
    }

    #[tokio::test]
    async fn test_write_updates_reads_and_echoes() {
        let (tx, mut rx) = mpsc::channel(4);
        let radio = SimulatedRadio::with_events(tx);

        assert!(radio.read_attribute(address(6)).await.is_err());
        radio.write_attribute(address(6), vec![1]).await.unwrap();
        assert_eq!(radio.read_attribute(address(6)).await.unwrap(), vec![1]);

        let echoed = rx.recv().await.unwrap();
        assert!(matches!(echoed, RadioEvent::AttributeReport { ref raw, .. } if raw == &vec![1]));
    }

    #[tokio::test]
    async fn test_tuya_query_and_request() {
        let (tx, mut rx) = mpsc::channel(4);
        let radio = SimulatedRadio::with_events(tx);
        let device = ClusterAddress {
            node: NodeId(7),
            endpoint: 1,
            cluster: cluster::TUYA_PRIVATE,
        };
        radio.set_datapoint(NodeId(7), 1, Datapoint::value(1, 215));

        radio.send_command(device, tuya::command::DATA_QUERY, Vec::new()).await.unwrap();
        let Some(RadioEvent::ClusterCommand { command, payload, .. }) = rx.recv().await else {
            panic!("expected a datapoint report");
        };
        assert_eq!(command, tuya::command::DATA_REPORT);
        assert_eq!(
            DatapointFrame::parse(&payload).unwrap().datapoints,
            vec![Datapoint::value(1, 215)]
        );

        let request = DatapointFrame::new(9, vec![Datapoint::value(1, 230)]).encode();
        radio.send_command(device, tuya::command::DATA_REQUEST, request).await.unwrap();
        let Some(RadioEvent::ClusterCommand { command, payload, .. }) = rx.recv().await else {
            panic!("expected a datapoint response");
        };
        assert_eq!(command, tuya::command::DATA_RESPONSE);
        assert_eq!(DatapointFrame::parse(&payload).unwrap().seq, 9);
        assert_eq!(radio.datapoints(NodeId(7), 1), vec![Datapoint::value(1, 230)]);
        assert_eq!(radio.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_command_scripts() {
        let radio = SimulatedRadio::new();
        radio.script_command(
            cluster::TUYA_PRIVATE,
            tuya::command::DATA_QUERY,
            vec![SimOutcome::Fail(RadioError::ClusterUnsupported(cluster::TUYA_PRIVATE))],
        );
        let device = ClusterAddress {
            node: NodeId(7),
            endpoint: 1,
            cluster: cluster::TUYA_PRIVATE,
        };
        assert!(radio.send_command(device, tuya::command::DATA_QUERY, Vec::new()).await.is_err());
        assert!(radio.send_command(device, tuya::command::DATA_QUERY, Vec::new()).await.is_ok());
    }

    #[test]
    fn test_cancel_unknown_handle_is_ok() {
        let radio = SimulatedRadio::new();
        tokio_test::assert_ok!(tokio_test::block_on(
            radio.cancel_report(&ReportHandle("nope".into()))
        ));
    }
}
