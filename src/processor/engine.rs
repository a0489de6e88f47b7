use crossbeam_channel::{never, select, tick, Receiver, Sender};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::capture::NormalizedPacket;
use crate::classifier::{ClassificationOutcome, ClassificationRequest, FeatureSelection};
use crate::types::NetworkStats;
use super::flow::{FlowKey, FlowState, FlowTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Operator asked to stop.
    Interrupted,
    /// A capture file has no frames left.
    SourceExhausted,
}

/// Streaming state machine over one flow table. Single-threaded; the
/// processing loop is the only owner while the pipeline runs.
pub struct FlowEngine {
    table: FlowTable,
    threshold: u64,
    selection: FeatureSelection,
    submitted: HashSet<FlowKey>,
    outstanding: usize,
    received: u64,
}

impl FlowEngine {
    pub fn new(threshold: u64, selection: FeatureSelection) -> Self {
        Self {
            table: FlowTable::new(),
            threshold,
            selection,
            submitted: HashSet::new(),
            outstanding: 0,
            received: 0,
        }
    }

    pub fn on_packet(&mut self, packet: &NormalizedPacket) {
        self.received += 1;
        let key = FlowKey::of(packet);
        // Once submitted the feature snapshot is taken, so only counters move.
        if self.submitted.contains(&key) {
            self.table.soft_update(&key, packet);
        } else {
            self.table.ingest(key, packet, None);
        }
    }

    /// Pending flows at or past the threshold that were never submitted.
    /// Each is marked submitted and counted as outstanding.
    pub fn sweep(&mut self) -> Vec<ClassificationRequest> {
        let mut requests: Vec<ClassificationRequest> = self
            .table
            .iter()
            .filter(|(key, flow)| {
                !flow.is_classified()
                    && flow.total_packets() >= self.threshold
                    && !self.submitted.contains(*key)
            })
            .map(|(key, flow)| ClassificationRequest { key: *key, features: self.selection.extract(flow) })
            .collect();
        requests.sort_by_key(|r| r.key);

        for request in &requests {
            self.submitted.insert(request.key);
        }
        self.outstanding += requests.len();
        requests
    }

    /// Applies a classifier answer. Returns the flow when it became classified.
    pub fn on_outcome(&mut self, outcome: ClassificationOutcome) -> Option<&FlowState> {
        self.outstanding = self.outstanding.saturating_sub(1);
        match outcome.result {
            Ok(label) => {
                if !self.table.mark_classified(&outcome.key, label) {
                    return None;
                }
                let flow = self.table.get(&outcome.key)?;
                info!(
                    label = flow.label.as_deref().unwrap_or_default(),
                    flow = %flow.descriptor,
                    "flow classified"
                );
                Some(flow)
            }
            Err(e) => {
                warn!(flow = %outcome.key, error = %e, "flow left unclassified");
                None
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    pub fn into_table(self) -> FlowTable {
        self.table
    }
}

pub struct EngineChannels {
    pub packets: Receiver<NormalizedPacket>,
    pub control: Receiver<ShutdownReason>,
    pub requests: Sender<ClassificationRequest>,
    pub outcomes: Receiver<ClassificationOutcome>,
    pub stats: Sender<NetworkStats>,
}

fn dispatch(engine: &mut FlowEngine, requests: &Sender<ClassificationRequest>) {
    for request in engine.sweep() {
        let key = request.key;
        if requests.send(request).is_err() {
            engine.on_outcome(ClassificationOutcome { key, result: Err("classifier unavailable".into()) });
        }
    }
}

pub fn processing_loop(
    mut engine: FlowEngine,
    channels: EngineChannels,
    skipped: Arc<AtomicU64>,
    sweep_interval: Duration,
    stats_interval: Duration,
) -> FlowTable {
    let EngineChannels { packets, control, requests, outcomes, stats } = channels;
    let idle_packets = never::<NormalizedPacket>();
    let idle_outcomes = never::<ClassificationOutcome>();
    let mut packets_open = true;
    let mut outcomes_open = true;

    let start = Instant::now();
    let sweep_tick = tick(sweep_interval);
    let stats_tick = tick(stats_interval);

    let mut last_rate = Instant::now();
    let mut last_received: u64 = 0;

    let reason = loop {
        let packet_rx = if packets_open { &packets } else { &idle_packets };
        let outcome_rx = if outcomes_open { &outcomes } else { &idle_outcomes };

        select! {
            recv(packet_rx) -> msg => match msg {
                Ok(packet) => engine.on_packet(&packet),
                Err(_) => packets_open = false,
            },

            recv(sweep_tick) -> _ => dispatch(&mut engine, &requests),

            recv(outcome_rx) -> msg => match msg {
                Ok(outcome) => { engine.on_outcome(outcome); }
                Err(_) => {
                    warn!("classifier worker went away");
                    outcomes_open = false;
                }
            },

            recv(stats_tick) -> _ => {
                let now = Instant::now();
                let dt = now.duration_since(last_rate).as_secs_f64().max(1e-6);
                let snapshot = NetworkStats {
                    received_packets: engine.received(),
                    skipped_frames: skipped.load(Ordering::Relaxed),
                    classified_flows: engine.table().classified_count() as u64,
                    detected_flows: engine.table().len() as u64,
                    packets_per_second: (engine.received() - last_received) as f64 / dt,
                    uptime_seconds: start.elapsed().as_secs(),
                };
                let _ = stats.send(snapshot);
                last_received = engine.received();
                last_rate = now;
            },

            recv(control) -> msg => break msg.unwrap_or(ShutdownReason::Interrupted),
        }
    };

    debug!(?reason, "engine shutting down");

    // The sink is closed before the signal arrives, so this drains everything that was accepted.
    while let Ok(packet) = packets.try_recv() {
        engine.on_packet(&packet);
    }

    if reason == ShutdownReason::SourceExhausted {
        dispatch(&mut engine, &requests);
    }
    drop(requests);

    while engine.outstanding() > 0 {
        match outcomes.recv() {
            Ok(outcome) => {
                engine.on_outcome(outcome);
            }
            Err(_) => break,
        }
    }

    info!(
        flows = engine.table().len(),
        classified = engine.table().classified_count(),
        packets = engine.received(),
        "flow engine stopped"
    );
    engine.into_table()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TransportProtocol;
    use std::net::Ipv4Addr;

    const A: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const B: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    fn packet(n: u32, from_a: bool) -> NormalizedPacket {
        let (src_addr, dst_addr, src_port, dst_port) =
            if from_a { (A, B, 41000, 443) } else { (B, A, 443, 41000) };
        NormalizedPacket {
            protocol: TransportProtocol::Tcp,
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            payload_len: 10 * n,
            timestamp: f64::from(n) * 0.01,
        }
    }

    fn feed(engine: &mut FlowEngine, count: u32) {
        for n in 0..count {
            engine.on_packet(&packet(n, n % 2 == 0));
        }
    }

    #[test]
    fn below_threshold_stays_pending() {
        let mut engine = FlowEngine::new(4, FeatureSelection::default());
        feed(&mut engine, 3);
        assert!(engine.sweep().is_empty());
        assert_eq!(engine.outstanding(), 0);
    }

    #[test]
    fn threshold_reached_is_submitted_once() {
        let mut engine = FlowEngine::new(4, FeatureSelection::default());
        feed(&mut engine, 4);

        let requests = engine.sweep();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].features.len(), 24);
        assert_eq!(requests[0].features[0] + requests[0].features[1], 4.0);
        assert!(engine.sweep().is_empty());
        assert_eq!(engine.outstanding(), 1);
    }

    #[test]
    fn submitted_flow_only_soft_updates() {
        let mut engine = FlowEngine::new(2, FeatureSelection::default());
        feed(&mut engine, 2);
        let request = engine.sweep().remove(0);
        let before = engine.table().get(&request.key).unwrap().clone();

        engine.on_packet(&packet(9, false));
        let after = engine.table().get(&request.key).unwrap();
        assert_eq!(after.total_packets(), before.total_packets() + 1);
        assert_eq!(after.backward().max_payload, before.backward().max_payload);
        assert_eq!(after.backward().last_timestamp, before.backward().last_timestamp);
    }

    #[test]
    fn successful_outcome_classifies() {
        let mut engine = FlowEngine::new(2, FeatureSelection::default());
        feed(&mut engine, 2);
        let key = engine.sweep()[0].key;

        let flow = engine.on_outcome(ClassificationOutcome { key, result: Ok("TLS".into()) }).unwrap();
        assert_eq!(flow.label.as_deref(), Some("TLS"));
        assert_eq!(engine.outstanding(), 0);
        assert_eq!(engine.table().classified_count(), 1);

        // A stray second answer changes nothing.
        assert!(engine.on_outcome(ClassificationOutcome { key, result: Ok("HTTP".into()) }).is_none());
        assert_eq!(engine.table().get(&key).unwrap().label.as_deref(), Some("TLS"));
    }

    #[test]
    fn failed_outcome_is_not_retried() {
        let mut engine = FlowEngine::new(2, FeatureSelection::default());
        feed(&mut engine, 2);
        let key = engine.sweep()[0].key;

        assert!(engine.on_outcome(ClassificationOutcome { key, result: Err("boom".into()) }).is_none());
        feed(&mut engine, 5);
        assert!(engine.sweep().is_empty());
        assert!(!engine.table().get(&key).unwrap().is_classified());
    }

    #[test]
    fn loop_runs_final_sweep_when_source_is_exhausted() {
        let (packet_tx, packet_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<ClassificationRequest>();
        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded();
        let (stats_tx, _stats_rx) = crossbeam_channel::unbounded();

        let worker = std::thread::spawn(move || {
            while let Ok(request) = request_rx.recv() {
                let _ = outcome_tx.send(ClassificationOutcome { key: request.key, result: Ok("web".into()) });
            }
        });

        for n in 0..3 {
            packet_tx.send(packet(n, true)).unwrap();
        }
        control_tx.send(ShutdownReason::SourceExhausted).unwrap();

        let channels = EngineChannels {
            packets: packet_rx,
            control: control_rx,
            requests: request_tx,
            outcomes: outcome_rx,
            stats: stats_tx,
        };
        // Ticks far in the future so only the shutdown path can classify.
        let table = processing_loop(
            FlowEngine::new(3, FeatureSelection::default()),
            channels,
            Arc::new(AtomicU64::new(0)),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        worker.join().unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.classified_count(), 1);
    }
}
