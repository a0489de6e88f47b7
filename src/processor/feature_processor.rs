use crossbeam_channel::{select, unbounded, Receiver, Sender};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

use crate::capture::sniffer::SnifferExit;
use crate::capture::{PacketSink, PacketSniffer, PacketSource};
use crate::classifier::{spawn_classifier, Classifier};
use crate::config::StreamConfig;
use crate::error::{MapperError, Result};
use crate::export;
use crate::types::NetworkStats;
use super::engine::{self, EngineChannels, FlowEngine, ShutdownReason};
use super::flow::FlowTable;
use super::publisher;

/// A running streaming pipeline: capture thread, flow engine, classification
/// worker and status publisher.
pub struct FeatureProcessor {
    running: Arc<AtomicBool>,
    sniffer: PacketSniffer,
    sink: PacketSink,
    control_tx: Sender<ShutdownReason>,
    sniffer_exit: Receiver<SnifferExit>,
    processing_thread: Option<JoinHandle<FlowTable>>,
    publisher_thread: Option<JoinHandle<()>>,
    classifier_thread: Option<JoinHandle<()>>,
    latest_stats: Arc<Mutex<Option<NetworkStats>>>,
    results: Option<PathBuf>,
}

impl FeatureProcessor {
    pub fn start(config: &StreamConfig, source: Box<dyn PacketSource>, classifier: Arc<dyn Classifier>) -> Result<Self> {
        config.validate()?;

        let running = Arc::new(AtomicBool::new(true));
        let (packet_tx, packet_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let (stats_tx, stats_rx) = unbounded();
        let (exit_tx, exit_rx) = unbounded();
        let latest_stats = Arc::new(Mutex::new(None));

        let sink = PacketSink::new(packet_tx);
        let workers = spawn_classifier(classifier);

        let processing = {
            let engine = FlowEngine::new(config.threshold, config.features.clone());
            let channels = EngineChannels {
                packets: packet_rx,
                control: control_rx,
                requests: workers.tx,
                outcomes: workers.rx,
                stats: stats_tx,
            };
            let skipped = sink.skipped_counter();
            let (sweep, status) = (config.sweep_interval, config.stats_interval);
            thread::spawn(move || engine::processing_loop(engine, channels, skipped, sweep, status))
        };

        let publisher = {
            let running = running.clone();
            let latest = latest_stats.clone();
            let interval = config.stats_interval;
            thread::spawn(move || publisher::publisher_loop(running, stats_rx, latest, interval))
        };

        let mut sniffer = PacketSniffer::new_with_sink(sink.clone());
        sniffer.start_sniffer(source, exit_tx)?;

        info!(threshold = config.threshold, features = config.features.width(), "streaming pipeline started");

        Ok(Self {
            running,
            sniffer,
            sink,
            control_tx,
            sniffer_exit: exit_rx,
            processing_thread: Some(processing),
            publisher_thread: Some(publisher),
            classifier_thread: Some(workers.thread),
            latest_stats,
            results: config.results.clone(),
        })
    }

    /// Submission handle for packets that do not come from the capture source.
    pub fn sink(&self) -> PacketSink {
        self.sink.clone()
    }

    pub fn latest_stats(&self) -> Option<NetworkStats> {
        self.latest_stats.lock().ok().and_then(|s| s.clone())
    }

    /// Blocks until the source runs dry or `interrupt` fires, then shuts down.
    pub fn run_until_done(self, interrupt: &Receiver<()>) -> Result<FlowTable> {
        let reason = select! {
            recv(self.sniffer_exit) -> exit => match exit {
                Ok(SnifferExit::Exhausted) => ShutdownReason::SourceExhausted,
                Ok(SnifferExit::Failed(e)) => {
                    error!(error = %e, "capture failed, shutting down");
                    ShutdownReason::Interrupted
                }
                Ok(SnifferExit::Stopped) | Err(_) => ShutdownReason::Interrupted,
            },
            recv(interrupt) -> _ => {
                info!("interrupt received");
                ShutdownReason::Interrupted
            },
        };
        self.stop(reason)
    }

    /// Stops ingestion, lets the engine finish outstanding classifications and
    /// writes the report when a results path is configured.
    pub fn stop(mut self, reason: ShutdownReason) -> Result<FlowTable> {
        self.sink.close();
        self.sniffer.stop_sniffer();

        self.control_tx
            .send(reason)
            .map_err(|_| MapperError::Config("flow engine already stopped".into()))?;

        let table = self
            .processing_thread
            .take()
            .ok_or_else(|| MapperError::Config("flow engine was not started".into()))?
            .join()
            .map_err(|_| MapperError::Lock("flow engine thread panicked".into()))?;

        // The engine dropped the request sender, so the worker is on its way out.
        if let Some(h) = self.classifier_thread.take() {
            if h.join().is_err() {
                warn!("classifier thread panicked");
            }
        }

        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.publisher_thread.take() { let _ = h.join(); }

        if let Some(path) = &self.results {
            export::write_stream_report(path, &table)?;
        }
        Ok(table)
    }
}
