use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use super::decoder::{decode_frame, NormalizedPacket};
use super::source::{PacketSource, RawFrame, SourceEvent};
use crate::error::{MapperError, Result};

/// Entry point of the streaming pipeline. Cheap to clone; every clone shares
/// the sender, so once the pipeline closes it nothing gets in.
///
/// `close` drops the sender under the write lock, so it waits for in-flight
/// submits: a submit that returned `Ok` is already queued for the engine.
#[derive(Clone)]
pub struct PacketSink {
    tx: Arc<RwLock<Option<Sender<NormalizedPacket>>>>,
    skipped: Arc<AtomicU64>,
}

impl PacketSink {
    pub fn new(tx: Sender<NormalizedPacket>) -> Self {
        Self {
            tx: Arc::new(RwLock::new(Some(tx))),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn submit(&self, packet: NormalizedPacket) -> Result<()> {
        let tx = self.tx.read().map_err(|e| MapperError::Lock(e.to_string()))?;
        match tx.as_ref() {
            Some(tx) => tx.try_send(packet).map_err(|_| MapperError::ShuttingDown),
            None => Err(MapperError::ShuttingDown),
        }
    }

    /// Decodes and submits. `Ok(false)` means the frame was not TCP/UDP over IPv4 and was skipped.
    pub fn submit_frame(&self, frame: &RawFrame) -> Result<bool> {
        if !self.is_open() {
            return Err(MapperError::ShuttingDown);
        }
        match decode_frame(frame.timestamp, &frame.data) {
            Some(packet) => self.submit(packet).map(|_| true),
            None => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        }
    }

    pub fn close(&self) {
        let mut tx = match self.tx.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tx.take();
    }

    pub fn is_open(&self) -> bool {
        self.tx.read().map(|tx| tx.is_some()).unwrap_or(false)
    }

    pub fn skipped_counter(&self) -> Arc<AtomicU64> {
        self.skipped.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnifferExit {
    /// The capture file ran out of frames.
    Exhausted,
    Stopped,
    Failed(String),
}

pub struct PacketSniffer {
    sniffer_running: Arc<AtomicBool>,
    sniffer_thread: Option<JoinHandle<()>>,
    sink: PacketSink,
}

impl PacketSniffer {
    pub fn new_with_sink(sink: PacketSink) -> Self {
        Self {
            sniffer_running: Arc::new(AtomicBool::new(false)),
            sniffer_thread: None,
            sink,
        }
    }

    /// Moves the source onto a capture thread. The reason the thread stopped is sent on `exit_tx`.
    pub fn start_sniffer(&mut self, mut source: Box<dyn PacketSource>, exit_tx: Sender<SnifferExit>) -> Result<()> {
        if self.sniffer_running.swap(true, Ordering::Relaxed) {
            return Err(MapperError::Config("sniffer is already running".into()));
        }

        let running = self.sniffer_running.clone();
        let sink = self.sink.clone();

        self.sniffer_thread = Some(thread::spawn(move || {
            debug!("sniffer thread started");
            let mut exit = SnifferExit::Stopped;
            while running.load(Ordering::Relaxed) {
                match source.next_event() {
                    Ok(SourceEvent::Frame(frame)) => {
                        if let Err(e) = sink.submit_frame(&frame) {
                            debug!(error = %e, "sink closed, capture stopping");
                            break;
                        }
                    }
                    Ok(SourceEvent::Idle) => continue,
                    Ok(SourceEvent::Exhausted) => {
                        info!("capture source exhausted");
                        exit = SnifferExit::Exhausted;
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "error capturing packet");
                        exit = SnifferExit::Failed(e.to_string());
                        break;
                    }
                }
            }
            running.store(false, Ordering::Relaxed);
            let _ = exit_tx.send(exit);
            debug!("sniffer thread exiting");
        }));

        Ok(())
    }

    pub fn stop_sniffer(&mut self) {
        self.sniffer_running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.sniffer_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::decoder::frame_builders::build_udp_frame;
    use crossbeam_channel::unbounded;

    struct VecSource(std::vec::IntoIter<RawFrame>);

    impl PacketSource for VecSource {
        fn next_event(&mut self) -> Result<SourceEvent> {
            Ok(match self.0.next() {
                Some(frame) => SourceEvent::Frame(frame),
                None => SourceEvent::Exhausted,
            })
        }
    }

    fn udp(ts: f64) -> RawFrame {
        RawFrame { timestamp: ts, data: build_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, b"abc") }
    }

    #[test]
    fn sink_counts_skipped_frames() {
        let (tx, rx) = unbounded();
        let sink = PacketSink::new(tx);

        assert!(sink.submit_frame(&udp(0.0)).unwrap());
        assert!(!sink.submit_frame(&RawFrame { timestamp: 0.0, data: vec![0; 5] }).unwrap());

        assert_eq!(rx.len(), 1);
        assert_eq!(sink.skipped_counter().load(Ordering::Relaxed), 1);
    }

    #[test]
    fn closed_sink_rejects_packets() {
        let (tx, rx) = unbounded();
        let sink = PacketSink::new(tx);
        sink.close();

        assert!(matches!(sink.submit_frame(&udp(0.0)), Err(MapperError::ShuttingDown)));
        assert!(rx.is_empty());
        assert!(!sink.is_open());
    }

    #[test]
    fn accepted_packets_are_queued_before_close_returns() {
        let (tx, rx) = unbounded();
        let sink = PacketSink::new(tx);

        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let sink = sink.clone();
                thread::spawn(move || {
                    let mut accepted = 0usize;
                    for n in 0..500 {
                        let frame = udp(f64::from(n));
                        match sink.submit_frame(&frame) {
                            Ok(_) => accepted += 1,
                            Err(MapperError::ShuttingDown) => break,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                    accepted
                })
            })
            .collect();

        thread::sleep(std::time::Duration::from_millis(1));
        sink.close();
        // Nothing can be queued from here on.
        let queued = rx.try_iter().count();

        let accepted: usize = submitters.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(queued, accepted);
        assert!(rx.try_recv().is_err());
        assert!(matches!(sink.submit_frame(&udp(0.0)), Err(MapperError::ShuttingDown)));
    }

    #[test]
    fn sniffer_reports_exhausted_source() {
        let (tx, rx) = unbounded();
        let (exit_tx, exit_rx) = unbounded();
        let mut sniffer = PacketSniffer::new_with_sink(PacketSink::new(tx));

        let frames = vec![udp(0.0), udp(0.1), udp(0.2)];
        sniffer.start_sniffer(Box::new(VecSource(frames.into_iter())), exit_tx).unwrap();

        assert_eq!(exit_rx.recv().unwrap(), SnifferExit::Exhausted);
        sniffer.stop_sniffer();
        assert_eq!(rx.len(), 3);
    }
}
