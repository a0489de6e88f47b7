use crossbeam_channel::{select, tick, unbounded, Receiver};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::capture::{count_packets, decode_frame, CaptureFile};
use crate::config::BatchConfig;
use crate::error::{MapperError, Result};
use crate::export::TrainingSetWriter;
use crate::processor::{FlowKey, FlowTable};
use super::oracle::GroundTruthOracle;
use super::progress::Progress;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub files_total: usize,
    pub files_failed: usize,
    pub flows_written: u64,
}

/// A single file, or the regular files directly inside a directory, sorted by name.
pub fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    if !input.is_dir() {
        return Ok(vec![input.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(input)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Labels one capture with the oracle and replays it into a private flow table.
///
/// Packets of flows the oracle does not know are dropped. A flow that already
/// has `threshold` packets only has its counters updated.
pub fn process_capture(
    path: &Path,
    oracle: &dyn GroundTruthOracle,
    threshold: u64,
    progress: &Progress,
) -> Result<FlowTable> {
    progress.oracle_started();
    let truth = oracle.ground_truth(path);
    progress.oracle_finished();
    let truth = truth?;

    info!(
        file = %path.display(),
        known_packets = truth.summary.known.packets,
        known_bytes = truth.summary.known.bytes,
        known_flows = truth.summary.known.flows,
        unknown_packets = truth.summary.unknown.packets,
        unknown_bytes = truth.summary.unknown.bytes,
        unknown_flows = truth.summary.unknown.flows,
        "ground truth ready"
    );

    progress.add_total(count_packets(path)?);

    let mut capture = CaptureFile::open(path)?;
    let mut table = FlowTable::new();

    while let Some(frame) = capture.next_frame()? {
        progress.advance(1);

        let Some(packet) = decode_frame(frame.timestamp, &frame.data) else { continue };
        let key = FlowKey::of(&packet);
        let Some(label) = truth.label_for(&key) else { continue };

        if table.total_packets(&key) >= threshold {
            table.soft_update(&key, &packet);
        } else {
            table.ingest(key, &packet, Some(label));
        }
    }

    Ok(table)
}

/// Canonical form when the path exists, the path itself otherwise.
fn same_file_key(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

pub struct BatchPipeline {
    config: BatchConfig,
    oracle: Arc<dyn GroundTruthOracle>,
    progress: Arc<Progress>,
}

impl BatchPipeline {
    pub fn new(config: BatchConfig, oracle: Arc<dyn GroundTruthOracle>) -> Self {
        Self { config, oracle, progress: Arc::new(Progress::new()) }
    }

    pub fn progress(&self) -> Arc<Progress> {
        self.progress.clone()
    }

    fn run_file(&self, path: &Path, writer: &TrainingSetWriter) -> Result<usize> {
        let started = Instant::now();
        info!(file = %path.display(), "processing started");

        let table = process_capture(path, self.oracle.as_ref(), self.config.threshold, &self.progress)?;
        let written = writer.append(&table)?;

        info!(
            file = %path.display(),
            flows = written,
            secs = format_args!("{:.2}", started.elapsed().as_secs_f64()),
            "processing finished"
        );
        Ok(written)
    }

    fn report_progress(&self, done: Receiver<()>) {
        let ticker = tick(self.config.status_interval);
        loop {
            select! {
                recv(done) -> _ => break,
                recv(ticker) -> _ => {
                    info!("completed: {:.0}%", self.progress.percent());
                }
            }
        }
    }

    /// Processes every input on a pool of `min(processes, files)` workers.
    /// A failing file is logged and counted; the others carry on.
    pub fn run(&self) -> Result<BatchReport> {
        self.config.validate()?;

        let output = same_file_key(&self.config.output);
        let files: Vec<PathBuf> = collect_inputs(&self.config.input)?
            .into_iter()
            .filter(|p| same_file_key(p) != output)
            .collect();
        let mut report = BatchReport { files_total: files.len(), ..BatchReport::default() };
        if files.is_empty() {
            warn!(input = %self.config.input.display(), "no input files");
            return Ok(report);
        }

        let writer = TrainingSetWriter::open(&self.config.output, self.config.header)?;
        let pool = self.config.processes.min(files.len());
        info!(
            files = files.len(),
            workers = pool,
            threshold = self.config.threshold,
            output = %writer.path().display(),
            "batch started"
        );

        let (path_tx, path_rx) = unbounded();
        for path in files {
            let _ = path_tx.send(path);
        }
        drop(path_tx);

        let failed = AtomicUsize::new(0);
        let written = AtomicU64::new(0);
        let (done_tx, done_rx) = unbounded::<()>();

        crossbeam::scope(|s| {
            s.spawn(|_| self.report_progress(done_rx));

            let workers: Vec<_> = (0..pool)
                .map(|_| {
                    let path_rx = path_rx.clone();
                    let (writer, failed, written) = (&writer, &failed, &written);
                    s.spawn(move |_| {
                        while let Ok(path) = path_rx.recv() {
                            match self.run_file(&path, writer) {
                                Ok(n) => {
                                    written.fetch_add(n as u64, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    error!(file = %path.display(), error = %e, "file skipped");
                                    failed.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    })
                })
                .collect();

            for worker in workers {
                if worker.join().is_err() {
                    error!("batch worker panicked");
                }
            }
            drop(done_tx);
        })
        .map_err(|_| MapperError::Lock("batch worker panicked".into()))?;

        report.files_failed = failed.into_inner();
        report.flows_written = written.into_inner();

        info!(
            files = report.files_total,
            failed = report.files_failed,
            flows = report.flows_written,
            "batch finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::oracle::GroundTruth;

    struct FailingOracle;

    impl GroundTruthOracle for FailingOracle {
        fn ground_truth(&self, _capture: &Path) -> Result<GroundTruth> {
            Err(MapperError::Oracle("ndpiReader exited with status 1".into()))
        }
    }

    #[test]
    fn directory_inputs_are_sorted_files_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.pcap"), b"").unwrap();
        fs::write(dir.path().join("a.pcap"), b"").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let files = collect_inputs(dir.path()).unwrap();
        let names: Vec<_> = files.iter().filter_map(|p| p.file_name()).collect();
        assert_eq!(names, vec!["a.pcap", "b.pcap"]);
    }

    #[test]
    fn single_file_input_is_kept() {
        let files = collect_inputs(Path::new("/data/one.pcap")).unwrap();
        assert_eq!(files, vec![PathBuf::from("/data/one.pcap")]);
    }

    #[test]
    fn oracle_failure_clears_running_flag() {
        let progress = Progress::new();
        let err = process_capture(Path::new("missing.pcap"), &FailingOracle, 8, &progress).unwrap_err();
        assert!(matches!(err, MapperError::Oracle(_)));
        assert_eq!(progress.snapshot().oracles_running, 0);
    }

    #[derive(Default)]
    struct RecordingOracle {
        seen: std::sync::Mutex<Vec<PathBuf>>,
    }

    impl GroundTruthOracle for RecordingOracle {
        fn ground_truth(&self, capture: &Path) -> Result<GroundTruth> {
            self.seen.lock().unwrap().push(capture.to_path_buf());
            Err(MapperError::Oracle("not a capture".into()))
        }
    }

    #[test]
    fn output_inside_input_directory_is_not_an_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("captures");
        fs::create_dir(&input).unwrap();
        fs::write(input.join("a.pcap"), b"").unwrap();
        fs::write(input.join("train.csv"), b"").unwrap();

        // Same file, spelled differently from the directory listing.
        let output = dir.path().join("captures").join("..").join("captures").join("train.csv");
        let oracle = Arc::new(RecordingOracle::default());
        let config = BatchConfig { processes: 2, ..BatchConfig::new(&input, &output) };
        let report = BatchPipeline::new(config, oracle.clone()).run().unwrap();

        assert_eq!(report.files_total, 1);
        let seen = oracle.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].file_name().unwrap(), "a.pcap");
    }

    #[test]
    fn failing_files_are_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        fs::create_dir(&input).unwrap();
        fs::write(input.join("one.pcap"), b"").unwrap();
        fs::write(input.join("two.pcap"), b"").unwrap();

        let config = BatchConfig { processes: 4, ..BatchConfig::new(&input, dir.path().join("out.csv")) };
        let report = BatchPipeline::new(config, Arc::new(FailingOracle)).run().unwrap();

        assert_eq!(report, BatchReport { files_total: 2, files_failed: 2, flows_written: 0 });
    }
}
