use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{MapperError, Result};
use crate::processor::{FlowKey, FlowState, FlowTable, StatValue, STAT_COLUMNS};

pub const STREAM_HEADER: [&str; 7] = [
    "type",
    "protocol",
    "count_dir",
    "count_back",
    "overall_dir",
    "overall_back",
    "flow_descriptor",
];

const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Integers verbatim. Floats: `0` for zero, otherwise rounded to 6 decimals
/// with a trailing `.0` when the result is integral.
pub fn format_stat(value: StatValue) -> String {
    match value {
        StatValue::Int(v) => v.to_string(),
        StatValue::Float(v) if v == 0.0 => "0".to_string(),
        StatValue::Float(v) => {
            let rounded = (v * 1e6).round() / 1e6;
            let s = rounded.to_string();
            if s.contains('.') || !rounded.is_finite() { s } else { format!("{s}.0") }
        }
    }
}

fn sorted_flows(table: &FlowTable) -> Vec<(&FlowKey, &FlowState)> {
    let mut flows: Vec<_> = table.iter().collect();
    flows.sort_by_key(|(key, _)| **key);
    flows
}

/// Shutdown report of the streaming pipeline. Classified flows come first.
pub fn write_stream_report(path: &Path, table: &FlowTable) -> Result<usize> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(STREAM_HEADER)?;

    let flows = sorted_flows(table);
    let (classified, pending): (Vec<_>, Vec<_>) = flows.into_iter().partition(|(_, f)| f.is_classified());

    for (kind, group) in [("classified", &classified), ("unclassified", &pending)] {
        for (_, flow) in group {
            wtr.write_record([
                kind.to_string(),
                flow.label.clone().unwrap_or_default(),
                flow.forward().packets.to_string(),
                flow.backward().packets.to_string(),
                flow.forward().bytes.to_string(),
                flow.backward().bytes.to_string(),
                flow.descriptor.clone(),
            ])?;
        }
    }
    wtr.flush()?;

    info!(
        path = %path.display(),
        classified = classified.len(),
        unclassified = pending.len(),
        "flow report written"
    );
    Ok(classified.len() + pending.len())
}

/// The 24 statistics followed by the application label.
pub fn batch_record(flow: &FlowState) -> Vec<String> {
    let mut record: Vec<String> = flow.statistics().into_iter().map(format_stat).collect();
    record.push(flow.label.clone().unwrap_or_default());
    record
}

/// Training set shared by every batch worker. Each call to `append` writes one
/// file's flows in a single critical section.
///
/// Rows only by default: dataset tooling routes every 25-field line by its
/// label, so a header would be read as a flow labelled `application`.
pub struct TrainingSetWriter {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
}

impl TrainingSetWriter {
    /// Opens for append. With `header`, a column header goes in when the file is empty.
    pub fn open(path: impl AsRef<Path>, header: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let empty = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if header && empty {
            let header: Vec<&str> = STAT_COLUMNS.iter().copied().chain(["application"]).collect();
            writer.write_record(&header)?;
            writer.flush()?;
        }

        Ok(Self { path, writer: Mutex::new(writer) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_with_backoff(&self) -> Result<MutexGuard<'_, csv::Writer<File>>> {
        let mut delay = Duration::from_millis(1);
        loop {
            match self.writer.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => {
                    debug!(wait_ms = delay.as_millis() as u64, "output busy, backing off");
                    thread::sleep(delay);
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                Err(TryLockError::Poisoned(e)) => return Err(MapperError::Lock(e.to_string())),
            }
        }
    }

    pub fn append(&self, table: &FlowTable) -> Result<usize> {
        let records: Vec<Vec<String>> = sorted_flows(table).into_iter().map(|(_, f)| batch_record(f)).collect();
        if records.is_empty() {
            return Ok(0);
        }

        let mut writer = self.lock_with_backoff()?;
        for record in &records {
            writer.write_record(record)?;
        }
        writer.flush()?;
        Ok(records.len())
    }
}
