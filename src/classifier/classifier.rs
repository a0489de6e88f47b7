use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use ndarray::{Array2, CowArray};
use ort::{Environment, GraphOptimizationLevel, LoggingLevel, Session, SessionBuilder, Value};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::fs;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::processor::FlowKey;

/// Anything that can turn one feature vector into an application label.
pub trait Classifier: Send + Sync {
    fn predict(&self, features: &[f32]) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ClassMap {
    num_classes: usize,
    id_to_label: HashMap<String, String>,
}

// Maps the json generated in training to a vector of class names indexed by class id
pub fn load_label_vector<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let s = fs::read_to_string(path).with_context(|| format!("read class map {}", path.display()))?;
    let m: ClassMap = serde_json::from_str(&s).with_context(|| format!("parse class map {}", path.display()))?;
    let mut labels = vec!["Unknown".to_string(); m.num_classes.max(1)];
    for (k, v) in m.id_to_label {
        if let Ok(idx) = k.parse::<usize>() {
            if idx < labels.len() { labels[idx] = v; }
        }
    }
    Ok(labels)
}

pub struct OnnxClassifier {
    session: Mutex<Session>,
    labels: Vec<String>,
    input_width: usize,
}

impl OnnxClassifier {
    pub fn load(model_path: &Path, labels: Vec<String>, input_width: usize) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("pktmapper")
                .with_log_level(LoggingLevel::Warning)
                .build()
                .context("Failed to create ONNX environment")?
        );

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .with_model_from_file(model_path)
            .with_context(|| format!("Failed to load model from {}", model_path.display()))?;

        info!(model = %model_path.display(), classes = labels.len(), "classifier model loaded");

        Ok(Self {
            session: Mutex::new(session),
            labels,
            input_width,
        })
    }

    fn label_for(&self, idx: usize) -> String {
        self.labels.get(idx).cloned().unwrap_or_else(|| format!("class_{idx}"))
    }
}

impl Classifier for OnnxClassifier {
    fn predict(&self, features: &[f32]) -> Result<String> {
        if features.len() != self.input_width {
            return Err(anyhow!("Expected {} features, got {}", self.input_width, features.len()));
        }

        let input = Array2::from_shape_vec((1, features.len()), features.to_vec())
            .context("Failed to create input array")?;
        let cow = CowArray::from(input.into_dyn());

        let t0 = Instant::now();

        let session = self.session.lock()
            .map_err(|e| anyhow!("Failed to lock model session: {}", e))?;

        let tensor = Value::from_array(session.allocator(), &cow)
            .context("Failed to create input tensor")?;

        let outputs = session.run(vec![tensor])
            .context("Failed to run model")?;

        // Probability output (argmax) when present, otherwise the integer label output.
        let probs = outputs.iter()
            .find_map(|o| o.try_extract::<f32>().ok())
            .map(|t| t.view().iter().copied().collect::<Vec<f32>>());

        let idx = match probs {
            Some(probs) => probs.iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(idx, _)| idx)
                .ok_or_else(|| anyhow!("Empty probability vector"))?,
            None => outputs.iter()
                .find_map(|o| o.try_extract::<i64>().ok())
                .and_then(|t| t.view().iter().next().copied())
                .and_then(|v| usize::try_from(v).ok())
                .ok_or_else(|| anyhow!("Model produced neither probabilities nor a label"))?,
        };

        debug!(class = idx, micros = t0.elapsed().as_micros() as u64, "flow predicted");
        Ok(self.label_for(idx))
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub key: FlowKey,
    pub features: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ClassificationOutcome {
    pub key: FlowKey,
    pub result: std::result::Result<String, String>,
}

pub struct ClassifierHandles {
    pub tx: Sender<ClassificationRequest>,
    pub rx: Receiver<ClassificationOutcome>,
    pub thread: JoinHandle<()>,
}

/// Runs predictions on a dedicated thread so the flow engine never waits on the model.
/// The thread exits once every request sender is dropped.
pub fn spawn_classifier(classifier: Arc<dyn Classifier>) -> ClassifierHandles {
    let (tx_in, rx_in) = unbounded::<ClassificationRequest>();
    let (tx_out, rx_out) = unbounded::<ClassificationOutcome>();

    let thread = thread::spawn(move || {
        debug!("classifier thread ready, waiting for flows");

        while let Ok(request) = rx_in.recv() {
            let result = classifier.predict(&request.features).map_err(|e| {
                warn!(flow = %request.key, error = %e, "classification failed");
                format!("{e:#}")
            });
            if tx_out.send(ClassificationOutcome { key: request.key, result }).is_err() {
                // Output channel closed
                break;
            }
        }

        debug!("classifier thread exiting (channel closed)");
    });

    ClassifierHandles { tx: tx_in, rx: rx_out, thread }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct SumClassifier;

    impl Classifier for SumClassifier {
        fn predict(&self, features: &[f32]) -> Result<String> {
            if features.is_empty() {
                return Err(anyhow!("no features"));
            }
            Ok(format!("sum{}", features.iter().sum::<f32>()))
        }
    }

    fn key(n: u16) -> FlowKey {
        use crate::capture::TransportProtocol;
        use std::net::Ipv4Addr;
        FlowKey::from_endpoints(Ipv4Addr::LOCALHOST, Ipv4Addr::new(10, 0, 0, 1), n, 80, TransportProtocol::Tcp)
    }

    #[test]
    fn label_vector_fills_gaps_with_unknown() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"num_classes": 3, "id_to_label": {{"0": "http", "2": "dns", "9": "ignored"}}}}"#).unwrap();

        let labels = load_label_vector(file.path()).unwrap();
        assert_eq!(labels, vec!["http", "Unknown", "dns"]);
    }

    #[test]
    fn label_vector_reports_missing_file() {
        let err = load_label_vector("/no/such/class_map.json").unwrap_err();
        assert!(format!("{err:#}").contains("class_map.json"));
    }

    #[test]
    fn worker_returns_one_outcome_per_request() {
        let handles = spawn_classifier(Arc::new(SumClassifier));
        handles.tx.send(ClassificationRequest { key: key(1), features: vec![1.0, 2.0] }).unwrap();
        handles.tx.send(ClassificationRequest { key: key(2), features: vec![] }).unwrap();

        let first = handles.rx.recv().unwrap();
        assert_eq!(first.key, key(1));
        assert_eq!(first.result.as_deref(), Ok("sum3"));

        let second = handles.rx.recv().unwrap();
        assert_eq!(second.key, key(2));
        assert!(second.result.is_err());

        drop(handles.tx);
        handles.thread.join().unwrap();
    }
}
