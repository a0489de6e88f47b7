//! pktmapper command line.
//!
//! ```bash
//! pktmapper interfaces
//! pktmapper live --interface eth0 --model models/flows.onnx --results results.csv
//! pktmapper live --pcap capture.pcap --model models/flows.onnx --features 1,2,15,16
//! pktmapper batch captures/ training.csv --processes 8
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::bounded;
use tracing_subscriber::EnvFilter;

use pktmapper_lib::batch::{BatchPipeline, NdpiReader};
use pktmapper_lib::capture::{list_interfaces, CaptureFile, LiveSource, PacketSource};
use pktmapper_lib::classifier::{load_label_vector, FeatureSelection, OnnxClassifier};
use pktmapper_lib::config::{self, BatchConfig, StreamConfig};
use pktmapper_lib::processor::FeatureProcessor;

#[derive(Parser)]
#[command(name = "pktmapper")]
#[command(version)]
#[command(about = "Flow-level traffic classification and DPI-labelled training sets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List capture-capable interfaces
    Interfaces,
    /// Classify flows from an interface or a capture file
    Live(LiveArgs),
    /// Build a labelled training set from stored captures
    Batch(BatchArgs),
}

#[derive(Args)]
struct LiveArgs {
    /// Interface to capture on
    #[arg(long, short, env = "PKTMAPPER_INTERFACE", conflicts_with = "pcap", required_unless_present = "pcap")]
    interface: Option<String>,

    /// Replay a capture file instead of a live interface
    #[arg(long, env = "PKTMAPPER_PCAP")]
    pcap: Option<PathBuf>,

    /// Trained ONNX model
    #[arg(long, short, env = "PKTMAPPER_MODEL")]
    model: PathBuf,

    /// Class map json; defaults to class_map.json beside the model
    #[arg(long, env = "PKTMAPPER_CLASS_MAP")]
    class_map: Option<PathBuf>,

    /// Packets a flow needs before it is classified
    #[arg(long, short, env = "PKTMAPPER_THRESHOLD", default_value_t = config::DEFAULT_THRESHOLD)]
    threshold: u64,

    /// Feature row indices fed to the model (1-32), space or comma separated
    #[arg(long, short, num_args = 1..)]
    features: Vec<String>,

    /// Write the flow report here on shutdown
    #[arg(long, short, env = "PKTMAPPER_RESULTS")]
    results: Option<PathBuf>,

    #[arg(long, env = "PKTMAPPER_SWEEP_INTERVAL_MS", default_value_t = 500)]
    sweep_interval_ms: u64,

    /// BPF filter for live capture
    #[arg(long, env = "PKTMAPPER_FILTER", default_value = config::DEFAULT_FILTER)]
    filter: String,
}

#[derive(Args)]
struct BatchArgs {
    /// Capture file or directory of capture files
    input: PathBuf,

    /// CSV the labelled flows are appended to
    output: PathBuf,

    #[arg(long, short, env = "PKTMAPPER_THRESHOLD", default_value_t = config::DEFAULT_THRESHOLD)]
    threshold: u64,

    /// Files processed in parallel
    #[arg(long, short, env = "PKTMAPPER_PROCESSES", default_value_t = config::DEFAULT_PROCESSES)]
    processes: usize,

    #[arg(long, env = "PKTMAPPER_NDPI_READER", default_value = config::DEFAULT_NDPI_READER)]
    ndpi_reader: PathBuf,

    #[arg(long, env = "PKTMAPPER_STATUS_INTERVAL_MS", default_value_t = 1000)]
    status_interval_ms: u64,

    /// Start an empty output file with a column header row
    #[arg(long)]
    header: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Interfaces => interfaces(),
        Commands::Live(args) => live(args),
        Commands::Batch(args) => batch(args),
    }
}

fn interfaces() -> Result<()> {
    for iface in list_interfaces().context("Failed to list interfaces")? {
        let state = if iface.is_up { "up" } else { "down" };
        println!("{:<16} {:<5} {:<32} {}", iface.name, state, iface.addresses.join(","), iface.description);
    }
    Ok(())
}

fn live(args: LiveArgs) -> Result<()> {
    let features = FeatureSelection::parse(args.features.as_slice())?;
    let stream = StreamConfig {
        threshold: args.threshold,
        features,
        results: args.results,
        sweep_interval: Duration::from_millis(args.sweep_interval_ms),
        ..StreamConfig::default()
    };
    stream.validate()?;

    let class_map = config::resolve_class_map(&args.model, args.class_map.as_deref());
    let labels = load_label_vector(&class_map)?;
    let classifier = OnnxClassifier::load(&args.model, labels, stream.features.width())?;

    let source: Box<dyn PacketSource> = match (args.interface, args.pcap) {
        (Some(interface), None) => Box::new(LiveSource::open(&interface, &args.filter)?),
        (None, Some(pcap)) => Box::new(
            CaptureFile::open(&pcap).with_context(|| format!("Failed to open {}", pcap.display()))?,
        ),
        _ => bail!("exactly one of --interface or --pcap is required"),
    };

    let (interrupt_tx, interrupt_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let processor = FeatureProcessor::start(&stream, source, Arc::new(classifier))?;
    let table = processor.run_until_done(&interrupt_rx)?;

    tracing::info!(flows = table.len(), classified = table.classified_count(), "done");
    Ok(())
}

fn batch(args: BatchArgs) -> Result<()> {
    let config = BatchConfig {
        threshold: args.threshold,
        processes: args.processes,
        ndpi_reader: args.ndpi_reader,
        status_interval: Duration::from_millis(args.status_interval_ms),
        header: args.header,
        ..BatchConfig::new(args.input, args.output)
    };

    let oracle = Arc::new(NdpiReader::new(config.ndpi_reader.clone()));
    let report = BatchPipeline::new(config, oracle).run()?;

    if report.files_failed > 0 {
        tracing::warn!(failed = report.files_failed, total = report.files_total, "some files were skipped");
    }
    Ok(())
}
