use crossbeam_channel::{select, tick, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use crate::types::NetworkStats;

/// Keeps the newest snapshot in `latest` and logs it every `interval`.
pub fn publisher_loop(
    running: Arc<AtomicBool>,
    stats_rx: Receiver<NetworkStats>,
    latest: Arc<Mutex<Option<NetworkStats>>>,
    interval: Duration,
) {
    let emit_tick = tick(interval);
    let mut current: Option<NetworkStats> = None;

    loop {
        if !running.load(Ordering::Relaxed) { break; }

        select! {
            recv(stats_rx) -> msg => match msg {
                Ok(s) => {
                    if let Ok(mut slot) = latest.lock() {
                        *slot = Some(s.clone());
                    }
                    current = Some(s);
                }
                Err(_) => break,
            },
            recv(emit_tick) -> _ => {
                if let Some(ref s) = current {
                    info!(
                        received = s.received_packets,
                        classified = s.classified_flows,
                        detected = s.detected_flows,
                        skipped = s.skipped_frames,
                        pps = format_args!("{:.1}", s.packets_per_second),
                        uptime = s.uptime_seconds,
                        "status"
                    );
                }
            }
        }
    }
}
