use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub completed: u64,
    pub oracles_running: usize,
}

impl ProgressSnapshot {
    /// 0 while any oracle is running or before a total is known.
    pub fn percent(&self) -> f64 {
        if self.oracles_running > 0 || self.total == 0 {
            return 0.0;
        }
        self.completed as f64 * 100.0 / self.total as f64
    }
}

/// Packet counters shared by every batch worker, all behind one lock.
#[derive(Debug, Default)]
pub struct Progress {
    inner: Mutex<ProgressSnapshot>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> MutexGuard<'_, ProgressSnapshot> {
        // Plain counters stay meaningful even if a worker panicked mid-update.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn oracle_started(&self) {
        self.counters().oracles_running += 1;
    }

    pub fn oracle_finished(&self) {
        let mut c = self.counters();
        c.oracles_running = c.oracles_running.saturating_sub(1);
    }

    pub fn add_total(&self, packets: u64) {
        self.counters().total += packets;
    }

    pub fn advance(&self, packets: u64) {
        self.counters().completed += packets;
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        *self.counters()
    }

    pub fn percent(&self) -> f64 {
        self.snapshot().percent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn unknown_total_reads_as_zero() {
        let progress = Progress::new();
        assert_eq!(progress.percent(), 0.0);
        progress.advance(5);
        assert_eq!(progress.percent(), 0.0);
    }

    #[test]
    fn running_oracle_suppresses_percentage() {
        let progress = Progress::new();
        progress.add_total(200);
        progress.advance(50);
        assert_eq!(progress.percent(), 25.0);

        progress.oracle_started();
        assert_eq!(progress.percent(), 0.0);
        progress.oracle_finished();
        assert_eq!(progress.percent(), 25.0);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let progress = Arc::new(Progress::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let progress = progress.clone();
                thread::spawn(move || {
                    progress.add_total(1000);
                    for _ in 0..1000 {
                        progress.advance(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = progress.snapshot();
        assert_eq!(snap.total, 8000);
        assert_eq!(snap.completed, 8000);
        assert_eq!(progress.percent(), 100.0);
    }
}
