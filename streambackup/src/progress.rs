//! Replaces the source's process-global `totalsize`/`totaldone`/
//! `tablespacecount` with an explicit value threaded through the CLI call
//! graph (design notes §9).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct ProgressTracker {
    total_kb: AtomicU64,
    done_kb: AtomicU64,
    tablespace_count: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total_kb(&self, total_kb: u64) {
        self.total_kb.store(total_kb, Ordering::Relaxed);
    }

    pub fn add_done_kb(&self, kb: u64) {
        self.done_kb.fetch_add(kb, Ordering::Relaxed);
    }

    pub fn note_tablespace(&self) {
        self.tablespace_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn percent_done(&self) -> f64 {
        let total = self.total_kb.load(Ordering::Relaxed);
        if total == 0 {
            return 100.0;
        }
        let done = self.done_kb.load(Ordering::Relaxed);
        (done as f64 / total as f64 * 100.0).min(100.0)
    }

    pub fn tablespace_count(&self) -> u64 {
        self.tablespace_count.load(Ordering::Relaxed)
    }
}
