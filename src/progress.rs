//! # Progress Tracking and Statistics Module
//!
//! Questo modulo gestisce il progress tracking e le statistiche di run.
//!
//! ## Responsabilità:
//! - Progress bar visual con `indicatif` per i loop `--all`
//! - Tracking statistiche cumulative attraverso batch ripetuti
//! - Report finali con byte risparmiati e percentuali
//!
//! ## Componenti principali:
//! - `ProgressManager`: Gestisce progress bar principale
//! - `RunStats`: Accumula i report dei singoli batch
//!
//! ## Visual feedback:
//! ```text
//! ⠋ [00:02:15] [========================>----] 150/200 (75%) ✅ photo.jpg: 42.1 KB saved
//! ```

use crate::optimizer::BatchReport;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Manages progress reporting for batch runs
#[derive(Clone)]
pub struct ProgressManager {
    bar: ProgressBar,
}

impl ProgressManager {
    /// Create a new progress manager
    pub fn new(total_attachments: u64) -> Self {
        let bar = ProgressBar::new(total_attachments);

        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update progress with a message
    pub fn update(&self, message: &str) {
        self.bar.inc(1);
        self.bar.set_message(message.to_string());
    }

    /// Finish with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Create a spinner for indeterminate progress
    pub fn spinner(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();

        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap(),
        );

        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));

        spinner
    }
}

/// Cumulative statistics across repeated batch invocations
#[derive(Debug, Default)]
pub struct RunStats {
    pub batches: usize,
    pub processed: usize,
    pub optimized: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_bytes_saved: u64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch report into the running totals
    pub fn add_batch(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.processed += report.processed;
        self.optimized += report.optimized;
        self.failed += report.failed;
        self.skipped += report.skipped;
        self.total_bytes_saved += report.saved_bytes;
    }

    pub fn format_summary(&self) -> String {
        format!(
            "Processed: {} attachments in {} batch(es) | Optimized: {} | Skipped: {} | Errors: {} | Total saved: {}",
            self.processed,
            self.batches,
            self.optimized,
            self.skipped,
            self.failed,
            crate::file_manager::FileManager::format_size(self.total_bytes_saved)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_stats_accumulate() {
        let mut stats = RunStats::new();

        stats.add_batch(&BatchReport {
            processed: 3,
            optimized: 2,
            failed: 1,
            skipped: 0,
            saved_bytes: 10_000,
            remaining: 5,
            messages: Vec::new(),
        });
        stats.add_batch(&BatchReport {
            processed: 2,
            optimized: 2,
            failed: 0,
            skipped: 0,
            saved_bytes: 4_000,
            remaining: 0,
            messages: Vec::new(),
        });

        assert_eq!(stats.batches, 2);
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.optimized, 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total_bytes_saved, 14_000);
        assert!(stats.format_summary().contains("13.67 KB"));
    }
}
