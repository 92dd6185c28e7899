//! # Main Optimizer Orchestrator Module
//!
//! Questo è il modulo principale che orchestra il loop batch di
//! ottimizzazione e restore.
//!
//! ## Responsabilità:
//! - Coordina fetcher, tracker, sender ed event bus (iniettati alla
//!   composition root, nessun registry globale)
//! - Loop batch pull-based: una invocazione processa UNA pagina di
//!   attachment e riporta quanti ne restano; è il chiamante che reinvoca
//!   finché una pagina vuota segnala il completamento
//! - State machine per-attachment: varianti → backup → invio remoto →
//!   persistenza byte → merge metadata → failure record → ledger → evento
//! - Retry mirato dei soli attachment con FailureRecord
//! - Restore batch con la stessa forma di report
//!
//! ## Isolamento dei fallimenti:
//! Errori per-attachment (I/O, rete) vengono catturati singolarmente: un
//! attachment che fallisce non interrompe il resto del batch. Solo la
//! validazione della chiave API (fase di setup) interrompe l'intero run.
//!
//! ## Semantica at-least-once:
//! Il pattern "pagina poi marca" non è transazionale: un crash tra fetch e
//! mark può rispedire un'immagine già ottimizzata al server. Accettato:
//! ri-ottimizzare un'immagine già ottimizzata è idempotente nell'effetto.

use crate::config::Settings;
use crate::error::OptimizeError;
use crate::events::{Event, EventBus};
use crate::fetcher::{AttachmentFetcher, FetchMode};
use crate::file_manager::FileManager;
use crate::library::{Attachment, AttachmentMetadata, MediaLibrary, META_RESTORE_SKIPPED};
use crate::records::{SizeData, VariantFailure, WebpData};
use crate::sender::{ImagePayload, OptimizedImage, RemoteClient, VariantOutcome};
use crate::tracker::BackupTracker;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Which slice of the library an optimize run targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeMode {
    /// Attachments never optimized before
    Fresh,
    /// Already-optimized attachments, under possibly-changed settings
    Reoptimize,
    /// Only attachments with a failure record
    RetryFailed,
}

impl OptimizeMode {
    fn fetch_mode(self) -> FetchMode {
        match self {
            OptimizeMode::Fresh => FetchMode::Unoptimized,
            OptimizeMode::Reoptimize => FetchMode::Reoptimize,
            OptimizeMode::RetryFailed => FetchMode::Failed,
        }
    }
}

/// Aggregate result of one batch invocation
#[derive(Debug, Default)]
pub struct BatchReport {
    pub processed: usize,
    pub optimized: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Bytes saved by this batch, WebP siblings excluded
    pub saved_bytes: u64,
    /// Attachments still matching the predicate after this batch
    pub remaining: u64,
    /// Per-item messages, suitable for direct display
    pub messages: Vec<String>,
}

/// Main batch orchestrator, generic over the remote client seam
pub struct OptimizationManager<C: RemoteClient> {
    library: Arc<MediaLibrary>,
    fetcher: AttachmentFetcher,
    tracker: BackupTracker,
    sender: C,
    bus: EventBus,
    settings: Settings,
}

impl<C: RemoteClient> OptimizationManager<C> {
    pub fn new(
        library: Arc<MediaLibrary>,
        fetcher: AttachmentFetcher,
        tracker: BackupTracker,
        sender: C,
        bus: EventBus,
        settings: Settings,
    ) -> Self {
        Self {
            library,
            fetcher,
            tracker,
            sender,
            bus,
            settings,
        }
    }

    /// Attachments currently matching an optimize mode's predicate
    pub fn candidates(&self, mode: OptimizeMode) -> Result<u64> {
        Ok(self.fetcher.count(mode.fetch_mode())?)
    }

    /// Attachments currently eligible for restore
    pub fn restore_candidates(&self) -> Result<u64> {
        Ok(self.fetcher.count(FetchMode::Restorable)?)
    }

    /// Process one page of candidate attachments.
    ///
    /// Returns after the page is drained; callers repeat until
    /// `report.processed == 0` signals completion.
    pub async fn optimize_batch(&self, mode: OptimizeMode) -> Result<BatchReport> {
        // Fail fast on a bad credential: one clear message instead of N
        // redundant per-image failures
        if !self.settings.dry_run {
            self.sender.validate_api_key().await?;
        }

        let fetch_mode = mode.fetch_mode();
        let page = self.fetcher.page(fetch_mode)?;

        let mut report = BatchReport::default();

        if page.is_empty() {
            if mode == OptimizeMode::Reoptimize {
                // Full re-optimization pass complete
                self.library.ledger_clear()?;
                debug!("Re-optimization pass drained, ledger truncated");
            }
            return Ok(report);
        }

        for id in page {
            self.optimize_one(id, mode, &mut report).await;
        }

        report.remaining = self.fetcher.count(fetch_mode)?;
        Ok(report)
    }

    /// Optimize an explicit list of attachment ids (CLI `--ids`)
    pub async fn optimize_ids(&self, ids: &[i64], reoptimize: bool) -> Result<BatchReport> {
        if !self.settings.dry_run {
            self.sender.validate_api_key().await?;
        }

        let mode = if reoptimize {
            OptimizeMode::Reoptimize
        } else {
            OptimizeMode::Fresh
        };
        let mut report = BatchReport::default();
        for &id in ids {
            self.optimize_one(id, mode, &mut report).await;
        }
        Ok(report)
    }

    async fn optimize_one(&self, id: i64, mode: OptimizeMode, report: &mut BatchReport) {
        report.processed += 1;
        match self.process_attachment(id, mode).await {
            Ok(ItemOutcome::Optimized { file, saved, failures }) => {
                report.saved_bytes += saved;
                if failures == 0 {
                    report.optimized += 1;
                    report.messages.push(format!(
                        "✅ {}: {} saved",
                        file,
                        FileManager::format_size(saved)
                    ));
                } else {
                    // Mixed outcome: successes persisted, failures recorded
                    report.optimized += 1;
                    report.failed += 1;
                    report.messages.push(format!(
                        "⚠️ {}: {} saved, {} variant(s) failed",
                        file,
                        FileManager::format_size(saved),
                        failures
                    ));
                }
            }
            Ok(ItemOutcome::AllFailed { file, failures }) => {
                report.failed += 1;
                report
                    .messages
                    .push(format!("❌ {}: all {} variant(s) failed", file, failures));
            }
            Ok(ItemOutcome::Skipped { file, reason }) => {
                report.skipped += 1;
                report.messages.push(format!("⏩ {}: {}", file, reason));
            }
            Ok(ItemOutcome::DryRun { file, variants }) => {
                report.skipped += 1;
                report
                    .messages
                    .push(format!("🧪 {}: would send {} variant(s)", file, variants));
            }
            Err(e) => {
                report.failed += 1;
                report.messages.push(format!("❌ attachment {}: {}", id, e));
                error!("Failed to process attachment {}: {}", id, e);
            }
        }
    }

    /// The per-attachment state machine of one optimization pass
    async fn process_attachment(
        &self,
        id: i64,
        mode: OptimizeMode,
    ) -> Result<ItemOutcome, OptimizeError> {
        let attachment = self
            .library
            .get_attachment(id)?
            .ok_or_else(|| OptimizeError::Validation(format!("Unknown attachment {}", id)))?;

        let payloads = self.variant_payloads(&attachment);
        if payloads.is_empty() {
            return Ok(ItemOutcome::Skipped {
                file: attachment.file,
                reason: "no variants to send".to_string(),
            });
        }

        if self.settings.dry_run {
            return Ok(ItemOutcome::DryRun {
                file: attachment.file,
                variants: payloads.len(),
            });
        }

        self.tracker.create_backup(&attachment).await?;

        let outcomes = self.sender.send(&payloads).await;

        let mut metadata = attachment.metadata.clone();
        let mut metadata_dirty = false;
        let mut size_data: Vec<SizeData> = Vec::new();
        let mut failures: Vec<VariantFailure> = Vec::new();

        for (payload, outcome) in payloads.iter().zip(outcomes) {
            match outcome {
                VariantOutcome::Optimized(image) => {
                    match self
                        .persist_variant(payload, &image, &mut metadata, &mut metadata_dirty)
                        .await
                    {
                        Ok(data) => size_data.push(data),
                        Err(e) => {
                            warn!("Could not persist {}: {}", payload.relative_path, e);
                            failures.push(VariantFailure {
                                image: payload.relative_path.clone(),
                                message: format!("Write failed: {}", e),
                            });
                        }
                    }
                }
                VariantOutcome::Failed { image, message } => {
                    debug!("Remote error for {}: {}", image, message);
                    failures.push(VariantFailure { image, message });
                }
            }
        }

        if metadata_dirty {
            self.library.update_metadata(id, &metadata)?;
        }

        let saved: u64 = size_data.iter().map(|s| s.saved_bytes).sum();
        let failure_count = failures.len();
        let had_success = !size_data.is_empty();

        // One metadata write for the whole attachment, not one per variant
        if !size_data.is_empty() {
            self.tracker.mark_as_optimized(id, size_data.clone())?;
        }

        if failures.is_empty() {
            self.tracker.clear_failures(id)?;
        } else {
            self.tracker.record_failures(id, failures)?;
        }

        if mode == OptimizeMode::Reoptimize {
            self.library.ledger_insert(id)?;
        }

        if !size_data.is_empty() {
            self.bus
                .emit(&Event::OptimizationCompleted {
                    attachment_id: id,
                    size_data,
                })
                .await;
        }

        if !had_success && failure_count > 0 {
            return Ok(ItemOutcome::AllFailed {
                file: attachment.file,
                failures: failure_count,
            });
        }

        Ok(ItemOutcome::Optimized {
            file: attachment.file,
            saved,
            failures: failure_count,
        })
    }

    /// Full image plus thumbnails, honoring the size exclusion list
    fn variant_payloads(&self, attachment: &Attachment) -> Vec<ImagePayload> {
        let mut payloads = vec![ImagePayload {
            attachment_id: attachment.id,
            path: self.library.absolute_path(&attachment.file),
            relative_path: attachment.file.clone(),
            size_name: None,
            mime_type: attachment.mime_type.clone(),
        }];

        for (name, size) in &attachment.metadata.sizes {
            if self.settings.excluded_sizes.contains(name) {
                debug!("Size '{}' excluded by settings", name);
                continue;
            }
            payloads.push(ImagePayload {
                attachment_id: attachment.id,
                path: self.library.absolute_path(&size.file),
                relative_path: size.file.clone(),
                size_name: Some(name.clone()),
                mime_type: size.mime_type.clone(),
            });
        }

        payloads
    }

    /// Write one optimized variant (and its WebP sibling) to disk and build
    /// its size_data entry
    async fn persist_variant(
        &self,
        payload: &ImagePayload,
        image: &OptimizedImage,
        metadata: &mut AttachmentMetadata,
        metadata_dirty: &mut bool,
    ) -> Result<SizeData, OptimizeError> {
        let (target_abs, target_rel) = if image.converted_to_jpg {
            (
                FileManager::jpeg_sibling(&payload.path),
                FileManager::jpeg_sibling(Path::new(&payload.relative_path))
                    .to_string_lossy()
                    .to_string(),
            )
        } else {
            (payload.path.clone(), payload.relative_path.clone())
        };

        fs::write(&target_abs, &image.content).await?;
        debug!(
            "Wrote {} optimized bytes to {}",
            image.content.len(),
            target_abs.display()
        );

        let webp = match &image.webp {
            Some(webp) => {
                let webp_abs = FileManager::webp_sibling(&payload.path);
                fs::write(&webp_abs, &webp.content).await?;
                Some(WebpData {
                    file_name: FileManager::webp_sibling(Path::new(&payload.relative_path))
                        .to_string_lossy()
                        .to_string(),
                    saved_bytes: webp.bytes_saved,
                    percent_saved: webp.percent_saved,
                })
            }
            None => None,
        };

        // Server-side resize changed the pixel dimensions: reflect it in the
        // attachment's derived-size metadata
        if let Some((width, height)) = image.dimensions {
            match &payload.size_name {
                None => {
                    if metadata.width != width || metadata.height != height {
                        metadata.width = width;
                        metadata.height = height;
                        metadata.filesize = image.content.len() as u64;
                        *metadata_dirty = true;
                    }
                }
                Some(name) => {
                    if let Some(size) = metadata.sizes.get_mut(name) {
                        if size.width != width || size.height != height {
                            size.width = width;
                            size.height = height;
                            size.filesize = image.content.len() as u64;
                            *metadata_dirty = true;
                        }
                    }
                }
            }
        }

        Ok(SizeData {
            size_name: payload.variant_name(),
            original_size: image.original_size,
            saved_bytes: image.bytes_saved,
            percent_saved: image.percent_saved,
            file_name: target_rel,
            converted_to_jpeg: image.converted_to_jpg,
            webp,
        })
    }

    /// Restore one page of optimized attachments from their backups
    pub async fn restore_batch(&self) -> Result<BatchReport> {
        let page = self.fetcher.page(FetchMode::Restorable)?;
        let mut report = BatchReport::default();

        for id in page {
            report.processed += 1;

            let attachment = match self.library.get_attachment(id)? {
                Some(attachment) => attachment,
                None => {
                    report.failed += 1;
                    report
                        .messages
                        .push(format!("❌ attachment {}: not found", id));
                    continue;
                }
            };

            if self.settings.dry_run {
                report.skipped += 1;
                report
                    .messages
                    .push(format!("🧪 {}: would restore", attachment.file));
                continue;
            }

            match self.tracker.restore(&attachment).await {
                Ok(true) => {
                    report.optimized += 1;
                    report.messages.push(format!("✅ {}: restored", attachment.file));
                    self.bus
                        .emit(&Event::AttachmentRestored { attachment_id: id })
                        .await;
                }
                Ok(false) => {
                    report.failed += 1;
                    report.messages.push(format!(
                        "⏩ {}: backup missing, marked as skipped",
                        attachment.file
                    ));
                }
                Err(e) => {
                    report.failed += 1;
                    report
                        .messages
                        .push(format!("❌ {}: {}", attachment.file, e));
                    error!("Failed to restore attachment {}: {}", id, e);
                    // A failed attachment must leave the restorable predicate,
                    // or a bulk restore would fetch the same page forever. The
                    // marker is one-shot: re-optimizing clears it.
                    self.library.meta_set(id, META_RESTORE_SKIPPED, "1")?;
                }
            }
        }

        report.remaining = self.fetcher.count(FetchMode::Restorable)?;
        Ok(report)
    }

    /// Clear every failed attachment so the next normal batch re-attempts it
    /// from scratch. Restorable backups are restored first to avoid
    /// compounding a partially-corrupted state.
    pub async fn reset_failed_optimizations(&self) -> Result<usize> {
        let mut reset = 0;

        loop {
            let page = self.fetcher.page(FetchMode::Failed)?;
            if page.is_empty() {
                break;
            }

            for id in page {
                let attachment = match self.library.get_attachment(id)? {
                    Some(attachment) => attachment,
                    None => {
                        self.library.meta_delete_all(id)?;
                        continue;
                    }
                };

                if self.tracker.backup_exists(&attachment)? {
                    if let Err(e) = self.tracker.restore(&attachment).await {
                        warn!("Could not restore attachment {} during reset: {}", id, e);
                        self.tracker.clear_failures(id)?;
                    }
                } else {
                    self.library.meta_delete_all(id)?;
                    self.library.stats_delete(id)?;
                }
                reset += 1;
            }
        }

        info!("Reset {} failed optimizations", reset);
        Ok(reset)
    }
}

/// Outcome of one attachment inside a batch
enum ItemOutcome {
    Optimized {
        file: String,
        saved: u64,
        failures: usize,
    },
    AllFailed {
        file: String,
        failures: usize,
    },
    Skipped {
        file: String,
        reason: String,
    },
    DryRun {
        file: String,
        variants: usize,
    },
}
