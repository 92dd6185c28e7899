//! # Backup/Restore Tracker Module
//!
//! Questo modulo mette al sicuro gli originali prima dell'ottimizzazione e
//! gestisce il ripristino e la bonifica dei metadata.
//!
//! ## Responsabilità:
//! - `create_backup`: copia l'originale in un albero speculare sotto la
//!   backup root, registrando il path relativo
//! - `restore`: riporta i byte pristini sul file corrente, elimina backup e
//!   artefatti derivati (WebP, JPEG convertiti), azzera metadata e stats,
//!   rigenera le thumbnail dall'originale ripristinato
//! - `mark_as_optimized`: merge (non replace) dei risultati per-variante nel
//!   record esistente — i risparmi si accumulano tra passaggi ripetuti
//! - `record_failures`: snapshot degli errori per il retry mirato
//! - `delete_attachment`: hook di cancellazione, nessuno stato orfano
//!
//! ## Politica di backup:
//! Backup-only-if-absent: il PRIMO backup è l'originale pristino e non viene
//! mai sovrascritto da passaggi successivi. Se il backup registrato esiste
//! già su disco, `create_backup` è un no-op.
//!
//! ## Restore mancante:
//! "Backup assente" non è un'eccezione: ritorna `Ok(false)` e scrive un
//! marker one-shot, così il bulk restore visita ogni fallimento una sola
//! volta e resta convergente.

use crate::error::OptimizeError;
use crate::file_manager::FileManager;
use crate::library::{
    Attachment, MediaLibrary, SizeMetadata, META_BACKUP_PATH, META_RESTORE_SKIPPED,
};
use crate::records::{FailureRecord, OptimizationRecord, SizeData, VariantFailure};
use crate::thumbnails::{self, STANDARD_SIZES};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Tracks backups and owns every metadata write of the optimization flow
pub struct BackupTracker {
    library: Arc<MediaLibrary>,
    backup_enabled: bool,
}

impl BackupTracker {
    pub fn new(library: Arc<MediaLibrary>, backup_enabled: bool) -> Self {
        Self {
            library,
            backup_enabled,
        }
    }

    /// True when a backup is recorded and the file is physically present
    pub fn backup_exists(&self, attachment: &Attachment) -> Result<bool, OptimizeError> {
        match self.library.meta_get(attachment.id, META_BACKUP_PATH)? {
            Some(relative) => Ok(self.library.backup_root().join(relative).exists()),
            None => Ok(false),
        }
    }

    /// Copy the pristine original aside before the first destructive pass.
    ///
    /// No-op when backups are disabled or when a backup already exists: the
    /// first backup is the pristine original and later passes must never
    /// overwrite it.
    pub async fn create_backup(&self, attachment: &Attachment) -> Result<(), OptimizeError> {
        if !self.backup_enabled {
            debug!("Backups disabled, skipping attachment {}", attachment.id);
            return Ok(());
        }

        if self.backup_exists(attachment)? {
            debug!("Backup already present for attachment {}", attachment.id);
            return Ok(());
        }

        let source = self.library.absolute_path(&attachment.file);
        let target = self.library.backup_root().join(&attachment.file);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&source, &target).await?;

        self.library
            .meta_set(attachment.id, META_BACKUP_PATH, &attachment.file)?;
        debug!(
            "Backed up attachment {} to {}",
            attachment.id,
            target.display()
        );
        Ok(())
    }

    /// Restore the pristine bytes, wiping every trace of optimization.
    ///
    /// Returns `Ok(false)` when no backup is available; in that case a
    /// one-shot skip marker keeps bulk restore from re-visiting the
    /// attachment.
    pub async fn restore(&self, attachment: &Attachment) -> Result<bool, OptimizeError> {
        let backup_relative = self.library.meta_get(attachment.id, META_BACKUP_PATH)?;
        let backup_path = backup_relative
            .as_ref()
            .map(|rel| self.library.backup_root().join(rel));

        let backup_path = match backup_path {
            Some(path) if path.exists() => path,
            _ => {
                warn!(
                    "No backup for attachment {}, marking restore as attempted",
                    attachment.id
                );
                self.library
                    .meta_set(attachment.id, META_RESTORE_SKIPPED, "1")?;
                return Ok(false);
            }
        };

        // Derived artifacts first, so a failed copy leaves them deletable
        self.delete_derived_files(attachment).await?;

        let original = self.library.absolute_path(&attachment.file);
        FileManager::replace_file(&original, &backup_path).await?;
        fs::remove_file(&backup_path).await?;

        self.library.meta_delete_all(attachment.id)?;
        self.library.stats_delete(attachment.id)?;

        self.regenerate_metadata(attachment).await?;

        info!("Restored attachment {} from backup", attachment.id);
        Ok(true)
    }

    /// Merge this pass's per-variant results into the stored record in one
    /// metadata write, and clear any stale restore-skip marker: a fresh
    /// optimization makes a future restore attempt meaningful again.
    pub fn mark_as_optimized(
        &self,
        attachment_id: i64,
        size_data: Vec<SizeData>,
    ) -> Result<OptimizationRecord, OptimizeError> {
        let mut record = self
            .library
            .get_optimization_record(attachment_id)?
            .unwrap_or_default();
        record.merge(size_data);
        self.library.set_optimization_record(attachment_id, &record)?;
        self.library.meta_delete(attachment_id, META_RESTORE_SKIPPED)?;
        Ok(record)
    }

    /// Snapshot per-variant errors so a retry pass can target exactly this
    /// attachment
    pub fn record_failures(
        &self,
        attachment_id: i64,
        failures: Vec<VariantFailure>,
    ) -> Result<(), OptimizeError> {
        self.library
            .set_failure_record(attachment_id, &FailureRecord { failures })
    }

    pub fn clear_failures(&self, attachment_id: i64) -> Result<(), OptimizeError> {
        self.library
            .meta_delete(attachment_id, crate::library::META_FAILURE_RECORD)
    }

    /// Deletion hook: when the host removes an attachment, leave no orphaned
    /// backup, derived file, metadata or stats row behind
    pub async fn delete_attachment(&self, attachment: &Attachment) -> Result<(), OptimizeError> {
        if let Some(relative) = self.library.meta_get(attachment.id, META_BACKUP_PATH)? {
            let backup = self.library.backup_root().join(relative);
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
        }

        self.delete_derived_files(attachment).await?;

        self.library.meta_delete_all(attachment.id)?;
        self.library.stats_delete(attachment.id)?;
        self.library.delete_attachment_row(attachment.id)?;

        debug!("Deleted all state for attachment {}", attachment.id);
        Ok(())
    }

    /// Remove WebP siblings and converted JPEG files named in the stored
    /// optimization record
    async fn delete_derived_files(&self, attachment: &Attachment) -> Result<(), OptimizeError> {
        let record = match self.library.get_optimization_record(attachment.id)? {
            Some(record) => record,
            None => return Ok(()),
        };

        for size in &record.sizes {
            if let Some(webp) = &size.webp {
                let path = self.library.absolute_path(&webp.file_name);
                if path.exists() {
                    fs::remove_file(&path).await?;
                    debug!("Removed WebP artifact {}", path.display());
                }
            }
            if size.converted_to_jpeg {
                let path = self.library.absolute_path(&size.file_name);
                if path.exists() {
                    fs::remove_file(&path).await?;
                    debug!("Removed converted JPEG {}", path.display());
                }
            }
        }
        Ok(())
    }

    /// Rebuild thumbnail variants and the metadata blob from the restored
    /// original
    async fn regenerate_metadata(&self, attachment: &Attachment) -> Result<(), OptimizeError> {
        let original = self.library.absolute_path(&attachment.file);

        let (width, height) = thumbnails::image_dimensions(&original)?;
        let filesize = FileManager::file_size(&original).await?;

        let generated = thumbnails::generate(&original, STANDARD_SIZES)?;
        let mut metadata = attachment.metadata.clone();
        metadata.width = width;
        metadata.height = height;
        metadata.filesize = filesize;
        metadata.sizes.clear();
        for (name, thumb) in generated {
            let relative = thumb
                .file
                .strip_prefix(self.library.root())
                .unwrap_or(&thumb.file)
                .to_string_lossy()
                .to_string();
            metadata.sizes.insert(
                name,
                SizeMetadata {
                    mime_type: FileManager::mime_type(&thumb.file).to_string(),
                    file: relative,
                    width: thumb.width,
                    height: thumb.height,
                    filesize: thumb.filesize,
                },
            );
        }

        self.library.update_metadata(attachment.id, &metadata)?;
        Ok(())
    }
}
