//! # Attachment Fetcher Module
//!
//! Questo modulo seleziona gli attachment candidati per batch.
//!
//! ## Responsabilità:
//! - Quattro predicati disgiunti: non ottimizzati, ottimizzati (per restore),
//!   falliti (per retry mirato), non-ancora-riottimizzati nel passaggio corrente
//! - Conteggio totale + pagina limitata di id, sempre in ordine ascendente
//!
//! ## Paginazione senza offset:
//! La pagina è semplicemente "i primi N id che soddisfano il predicato".
//! Marcare le pagine precedenti (record di ottimizzazione scritto, failure
//! registrato, id nel ledger, marker di skip) cambia il predicato stesso, per
//! cui chiamate ripetute restituiscono slice disgiunte e monotone. È questo il
//! meccanismo che rende resumabile uno scan lungo attraverso molte invocazioni
//! brevi, senza alcun parametro di offset.
//!
//! ## Edge case:
//! Una pagina vuota termina il run anche se il conteggio iniziale era non-zero:
//! i conteggi possono essere stantii rispetto a modifiche concorrenti.

use crate::error::OptimizeError;
use crate::library::{MediaLibrary, META_FAILURE_RECORD, META_OPTIMIZATION_RECORD, META_RESTORE_SKIPPED};
use std::sync::Arc;

/// Which disjoint slice of the library a batch run iterates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// No optimization record yet
    Unoptimized,
    /// Has an optimization record, not yet visited in the current
    /// re-optimization pass
    Reoptimize,
    /// Has a failure record
    Failed,
    /// Has an optimization record and no restore-skipped marker
    Restorable,
}

/// Batch-limited queries over the media library
pub struct AttachmentFetcher {
    library: Arc<MediaLibrary>,
    page_size: usize,
}

impl AttachmentFetcher {
    pub fn new(library: Arc<MediaLibrary>, page_size: usize) -> Self {
        Self { library, page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Count of attachments currently matching the predicate
    pub fn count(&self, mode: FetchMode) -> Result<u64, OptimizeError> {
        let sql = format!("SELECT COUNT(*) FROM attachments a WHERE {}", predicate(mode));
        let count: i64 = self
            .library
            .with_conn(|conn| conn.query_row(&sql, [], |row| row.get(0)))?;
        Ok(count as u64)
    }

    /// First `page_size` matching ids in ascending order.
    ///
    /// Callers must mark returned ids (optimized, failed, ledgered or
    /// restore-skipped) before requesting the next page, otherwise the same
    /// slice comes back.
    pub fn page(&self, mode: FetchMode) -> Result<Vec<i64>, OptimizeError> {
        let sql = format!(
            "SELECT a.id FROM attachments a WHERE {} ORDER BY a.id ASC LIMIT {}",
            predicate(mode),
            self.page_size
        );
        self.library.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            rows.collect()
        })
    }
}

fn has_meta(key: &str) -> String {
    format!(
        "EXISTS (SELECT 1 FROM attachment_meta m WHERE m.attachment_id = a.id AND m.meta_key = '{}')",
        key
    )
}

fn predicate(mode: FetchMode) -> String {
    match mode {
        FetchMode::Unoptimized => format!("NOT {}", has_meta(META_OPTIMIZATION_RECORD)),
        FetchMode::Reoptimize => format!(
            "{} AND a.id NOT IN (SELECT attachment_id FROM reoptimize_ledger)",
            has_meta(META_OPTIMIZATION_RECORD)
        ),
        FetchMode::Failed => has_meta(META_FAILURE_RECORD),
        FetchMode::Restorable => format!(
            "{} AND NOT {}",
            has_meta(META_OPTIMIZATION_RECORD),
            has_meta(META_RESTORE_SKIPPED)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{AttachmentMetadata, META_RESTORE_SKIPPED};
    use crate::records::{FailureRecord, OptimizationRecord, SizeData, VariantFailure};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn library_with_attachments(n: usize) -> (TempDir, Arc<MediaLibrary>, Vec<i64>) {
        let temp_dir = TempDir::new().unwrap();
        let library = Arc::new(MediaLibrary::open_in_memory(temp_dir.path()).unwrap());
        let ids = (0..n)
            .map(|i| {
                library
                    .insert_attachment(
                        &format!("photo-{}.jpg", i),
                        "image/jpeg",
                        &AttachmentMetadata::default(),
                    )
                    .unwrap()
            })
            .collect();
        (temp_dir, library, ids)
    }

    fn record_for(saved: u64) -> OptimizationRecord {
        OptimizationRecord::new(vec![SizeData {
            size_name: "full".to_string(),
            original_size: 10_000,
            saved_bytes: saved,
            percent_saved: saved as f64 / 100.0,
            file_name: "photo.jpg".to_string(),
            converted_to_jpeg: false,
            webp: None,
        }])
    }

    #[test]
    fn test_paging_visits_each_id_exactly_once() {
        let (_tmp, library, ids) = library_with_attachments(23);
        let fetcher = AttachmentFetcher::new(library.clone(), 5);

        assert_eq!(fetcher.count(FetchMode::Unoptimized).unwrap(), 23);

        let mut visited = Vec::new();
        loop {
            let page = fetcher.page(FetchMode::Unoptimized).unwrap();
            if page.is_empty() {
                break;
            }
            assert!(page.len() <= 5);
            for id in page {
                visited.push(id);
                // Marking the id changes the predicate, which is what
                // advances the next page
                library.set_optimization_record(id, &record_for(100)).unwrap();
            }
        }

        let unique: HashSet<_> = visited.iter().collect();
        assert_eq!(unique.len(), visited.len());
        assert_eq!(visited.len(), ids.len());
        assert!(visited.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(fetcher.count(FetchMode::Unoptimized).unwrap(), 0);
    }

    #[test]
    fn test_failed_predicate() {
        let (_tmp, library, ids) = library_with_attachments(3);
        let fetcher = AttachmentFetcher::new(library.clone(), 10);

        library
            .set_failure_record(
                ids[1],
                &FailureRecord {
                    failures: vec![VariantFailure {
                        image: "photo-1.jpg".to_string(),
                        message: "timeout".to_string(),
                    }],
                },
            )
            .unwrap();

        assert_eq!(fetcher.count(FetchMode::Failed).unwrap(), 1);
        assert_eq!(fetcher.page(FetchMode::Failed).unwrap(), vec![ids[1]]);
    }

    #[test]
    fn test_reoptimize_excludes_ledgered_ids() {
        let (_tmp, library, ids) = library_with_attachments(3);
        let fetcher = AttachmentFetcher::new(library.clone(), 10);

        for &id in &ids {
            library.set_optimization_record(id, &record_for(100)).unwrap();
        }
        assert_eq!(fetcher.count(FetchMode::Reoptimize).unwrap(), 3);

        library.ledger_insert(ids[0]).unwrap();
        library.ledger_insert(ids[2]).unwrap();

        assert_eq!(fetcher.count(FetchMode::Reoptimize).unwrap(), 1);
        assert_eq!(fetcher.page(FetchMode::Reoptimize).unwrap(), vec![ids[1]]);

        library.ledger_clear().unwrap();
        assert_eq!(fetcher.count(FetchMode::Reoptimize).unwrap(), 3);
    }

    #[test]
    fn test_restorable_excludes_skip_marker() {
        let (_tmp, library, ids) = library_with_attachments(2);
        let fetcher = AttachmentFetcher::new(library.clone(), 10);

        library.set_optimization_record(ids[0], &record_for(100)).unwrap();
        library.set_optimization_record(ids[1], &record_for(100)).unwrap();
        library.meta_set(ids[0], META_RESTORE_SKIPPED, "1").unwrap();

        assert_eq!(fetcher.count(FetchMode::Restorable).unwrap(), 1);
        assert_eq!(fetcher.page(FetchMode::Restorable).unwrap(), vec![ids[1]]);
    }

    #[test]
    fn test_empty_page_even_with_stale_count() {
        let (_tmp, library, ids) = library_with_attachments(2);
        let fetcher = AttachmentFetcher::new(library.clone(), 10);

        let stale_count = fetcher.count(FetchMode::Unoptimized).unwrap();
        assert_eq!(stale_count, 2);

        // Attachments get optimized between the count and the page query
        for &id in &ids {
            library.set_optimization_record(id, &record_for(100)).unwrap();
        }

        assert!(fetcher.page(FetchMode::Unoptimized).unwrap().is_empty());
    }
}
