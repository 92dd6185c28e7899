//! # Optimization Records Module
//!
//! Questo modulo definisce i record persistiti per ogni attachment ottimizzato.
//!
//! ## Responsabilità:
//! - `SizeData`: Risultato per singola variante (full o thumbnail)
//! - `WebpData`: Sotto-record per la variante WebP affiancata
//! - `OptimizationRecord`: Collezione ordinata di risultati per-variante
//! - `FailureRecord`: Snapshot degli errori per-variante per il retry mirato
//! - Implementa la semantica di merge per ri-ottimizzazioni ripetute
//!
//! ## Semantica di merge:
//! Quando una ri-ottimizzazione produce nuovi risultati per una variante già
//! presente nel record, i byte risparmiati si SOMMANO (non sostituiscono) e la
//! percentuale viene ricalcolata contro la dimensione originale catturata alla
//! PRIMA ottimizzazione. Varianti nuove vengono accodate. In questo modo il
//! record riporta sempre il risparmio cumulativo lifetime, non solo il delta
//! dell'ultimo passaggio.
//!
//! ## Invariante:
//! `percent_saved` è sempre derivabile come `saved_bytes / original_size`.

use serde::{Deserialize, Serialize};

/// WebP sibling result for one variant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebpData {
    pub file_name: String,
    pub saved_bytes: u64,
    pub percent_saved: f64,
}

/// Per-variant optimization result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SizeData {
    /// Variant identifier: "full" or a thumbnail size name
    pub size_name: String,
    /// Size in bytes before the first optimization (the baseline)
    pub original_size: u64,
    /// Cumulative bytes saved across all optimization passes
    pub saved_bytes: u64,
    /// saved_bytes / original_size, as a percentage
    pub percent_saved: f64,
    /// File name the optimized bytes were written to
    pub file_name: String,
    /// Whether the variant was converted from PNG to JPEG
    pub converted_to_jpeg: bool,
    /// Optional WebP sibling produced alongside the variant
    pub webp: Option<WebpData>,
}

impl SizeData {
    fn recompute_percent(&mut self) {
        self.percent_saved = percent(self.saved_bytes, self.original_size);
    }
}

/// Ordered collection of per-variant results for one attachment
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OptimizationRecord {
    pub sizes: Vec<SizeData>,
}

impl OptimizationRecord {
    pub fn new(sizes: Vec<SizeData>) -> Self {
        Self { sizes }
    }

    /// Fold new per-variant results into this record.
    ///
    /// Matching variants (same `size_name`) accumulate saved bytes and keep
    /// the original-size baseline captured at first optimization; file name
    /// and conversion flag take the latest value. Non-matching variants are
    /// appended.
    pub fn merge(&mut self, new_sizes: Vec<SizeData>) {
        for incoming in new_sizes {
            match self
                .sizes
                .iter_mut()
                .find(|s| s.size_name == incoming.size_name)
            {
                Some(existing) => {
                    existing.saved_bytes += incoming.saved_bytes;
                    existing.file_name = incoming.file_name;
                    existing.converted_to_jpeg =
                        existing.converted_to_jpeg || incoming.converted_to_jpeg;
                    existing.recompute_percent();

                    if let Some(new_webp) = incoming.webp {
                        match existing.webp.as_mut() {
                            Some(webp) => {
                                webp.saved_bytes += new_webp.saved_bytes;
                                webp.file_name = new_webp.file_name;
                                webp.percent_saved =
                                    percent(webp.saved_bytes, existing.original_size);
                            }
                            None => existing.webp = Some(new_webp),
                        }
                    }
                }
                None => self.sizes.push(incoming),
            }
        }
    }

    /// Total bytes saved across all variants, WebP siblings excluded
    pub fn total_saved(&self) -> u64 {
        self.sizes.iter().map(|s| s.saved_bytes).sum()
    }

    /// Total bytes saved by WebP siblings
    pub fn total_webp_saved(&self) -> u64 {
        self.sizes
            .iter()
            .filter_map(|s| s.webp.as_ref())
            .map(|w| w.saved_bytes)
            .sum()
    }

    /// Number of variants with a WebP sibling
    pub fn webp_conversions(&self) -> u64 {
        self.sizes.iter().filter(|s| s.webp.is_some()).count() as u64
    }

    /// Number of variants converted from PNG to JPEG
    pub fn png_jpg_conversions(&self) -> u64 {
        self.sizes.iter().filter(|s| s.converted_to_jpeg).count() as u64
    }
}

/// One failed variant: which image and why
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantFailure {
    /// Variant file path or size name the error refers to
    pub image: String,
    /// Error message reported by the sender or the remote API
    pub message: String,
}

/// Snapshot of per-variant errors, kept separately from success data so a
/// retry pass can target failed attachments without rescanning successes
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub failures: Vec<VariantFailure>,
}

pub(crate) fn percent(saved: u64, original: u64) -> f64 {
    if original == 0 {
        0.0
    } else {
        (saved as f64 / original as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(name: &str, original: u64, saved: u64) -> SizeData {
        SizeData {
            size_name: name.to_string(),
            original_size: original,
            saved_bytes: saved,
            percent_saved: percent(saved, original),
            file_name: format!("{}.jpg", name),
            converted_to_jpeg: false,
            webp: None,
        }
    }

    #[test]
    fn test_merge_accumulates_against_first_baseline() {
        // Full image 100000 bytes, thumbnail 20000 bytes. First pass saves
        // 40000/8000, a re-optimize pass saves another 5000/1000.
        let mut record = OptimizationRecord::new(vec![
            size("full", 100_000, 40_000),
            size("thumbnail", 20_000, 8_000),
        ]);

        record.merge(vec![
            size("full", 60_000, 5_000),
            size("thumbnail", 12_000, 1_000),
        ]);

        let full = &record.sizes[0];
        assert_eq!(full.saved_bytes, 45_000);
        assert_eq!(full.original_size, 100_000);
        assert!((full.percent_saved - 45.0).abs() < f64::EPSILON);

        let thumb = &record.sizes[1];
        assert_eq!(thumb.saved_bytes, 9_000);
        assert!((thumb.percent_saved - 45.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_appends_unknown_variants() {
        let mut record = OptimizationRecord::new(vec![size("full", 100_000, 10_000)]);
        record.merge(vec![size("medium", 50_000, 5_000)]);

        assert_eq!(record.sizes.len(), 2);
        assert_eq!(record.sizes[1].size_name, "medium");
        assert_eq!(record.sizes[1].saved_bytes, 5_000);
    }

    #[test]
    fn test_merge_webp_subrecord() {
        let mut first = size("full", 100_000, 10_000);
        first.webp = Some(WebpData {
            file_name: "full.webp".to_string(),
            saved_bytes: 20_000,
            percent_saved: 20.0,
        });
        let mut record = OptimizationRecord::new(vec![first]);

        let mut second = size("full", 90_000, 2_000);
        second.webp = Some(WebpData {
            file_name: "full.webp".to_string(),
            saved_bytes: 5_000,
            percent_saved: 5.0,
        });
        record.merge(vec![second]);

        let webp = record.sizes[0].webp.as_ref().unwrap();
        assert_eq!(webp.saved_bytes, 25_000);
        assert!((webp.percent_saved - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_conversion_flag_is_sticky() {
        let mut converted = size("full", 100_000, 10_000);
        converted.converted_to_jpeg = true;
        let mut record = OptimizationRecord::new(vec![converted]);

        // A later pass over the already-converted JPEG reports no conversion
        record.merge(vec![size("full", 90_000, 1_000)]);
        assert!(record.sizes[0].converted_to_jpeg);
        assert_eq!(record.png_jpg_conversions(), 1);
    }

    #[test]
    fn test_totals() {
        let mut with_webp = size("full", 100_000, 40_000);
        with_webp.webp = Some(WebpData {
            file_name: "full.webp".to_string(),
            saved_bytes: 15_000,
            percent_saved: 15.0,
        });
        let record = OptimizationRecord::new(vec![with_webp, size("thumbnail", 20_000, 8_000)]);

        assert_eq!(record.total_saved(), 48_000);
        assert_eq!(record.total_webp_saved(), 15_000);
        assert_eq!(record.webp_conversions(), 1);
        assert_eq!(record.png_jpg_conversions(), 0);
    }
}
