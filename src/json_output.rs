//! # JSON Output Module
//!
//! Questo modulo gestisce l'output strutturato in JSON per chiamanti
//! programmatici (polling UI, wrapper esterni).
//!
//! ## Responsabilità:
//! - Emette messaggi JSON line-delimited su stdout per eventi di run
//! - Fornisce interfaccia standardizzata per comunicazione inter-processo
//!
//! ## Tipi di messaggi:
//! - `start`: Inizio di un run batch
//! - `batch`: Una pagina completata (conteggi + remaining)
//! - `item`: Esito per singolo attachment
//! - `complete`: Fine run con statistiche cumulative
//! - `error`: Errore fatale di setup

use crate::optimizer::BatchReport;
use crate::progress::RunStats;
use serde::{Deserialize, Serialize};

/// Tipo di messaggio JSON
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JsonMessage {
    /// Inizio di un run batch
    #[serde(rename = "start")]
    Start {
        operation: String,
        candidates: u64,
        batch_size: usize,
        dry_run: bool,
    },

    /// Una pagina completata
    #[serde(rename = "batch")]
    Batch {
        processed: usize,
        optimized: usize,
        failed: usize,
        skipped: usize,
        bytes_saved: u64,
        remaining: u64,
    },

    /// Esito per singolo attachment
    #[serde(rename = "item")]
    Item { message: String },

    /// Run completato
    #[serde(rename = "complete")]
    Complete {
        batches: usize,
        processed: usize,
        optimized: usize,
        failed: usize,
        skipped: usize,
        total_bytes_saved: u64,
    },

    /// Errore fatale
    #[serde(rename = "error")]
    Error { message: String },
}

impl JsonMessage {
    /// Emette il messaggio JSON su stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    /// Crea un messaggio di inizio run
    pub fn start(operation: &str, candidates: u64, batch_size: usize, dry_run: bool) -> Self {
        Self::Start {
            operation: operation.to_string(),
            candidates,
            batch_size,
            dry_run,
        }
    }

    /// Crea un messaggio per una pagina completata
    pub fn batch(report: &BatchReport) -> Self {
        Self::Batch {
            processed: report.processed,
            optimized: report.optimized,
            failed: report.failed,
            skipped: report.skipped,
            bytes_saved: report.saved_bytes,
            remaining: report.remaining,
        }
    }

    /// Crea un messaggio di completamento run
    pub fn complete(stats: &RunStats) -> Self {
        Self::Complete {
            batches: stats.batches,
            processed: stats.processed,
            optimized: stats.optimized,
            failed: stats.failed,
            skipped: stats.skipped,
            total_bytes_saved: stats.total_bytes_saved,
        }
    }

    /// Crea un messaggio di errore
    pub fn error(message: String) -> Self {
        Self::Error { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_tag_correctly() {
        let start = serde_json::to_string(&JsonMessage::start("optimize", 12, 10, false)).unwrap();
        assert!(start.contains(r#""type":"start""#));
        assert!(start.contains(r#""operation":"optimize""#));

        let report = BatchReport {
            processed: 2,
            optimized: 1,
            failed: 1,
            skipped: 0,
            saved_bytes: 500,
            remaining: 3,
            messages: Vec::new(),
        };
        let batch = serde_json::to_string(&JsonMessage::batch(&report)).unwrap();
        assert!(batch.contains(r#""type":"batch""#));
        assert!(batch.contains(r#""remaining":3"#));

        let error =
            serde_json::to_string(&JsonMessage::error("Invalid API key".to_string())).unwrap();
        assert!(error.contains(r#""type":"error""#));
        assert!(error.contains(r#""message":"Invalid API key""#));
    }
}
