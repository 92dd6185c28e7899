//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore custom dell'applicazione.
//!
//! ## Responsabilità:
//! - Definisce `OptimizeError` enum per categorizzare tutti gli errori possibili
//! - Fornisce messaggi di errore descrittivi e strutturati
//! - Integra con `thiserror` per automatic error conversion
//! - Supporta error chaining per mantenere il contesto degli errori
//!
//! ## Categorie di errori:
//! - `Io`: Errori di I/O (file non trovati, permessi, etc.)
//! - `Database`: Errori SQLite sul database della libreria
//! - `Http`: Errori di trasporto verso l'API remota
//! - `InvalidApiKey`: Chiave API rifiutata dall'endpoint di validazione
//! - `Image`: Errori di decodifica/encoding durante la rigenerazione thumbnail
//! - `UnsupportedFormat`: Formato file non supportato
//! - `Validation`: Errori di validazione input/configurazione
//!
//! Gli errori applicativi dell'API remota NON passano di qui: diventano
//! outcome per-variante nel sender, mai un errore del batch.
//!
//! ## Propagazione:
//! - Errori per-variante e per-attachment NON interrompono un batch: vengono
//!   catturati e registrati come `FailureRecord`
//! - Solo gli errori di setup (chiave API invalida, database inaccessibile)
//!   interrompono l'intera esecuzione

/// Custom error types for remote media optimization
#[derive(thiserror::Error, Debug)]
pub enum OptimizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Library database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid API key: {0}")]
    InvalidApiKey(String),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
