//! # Remote Media Optimizer Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare dell'applicazione
//! - Espone i tipi e le funzioni principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il main.rs e per altri consumatori
//!
//! ## Architettura dei moduli:
//! - `config`: Configurazione tipizzata e validazione parametri
//! - `error`: Tipi di errore custom per diverse operazioni
//! - `library`: Database SQLite della libreria media (attachment, meta, stats)
//! - `records`: Record di ottimizzazione/fallimento e semantica di merge
//! - `fetcher`: Query paginate sui candidati per batch
//! - `tracker`: Backup, restore e scrittura metadata
//! - `sender`: Client HTTP verso l'API remota di ottimizzazione
//! - `optimizer`: Orchestratore del loop batch
//! - `stats`: Aggregatore statistiche resumabile con checkpoint
//! - `events`: Event bus tipizzato per i consumatori del ciclo di vita
//! - `purge`: Purge opzionale della cache Cloudflare
//! - `thumbnails`: Generazione/rigenerazione locale delle varianti derivate
//! - `file_manager`: Operazioni sui file e discovery immagini
//! - `progress`: Progress tracking e statistiche di run
//! - `json_output`: Output strutturato per chiamanti programmatici
//!
//! ## Utilizzo:
//! ```rust,ignore
//! use remote_media_optimizer::{MediaLibrary, OptimizationManager, Settings};
//!
//! let settings = Settings::default();
//! let library = Arc::new(MediaLibrary::open(&path)?);
//! let manager = OptimizationManager::new(library, fetcher, tracker, sender, bus, settings);
//! let report = manager.optimize_batch(OptimizeMode::Fresh).await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod file_manager;
pub mod json_output;
pub mod library;
pub mod optimizer;
pub mod progress;
pub mod purge;
pub mod records;
pub mod sender;
pub mod stats;
pub mod thumbnails;
pub mod tracker;

pub use config::Settings;
pub use error::OptimizeError;
pub use events::{Event, EventBus, Observer, StatsRowObserver};
pub use fetcher::{AttachmentFetcher, FetchMode};
pub use library::{Attachment, MediaLibrary, ProcessingTask, TaskStatus};
pub use optimizer::{BatchReport, OptimizationManager, OptimizeMode};
pub use records::{FailureRecord, OptimizationRecord, SizeData};
pub use sender::{HttpSender, RemoteClient};
pub use stats::StatsAggregator;
pub use tracker::BackupTracker;
