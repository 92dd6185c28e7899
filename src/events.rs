//! # Lifecycle Events Module
//!
//! Questo modulo sostituisce il dispatch per-nome degli hook con un event
//! bus tipizzato: l'orchestratore chiama direttamente una lista esplicita di
//! observer dopo ogni attachment processato.
//!
//! ## Eventi:
//! - `OptimizationCompleted`: attachment id + size_data del passaggio
//! - `AttachmentRestored`: attachment id dopo un restore riuscito
//!
//! ## Observer registrati alla composition root:
//! - `StatsRowObserver`: upsert cumulativo della riga statistiche
//! - `CloudflarePurger` (opzionale): purge della cache CDN
//!
//! ## Contratto:
//! Gli observer non propagano MAI errori verso l'orchestratore: un purge
//! fallito si logga e basta, il batch continua.

use crate::library::{MediaLibrary, StatsRow};
use crate::records::SizeData;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::warn;

/// Lifecycle event emitted by the orchestrator after each batch item
#[derive(Debug, Clone)]
pub enum Event {
    OptimizationCompleted {
        attachment_id: i64,
        /// Size data of THIS pass (the delta, not the merged lifetime record)
        size_data: Vec<SizeData>,
    },
    AttachmentRestored {
        attachment_id: i64,
    },
}

/// A consumer of lifecycle events
pub trait Observer: Send + Sync {
    fn handle<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, ()>;
}

/// Explicit, ordered list of observers
#[derive(Default)]
pub struct EventBus {
    observers: Vec<Box<dyn Observer>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Deliver the event to every observer, in registration order
    pub async fn emit(&self, event: &Event) {
        for observer in &self.observers {
            observer.handle(event).await;
        }
    }
}

/// Folds each pass's savings into the per-attachment stats row
pub struct StatsRowObserver {
    library: Arc<MediaLibrary>,
}

impl StatsRowObserver {
    pub fn new(library: Arc<MediaLibrary>) -> Self {
        Self { library }
    }
}

impl Observer for StatsRowObserver {
    fn handle<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Event::OptimizationCompleted {
                attachment_id,
                size_data,
            } = event
            {
                let delta = stats_delta(size_data);
                if let Err(e) = self.library.stats_accumulate(*attachment_id, &delta) {
                    warn!(
                        "Could not update stats row for attachment {}: {}",
                        attachment_id, e
                    );
                }
            }
        })
    }
}

/// Per-pass stats contribution of a size_data list
pub fn stats_delta(size_data: &[SizeData]) -> StatsRow {
    StatsRow {
        normal_savings: size_data.iter().map(|s| s.saved_bytes).sum(),
        webp_savings: size_data
            .iter()
            .filter_map(|s| s.webp.as_ref())
            .map(|w| w.saved_bytes)
            .sum(),
        webp_conversions: size_data.iter().filter(|s| s.webp.is_some()).count() as u64,
        png_jpg_conversions: size_data.iter().filter(|s| s.converted_to_jpeg).count() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::AttachmentMetadata;
    use crate::records::WebpData;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Recorder {
        seen: Mutex<Vec<i64>>,
    }

    impl Observer for Recorder {
        fn handle<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                if let Event::OptimizationCompleted { attachment_id, .. } = event {
                    self.seen.lock().unwrap().push(*attachment_id);
                }
            })
        }
    }

    fn sample_size_data() -> Vec<SizeData> {
        vec![
            SizeData {
                size_name: "full".to_string(),
                original_size: 100_000,
                saved_bytes: 40_000,
                percent_saved: 40.0,
                file_name: "photo.jpg".to_string(),
                converted_to_jpeg: true,
                webp: Some(WebpData {
                    file_name: "photo.webp".to_string(),
                    saved_bytes: 15_000,
                    percent_saved: 15.0,
                }),
            },
            SizeData {
                size_name: "thumbnail".to_string(),
                original_size: 20_000,
                saved_bytes: 8_000,
                percent_saved: 40.0,
                file_name: "photo-thumbnail.jpg".to_string(),
                converted_to_jpeg: false,
                webp: None,
            },
        ]
    }

    #[test]
    fn test_stats_delta() {
        let delta = stats_delta(&sample_size_data());
        assert_eq!(delta.normal_savings, 48_000);
        assert_eq!(delta.webp_savings, 15_000);
        assert_eq!(delta.webp_conversions, 1);
        assert_eq!(delta.png_jpg_conversions, 1);
    }

    #[tokio::test]
    async fn test_bus_delivers_in_order() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });

        struct Fwd(Arc<Recorder>);
        impl Observer for Fwd {
            fn handle<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, ()> {
                self.0.handle(event)
            }
        }

        let mut bus = EventBus::new();
        bus.register(Box::new(Fwd(recorder.clone())));

        for id in [3, 1, 2] {
            bus.emit(&Event::OptimizationCompleted {
                attachment_id: id,
                size_data: Vec::new(),
            })
            .await;
        }

        assert_eq!(*recorder.seen.lock().unwrap(), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn test_stats_row_observer_accumulates() {
        let temp_dir = TempDir::new().unwrap();
        let library = Arc::new(MediaLibrary::open_in_memory(temp_dir.path()).unwrap());
        let id = library
            .insert_attachment("photo.jpg", "image/jpeg", &AttachmentMetadata::default())
            .unwrap();

        let mut bus = EventBus::new();
        bus.register(Box::new(StatsRowObserver::new(library.clone())));

        let event = Event::OptimizationCompleted {
            attachment_id: id,
            size_data: sample_size_data(),
        };
        bus.emit(&event).await;
        bus.emit(&event).await;

        let row = library.stats_row(id).unwrap().unwrap();
        assert_eq!(row.normal_savings, 96_000);
        assert_eq!(row.webp_savings, 30_000);
        assert_eq!(row.webp_conversions, 2);
    }
}
