//! # Cloudflare Purge Module
//!
//! Collaboratore opzionale: dopo ogni ottimizzazione o restore, invalida la
//! cache CDN per l'URL principale dell'attachment e per ogni size generata.
//!
//! ## Attivazione:
//! Registrato sull'event bus solo quando token, zone id e public base URL
//! sono tutti configurati. I fallimenti vengono loggati e mai propagati.

use crate::events::{Event, Observer};
use crate::library::{Attachment, MediaLibrary};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct PurgeRequest {
    files: Vec<String>,
}

/// Purges attachment URLs from the Cloudflare cache after each lifecycle event
pub struct CloudflarePurger {
    client: reqwest::Client,
    library: Arc<MediaLibrary>,
    api_token: String,
    zone_id: String,
    public_base_url: String,
}

impl CloudflarePurger {
    pub fn new(
        library: Arc<MediaLibrary>,
        api_token: String,
        zone_id: String,
        public_base_url: String,
    ) -> Result<Self, crate::error::OptimizeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            library,
            api_token,
            zone_id,
            public_base_url,
        })
    }

    async fn purge_attachment(&self, attachment_id: i64) {
        let attachment = match self.library.get_attachment(attachment_id) {
            Ok(Some(attachment)) => attachment,
            Ok(None) => return,
            Err(e) => {
                warn!("Purge lookup failed for attachment {}: {}", attachment_id, e);
                return;
            }
        };

        let files = purge_urls(&self.public_base_url, &attachment);
        let endpoint = format!(
            "https://api.cloudflare.com/client/v4/zones/{}/purge_cache",
            self.zone_id
        );

        match self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_token)
            .json(&PurgeRequest { files })
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!("Purged cache for attachment {}", attachment_id);
            }
            Ok(response) => {
                warn!(
                    "Cloudflare purge for attachment {} returned HTTP {}",
                    attachment_id,
                    response.status()
                );
            }
            Err(e) => {
                warn!("Cloudflare purge for attachment {} failed: {}", attachment_id, e);
            }
        }
    }
}

impl Observer for CloudflarePurger {
    fn handle<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, ()> {
        let attachment_id = match event {
            Event::OptimizationCompleted { attachment_id, .. } => *attachment_id,
            Event::AttachmentRestored { attachment_id } => *attachment_id,
        };
        Box::pin(self.purge_attachment(attachment_id))
    }
}

/// Public URLs of the attachment's main file and every generated size
pub fn purge_urls(public_base_url: &str, attachment: &Attachment) -> Vec<String> {
    let base = public_base_url.trim_end_matches('/');
    let mut urls = vec![format!("{}/{}", base, attachment.file)];
    for size in attachment.metadata.sizes.values() {
        urls.push(format!("{}/{}", base, size.file));
    }
    urls
}
