//! # Configuration Management Module
//!
//! Questo modulo gestisce tutta la configurazione dell'applicazione.
//!
//! ## Responsabilità:
//! - Definisce la struct `Settings` con tutti i parametri di ottimizzazione
//! - Fornisce validazione robusta dei parametri di input
//! - Supporta caricamento/salvataggio configurazione da/verso file JSON
//! - Fornisce valori di default sensati per tutti i parametri
//!
//! ## Parametri di configurazione:
//! - `api_url` / `api_key`: Endpoint e credenziale dell'API di ottimizzazione
//! - `backup_enabled`: Copia l'originale prima della prima ottimizzazione (default: true)
//! - `convert_png_to_jpeg`: Chiede al server la conversione PNG→JPEG (default: false)
//! - `generate_webp`: Chiede al server una variante WebP affiancata (default: false)
//! - `resize_enabled` / `max_width` / `max_height`: Resize lato server
//! - `excluded_sizes`: Nomi di thumbnail da non inviare mai
//! - `batch_size`: Dimensione pagina del fetcher (default: 10)
//! - `stats_batch_size`: Dimensione pagina dell'aggregatore statistiche (default: 50)
//! - `stats_time_budget_secs`: Budget wall-clock per invocazione stats (default: 10)
//! - `remote_timeout_secs`: Timeout HTTP per singola variante (default: 60,
//!   payload multi-megabyte)
//! - `dry_run`: Simulazione senza modifiche (default: false)
//! - `cloudflare_api_token` / `cloudflare_zone_id` / `public_base_url`:
//!   Purge della cache CDN dopo ogni ottimizzazione/restore (opzionale)
//!
//! ## Validazione:
//! - batch_size e stats_batch_size > 0
//! - dimensioni resize > 0 quando resize_enabled
//! - timeout e budget > 0
//! - configurazione Cloudflare tutta-o-niente
//!
//! ## Esempio:
//! ```rust
//! use remote_media_optimizer::Settings;
//!
//! let settings = Settings {
//!     api_key: "sk-...".to_string(),
//!     generate_webp: true,
//!     ..Default::default()
//! };
//! settings.validate().unwrap();
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Typed configuration for the optimizer.
///
/// Every option is enumerated here once, with its default and validation
/// rule, instead of being looked up by string key at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the remote optimization API; the sender appends
    /// `/optimize` and `/validate_api_key`
    pub api_url: String,
    /// API key sent with every request
    pub api_key: String,
    /// Copy the pristine original aside before the first optimization
    pub backup_enabled: bool,
    /// Ask the server to convert PNG files to JPEG
    pub convert_png_to_jpeg: bool,
    /// Ask the server to produce a WebP sibling for every variant
    pub generate_webp: bool,
    /// Ask the server to downscale images larger than max_width x max_height
    pub resize_enabled: bool,
    /// Maximum width when resize is enabled
    pub max_width: u32,
    /// Maximum height when resize is enabled
    pub max_height: u32,
    /// Thumbnail size names that are never sent for optimization
    pub excluded_sizes: Vec<String>,
    /// Number of attachments fetched per batch page
    pub batch_size: usize,
    /// Number of attachments scanned per stats aggregation page
    pub stats_batch_size: usize,
    /// Wall-clock budget in seconds for one stats aggregation invocation
    pub stats_time_budget_secs: u64,
    /// HTTP timeout in seconds for one variant upload
    pub remote_timeout_secs: u64,
    /// Dry run - report candidates without sending or writing anything
    pub dry_run: bool,
    /// Cloudflare API token for cache purging (None = purging disabled)
    pub cloudflare_api_token: Option<String>,
    /// Cloudflare zone identifier
    pub cloudflare_zone_id: Option<String>,
    /// Public base URL the library is served from, used to build purge URLs
    pub public_base_url: Option<String>,
    /// Output progress and status as JSON for programmatic use
    pub json_output: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "https://api.optimizer.example.com/v1".to_string(),
            api_key: String::new(),
            backup_enabled: true,
            convert_png_to_jpeg: false,
            generate_webp: false,
            resize_enabled: false,
            max_width: 2560,
            max_height: 2560,
            excluded_sizes: Vec::new(),
            batch_size: 10,
            stats_batch_size: 50,
            stats_time_budget_secs: 10,
            remote_timeout_secs: 60,
            dry_run: false,
            cloudflare_api_token: None,
            cloudflare_zone_id: None,
            public_base_url: None,
            json_output: false,
        }
    }
}

impl Settings {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("Batch size must be greater than 0"));
        }

        if self.stats_batch_size == 0 {
            return Err(anyhow::anyhow!("Stats batch size must be greater than 0"));
        }

        if self.stats_time_budget_secs == 0 {
            return Err(anyhow::anyhow!("Stats time budget must be greater than 0"));
        }

        if self.remote_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Remote timeout must be greater than 0"));
        }

        if self.resize_enabled && (self.max_width == 0 || self.max_height == 0) {
            return Err(anyhow::anyhow!(
                "Resize dimensions must be greater than 0 when resize is enabled"
            ));
        }

        // Cloudflare purging needs all three values or none
        let cf_fields = [
            self.cloudflare_api_token.is_some(),
            self.cloudflare_zone_id.is_some(),
            self.public_base_url.is_some(),
        ];
        if cf_fields.iter().any(|&f| f) && !cf_fields.iter().all(|&f| f) {
            return Err(anyhow::anyhow!(
                "Cloudflare purging requires api token, zone id and public base URL together"
            ));
        }

        Ok(())
    }

    /// Load configuration from file
    pub async fn from_file(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let settings: Settings = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &PathBuf) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.batch_size = 0;
        assert!(settings.validate().is_err());

        settings.batch_size = 10;
        settings.resize_enabled = true;
        settings.max_width = 0;
        assert!(settings.validate().is_err());

        settings.max_width = 2560;
        settings.cloudflare_api_token = Some("token".to_string());
        assert!(settings.validate().is_err());

        settings.cloudflare_zone_id = Some("zone".to_string());
        settings.public_base_url = Some("https://example.com/media".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();
        assert!(settings.backup_enabled);
        assert!(!settings.generate_webp);
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.stats_time_budget_secs, 10);
        assert_eq!(settings.remote_timeout_secs, 60);
        assert!(settings.cloudflare_api_token.is_none());
    }

    #[tokio::test]
    async fn test_settings_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.json");

        let original = Settings {
            api_key: "sk-test".to_string(),
            generate_webp: true,
            convert_png_to_jpeg: true,
            batch_size: 25,
            excluded_sizes: vec!["thumbnail".to_string()],
            ..Default::default()
        };

        original.save_to_file(&config_path).await.unwrap();

        let loaded = Settings::from_file(&config_path).await.unwrap();

        assert_eq!(loaded.api_key, "sk-test");
        assert!(loaded.generate_webp);
        assert!(loaded.convert_png_to_jpeg);
        assert_eq!(loaded.batch_size, 25);
        assert_eq!(loaded.excluded_sizes, vec!["thumbnail".to_string()]);
    }

    #[tokio::test]
    async fn test_settings_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("does-not-exist.json");

        let loaded = Settings::from_file(&config_path).await.unwrap();
        assert_eq!(loaded.batch_size, Settings::default().batch_size);
    }
}
