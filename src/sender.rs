//! # Remote Client Module
//!
//! Questo modulo spedisce le immagini all'API remota di ottimizzazione.
//!
//! ## Responsabilità:
//! - Una POST multipart per variante (nessun batching a livello trasporto):
//!   byte del file, filename, MIME type, path, attachment id, ruolo
//!   (full/thumbnail), nome size, settings attivi + default in JSON
//! - Autenticazione via header `X-Api-Key` + `X-Source-Url`
//! - Parsing della risposta JSON e decodifica base64 dei byte ottimizzati
//! - `validate_api_key`: check leggero della credenziale PRIMA di un batch,
//!   così una chiave invalida fallisce subito con un solo messaggio chiaro
//!   invece di N errori per-immagine ridondanti
//!
//! ## Tolleranza agli errori:
//! Una risposta non-2xx, un errore di trasporto o un body non-JSON producono
//! un outcome di errore PER-IMMAGINE, mai l'abort dell'intero batch:
//! l'orchestratore riceve sempre una lista mista di successi ed errori.
//!
//! ## Dependency injection:
//! Il trait `RemoteClient` è la cucitura per i test: l'orchestratore è
//! generico sul client, i test usano un fake in-memory.

use crate::config::Settings;
use crate::error::OptimizeError;
use crate::records::percent;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// One variant ready to be shipped to the remote optimizer
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub attachment_id: i64,
    /// Absolute path on disk
    pub path: PathBuf,
    /// Library-relative path, the variant's stable identity
    pub relative_path: String,
    /// None for the full/original image, the size name for thumbnails
    pub size_name: Option<String>,
    pub mime_type: String,
}

impl ImagePayload {
    /// "full" for the original image, "thumbnail" for derived sizes
    pub fn role(&self) -> &'static str {
        if self.size_name.is_none() {
            "full"
        } else {
            "thumbnail"
        }
    }

    /// Variant identifier used in optimization records
    pub fn variant_name(&self) -> String {
        self.size_name.clone().unwrap_or_else(|| "full".to_string())
    }
}

/// Decoded WebP sibling returned by the API
#[derive(Debug, Clone)]
pub struct OptimizedWebp {
    pub file_name: String,
    pub bytes_saved: u64,
    pub percent_saved: f64,
    pub content: Vec<u8>,
}

/// Decoded successful result for one variant
#[derive(Debug, Clone)]
pub struct OptimizedImage {
    pub size_name: String,
    pub original_size: u64,
    pub bytes_saved: u64,
    pub percent_saved: f64,
    pub file_name: String,
    pub content: Vec<u8>,
    pub converted_to_jpg: bool,
    pub webp: Option<OptimizedWebp>,
    pub dimensions: Option<(u32, u32)>,
}

/// Per-variant result: either optimized bytes or an isolated error
#[derive(Debug, Clone)]
pub enum VariantOutcome {
    Optimized(OptimizedImage),
    Failed { image: String, message: String },
}

/// Seam between the orchestrator and the remote API
pub trait RemoteClient {
    /// One call per image; a mixed list of successes and per-image errors
    fn send(
        &self,
        images: &[ImagePayload],
    ) -> impl std::future::Future<Output = Vec<VariantOutcome>> + Send;

    /// Lightweight credential check against the validation endpoint
    fn validate_api_key(&self) -> impl std::future::Future<Output = Result<(), OptimizeError>> + Send;
}

// ---- wire format -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiWebp {
    file_name: String,
    bytes_saved: u64,
    percent_saved: f64,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiDimensions {
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    error: Option<String>,
    bytes_saved: Option<u64>,
    original_size: Option<u64>,
    percent_saved: Option<f64>,
    image_size: Option<String>,
    file_name: Option<String>,
    optimized_content: Option<String>,
    converted_to_jpg: Option<bool>,
    webp: Option<ApiWebp>,
    dimensions: Option<ApiDimensions>,
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    action: &'a str,
    api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    success: bool,
    #[serde(default)]
    message: String,
}

/// HTTP implementation of [`RemoteClient`] over the SaaS endpoint
pub struct HttpSender {
    client: reqwest::Client,
    settings: Settings,
    source_url: String,
}

impl HttpSender {
    pub fn new(settings: Settings, source_url: String) -> Result<Self, OptimizeError> {
        // Extended timeout: variant payloads can be multiple megabytes
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.remote_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            settings,
            source_url,
        })
    }

    fn optimize_url(&self) -> String {
        format!("{}/optimize", self.settings.api_url.trim_end_matches('/'))
    }

    fn validate_url(&self) -> String {
        format!(
            "{}/validate_api_key",
            self.settings.api_url.trim_end_matches('/')
        )
    }

    async fn send_one(&self, image: &ImagePayload) -> VariantOutcome {
        let label = image.relative_path.clone();

        let bytes = match tokio::fs::read(&image.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return VariantOutcome::Failed {
                    image: label,
                    message: format!("Could not read file: {}", e),
                }
            }
        };

        debug!(
            "Sending {} ({} bytes, role {})",
            image.relative_path,
            bytes.len(),
            image.role()
        );

        let file_name = image
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| image.relative_path.clone());

        let file_part = match Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(&image.mime_type)
        {
            Ok(part) => part,
            Err(e) => {
                return VariantOutcome::Failed {
                    image: label,
                    message: format!("Invalid MIME type: {}", e),
                }
            }
        };

        let defaults = serde_json::to_string(&Settings::default()).unwrap_or_default();
        let settings = serde_json::to_string(&self.settings).unwrap_or_default();

        let mut form = Form::new()
            .part("file", file_part)
            .text("path", image.relative_path.clone())
            .text("attachment_id", image.attachment_id.to_string())
            .text("image_role", image.role())
            .text("defaults", defaults)
            .text("settings", settings);
        if let Some(size_name) = &image.size_name {
            form = form.text("size_name", size_name.clone());
        }

        let response = self
            .client
            .post(self.optimize_url())
            .header("X-Api-Key", &self.settings.api_key)
            .header("X-Source-Url", &self.source_url)
            .multipart(form)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return VariantOutcome::Failed {
                    image: label,
                    message: format!("Transport error: {}", e),
                }
            }
        };

        if !response.status().is_success() {
            return VariantOutcome::Failed {
                image: label,
                message: format!("Remote returned HTTP {}", response.status()),
            };
        }

        let parsed: ApiResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                return VariantOutcome::Failed {
                    image: label,
                    message: format!("Invalid JSON response: {}", e),
                }
            }
        };

        outcome_from_response(&label, &image.variant_name(), parsed)
    }
}

impl RemoteClient for HttpSender {
    async fn send(&self, images: &[ImagePayload]) -> Vec<VariantOutcome> {
        let mut outcomes = Vec::with_capacity(images.len());
        for image in images {
            outcomes.push(self.send_one(image).await);
        }
        outcomes
    }

    async fn validate_api_key(&self) -> Result<(), OptimizeError> {
        let response = self
            .client
            .post(self.validate_url())
            .header("X-Api-Key", &self.settings.api_key)
            .header("X-Source-Url", &self.source_url)
            .json(&ValidateRequest {
                action: "validate_api_key",
                api_key: &self.settings.api_key,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(OptimizeError::InvalidApiKey(format!(
                "Validation endpoint returned HTTP {}",
                response.status()
            )));
        }

        let parsed: ValidateResponse = response.json().await?;
        if parsed.success {
            Ok(())
        } else {
            Err(OptimizeError::InvalidApiKey(parsed.message))
        }
    }
}

/// Map one parsed API response to a per-variant outcome
fn outcome_from_response(label: &str, variant_name: &str, resp: ApiResponse) -> VariantOutcome {
    if let Some(error) = resp.error {
        return VariantOutcome::Failed {
            image: label.to_string(),
            message: error,
        };
    }

    let (bytes_saved, original_size, file_name, content) = match (
        resp.bytes_saved,
        resp.original_size,
        resp.file_name,
        resp.optimized_content,
    ) {
        (Some(saved), Some(original), Some(name), Some(content)) => {
            (saved, original, name, content)
        }
        _ => {
            warn!("Incomplete response for {}", label);
            return VariantOutcome::Failed {
                image: label.to_string(),
                message: "Incomplete response from remote API".to_string(),
            };
        }
    };

    let content = match BASE64.decode(content.as_bytes()) {
        Ok(content) => content,
        Err(e) => {
            return VariantOutcome::Failed {
                image: label.to_string(),
                message: format!("Invalid base64 content: {}", e),
            }
        }
    };

    let webp = match resp.webp {
        Some(webp) => match BASE64.decode(webp.content.as_bytes()) {
            Ok(decoded) => Some(OptimizedWebp {
                file_name: webp.file_name,
                bytes_saved: webp.bytes_saved,
                percent_saved: webp.percent_saved,
                content: decoded,
            }),
            Err(e) => {
                return VariantOutcome::Failed {
                    image: label.to_string(),
                    message: format!("Invalid base64 WebP content: {}", e),
                }
            }
        },
        None => None,
    };

    VariantOutcome::Optimized(OptimizedImage {
        size_name: resp
            .image_size
            .unwrap_or_else(|| variant_name.to_string()),
        original_size,
        bytes_saved,
        percent_saved: resp
            .percent_saved
            .unwrap_or_else(|| percent(bytes_saved, original_size)),
        file_name,
        content,
        converted_to_jpg: resp.converted_to_jpg.unwrap_or(false),
        webp,
        dimensions: resp.dimensions.map(|d| (d.width, d.height)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(label: &str, json: &str) -> VariantOutcome {
        let resp: ApiResponse = serde_json::from_str(json).unwrap();
        outcome_from_response(label, "full", resp)
    }

    #[test]
    fn test_error_response_becomes_failed_outcome() {
        let outcome = parse("photo.jpg", r#"{"error": "unsupported color profile"}"#);
        match outcome {
            VariantOutcome::Failed { image, message } => {
                assert_eq!(image, "photo.jpg");
                assert_eq!(message, "unsupported color profile");
            }
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn test_success_response_decodes_content() {
        let json = format!(
            r#"{{
                "bytes_saved": 400,
                "original_size": 1000,
                "percent_saved": 40.0,
                "image_size": "full",
                "file_name": "photo.jpg",
                "optimized_content": "{}",
                "converted_to_jpg": true,
                "dimensions": {{"width": 800, "height": 600}}
            }}"#,
            BASE64.encode(b"optimized bytes")
        );

        match parse("photo.jpg", &json) {
            VariantOutcome::Optimized(img) => {
                assert_eq!(img.content, b"optimized bytes");
                assert_eq!(img.bytes_saved, 400);
                assert_eq!(img.original_size, 1000);
                assert!(img.converted_to_jpg);
                assert_eq!(img.dimensions, Some((800, 600)));
            }
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn test_webp_subrecord_decodes() {
        let json = format!(
            r#"{{
                "bytes_saved": 400,
                "original_size": 1000,
                "file_name": "photo.jpg",
                "optimized_content": "{}",
                "webp": {{
                    "file_name": "photo.webp",
                    "bytes_saved": 600,
                    "percent_saved": 60.0,
                    "content": "{}"
                }}
            }}"#,
            BASE64.encode(b"jpg"),
            BASE64.encode(b"webp")
        );

        match parse("photo.jpg", &json) {
            VariantOutcome::Optimized(img) => {
                let webp = img.webp.unwrap();
                assert_eq!(webp.content, b"webp");
                assert_eq!(webp.bytes_saved, 600);
                // percent falls back to saved/original when omitted
                assert!((img.percent_saved - 40.0).abs() < f64::EPSILON);
            }
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn test_zero_original_size_yields_zero_percent() {
        let json = format!(
            r#"{{
                "bytes_saved": 0,
                "original_size": 0,
                "file_name": "empty.jpg",
                "optimized_content": "{}"
            }}"#,
            BASE64.encode(b"bytes")
        );

        match parse("empty.jpg", &json) {
            VariantOutcome::Optimized(img) => {
                assert_eq!(img.percent_saved, 0.0);
                assert!(!img.percent_saved.is_nan());
            }
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn test_incomplete_response_is_failed() {
        let outcome = parse("photo.jpg", r#"{"bytes_saved": 400}"#);
        assert!(matches!(outcome, VariantOutcome::Failed { .. }));
    }

    #[test]
    fn test_invalid_base64_is_failed() {
        let outcome = parse(
            "photo.jpg",
            r#"{"bytes_saved": 1, "original_size": 2, "file_name": "p.jpg",
                "optimized_content": "not base64!!!"}"#,
        );
        assert!(matches!(outcome, VariantOutcome::Failed { .. }));
    }
}
