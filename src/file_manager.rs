//! # File Management Module
//!
//! Questo modulo gestisce tutte le operazioni sui file.
//!
//! ## Responsabilità:
//! - Determinazione formato file e MIME type
//! - Calcolo dei path "sibling" per artefatti derivati (WebP, PNG→JPEG)
//! - Sostituzione sicura dei file con rollback in caso di errore
//! - Formattazione human-readable delle dimensioni
//!
//! ## Formati supportati:
//! - **Immagini**: JPG, JPEG, PNG, WebP
//!
//! ## Convenzioni sui derivati:
//! - Variante WebP: stesso basename con estensione `.webp`
//! - Conversione PNG→JPEG: stesso basename con estensione `.jpg`
//!
//! ## Esempio:
//! ```rust,ignore
//! let webp = FileManager::webp_sibling(Path::new("photo.png")); // photo.webp
//! ```

use crate::error::OptimizeError;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Manages file operations
pub struct FileManager;

impl FileManager {
    /// Get the size in bytes of a file
    pub async fn file_size(path: &Path) -> Result<u64, OptimizeError> {
        let metadata = fs::metadata(path).await?;
        Ok(metadata.len())
    }

    /// Check if a file is a supported image
    pub fn is_image(path: &Path) -> bool {
        if let Some(ext) = path.extension() {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            matches!(ext_lower.as_str(), "jpg" | "jpeg" | "png" | "webp")
        } else {
            false
        }
    }

    /// MIME type for a supported image file
    pub fn mime_type(path: &Path) -> &'static str {
        match path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .as_deref()
        {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("png") => "image/png",
            Some("webp") => "image/webp",
            _ => "application/octet-stream",
        }
    }

    /// Path of the WebP sibling for a variant (same basename, .webp extension)
    pub fn webp_sibling(path: &Path) -> PathBuf {
        path.with_extension("webp")
    }

    /// Path of the converted JPEG sibling for a PNG variant
    pub fn jpeg_sibling(path: &Path) -> PathBuf {
        path.with_extension("jpg")
    }

    /// Safely replace a file, restoring the previous bytes on write failure
    pub async fn replace_file(target: &Path, source: &Path) -> Result<(), OptimizeError> {
        let rollback_path = target.with_extension(format!(
            "{}.rollback",
            target.extension().unwrap_or_default().to_string_lossy()
        ));

        let had_target = target.exists();
        if had_target {
            fs::copy(target, &rollback_path).await?;
        }

        match fs::copy(source, target).await {
            Ok(_) => {
                if had_target {
                    let _ = fs::remove_file(&rollback_path).await;
                }
                Ok(())
            }
            Err(e) => {
                if had_target {
                    let _ = fs::copy(&rollback_path, target).await;
                    let _ = fs::remove_file(&rollback_path).await;
                }
                Err(e.into())
            }
        }
    }

    /// Get human-readable file size
    pub fn format_size(size: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_image() {
        assert!(FileManager::is_image(Path::new("photo.JPG")));
        assert!(FileManager::is_image(Path::new("photo.png")));
        assert!(FileManager::is_image(Path::new("photo.webp")));
        assert!(!FileManager::is_image(Path::new("clip.mp4")));
        assert!(!FileManager::is_image(Path::new("noext")));
    }

    #[test]
    fn test_siblings() {
        assert_eq!(
            FileManager::webp_sibling(Path::new("/lib/photo.png")),
            PathBuf::from("/lib/photo.webp")
        );
        assert_eq!(
            FileManager::jpeg_sibling(Path::new("/lib/photo.png")),
            PathBuf::from("/lib/photo.jpg")
        );
    }

    #[test]
    fn test_format_size() {
        assert_eq!(FileManager::format_size(512), "512 B");
        assert_eq!(FileManager::format_size(1536), "1.50 KB");
        assert_eq!(FileManager::format_size(1024 * 1024), "1.00 MB");
    }

    #[tokio::test]
    async fn test_replace_file() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target.jpg");
        let source = temp_dir.path().join("source.jpg");

        tokio::fs::write(&target, b"old bytes").await.unwrap();
        tokio::fs::write(&source, b"new bytes").await.unwrap();

        FileManager::replace_file(&target, &source).await.unwrap();

        let content = tokio::fs::read(&target).await.unwrap();
        assert_eq!(content, b"new bytes");
        assert!(!temp_dir.path().join("target.jpg.rollback").exists());
    }

    #[tokio::test]
    async fn test_replace_file_missing_source_keeps_target() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target.jpg");
        let source = temp_dir.path().join("missing.jpg");

        tokio::fs::write(&target, b"old bytes").await.unwrap();

        let result = FileManager::replace_file(&target, &source).await;
        assert!(matches!(result, Err(OptimizeError::Io(_))));

        let content = tokio::fs::read(&target).await.unwrap();
        assert_eq!(content, b"old bytes");
        assert!(!temp_dir.path().join("target.jpg.rollback").exists());
    }
}
