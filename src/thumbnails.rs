//! # Thumbnail Generation Module
//!
//! Questo modulo genera le varianti derivate (thumbnail) di un'immagine.
//!
//! ## Responsabilità:
//! - Genera le thumbnail standard durante lo scan della libreria
//! - Rigenera le thumbnail dall'originale ripristinato dopo un restore
//! - Legge le dimensioni dell'immagine originale
//!
//! ## Nota:
//! Questa è l'UNICA elaborazione pixel svolta localmente: tutta la
//! compressione/conversione vera avviene lato server. Le thumbnail non
//! vengono mai ingrandite oltre l'originale.

use crate::error::OptimizeError;
use image::imageops::FilterType;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One named thumbnail size: the longest edge is capped at `max_edge`
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailSpec {
    pub name: &'static str,
    pub max_edge: u32,
}

/// Standard sizes generated for every attachment
pub const STANDARD_SIZES: &[ThumbnailSpec] = &[
    ThumbnailSpec { name: "thumbnail", max_edge: 150 },
    ThumbnailSpec { name: "medium", max_edge: 300 },
    ThumbnailSpec { name: "large", max_edge: 1024 },
];

/// One generated thumbnail file
#[derive(Debug, Clone)]
pub struct GeneratedThumbnail {
    pub file: PathBuf,
    pub width: u32,
    pub height: u32,
    pub filesize: u64,
}

/// Read the pixel dimensions of an image file
pub fn image_dimensions(path: &Path) -> Result<(u32, u32), OptimizeError> {
    Ok(image::image_dimensions(path)?)
}

/// Generate thumbnail files next to the original.
///
/// Sizes whose max edge is not smaller than the original are skipped (no
/// upscaling). Output files are named `<stem>-<size>.<ext>`.
pub fn generate(
    original: &Path,
    sizes: &[ThumbnailSpec],
) -> Result<BTreeMap<String, GeneratedThumbnail>, OptimizeError> {
    let img = image::open(original)?;
    let (width, height) = (img.width(), img.height());
    let longest = width.max(height);

    let stem = original
        .file_stem()
        .ok_or_else(|| OptimizeError::UnsupportedFormat(original.display().to_string()))?
        .to_string_lossy()
        .to_string();
    let ext = original
        .extension()
        .ok_or_else(|| OptimizeError::UnsupportedFormat(original.display().to_string()))?
        .to_string_lossy()
        .to_string();
    let parent = original.parent().unwrap_or_else(|| Path::new(""));

    let mut generated = BTreeMap::new();

    for spec in sizes {
        if spec.max_edge >= longest {
            debug!(
                "Skipping size '{}' for {} ({}px >= original {}px)",
                spec.name,
                original.display(),
                spec.max_edge,
                longest
            );
            continue;
        }

        let resized = img.resize(spec.max_edge, spec.max_edge, FilterType::Lanczos3);
        let out_path = parent.join(format!("{}-{}.{}", stem, spec.name, ext));
        resized.save(&out_path)?;

        let filesize = std::fs::metadata(&out_path)?.len();
        generated.insert(
            spec.name.to_string(),
            GeneratedThumbnail {
                file: out_path,
                width: resized.width(),
                height: resized.height(),
                filesize,
            },
        );
    }

    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn write_test_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        let img = ImageBuffer::from_pixel(width, height, Rgb::<u8>([120, 50, 200]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_generate_skips_upscaling() {
        let temp_dir = TempDir::new().unwrap();
        let original = write_test_image(temp_dir.path(), "photo.png", 400, 200);

        let generated = generate(&original, STANDARD_SIZES).unwrap();

        // 400px original: thumbnail (150) and medium (300) apply, large (1024) does not
        assert!(generated.contains_key("thumbnail"));
        assert!(generated.contains_key("medium"));
        assert!(!generated.contains_key("large"));

        let thumb = &generated["thumbnail"];
        assert_eq!(thumb.width, 150);
        assert_eq!(thumb.height, 75);
        assert!(thumb.file.ends_with("photo-thumbnail.png"));
        assert!(thumb.file.exists());
    }

    #[test]
    fn test_image_dimensions() {
        let temp_dir = TempDir::new().unwrap();
        let original = write_test_image(temp_dir.path(), "dims.png", 64, 32);
        assert_eq!(image_dimensions(&original).unwrap(), (64, 32));
    }
}
