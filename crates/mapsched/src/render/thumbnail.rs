use std::path::{Path, PathBuf};

use image::{imageops, DynamicImage, Rgba, RgbaImage};
use thiserror::Error;

use crate::config::ThumbnailConfig;

#[derive(Error, Debug)]
pub enum ThumbnailError {
    #[error("Image error for '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("No page images to compose a preview from")]
    NoPages,
}

/// Scales rendered maps down to small previews.
#[derive(Debug, Clone)]
pub struct ThumbnailGenerator {
    max_width: u32,
    max_height: u32,
    max_pages: usize,
}

impl ThumbnailGenerator {
    pub fn new(max_width: u32, max_height: u32, max_pages: usize) -> Self {
        Self {
            max_width,
            max_height,
            max_pages,
        }
    }

    pub fn from_config(config: &ThumbnailConfig) -> Self {
        Self::new(config.max_width, config.max_height, config.max_pages)
    }

    fn open(path: &Path) -> Result<DynamicImage, ThumbnailError> {
        image::open(path).map_err(|e| ThumbnailError::Image {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn save(image: &DynamicImage, dest: &Path) -> Result<(), ThumbnailError> {
        image.save(dest).map_err(|e| ThumbnailError::Image {
            path: dest.to_path_buf(),
            source: e,
        })
    }

    /// Writes a copy of `source` scaled to fit the configured box,
    /// keeping its aspect ratio.
    pub fn from_image(&self, source: &Path, dest: &Path) -> Result<(), ThumbnailError> {
        let image = Self::open(source)?;
        Self::save(&image.thumbnail(self.max_width, self.max_height), dest)
    }

    /// Composes the first pages of a paged document side by side on a white
    /// strip, then scales the strip to fit the configured box.
    pub fn from_pages(&self, pages: &[PathBuf], dest: &Path) -> Result<(), ThumbnailError> {
        let scaled = pages
            .iter()
            .take(self.max_pages.max(1))
            .map(|page| {
                Self::open(page).map(|img| img.thumbnail(self.max_width, self.max_height).to_rgba8())
            })
            .collect::<Result<Vec<_>, _>>()?;
        if scaled.is_empty() {
            return Err(ThumbnailError::NoPages);
        }

        let width: u32 = scaled.iter().map(|p| p.width()).sum();
        let height = scaled.iter().map(|p| p.height()).max().unwrap_or(0);
        let mut strip = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
        let mut x = 0i64;
        for page in &scaled {
            imageops::overlay(&mut strip, page, x, 0);
            x += i64::from(page.width());
        }

        let strip = DynamicImage::ImageRgba8(strip);
        Self::save(&strip.thumbnail(self.max_width, self.max_height), dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;
    use tempfile::TempDir;

    fn write_png(path: &Path, width: u32, height: u32) {
        RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_from_image_fits_box() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("map.png");
        let dest = dir.path().join("map_small.png");
        write_png(&source, 800, 400);

        ThumbnailGenerator::new(200, 200, 3)
            .from_image(&source, &dest)
            .unwrap();

        let (w, h) = image::open(&dest).unwrap().dimensions();
        assert_eq!(w, 200);
        assert_eq!(h, 100);
    }

    #[test]
    fn test_from_image_missing_source() {
        let dir = TempDir::new().unwrap();
        let result = ThumbnailGenerator::new(200, 200, 3)
            .from_image(&dir.path().join("missing.png"), &dir.path().join("out.png"));
        assert!(matches!(result, Err(ThumbnailError::Image { .. })));
    }

    #[test]
    fn test_from_pages_composes_strip() {
        let dir = TempDir::new().unwrap();
        let pages: Vec<PathBuf> = (0..5)
            .map(|i| {
                let path = dir.path().join(format!("page{}.png", i));
                write_png(&path, 100, 140);
                path
            })
            .collect();
        let dest = dir.path().join("booklet_small.png");

        ThumbnailGenerator::new(200, 200, 3)
            .from_pages(&pages, &dest)
            .unwrap();

        // Three portrait pages side by side are wider than tall.
        let (w, h) = image::open(&dest).unwrap().dimensions();
        assert_eq!(w, 200);
        assert!(h < 140);
    }

    #[test]
    fn test_from_pages_requires_pages() {
        let dir = TempDir::new().unwrap();
        let result = ThumbnailGenerator::new(200, 200, 3).from_pages(&[], &dir.path().join("x.png"));
        assert!(matches!(result, Err(ThumbnailError::NoPages)));
    }
}
