//! Collaborators the worker drives: the external renderer, the geocoder
//! that resolves administrative areas, and the thumbnail generator.

pub mod command;
pub mod geocode;
pub mod thumbnail;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PaperSize;
use crate::jobs::BoundingBox;

pub use command::CommandRenderer;
pub use geocode::{GeocodeError, Geocoder, NominatimGeocoder};
pub use thumbnail::{ThumbnailError, ThumbnailGenerator};

/// Cooperative stop request shared between a supervisor and a renderer.
///
/// Only honoured at points where the renderer checks it; a renderer stuck
/// in native code will not notice.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a layout can produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutCapabilities {
    pub formats: Vec<String>,
    pub paper_sizes: Vec<PaperSize>,
    /// Produces a paged document (booklet) rather than a single sheet.
    pub multi_page: bool,
}

/// Everything the renderer needs for one job. Output goes to
/// `{output_prefix}.{format}` for each requested format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderRequest {
    pub title: String,
    pub bounding_box: BoundingBox,
    pub stylesheet: String,
    pub layout: String,
    pub paper_width_mm: u32,
    pub paper_height_mm: u32,
    pub locale: String,
    pub output_prefix: PathBuf,
    pub formats: Vec<String>,
    /// Private prefix for temporary files of this attempt.
    pub scratch_prefix: PathBuf,
}

/// Files reported by a successful rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderOutput {
    /// Page rasters left in the scratch area, used for multi-page previews.
    #[serde(default)]
    pub page_images: Vec<PathBuf>,
}

#[derive(Error, Debug)]
pub enum RenderError {
    /// The job could not be turned into a renderable configuration.
    #[error("Data preparation failed: {0}")]
    Preparation(String),

    #[error("Rendering failed: {0}")]
    Rendering(String),

    #[error("Rendering interrupted")]
    Interrupted,
}

/// The external map renderer.
pub trait Renderer: Send + Sync {
    /// Capabilities of `layout`, or `None` if the layout is unknown.
    fn capabilities(&self, layout: &str) -> Option<LayoutCapabilities>;

    fn render(&self, request: &RenderRequest, cancel: &CancelFlag)
        -> Result<RenderOutput, RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_render_output_tolerates_missing_fields() {
        let output: RenderOutput = serde_json::from_str("{}").unwrap();
        assert!(output.page_images.is_empty());
    }
}
