use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn, Span};

use crate::error::WorkerError;
use crate::jobs::{BoundingBox, Job, RenderArea};
use crate::notify::Notifier;
use crate::render::{
    CancelFlag, Geocoder, LayoutCapabilities, RenderError, RenderOutput, RenderRequest, Renderer,
    ThumbnailGenerator,
};
use crate::sanitize::redact_path;
use crate::storage::{remove_if_exists, OutputStorage};
use crate::worker::ResultCode;

/// Renders exactly one job and reduces every outcome to a [`ResultCode`].
///
/// Never panics on job-level failures and never returns an error: a failed
/// attempt leaves no file behind under the job's files prefix.
pub struct Worker {
    renderer: Arc<dyn Renderer>,
    geocoder: Arc<dyn Geocoder>,
    notifier: Arc<dyn Notifier>,
    thumbnails: ThumbnailGenerator,
    storage: OutputStorage,
    span: Span,
}

impl Worker {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        geocoder: Arc<dyn Geocoder>,
        notifier: Arc<dyn Notifier>,
        thumbnails: ThumbnailGenerator,
        storage: OutputStorage,
        span: Span,
    ) -> Self {
        Self {
            renderer,
            geocoder,
            notifier,
            thumbnails,
            storage,
            span,
        }
    }

    pub fn storage(&self) -> &OutputStorage {
        &self.storage
    }

    /// Renders `job` into the output directory. `scratch_prefix` is private
    /// to this attempt and used for the renderer's temporary files.
    pub fn run(&self, job: &Job, scratch_prefix: &Path, cancel: &CancelFlag) -> ResultCode {
        let _entered = self.span.enter();

        let Some(prefix) = job.files_prefix() else {
            let err = WorkerError::NotStarted(job.id);
            error!(job_id = job.id, error = %err, "Refusing to render");
            return ResultCode::PreparationFailed;
        };

        let result = match self.render(job, &prefix, scratch_prefix, cancel) {
            Ok(()) => {
                info!(job_id = job.id, prefix = %prefix, "Rendering complete");
                ResultCode::Success
            }
            Err(e @ RenderError::Preparation(_)) => {
                warn!(job_id = job.id, error = %e, "Data preparation failed");
                self.notifier.notify_failure(job, &e);
                ResultCode::PreparationFailed
            }
            Err(e @ RenderError::Rendering(_)) => {
                error!(job_id = job.id, error = %e, "Rendering failed");
                self.notifier.notify_failure(job, &e);
                ResultCode::RenderingFailed
            }
            Err(RenderError::Interrupted) => {
                warn!(job_id = job.id, "Rendering interrupted");
                ResultCode::Interrupted
            }
        };

        if !result.is_success() {
            self.purge(job, &prefix);
        }
        result
    }

    fn purge(&self, job: &Job, prefix: &str) {
        match self.storage.purge_prefix(prefix) {
            Ok(0) => {}
            Ok(n) => debug!(job_id = job.id, removed = n, "Removed partial output"),
            Err(e) => error!(job_id = job.id, error = %e, "Could not remove partial output"),
        }
    }

    fn render(
        &self,
        job: &Job,
        prefix: &str,
        scratch_prefix: &Path,
        cancel: &CancelFlag,
    ) -> Result<(), RenderError> {
        let (request, capabilities) = self.prepare(job, prefix, scratch_prefix)?;
        if cancel.is_cancelled() {
            return Err(RenderError::Interrupted);
        }

        info!(
            job_id = job.id,
            layout = %request.layout,
            formats = ?request.formats,
            "Rendering"
        );
        let output = self.renderer.render(&request, cancel)?;

        self.make_thumbnail(job, prefix, &request, &capabilities, &output);
        Ok(())
    }

    /// Builds the renderer request. Any failure here is the job's fault.
    fn prepare(
        &self,
        job: &Job,
        prefix: &str,
        scratch_prefix: &Path,
    ) -> Result<(RenderRequest, LayoutCapabilities), RenderError> {
        let params = &job.params;

        let bounding_box: BoundingBox = match &params.area {
            RenderArea::BoundingBox(bbox) => *bbox,
            RenderArea::Administrative { city, osm_id } => {
                debug!(job_id = job.id, city = %city, osm_id, "Resolving administrative area");
                self.geocoder
                    .bounding_box(*osm_id)
                    .map_err(|e| RenderError::Preparation(e.to_string()))?
            }
        };

        let capabilities = self.renderer.capabilities(&params.layout).ok_or_else(|| {
            RenderError::Preparation(format!("unknown layout '{}'", params.layout))
        })?;

        if !capabilities.paper_sizes.is_empty()
            && !capabilities.paper_sizes.iter().any(|p| {
                (p.width_mm, p.height_mm) == (params.paper_width_mm, params.paper_height_mm)
                    || (p.height_mm, p.width_mm) == (params.paper_width_mm, params.paper_height_mm)
            })
        {
            return Err(RenderError::Preparation(format!(
                "layout '{}' does not support {}x{} mm paper",
                params.layout, params.paper_width_mm, params.paper_height_mm
            )));
        }

        let formats: Vec<String> = self
            .storage
            .formats()
            .iter()
            .filter(|f| capabilities.formats.contains(f))
            .cloned()
            .collect();
        if formats.is_empty() {
            return Err(RenderError::Preparation(format!(
                "layout '{}' supports none of the configured formats",
                params.layout
            )));
        }

        let request = RenderRequest {
            title: params.title.clone(),
            bounding_box,
            stylesheet: params.stylesheet.clone(),
            layout: params.layout.clone(),
            paper_width_mm: params.paper_width_mm,
            paper_height_mm: params.paper_height_mm,
            locale: params.locale.clone(),
            output_prefix: self.storage.directory().join(prefix),
            formats,
            scratch_prefix: scratch_prefix.to_path_buf(),
        };
        Ok((request, capabilities))
    }

    /// Thumbnail failures are logged and never change the result.
    fn make_thumbnail(
        &self,
        job: &Job,
        prefix: &str,
        request: &RenderRequest,
        capabilities: &LayoutCapabilities,
        output: &RenderOutput,
    ) {
        let dest = self.storage.thumbnail_path(prefix);
        let result = if capabilities.multi_page && !output.page_images.is_empty() {
            Some(self.thumbnails.from_pages(&output.page_images, &dest))
        } else if request.formats.iter().any(|f| f == "png") {
            Some(
                self.thumbnails
                    .from_image(&self.storage.file_path(prefix, "png"), &dest),
            )
        } else {
            None
        };

        match result {
            Some(Ok(())) => debug!(job_id = job.id, thumbnail = %redact_path(&dest), "Thumbnail created"),
            Some(Err(e)) => warn!(job_id = job.id, error = %e, "Thumbnail generation failed"),
            None => debug!(job_id = job.id, "No raster output, skipping thumbnail"),
        }

        for page in &output.page_images {
            if let Err(e) = remove_if_exists(page) {
                warn!(job_id = job.id, error = %e, "Could not remove page raster");
            }
        }
    }
}
