//! Page rasterisation for OCR.
//!
//! Pages are rendered one at a time and handed to a [`PageVisitor`], so only a
//! single page image is held in memory per document. Each call to
//! [`PageRenderer::render_pages`] starts again from the first page.

use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use pdfium_render::prelude::*;
use tracing::{debug, trace};

use crate::config::RenderConfig;
use crate::error::{IndexError, IndexResult};

/// One rendered page, JPEG encoded.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// Zero-based page number
    pub number: usize,
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

/// Receives pages from a renderer as they are produced.
pub trait PageVisitor {
    /// Called once after the document is opened, before any page.
    fn opened(&mut self, _page_count: usize) -> IndexResult<()> {
        Ok(())
    }

    /// Called once per page, in page order.
    fn page(&mut self, page: RenderedPage) -> IndexResult<()>;
}

/// Opens documents and renders their pages.
pub trait PageRenderer: Send + Sync {
    /// Render every page of `path`, stopping at the first error returned by
    /// the visitor.
    fn render_pages(&self, path: &Path, visitor: &mut dyn PageVisitor) -> IndexResult<()>;
}

/// Create a new Pdfium instance (dynamically linked).
///
/// Searches for libpdfium in:
/// 1. Current directory (./libpdfium.so)
/// 2. vendor/pdfium/lib/
/// 3. System library paths
pub fn create_pdfium() -> IndexResult<Pdfium> {
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(
                "./vendor/pdfium/lib/",
            ))
        })
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| IndexError::Config {
            message: format!("Failed to load PDFium library: {:?}", e),
        })?;

    Ok(Pdfium::new(bindings))
}

/// Renders PDF pages with PDFium.
///
/// Stateless: `Pdfium` is bound per document because the handle cannot be
/// shared between worker threads. The OS caches the library load.
pub struct PdfiumRenderer {
    zoom: f32,
    jpeg_quality: u8,
}

impl PdfiumRenderer {
    /// Create a renderer, verifying that the PDFium library can be bound.
    pub fn new(config: &RenderConfig) -> IndexResult<Self> {
        create_pdfium()?;
        Ok(Self {
            zoom: config.zoom,
            jpeg_quality: config.jpeg_quality,
        })
    }
}

impl PageRenderer for PdfiumRenderer {
    fn render_pages(&self, path: &Path, visitor: &mut dyn PageVisitor) -> IndexResult<()> {
        let pdfium = create_pdfium()?;

        let document =
            pdfium
                .load_pdf_from_file(path, None)
                .map_err(|e| IndexError::DocumentOpen {
                    path: path.to_path_buf(),
                    message: format!("{:?}", e),
                })?;

        let page_count = document.pages().len() as usize;
        debug!(path = %path.display(), pages = page_count, "Opened document");
        visitor.opened(page_count)?;

        // Must zoom in for the OCR engine to give an accurate transcription
        let render_config = PdfRenderConfig::new().scale_page_by_factor(self.zoom);

        for (number, page) in document.pages().iter().enumerate() {
            let render_error = |message: String| IndexError::Render {
                path: path.to_path_buf(),
                page: number,
                message,
            };

            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| render_error(format!("{:?}", e)))?;
            let rgb = bitmap.as_image().to_rgb8();

            let jpeg = encode_jpeg(&rgb, self.jpeg_quality)
                .map_err(|e| render_error(format!("JPEG encoding failed: {}", e)))?;

            trace!(
                page = number,
                width = rgb.width(),
                height = rgb.height(),
                bytes = jpeg.len(),
                "Rendered page"
            );

            visitor.page(RenderedPage {
                number,
                width: rgb.width(),
                height: rgb.height(),
                jpeg,
            })?;
        }

        Ok(())
    }
}

/// Encode an RGB image as JPEG at the given quality (1-100).
pub fn encode_jpeg(image: &image::RgbImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    encoder.write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(buffer.into_inner())
}
