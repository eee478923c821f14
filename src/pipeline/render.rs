//! PDF rasterisation: render every page to a `DynamicImage` via pdfium.
//!
//! ## Why a scale factor instead of DPI?
//!
//! Pdfium renders at the page's native point size (72 points per inch), so a
//! scale factor of 2.0 yields roughly 144 DPI. That is enough detail for the
//! vision encoder, which re-resizes to its own pixel budget anyway; rendering
//! higher only burns memory on pixels the model never sees.
//!
//! ## Library binding
//!
//! `pdfium-render` loads the pdfium shared library at runtime. We look next
//! to the executable first (the common "drop libpdfium.so beside the binary"
//! deployment), then fall back to the system loader path.

use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{OcrError, Result};

/// Bind to the pdfium shared library.
///
/// Tries `./libpdfium.so` (or the platform equivalent) before the system
/// library path, mirroring how pdfium is usually deployed alongside a binary.
fn bind_pdfium() -> Result<Pdfium> {
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| OcrError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

/// Rasterise every page of a PDF into RGB images, in page order.
///
/// The whole document is rendered up front; for OCR workloads the model step
/// dominates runtime by orders of magnitude, so holding all page bitmaps in
/// memory is a non-issue at typical document sizes.
///
/// # Arguments
/// * `pdf_path` - path to the PDF file
/// * `scale`    - linear scale factor applied to each page's point size
pub fn render_pages(pdf_path: &Path, scale: f32) -> Result<Vec<DynamicImage>> {
    let pdfium = bind_pdfium()?;

    let document = pdfium.load_pdf_from_file(pdf_path, None).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            OcrError::PasswordProtected {
                path: pdf_path.to_path_buf(),
            }
        } else {
            OcrError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail: err_str,
            }
        }
    })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);

    let mut images = Vec::with_capacity(total_pages);

    for (idx, page) in pages.iter().enumerate() {
        let bitmap =
            page.render_with_config(&render_config)
                .map_err(|e| OcrError::PageRenderFailed {
                    page: idx + 1,
                    detail: format!("{:?}", e),
                })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );

        images.push(image);
    }

    Ok(images)
}
