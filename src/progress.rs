//! Progress-callback trait for model-load and per-page events.
//!
//! Inject an [`Arc<dyn OcrProgressCallback>`] via
//! [`crate::config::ProcessorConfigBuilder::progress_callback`] to observe the
//! pipeline as it loads the model and walks through pages.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a terminal progress bar, a log sink, or a database record
//! without the library knowing anything about how the host application
//! communicates. The library itself never prints; the CLI's progress bar is
//! just one implementation of this trait.
//!
//! # Example
//!
//! ```rust
//! use docstrange_ocr::{OcrProgressCallback, ProcessorConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: Arc<AtomicUsize>,
//! }
//!
//! impl OcrProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, text_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {}/{} done ({} bytes)", page_num, total_pages, text_len);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     completed: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = ProcessorConfig::builder()
//!     .progress_callback(counter as Arc<dyn OcrProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the processor as it loads the model and processes pages.
///
/// Pages are processed strictly in order on a single thread, so methods are
/// never called concurrently; the `Send + Sync` bound exists so the callback
/// can be stored in a [`ProcessorConfig`](crate::config::ProcessorConfig) that
/// crosses thread boundaries. All methods have default no-op implementations
/// so callers only override what they care about.
///
/// A single-image conversion reports one page (`total_pages = 1`). A page that
/// fails never reaches `on_page_complete`; the error aborts the document and
/// surfaces through the processor's return value instead.
pub trait OcrProgressCallback: Send + Sync {
    /// Called once, just before model weights start downloading/loading.
    ///
    /// Only fired on the first conversion (or the first after a failed load);
    /// subsequent conversions reuse the resident engine silently.
    ///
    /// # Arguments
    /// * `model_id` - the Hugging Face model identifier being loaded
    fn on_load_start(&self, model_id: &str) {
        let _ = model_id;
    }

    /// Called once the engine is resident and ready to generate.
    fn on_load_complete(&self, model_id: &str) {
        let _ = model_id;
    }

    /// Called just before a page image is handed to the model.
    ///
    /// # Arguments
    /// * `page_num`    - 1-indexed page number
    /// * `total_pages` - total pages in the document
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page's text has been extracted.
    ///
    /// # Arguments
    /// * `page_num`    - 1-indexed page number
    /// * `total_pages` - total pages
    /// * `text_len`    - byte length of the extracted text
    fn on_page_complete(&self, page_num: usize, total_pages: usize, text_len: usize) {
        let _ = (page_num, total_pages, text_len);
    }

    /// Called once after every page of the document has been extracted.
    ///
    /// Not called when a page fails: the document aborts and the error
    /// propagates to the caller instead.
    ///
    /// # Arguments
    /// * `total_pages` - pages that were processed
    fn on_document_complete(&self, total_pages: usize) {
        let _ = total_pages;
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl OcrProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ProcessorConfig`].
pub type ProgressCallback = Arc<dyn OcrProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct TrackingCallback {
        loads: Arc<AtomicUsize>,
        starts: Arc<AtomicUsize>,
        completes: Arc<AtomicUsize>,
        finished_total: Arc<AtomicUsize>,
        loaded_model: Mutex<String>,
    }

    impl OcrProgressCallback for TrackingCallback {
        fn on_load_start(&self, _model_id: &str) {
            self.loads.fetch_add(1, Ordering::SeqCst);
        }

        fn on_load_complete(&self, model_id: &str) {
            *self.loaded_model.lock().unwrap() = model_id.to_string();
        }

        fn on_page_start(&self, _page_num: usize, _total_pages: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page_num: usize, _total_pages: usize, _text_len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_document_complete(&self, total_pages: usize) {
            self.finished_total.store(total_pages, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_load_start("nanonets/Nanonets-OCR2-3B");
        cb.on_load_complete("nanonets/Nanonets-OCR2-3B");
        cb.on_page_start(1, 3);
        cb.on_page_complete(1, 3, 42);
        cb.on_document_complete(3);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback {
            loads: Arc::new(AtomicUsize::new(0)),
            starts: Arc::new(AtomicUsize::new(0)),
            completes: Arc::new(AtomicUsize::new(0)),
            finished_total: Arc::new(AtomicUsize::new(0)),
            loaded_model: Mutex::new(String::new()),
        };

        tracker.on_load_start("nanonets/Nanonets-OCR2-3B");
        tracker.on_load_complete("nanonets/Nanonets-OCR2-3B");
        assert_eq!(tracker.loads.load(Ordering::SeqCst), 1);
        assert_eq!(
            tracker.loaded_model.lock().unwrap().as_str(),
            "nanonets/Nanonets-OCR2-3B"
        );

        tracker.on_page_start(1, 2);
        tracker.on_page_complete(1, 2, 100);
        tracker.on_page_start(2, 2);
        tracker.on_page_complete(2, 2, 200);
        tracker.on_document_complete(2);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.finished_total.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: Arc<dyn OcrProgressCallback> = Arc::new(NoopProgressCallback);
        cb.on_load_start("some/model");
        cb.on_page_start(1, 10);
        cb.on_page_complete(1, 10, 512);
    }
}
