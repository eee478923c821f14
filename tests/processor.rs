//! Pipeline integration tests driven by scripted engines.
//!
//! Everything here runs without model weights: a scripted [`OcrEngine`]
//! stands in for the real one via
//! `LocalNanonetsProcessor::with_engine_loader`, so dispatch, lazy loading,
//! temp-file cleanup, and abort-on-failure can all be exercised in
//! milliseconds. Tests that rasterise PDFs additionally need the PDFium
//! shared library and skip politely when it is absent.
//!
//! Run with:
//!   cargo test --test processor

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use docstrange_ocr::prompts::OCR_PROMPT;
use docstrange_ocr::{
    LocalNanonetsProcessor, OcrEngine, OcrError, OcrProgressCallback, ProcessorConfig, Result,
};
use pdfium_render::prelude::Pdfium;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// One recorded `extract_text` invocation.
#[derive(Clone)]
struct EngineCall {
    path: PathBuf,
    prompt: String,
    max_new_tokens: usize,
    /// Whether the image file existed when the engine was invoked.
    file_existed: bool,
}

/// Engine that records every call and answers `Text of call N`, optionally
/// failing on the Nth call (1-indexed).
struct ScriptedEngine {
    calls: Arc<Mutex<Vec<EngineCall>>>,
    fail_on_call: Option<usize>,
}

impl OcrEngine for ScriptedEngine {
    fn model_id(&self) -> &str {
        "test/scripted"
    }

    fn extract_text(
        &mut self,
        image: &Path,
        prompt: &str,
        max_new_tokens: usize,
    ) -> Result<String> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(EngineCall {
            path: image.to_path_buf(),
            prompt: prompt.to_string(),
            max_new_tokens,
            file_existed: image.exists(),
        });
        let call_num = calls.len();
        if self.fail_on_call == Some(call_num) {
            return Err(OcrError::GenerationFailed {
                detail: format!("scripted failure on call {call_num}"),
            });
        }
        Ok(format!("Text of call {call_num}"))
    }
}

/// Engine that always answers the same string.
struct CannedEngine {
    text: &'static str,
}

impl OcrEngine for CannedEngine {
    fn model_id(&self) -> &str {
        "test/canned"
    }

    fn extract_text(&mut self, _image: &Path, _prompt: &str, _max: usize) -> Result<String> {
        Ok(self.text.to_string())
    }
}

/// Processor wired to a [`ScriptedEngine`]; returns the call log and a
/// counter of how many times the loader ran.
fn scripted_processor(
    config: ProcessorConfig,
    fail_on_call: Option<usize>,
) -> (
    LocalNanonetsProcessor,
    Arc<Mutex<Vec<EngineCall>>>,
    Arc<AtomicUsize>,
) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loads = Arc::new(AtomicUsize::new(0));
    let loader_calls = Arc::clone(&calls);
    let loader_loads = Arc::clone(&loads);
    let processor = LocalNanonetsProcessor::with_engine_loader(
        config,
        Box::new(move |_| {
            loader_loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedEngine {
                calls: Arc::clone(&loader_calls),
                fail_on_call,
            }) as Box<dyn OcrEngine>)
        }),
    );
    (processor, calls, loads)
}

/// Records every progress event for later inspection.
#[derive(Default)]
struct RecordingCallback {
    load_starts: AtomicUsize,
    load_completes: AtomicUsize,
    page_starts: Mutex<Vec<(usize, usize)>>,
    page_completes: Mutex<Vec<(usize, usize, usize)>>,
    document_completes: Mutex<Vec<usize>>,
}

impl OcrProgressCallback for RecordingCallback {
    fn on_load_start(&self, _model_id: &str) {
        self.load_starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_load_complete(&self, _model_id: &str) {
        self.load_completes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        self.page_starts.lock().unwrap().push((page_num, total_pages));
    }

    fn on_page_complete(&self, page_num: usize, total_pages: usize, text_len: usize) {
        self.page_completes
            .lock()
            .unwrap()
            .push((page_num, total_pages, text_len));
    }

    fn on_document_complete(&self, total_pages: usize) {
        self.document_completes.lock().unwrap().push(total_pages);
    }
}

/// A minimal well-formed PDF with `pages` blank 200x200pt pages and a
/// correct xref table, assembled with computed byte offsets so pdfium does
/// not have to reconstruct anything.
fn minimal_pdf(pages: usize) -> Vec<u8> {
    let mut objects: Vec<String> = Vec::new();
    objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());
    let kids: Vec<String> = (0..pages).map(|i| format!("{} 0 R", 3 + i)).collect();
    objects.push(format!(
        "<< /Type /Pages /Kids [{}] /Count {} >>",
        kids.join(" "),
        pages
    ));
    for _ in 0..pages {
        objects.push("<< /Type /Page /Parent 2 0 R /MediaBox [0 0 200 200] >>".to_string());
    }

    let mut buf = String::from("%PDF-1.4\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(buf.len());
        buf.push_str(&format!("{} 0 obj\n{body}\nendobj\n", i + 1));
    }
    let xref_start = buf.len();
    buf.push_str(&format!("xref\n0 {}\n", objects.len() + 1));
    buf.push_str("0000000000 65535 f \n");
    for off in &offsets {
        buf.push_str(&format!("{off:010} 00000 n \n"));
    }
    buf.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_start}\n%%EOF\n",
        objects.len() + 1
    ));
    buf.into_bytes()
}

fn write_pdf(dir: &tempfile::TempDir, pages: usize) -> PathBuf {
    let path = dir.path().join("document.pdf");
    std::fs::write(&path, minimal_pdf(pages)).unwrap();
    path
}

fn pdfium_available() -> bool {
    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .is_ok()
}

/// pdfium's init/destroy pairs must not interleave across test threads, so
/// every test that rasterises takes this lock first.
static PDFIUM_LOCK: Mutex<()> = Mutex::new(());

macro_rules! skip_unless_pdfium {
    () => {
        if !pdfium_available() {
            println!("SKIP — PDFium shared library not found (needed to rasterise PDFs)");
            return;
        }
    };
}

// ── Dispatch and metadata ────────────────────────────────────────────────────

#[test]
fn image_goes_straight_to_the_engine() {
    let file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
    let (processor, calls, _) = scripted_processor(ProcessorConfig::default(), None);

    let result = processor.process(file.path()).unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1, "one image means one model call");
    assert_eq!(calls[0].path, file.path(), "image path must reach the engine as given");

    assert_eq!(result.extract_markdown(), "Text of call 1");
    assert_eq!(result.metadata_value("processor"), Some("LocalNanonetsProcessor"));
    assert_eq!(result.metadata_value("model"), Some("Nanonets-OCR2-3B"));
    assert_eq!(
        result.metadata_value("file_path"),
        Some(file.path().display().to_string().as_str())
    );
    assert_eq!(result.metadata_value("file_type"), Some(".png"));
}

#[test]
fn uppercase_extension_is_accepted() {
    let file = tempfile::Builder::new().suffix(".JPEG").tempfile().unwrap();
    let (processor, _, _) = scripted_processor(ProcessorConfig::default(), None);

    let result = processor.process(file.path()).unwrap();
    assert_eq!(result.metadata_value("file_type"), Some(".jpeg"));
}

#[test]
fn prompt_and_token_budget_are_forwarded() {
    let file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
    let config = ProcessorConfig::builder().max_new_tokens(777).build().unwrap();
    let (processor, calls, _) = scripted_processor(config, None);

    processor.process(file.path()).unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls[0].prompt, OCR_PROMPT);
    assert_eq!(calls[0].max_new_tokens, 777);
}

#[test]
fn engine_output_is_cleaned() {
    let file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
    let processor = LocalNanonetsProcessor::with_engine_loader(
        ProcessorConfig::default(),
        Box::new(|_| {
            Ok(Box::new(CannedEngine {
                text: "```markdown\nHello world\n```\n",
            }) as Box<dyn OcrEngine>)
        }),
    );

    let result = processor.process(file.path()).unwrap();
    assert_eq!(
        result.extract_markdown(),
        "Hello world",
        "outer code fences must be stripped from the model output"
    );
}

#[test]
fn txt_file_is_rejected_without_loading() {
    let file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
    let (processor, _, loads) = scripted_processor(ProcessorConfig::default(), None);

    let err = processor.process(file.path()).unwrap_err();
    match err {
        OcrError::UnsupportedFormat { extension, .. } => assert_eq!(extension, ".txt"),
        other => panic!("expected UnsupportedFormat, got {other:?}"),
    }
    assert_eq!(loads.load(Ordering::SeqCst), 0, "no engine load for rejected input");
}

#[test]
fn missing_file_is_reported_without_loading() {
    let (processor, _, loads) = scripted_processor(ProcessorConfig::default(), None);

    let err = processor.process("no/such/scan.png").unwrap_err();
    assert!(matches!(err, OcrError::FileNotFound { .. }));
    assert_eq!(loads.load(Ordering::SeqCst), 0);
}

// ── Engine lifecycle ─────────────────────────────────────────────────────────

#[test]
fn engine_loads_once_for_many_documents() {
    let first = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
    let second = tempfile::Builder::new().suffix(".jpg").tempfile().unwrap();
    let (processor, calls, loads) = scripted_processor(ProcessorConfig::default(), None);

    assert!(!processor.is_loaded());
    processor.process(first.path()).unwrap();
    assert!(processor.is_loaded());
    processor.process(second.path()).unwrap();

    assert_eq!(loads.load(Ordering::SeqCst), 1, "the engine is loaded exactly once");
    assert_eq!(calls.lock().unwrap().len(), 2);
}

#[test]
fn failed_load_is_retried_on_the_next_document() {
    let file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let loader_attempts = Arc::clone(&attempts);
    let processor = LocalNanonetsProcessor::with_engine_loader(
        ProcessorConfig::default(),
        Box::new(move |_| {
            if loader_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(OcrError::ModelLoadFailed {
                    model_id: "test/scripted".to_string(),
                    detail: "download interrupted".to_string(),
                })
            } else {
                Ok(Box::new(CannedEngine { text: "recovered" }) as Box<dyn OcrEngine>)
            }
        }),
    );

    let err = processor.process(file.path()).unwrap_err();
    assert!(matches!(err, OcrError::ModelLoadFailed { .. }));
    assert!(!processor.is_loaded(), "a failed load must leave the slot empty");

    let result = processor.process(file.path()).unwrap();
    assert_eq!(result.extract_markdown(), "recovered");
    assert!(processor.is_loaded());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn single_image_reports_one_page_of_progress() {
    let file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
    let recorder = Arc::new(RecordingCallback::default());
    let config = ProcessorConfig::builder()
        .progress_callback(Arc::clone(&recorder) as Arc<dyn OcrProgressCallback>)
        .build()
        .unwrap();
    let (processor, _, _) = scripted_processor(config, None);

    processor.process(file.path()).unwrap();
    assert_eq!(recorder.load_starts.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.load_completes.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.page_starts.lock().unwrap(), vec![(1, 1)]);
    assert_eq!(
        *recorder.page_completes.lock().unwrap(),
        vec![(1, 1, "Text of call 1".len())]
    );
    assert_eq!(*recorder.document_completes.lock().unwrap(), vec![1]);

    // A second document reuses the resident engine: no further load events.
    processor.process(file.path()).unwrap();
    assert_eq!(recorder.load_starts.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.document_completes.lock().unwrap().len(), 2);
}

// ── PDF pipeline (needs PDFium) ──────────────────────────────────────────────

#[test]
fn pdf_pages_are_transcribed_in_order_under_headings() {
    skip_unless_pdfium!();
    let _guard = PDFIUM_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let dir = tempfile::tempdir().unwrap();
    let pdf = write_pdf(&dir, 3);
    let recorder = Arc::new(RecordingCallback::default());
    let config = ProcessorConfig::builder()
        .progress_callback(Arc::clone(&recorder) as Arc<dyn OcrProgressCallback>)
        .build()
        .unwrap();
    let (processor, calls, loads) = scripted_processor(config, None);

    let result = processor.process(&pdf).unwrap();

    assert_eq!(
        result.extract_markdown(),
        "## Page 1\n\nText of call 1\n\n## Page 2\n\nText of call 2\n\n## Page 3\n\nText of call 3"
    );
    assert_eq!(result.metadata_value("file_type"), Some(".pdf"));
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 3);
    for (idx, call) in calls.iter().enumerate() {
        let name = call.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(
            name.starts_with(&format!("docstrange-page-{}-", idx + 1)),
            "unexpected temp name {name}"
        );
        assert!(name.ends_with(".png"), "pages are handed over as PNG, got {name}");
    }

    assert_eq!(
        *recorder.page_starts.lock().unwrap(),
        vec![(1, 3), (2, 3), (3, 3)]
    );
    assert_eq!(recorder.page_completes.lock().unwrap().len(), 3);
    assert_eq!(*recorder.document_completes.lock().unwrap(), vec![3]);
}

#[test]
fn page_temp_files_are_removed_after_success() {
    skip_unless_pdfium!();
    let _guard = PDFIUM_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let dir = tempfile::tempdir().unwrap();
    let pdf = write_pdf(&dir, 2);
    let (processor, calls, _) = scripted_processor(ProcessorConfig::default(), None);

    processor.process(&pdf).unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    for call in calls.iter() {
        assert!(call.file_existed, "temp page must exist while the engine runs");
        assert!(
            !call.path.exists(),
            "temp page {} must be removed after processing",
            call.path.display()
        );
    }
}

#[test]
fn page_failure_aborts_the_remaining_pages() {
    skip_unless_pdfium!();
    let _guard = PDFIUM_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let dir = tempfile::tempdir().unwrap();
    let pdf = write_pdf(&dir, 3);
    let recorder = Arc::new(RecordingCallback::default());
    let config = ProcessorConfig::builder()
        .progress_callback(Arc::clone(&recorder) as Arc<dyn OcrProgressCallback>)
        .build()
        .unwrap();
    let (processor, calls, _) = scripted_processor(config, Some(2));

    let err = processor.process(&pdf).unwrap_err();
    assert!(matches!(err, OcrError::GenerationFailed { .. }));

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2, "page 3 must never reach the engine");
    for call in calls.iter() {
        assert!(
            !call.path.exists(),
            "temp page {} must be removed on failure too",
            call.path.display()
        );
    }

    assert_eq!(
        recorder.page_completes.lock().unwrap().len(),
        1,
        "only page 1 completed"
    );
    assert!(
        recorder.document_completes.lock().unwrap().is_empty(),
        "an aborted document never reports completion"
    );
}
