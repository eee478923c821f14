//! CLI binary for docstrange-ocr.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ProcessorConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use docstrange_ocr::{
    ConversionResult, DevicePreference, DocumentExtractor, OcrProgressCallback, ProcessorConfig,
    DEFAULT_MODEL_ID,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: renders a live progress bar and per-page log
/// lines using [indicatif]. Pages arrive strictly in order (the pipeline is
/// single-threaded), so one timestamp slot per page is enough.
struct CliProgressCallback {
    /// The single progress bar anchored at the bottom of the terminal.
    bar: ProgressBar,
    /// Wall-clock start of the page currently being extracted.
    page_started: Mutex<Option<Instant>>,
    /// Wall-clock start of the model load, when one is in flight.
    load_started: Mutex<Option<Instant>>,
}

impl CliProgressCallback {
    /// Create a callback whose progress-bar length is set dynamically by the
    /// first `on_page_start` (the page count is unknown until the document
    /// has been opened).
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set on the first page event

        // Initial style: spinner only (no counter until we know the total).
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening document…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            page_started: Mutex::new(None),
            load_started: Mutex::new(None),
        })
    }

    /// Switch to the full progress-bar style once we know `total`.
    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    /// Clear the bar so a following error message prints on a clean line.
    fn clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl OcrProgressCallback for CliProgressCallback {
    fn on_load_start(&self, model_id: &str) {
        *self.load_started.lock().unwrap() = Some(Instant::now());
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Loading {model_id}…"))
        ));
        self.bar.println(dim(
            "  (first run downloads the weights to the Hugging Face cache)",
        ));
        self.bar.set_message("loading model…");
    }

    fn on_load_complete(&self, model_id: &str) {
        let elapsed = self
            .load_started
            .lock()
            .unwrap()
            .take()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.bar.println(format!(
            "  {} {} ready  {}",
            green("✓"),
            model_id,
            dim(&format!("{elapsed:.1}s")),
        ));
    }

    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        // First page event: swap the spinner for the real bar now that the
        // page count is known.
        if self.bar.length().unwrap_or(0) == 0 {
            self.activate_bar(total_pages);
        }
        *self.page_started.lock().unwrap() = Some(Instant::now());
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total_pages: usize, text_len: usize) {
        let elapsed = self
            .page_started
            .lock()
            .unwrap()
            .take()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            page_num,
            total_pages,
            dim(&format!("{text_len:>5} chars")),
            dim(&format!("{elapsed:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_document_complete(&self, total_pages: usize) {
        self.bar.finish_and_clear();
        let noun = if total_pages == 1 { "page" } else { "pages" };
        eprintln!(
            "{} {} extracted",
            green("✔"),
            bold(&format!("{total_pages} {noun}"))
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract a scanned PDF to stdout
  docstrange scan.pdf

  # Extract to a file
  docstrange scan.pdf -o scan.md

  # Single image, structured JSON output
  docstrange --json receipt.png > receipt.json

  # Force CPU inference
  docstrange --device cpu invoice.jpg

  # Sharper page rendering for small print
  docstrange --scale 3.0 contract.pdf -o contract.md

  # Use a different Qwen2.5-VL-family checkpoint
  docstrange --model-id nanonets/Nanonets-OCR-s page.png

SUPPORTED FORMATS:
  .pdf  .png  .jpg  .jpeg  .bmp  .tiff  .webp

ENVIRONMENT VARIABLES:
  DOCSTRANGE_OUTPUT       Default output path (same as -o)
  DOCSTRANGE_MODEL_ID     Override the model repository
  DOCSTRANGE_DEVICE       Override the device (auto, cpu, cuda, cuda:N)
  HF_HOME                 Hugging Face cache directory for downloaded weights

SETUP:
  No API key is required: inference runs locally. On first use the model
  weights (several GB) are downloaded from the Hugging Face hub and cached;
  later runs load straight from the cache.

  PDF input needs the PDFium shared library (libpdfium). Place it next to
  the binary or install it system-wide; image input works without it.
"#;

/// Extract text from documents with a local vision model.
#[derive(Parser, Debug)]
#[command(
    name = "docstrange",
    version,
    about = "Extract text from PDFs and images with a local vision model",
    long_about = "Extract clean, structured text (markdown with HTML tables and LaTeX \
equations) from scanned PDFs and images. Inference runs entirely on this machine with the \
Nanonets-OCR2-3B vision-language model; nothing is uploaded and no API key is needed.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Input document: a PDF or an image file.
    input: PathBuf,

    /// Write extracted text to this file instead of stdout.
    #[arg(short, long, env = "DOCSTRANGE_OUTPUT")]
    output: Option<PathBuf>,

    /// Hugging Face model repository to run.
    #[arg(long, env = "DOCSTRANGE_MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    /// Git revision of the model repository.
    #[arg(long, env = "DOCSTRANGE_REVISION", default_value = "main")]
    revision: String,

    /// Max tokens the model may generate per page.
    #[arg(long, env = "DOCSTRANGE_MAX_NEW_TOKENS", default_value_t = 4096)]
    max_new_tokens: usize,

    /// PDF rasterisation scale factor (1.0–4.0).
    #[arg(long, env = "DOCSTRANGE_SCALE", default_value_t = 2.0)]
    scale: f32,

    /// Inference device: auto, cpu, cuda, or cuda:N.
    #[arg(long, env = "DOCSTRANGE_DEVICE", default_value = "auto")]
    device: String,

    /// Output structured JSON (content + metadata) instead of plain text.
    #[arg(long, env = "DOCSTRANGE_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "DOCSTRANGE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCSTRANGE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCSTRANGE_QUIET")]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active; the
    // bar provides all the feedback that matters to the user. Verbose mode
    // wins over everything.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let device: DevicePreference = cli
        .device
        .parse()
        .with_context(|| format!("Invalid --device '{}'", cli.device))?;

    let progress = if show_progress {
        Some(CliProgressCallback::new_dynamic())
    } else {
        None
    };

    let mut builder = ProcessorConfig::builder()
        .model_id(&cli.model_id)
        .revision(&cli.revision)
        .max_new_tokens(cli.max_new_tokens)
        .render_scale(cli.scale)
        .device(device);
    if let Some(ref cb) = progress {
        builder = builder.progress_callback(Arc::clone(cb) as Arc<dyn OcrProgressCallback>);
    }
    let config = builder.build().context("Invalid configuration")?;

    // ── Run extraction ───────────────────────────────────────────────────
    let extractor = DocumentExtractor::with_config(config);
    let result = match extractor.extract(&cli.input) {
        Ok(result) => result,
        Err(e) => {
            // Clear the bar first so the error prints on its own line.
            if let Some(ref cb) = progress {
                cb.clear();
            }
            return Err(e)
                .with_context(|| format!("Failed to extract {}", cli.input.display()));
        }
    };

    print_result(&cli, &result)
}

/// Write the result to `-o`, or to stdout as JSON or plain text.
fn print_result(cli: &Cli, result: &ConversionResult) -> Result<()> {
    if let Some(ref output_path) = cli.output {
        result
            .save_to_file(output_path)
            .with_context(|| format!("Failed to write {}", output_path.display()))?;

        // Summary line (the callback already printed the per-page log).
        if !cli.quiet {
            eprintln!(
                "{}  {}  →  {}",
                green("✔"),
                dim(&format!("{} chars", result.content.len())),
                bold(&output_path.display().to_string()),
            );
        }
    } else if cli.json {
        let json = serde_json::to_string_pretty(result).context("Failed to serialise result")?;
        println!("{json}");
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(result.content.as_bytes())
            .context("Failed to write to stdout")?;
        // Ensure a trailing newline on stdout.
        if !result.content.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }
    }

    Ok(())
}
