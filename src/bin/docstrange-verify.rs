//! Wiring verification binary.
//!
//! Runs five independent checks that prove the pipeline is assembled
//! correctly on this machine: types construct, the local processor is
//! registered and primary, device selection resolves, construction needs no
//! credentials, and the public model assets are reachable. No model weights
//! are loaded and no inference runs, so the whole thing finishes in seconds.
//!
//! Each check is isolated: a failure (or panic) is reported as `✗` and the
//! remaining checks still run. Exit code 0 only when every check passes.

use std::any::Any;
use std::collections::BTreeMap;
use std::io;
use std::panic;
use std::process::ExitCode;

use docstrange_ocr::model::config::PreprocessorConfig;
use docstrange_ocr::{
    ConversionResult, DevicePreference, DocumentExtractor, DocumentProcessor,
    LocalNanonetsProcessor, ProcessorConfig, DEFAULT_MODEL_ID, PROCESSOR_NAME, SUPPORTED_FORMATS,
};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use tokenizers::Tokenizer;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── Checks ───────────────────────────────────────────────────────────────────

type CheckResult = Result<String, String>;

/// Check 1: config validates and the result container round-trips.
fn check_core_types() -> CheckResult {
    let config = ProcessorConfig::builder()
        .max_new_tokens(512)
        .render_scale(2.0)
        .build()
        .map_err(|e| format!("config rejected: {e}"))?;
    if config.model_name() != "Nanonets-OCR2-3B" {
        return Err(format!("unexpected model name '{}'", config.model_name()));
    }

    let mut metadata = BTreeMap::new();
    metadata.insert("processor".to_string(), PROCESSOR_NAME.to_string());
    metadata.insert("model".to_string(), config.model_name().to_string());
    let result = ConversionResult::new("# probe", metadata);
    if result.extract_markdown() != "# probe" {
        return Err("result content accessor mismatch".to_string());
    }
    if result.metadata_value("processor") != Some(PROCESSOR_NAME) {
        return Err("result metadata accessor mismatch".to_string());
    }

    let dir = tempfile::tempdir().map_err(|e| format!("tempdir: {e}"))?;
    let path = dir.path().join("probe.md");
    result
        .save_to_file(&path)
        .map_err(|e| format!("save_to_file failed: {e}"))?;
    let written = std::fs::read_to_string(&path).map_err(|e| format!("read back: {e}"))?;
    if written != "# probe" {
        return Err("saved content does not match".to_string());
    }

    Ok("config validates, result round-trips to disk".to_string())
}

/// Check 2: the extractor registers the local processor and reports its
/// formats.
fn check_extractor() -> CheckResult {
    let extractor = DocumentExtractor::new();
    let names = extractor.processor_names();
    if names != [PROCESSOR_NAME] {
        return Err(format!("unexpected processors registered: {names:?}"));
    }
    let formats = extractor.supported_formats();
    for expected in SUPPORTED_FORMATS {
        if !formats.iter().any(|f| f == expected) {
            return Err(format!("format {expected} missing from extractor"));
        }
    }
    Ok(format!(
        "{PROCESSOR_NAME} registered, {} formats",
        formats.len()
    ))
}

/// Check 3: the processor initialises standalone and device selection
/// resolves.
fn check_processor() -> CheckResult {
    let processor = LocalNanonetsProcessor::new(ProcessorConfig::default());
    if processor.is_loaded() {
        return Err("engine resident before first use".to_string());
    }
    if processor.name() != PROCESSOR_NAME {
        return Err(format!("unexpected processor name '{}'", processor.name()));
    }
    if LocalNanonetsProcessor::supported_formats() != SUPPORTED_FORMATS {
        return Err("format list does not match the published set".to_string());
    }

    let selection = DevicePreference::Auto
        .resolve()
        .map_err(|e| format!("device resolution failed: {e}"))?;
    Ok(format!("formats match, device {}", selection.describe()))
}

/// Check 4: construction succeeds with no credentials of any kind, and the
/// local processor is the primary dispatch target.
fn check_no_auth() -> CheckResult {
    // Neither the builder nor the constructors read tokens, keys, or any
    // other environment state; this must succeed on a machine with nothing
    // configured.
    let config = ProcessorConfig::builder()
        .build()
        .map_err(|e| format!("default config rejected: {e}"))?;
    let extractor = DocumentExtractor::with_config(config);
    match extractor.processor_names().first() {
        Some(first) if *first == PROCESSOR_NAME => {
            Ok("no credentials required, local processor is primary".to_string())
        }
        other => Err(format!("primary processor is {other:?}")),
    }
}

/// Check 5: the public model repository serves the tokenizer and
/// preprocessor assets, and both parse.
fn check_model_assets() -> CheckResult {
    let api = Api::new().map_err(|e| format!("hub api init failed: {e}"))?;
    let repo = api.repo(Repo::with_revision(
        DEFAULT_MODEL_ID.to_string(),
        RepoType::Model,
        "main".to_string(),
    ));

    let tokenizer_path = repo
        .get("tokenizer.json")
        .map_err(|e| format!("tokenizer.json fetch failed: {e}"))?;
    let preprocessor_path = repo
        .get("preprocessor_config.json")
        .map_err(|e| format!("preprocessor_config.json fetch failed: {e}"))?;

    let tokenizer =
        Tokenizer::from_file(&tokenizer_path).map_err(|e| format!("tokenizer parse failed: {e}"))?;
    let preprocessor = PreprocessorConfig::from_path(&preprocessor_path)
        .map_err(|e| format!("preprocessor parse failed: {e}"))?;
    preprocessor
        .validate()
        .map_err(|e| format!("preprocessor config invalid: {e}"))?;

    Ok(format!(
        "tokenizer ({} tokens) and preprocessor config parsed",
        tokenizer.get_vocab_size(true)
    ))
}

// ── Runner ───────────────────────────────────────────────────────────────────

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error")),
        )
        .with_writer(io::stderr)
        .init();

    println!("{}", bold("docstrange-ocr wiring verification"));
    println!("{}", dim(&format!("model: {DEFAULT_MODEL_ID}")));
    println!();

    let checks: [(&str, fn() -> CheckResult); 5] = [
        ("core types", check_core_types),
        ("extractor registration", check_extractor),
        ("processor standalone", check_processor),
        ("no-auth construction", check_no_auth),
        ("model assets fetch", check_model_assets),
    ];

    let total = checks.len();
    let mut passed = 0;
    for (name, check) in checks {
        // A panicking check is a failed check, not a crashed run.
        let outcome = panic::catch_unwind(check).unwrap_or_else(|p| Err(panic_message(p)));
        match outcome {
            Ok(detail) => {
                passed += 1;
                println!("{} {:<24} {}", green("✓"), name, dim(&detail));
            }
            Err(reason) => {
                println!("{} {:<24} {}", red("✗"), name, red(&reason));
            }
        }
    }

    println!();
    println!("Results: {passed}/{total}");
    if passed == total {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
