//! Post-processing: deterministic cleanup of raw model output.
//!
//! ## Why is post-processing necessary?
//!
//! Even a fine-tuned OCR model occasionally introduces artefacts that are
//! *semantically correct* but *structurally noisy*, for example:
//!
//! - Wrapping the whole answer in ` ```markdown ... ``` ` fences
//! - Emitting Windows-style `\r\n` line endings
//! - Leaving runs of blank lines between sections
//! - Trailing spaces at line ends
//!
//! This module applies cheap, deterministic rules that fix those quirks
//! without touching content. The model's structured tags (`<table>`, `<img>`,
//! `<watermark>`, `<page_number>`, LaTeX) pass through untouched; cleanup is
//! strictly whitespace and fence hygiene. Each rule is independently testable.
//!
//! ## Rule Order
//!
//! Rules must run in this specific order: strip fences before line-ending
//! normalisation so the fence regex sees the raw shape, and trim outer blank
//! lines last so earlier rules cannot reintroduce them.
//!
//! Note the output deliberately has no trailing newline: page texts are
//! joined with `\n\n` by the processor, so a trailing newline here would
//! produce uneven gaps between pages.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to the raw model output for one page.
///
/// Each pass is a pure function (`&str → String`) with no shared state,
/// making the pipeline easy to extend or re-order without side effects.
///
/// Rules (applied in order):
/// 1. Strip outer markdown fences (models sometimes wrap the whole answer)
/// 2. Normalise line endings (CRLF → LF)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 3+ consecutive blank lines down to 2
/// 5. Trim leading and trailing blank lines (no final newline)
pub fn clean_output(input: &str) -> String {
    let s = strip_outer_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    trim_outer_blank_lines(&s)
}

// ── Rule 1: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown)?\n(.*)\n```\s*$").unwrap());

fn strip_outer_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 5: Trim outer blank lines ───────────────────────────────────────────

fn trim_outer_blank_lines(input: &str) -> String {
    input.trim_matches('\n').to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────
