//! Prompt rendering and budget enforcement.
//!
//! The retrieved code comes first, then the question and guidelines. Only
//! the code context is shortened to fit the budget.

use codelens_index::SearchResult;
use codelens_index::context::chunk_display_header;

/// Separates retrieved chunks inside the context section.
pub const CHUNK_BOUNDARY: &str = "\n\n-----\n\n";

/// Appended whenever a prompt had to be shortened.
pub const TRUNCATION_MARKER: &str = "\n\n[... context truncated ...]";

pub const SYSTEM_PROMPT: &str = "You are an expert software engineer answering questions \
about a specific code repository. Ground every answer in the provided code context.";

const GUIDELINES: &str = "\
- Answer using the code context above; say so when it is insufficient.
- Reference files by path and line range, e.g. `src/lib.rs (lines 10-42)`.
- Use fenced code blocks with a language tag for code.
- Keep the answer focused on the question.";

const NO_CONTEXT: &str = "No relevant code was found for this question.";

/// Render retrieved chunks as the context section.
#[must_use]
pub fn render_context(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return NO_CONTEXT.to_owned();
    }
    results
        .iter()
        .map(|r| {
            format!(
                "File: {}\n```{}\n{}\n```",
                chunk_display_header(&r.chunk),
                r.chunk.language,
                r.chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join(CHUNK_BOUNDARY)
}

fn render_question(question: &str) -> String {
    format!("\n\n## Question\n\n{question}\n\n## Guidelines\n\n{GUIDELINES}")
}

/// Full prompt for `question`, cut down to `max_length` characters.
#[must_use]
pub fn build_prompt(question: &str, results: &[SearchResult], max_length: usize) -> String {
    let context = format!("## Code context\n\n{}", render_context(results));
    fit_prompt(&context, &render_question(question), max_length)
}

/// Join `context` and `tail`, truncating to at most `max_length` characters.
///
/// Only the context is shortened while the tail fits; the cut prefers a
/// chunk boundary, then a word boundary. If the tail alone is over budget
/// the context is dropped and the tail is cut on a word boundary. A
/// truncated prompt always ends with [`TRUNCATION_MARKER`]. `max_length`
/// must exceed the marker length.
#[must_use]
pub fn fit_prompt(context: &str, tail: &str, max_length: usize) -> String {
    let context_len = context.chars().count();
    let tail_len = tail.chars().count();
    if context_len + tail_len <= max_length {
        return format!("{context}{tail}");
    }

    let budget = max_length.saturating_sub(TRUNCATION_MARKER.chars().count());
    if tail_len > budget {
        let kept = cut_at_word(char_prefix(tail, budget));
        tracing::warn!(max_length, "question exceeds prompt budget, dropping context");
        return format!("{}{TRUNCATION_MARKER}", kept.trim());
    }

    let window = char_prefix(context, budget - tail_len);
    let kept = match window.rfind(CHUNK_BOUNDARY) {
        Some(idx) if idx > 0 => &window[..idx],
        _ => cut_at_word(window),
    };
    tracing::debug!(
        max_length,
        dropped = context_len - kept.chars().count(),
        "prompt context truncated"
    );
    format!("{}{tail}{TRUNCATION_MARKER}", kept.trim_end())
}

fn char_prefix(s: &str, chars: usize) -> &str {
    match s.char_indices().nth(chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Cut before the last partial word; falls back to the whole slice if it has
/// no whitespace.
fn cut_at_word(s: &str) -> &str {
    match s.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => &s[..idx],
        _ => s,
    }
}
