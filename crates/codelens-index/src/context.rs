//! Embedding text generation.
//!
//! The raw window alone embeds poorly for conceptual queries, so a short
//! header with the language and detected symbols is prepended. The header
//! depends only on content and language, which keeps vectors reusable across
//! chunks sharing a content hash.

use codelens_store::CodeChunk;

/// Maximum number of symbols listed in the header.
const MAX_HEADER_SYMBOLS: usize = 12;

/// Generate text optimized for embedding (not for display).
#[must_use]
pub fn contextualize_for_embedding(chunk: &CodeChunk) -> String {
    let mut text = String::with_capacity(chunk.content.len() + 128);

    text.push_str("# Language: ");
    text.push_str(&chunk.language);
    text.push('\n');

    if !chunk.symbols.is_empty() {
        let listed: Vec<&str> = chunk
            .symbols
            .iter()
            .take(MAX_HEADER_SYMBOLS)
            .map(String::as_str)
            .collect();
        text.push_str("# Symbols: ");
        text.push_str(&listed.join(", "));
        text.push('\n');
    }

    text.push_str(&chunk.content);
    text
}

/// Short header for display in retrieved results.
#[must_use]
pub fn chunk_display_header(chunk: &CodeChunk) -> String {
    format!(
        "{} (lines {}-{})",
        chunk.file_path, chunk.start_line, chunk.end_line
    )
}
