//! Sliding-window text chunker.
//!
//! Splits a page's text into passage-sized chunks of roughly `max_chars`
//! characters with a configurable overlap between consecutive chunks, after
//! collapsing all whitespace runs to single spaces. Overlap keeps facts that
//! straddle a window boundary retrievable from at least one chunk.

/// Default chunk window in characters.
pub const DEFAULT_MAX_CHARS: usize = 1100;
/// Default overlap between consecutive chunks.
pub const DEFAULT_OVERLAP: usize = 200;

/// Split text into overlapping character windows.
///
/// Returns an empty vec for empty or whitespace-only input. Operates on
/// `char` boundaries, so multibyte text never splits mid-character.
pub fn chunk_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let normalized: Vec<char> = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .collect();

    if normalized.is_empty() {
        return Vec::new();
    }

    let step = max_chars.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let n = normalized.len();

    while start < n {
        let end = (start + max_chars).min(n);
        chunks.push(normalized[start..end].iter().collect());
        if end == n {
            break;
        }
        start += step;
    }

    chunks
}
