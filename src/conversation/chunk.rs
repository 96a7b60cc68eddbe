//! Boundary-aware text splitter.
//!
//! Chunks are contiguous slices of the input, so concatenating them gives the
//! input back byte for byte. Within the budget a cut prefers, in order: a
//! paragraph break, a line break, a sentence end, a word boundary. Only when
//! none of those exists is the text cut at the budget itself, and even then
//! on a UTF-8 char boundary.

/// Approximate chars-per-token ratio used to size chunks
pub const CHARS_PER_TOKEN: usize = 4;

/// Split `text` into chunks of at most `max_chars` characters.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        // Byte offset just past the last char that still fits
        let window_end = match remaining.char_indices().nth(max_chars) {
            Some((idx, _)) => idx,
            None => {
                chunks.push(remaining.to_string());
                break;
            }
        };

        let cut = best_cut(&remaining[..window_end]).unwrap_or(window_end);
        chunks.push(remaining[..cut].to_string());
        remaining = &remaining[cut..];
    }

    chunks
}

/// Split `text` using a token budget
pub fn split_by_tokens(text: &str, max_tokens: usize) -> Vec<String> {
    split_text(text, max_tokens.saturating_mul(CHARS_PER_TOKEN))
}

/// Latest preferred boundary inside `window`, as a byte offset > 0
fn best_cut(window: &str) -> Option<usize> {
    let positive = |cut: usize| (cut > 0).then_some(cut);

    if let Some(pos) = window.rfind("\n\n") {
        if let Some(cut) = positive(pos + 2) {
            return Some(cut);
        }
    }

    if let Some(pos) = window.rfind('\n') {
        if let Some(cut) = positive(pos + 1) {
            return Some(cut);
        }
    }

    if let Some(cut) = last_sentence_end(window) {
        return Some(cut);
    }

    window
        .char_indices()
        .filter(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8())
        .last()
}

/// Offset just after the whitespace following the last `.`, `!` or `?`
fn last_sentence_end(window: &str) -> Option<usize> {
    let mut found = None;
    let mut prev_terminal = false;

    for (i, c) in window.char_indices() {
        if prev_terminal && c.is_whitespace() {
            found = Some(i + c.len_utf8());
        }
        prev_terminal = matches!(c, '.' | '!' | '?');
    }

    found
}
