//! Boundary-aware overlapping text chunker.
//!
//! Splits document text into [`Chunk`]s no longer than `chunk_size`
//! bytes, preferring paragraph boundaries (`\n\n`), then line breaks,
//! then sentence ends, then word boundaries before falling back to a
//! hard split. Consecutive chunks share up to `overlap` bytes of
//! boundary text so context is not lost at split points.
//!
//! Invariants:
//! - chunk indices are contiguous starting at 0;
//! - `chunks[i].text == &text[chunks[i].start..chunks[i].end]`;
//! - `chunks[i+1].start <= chunks[i].end` (full coverage, no gaps);
//! - every chunk's text length is `<= chunk_size`, except when a single
//!   character is wider than `chunk_size` in bytes — that character
//!   becomes a chunk of its own rather than being split mid-sequence.
//!
//! Lengths are measured in bytes; all splits land on UTF-8 character
//! boundaries.

use uuid::Uuid;

use crate::error::ConfigError;

/// One contiguous slice of a document, sized for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    /// Byte offset of the chunk's first character in the source text.
    pub start: usize,
    /// Byte offset one past the chunk's last character.
    pub end: usize,
    /// Monotonic position of the chunk within its document.
    pub index: usize,
}

/// Split `text` into overlapping chunks.
///
/// `chunk_size` and `overlap` are validated here as well as at config
/// load time, since this function is also usable standalone.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<Chunk>, ConfigError> {
    if chunk_size == 0 {
        return Err(ConfigError::NonPositive {
            field: "chunking.chunk_size",
        });
    }
    if overlap >= chunk_size {
        return Err(ConfigError::ChunkOverlap {
            chunk_size,
            overlap,
        });
    }

    let len = text.len();
    if len <= chunk_size {
        return Ok(vec![make_chunk(text, 0, len, 0)]);
    }

    let mut chunks = Vec::new();
    let mut pos = 0usize;
    let mut index = 0usize;

    while pos < len {
        let mut cap = floor_char_boundary(text, (pos + chunk_size).min(len));
        if cap <= pos {
            // chunk_size is narrower than the next character; take the
            // whole character so the loop always advances.
            cap = ceil_char_boundary(text, pos + 1);
        }
        let end = if cap == len {
            len
        } else {
            find_break(text, pos, cap)
        };

        chunks.push(make_chunk(text, pos, end, index));
        index += 1;

        if end == len {
            break;
        }

        // Step back by the overlap, but always make forward progress.
        let mut next = floor_char_boundary(text, end.saturating_sub(overlap));
        if next <= pos {
            next = end;
        }
        pos = next;
    }

    Ok(chunks)
}

/// Pick the best split point in `(pos, cap]`, searching backwards for a
/// paragraph break, then a line break, then a sentence end, then a space.
/// Falls back to a hard split at `cap` when nothing better exists.
fn find_break(text: &str, pos: usize, cap: usize) -> usize {
    let window = &text[pos..cap];

    // Paragraph boundary: split after the blank line.
    if let Some(at) = window.rfind("\n\n") {
        if at > 0 {
            return pos + at + 2;
        }
    }
    if let Some(at) = window.rfind('\n') {
        if at > 0 {
            return pos + at + 1;
        }
    }
    if let Some(at) = window.rfind(". ") {
        if at > 0 {
            return pos + at + 2;
        }
    }
    if let Some(at) = window.rfind(' ') {
        if at > 0 {
            return pos + at + 1;
        }
    }
    cap
}

/// Largest index `<= at` that lands on a character boundary.
fn floor_char_boundary(text: &str, mut at: usize) -> usize {
    while at > 0 && !text.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Smallest index `>= at` that lands on a character boundary.
fn ceil_char_boundary(text: &str, mut at: usize) -> usize {
    while at < text.len() && !text.is_char_boundary(at) {
        at += 1;
    }
    at
}

fn make_chunk(text: &str, start: usize, end: usize, index: usize) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        text: text[start..end].to_string(),
        start,
        end,
        index,
    }
}
