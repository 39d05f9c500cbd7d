// SPDX-License-Identifier: Apache-2.0
//! Splits an agent reply that exceeds the transport's single-message limit
//! into multiple chunks, preferring structural boundaries over hard cuts.
//!
//! Boundary preference, most to least preferred:
//! 1. A blank line between paragraphs.
//! 2. A single newline.
//! 3. A hard cut at the character budget, never inside a multi-byte scalar.
//!
//! A fenced code block (```` ``` ````) that straddles a chunk boundary is
//! closed at the end of the chunk it was split out of and reopened (with
//! the same language tag) at the top of the next, so every chunk is
//! independently valid markdown even before metadata is attached.
//!
//! Splitting and metadata are deliberately two separate steps —
//! [`ChunkSplitter::split`] never adds a `(i/N)` marker or footer itself;
//! [`add_chunk_metadata`] does that once the final chunk count is known.

pub struct ChunkSplitter {
    max_len: usize,
}

impl ChunkSplitter {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Split `text` into chunks no longer than `max_len` scalar values each,
    /// minus `reserved_footer_len` headroom for metadata the caller will
    /// attach afterwards. Returns a single chunk if `text` already fits
    /// within `max_len` (the reservation only applies once splitting is
    /// actually necessary). Empty input returns no chunks.
    pub fn split(&self, text: &str, reserved_footer_len: usize) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        if text.chars().count() <= self.max_len {
            return vec![text.to_string()];
        }

        let budget = self.max_len.saturating_sub(reserved_footer_len).max(1);
        self.split_into_budget(text, budget)
    }

    fn split_into_budget(&self, text: &str, budget: usize) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut remaining = text;
        let mut open_fence_lang: Option<String> = None;

        while !remaining.is_empty() {
            if remaining.chars().count() <= budget {
                chunks.push(reopen_fence(&open_fence_lang, remaining));
                break;
            }

            let cut = find_cut_point(remaining, budget);
            let (head, tail) = split_at_char_boundary(remaining, cut);

            let was_open = open_fence_lang.is_some();
            let toggled = fence_count(head) % 2 == 1;
            let still_open_at_end = was_open != toggled;

            let mut emitted = reopen_fence(&open_fence_lang, head);
            if still_open_at_end {
                // The fence carries past this chunk's boundary: close it
                // here so this chunk is independently valid markdown, and
                // reopen it (with the same tag) at the top of the next.
                emitted.push_str("\n```");
            }
            chunks.push(emitted);
            remaining = tail.trim_start_matches('\n');

            open_fence_lang = if still_open_at_end {
                Some(if toggled {
                    fence_lang_of_last_open(head).unwrap_or_default()
                } else {
                    open_fence_lang.unwrap_or_default()
                })
            } else {
                None
            };
        }

        chunks
    }
}

/// Attach `(i/N)` positional markers and an optional footer to already-split
/// chunks. A single chunk gets only the footer (no positional marker); a
/// multi-chunk reply gets `(i/N)` on every chunk and the footer appended to
/// the last chunk, before its indicator. Empty input returns empty output.
pub fn add_chunk_metadata(chunks: Vec<String>, footer: Option<&str>) -> Vec<String> {
    let total = chunks.len();
    if total == 0 {
        return Vec::new();
    }
    if total == 1 {
        let mut chunk = chunks.into_iter().next().unwrap();
        if let Some(footer) = footer {
            chunk.push_str("\n\n");
            chunk.push_str(footer);
        }
        return vec![chunk];
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            if i + 1 == total {
                let mut last = chunk;
                if let Some(footer) = footer {
                    last.push_str("\n\n");
                    last.push_str(footer);
                }
                format!("{last} ({}/{})", i + 1, total)
            } else {
                format!("{chunk} ({}/{})", i + 1, total)
            }
        })
        .collect()
}

fn reopen_fence(open_fence_lang: &Option<String>, chunk: &str) -> String {
    match open_fence_lang {
        Some(lang) => format!("```{lang}\n{chunk}"),
        None => chunk.to_string(),
    }
}

/// Find the best cut point at or before `budget` characters: prefer a
/// blank-line paragraph boundary, then any newline, then a hard cut.
fn find_cut_point(text: &str, budget: usize) -> usize {
    let char_indices: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let limit_byte = char_indices.get(budget).copied().unwrap_or(text.len());
    let window = &text[..limit_byte];

    if let Some(pos) = window.rfind("\n\n") {
        if pos > 0 {
            return char_count(&text[..pos + 2]);
        }
    }
    if let Some(pos) = window.rfind('\n') {
        if pos > 0 {
            return char_count(&text[..pos + 1]);
        }
    }
    budget
}

fn char_count(s: &str) -> usize {
    s.chars().count()
}

fn split_at_char_boundary(text: &str, char_idx: usize) -> (&str, &str) {
    let byte_idx = text
        .char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text.split_at(byte_idx)
}

fn fence_count(s: &str) -> usize {
    s.matches("```").count()
}

/// The language tag declared on the last (odd-numbered) fence marker in
/// `chunk`, i.e. the one a fresh fence opened by this chunk itself.
fn fence_lang_of_last_open(chunk: &str) -> Option<String> {
    let last_open = chunk.rfind("```")?;
    let after = &chunk[last_open + 3..];
    Some(after.lines().next().unwrap_or("").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_splits_to_no_chunks() {
        let splitter = ChunkSplitter::new(100);
        assert!(splitter.split("", 16).is_empty());
    }

    #[test]
    fn text_within_budget_is_returned_unsplit() {
        let splitter = ChunkSplitter::new(100);
        let chunks = splitter.split("hello world", 16);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn long_text_is_split_on_paragraph_boundary() {
        let splitter = ChunkSplitter::new(40);
        let text = format!("{}\n\n{}", "a".repeat(20), "b".repeat(20));
        let chunks = splitter.split(&text, 16);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.chars().count() <= 40);
        }
    }

    #[test]
    fn hard_cut_never_splits_inside_a_multibyte_scalar() {
        let splitter = ChunkSplitter::new(10);
        let text = "é".repeat(50);
        let chunks = splitter.split(&text, 0);
        let rejoined: String = chunks.iter().flat_map(|c| c.chars()).collect();
        assert!(rejoined.chars().all(|ch| ch == 'é'));
    }

    #[test]
    fn open_fence_is_closed_then_reopened_across_the_boundary() {
        let splitter = ChunkSplitter::new(30);
        let body = "a".repeat(15);
        let text = format!("```rust\n{}\n{}\n```", body, body);
        let chunks = splitter.split(&text, 0);
        assert!(chunks.len() > 1);
        // The first chunk must itself be valid standalone markdown: an even
        // number of fence markers.
        assert_eq!(fence_count(&chunks[0]) % 2, 0);
        assert!(chunks[0].trim_end().ends_with("```"));
        assert!(chunks[1].starts_with("```rust"));
    }

    #[test]
    fn single_chunk_metadata_has_no_positional_marker() {
        let chunks = add_chunk_metadata(vec!["hello".to_string()], Some("— via bot"));
        assert_eq!(chunks, vec!["hello\n\n— via bot".to_string()]);
    }

    #[test]
    fn single_chunk_with_no_footer_is_unchanged() {
        let chunks = add_chunk_metadata(vec!["hello".to_string()], None);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn multi_chunk_gets_positional_markers_and_footer_on_last() {
        let chunks = add_chunk_metadata(
            vec!["one".to_string(), "two".to_string(), "three".to_string()],
            Some("— via bot"),
        );
        assert_eq!(chunks[0], "one (1/3)");
        assert_eq!(chunks[1], "two (2/3)");
        assert_eq!(chunks[2], "three\n\n— via bot (3/3)");
    }

    #[test]
    fn empty_chunk_list_metadata_is_empty() {
        assert!(add_chunk_metadata(Vec::new(), Some("footer")).is_empty());
    }
}
