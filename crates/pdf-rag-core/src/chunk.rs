//! Recursive character splitter and content-addressed chunk identity.
//!
//! Page text is cut into overlapping windows of at most `chunk_size`
//! characters. The splitter prefers paragraph breaks, then line breaks,
//! then spaces, and only falls back to single characters when a piece has
//! no separator at all. Adjacent pieces are merged back up to the size
//! limit, carrying up to `chunk_overlap` characters into the next window.
//!
//! Every window then receives a deterministic identifier:
//!
//! ```text
//! {source}:{page}:{chunk_index}:{sha256(text) prefix}
//! ```
//!
//! `chunk_index` counts windows within the same (source, page) run and
//! resets whenever that pair changes from the previous window. The same
//! input sequence in the same order always yields the same identifiers,
//! which is what makes re-ingestion a no-op. Reordering the input changes
//! indices, and with them the identifiers.
//!
//! # Example
//!
//! ```rust
//! use pdf_rag_core::chunk::{chunk_pages, ChunkingParams};
//! use pdf_rag_core::models::PageRecord;
//!
//! let pages = vec![PageRecord::new("guide.pdf", 1, "Hello world.")];
//! let chunks = chunk_pages(&pages, &ChunkingParams::default());
//! assert_eq!(chunks.len(), 1);
//! assert!(chunks[0].id.starts_with("guide.pdf:1:0:"));
//! ```

use std::collections::VecDeque;

use sha2::{Digest, Sha256};

use crate::models::{Chunk, PageRecord};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;
/// Length of a full hex SHA-256 digest.
pub const FULL_HASH_LEN: usize = 64;
pub const ID_DELIMITER: char = ':';

/// Tried in order; `""` splits into single characters.
const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

/// Splitter and identifier settings, decoupled from application config.
#[derive(Debug, Clone)]
pub struct ChunkingParams {
    /// Maximum window length in characters.
    pub chunk_size: usize,
    /// Characters carried over from the end of one window into the next.
    pub chunk_overlap: usize,
    /// Number of hex digest characters kept in the identifier (1..=64).
    /// Short prefixes trade collision resistance for brevity.
    pub id_hash_len: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            id_hash_len: FULL_HASH_LEN,
        }
    }
}

/// Split pages into windows and assign identifiers in one pass.
pub fn chunk_pages(pages: &[PageRecord], params: &ChunkingParams) -> Vec<Chunk> {
    let windows = split_pages(pages, params.chunk_size, params.chunk_overlap);
    assign_chunk_ids(&windows, params.id_hash_len)
}

/// Split every page into overlapping windows, preserving page order.
///
/// Each window keeps the source and page of the page it came from. Pages
/// with no text produce no windows.
pub fn split_pages(pages: &[PageRecord], chunk_size: usize, chunk_overlap: usize) -> Vec<PageRecord> {
    let mut windows = Vec::new();
    for page in pages {
        for text in split_text(&page.text, chunk_size, chunk_overlap) {
            windows.push(PageRecord {
                source: page.source.clone(),
                page: page.page,
                text,
            });
        }
    }
    windows
}

/// Split text into windows of at most `chunk_size` characters.
///
/// Windows are whitespace-trimmed and never empty.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    split_recursive(text, SEPARATORS, chunk_size.max(1), chunk_overlap)
}

fn split_recursive(
    text: &str,
    separators: &[&str],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    let mut separator = separators.last().copied().unwrap_or("");
    let mut finer: &[&str] = &[];
    for (i, sep) in separators.iter().enumerate() {
        if sep.is_empty() {
            separator = sep;
            break;
        }
        if text.contains(sep) {
            separator = sep;
            finer = &separators[i + 1..];
            break;
        }
    }

    let mut out = Vec::new();
    let mut fitting: Vec<&str> = Vec::new();

    for piece in split_keeping_separator(text, separator) {
        if char_len(piece) < chunk_size {
            fitting.push(piece);
            continue;
        }

        if !fitting.is_empty() {
            out.extend(merge_pieces(&fitting, chunk_size, chunk_overlap));
            fitting.clear();
        }

        if finer.is_empty() {
            let trimmed = piece.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        } else {
            out.extend(split_recursive(piece, finer, chunk_size, chunk_overlap));
        }
    }

    if !fitting.is_empty() {
        out.extend(merge_pieces(&fitting, chunk_size, chunk_overlap));
    }

    out
}

/// Split on `separator`, attaching each separator to the start of the
/// piece that follows it. Empty pieces are dropped.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > start {
            pieces.push(&text[start..idx]);
        }
        start = idx;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Greedily merge pieces into windows, then drop pieces from the front
/// until at most `chunk_overlap` characters remain to seed the next one.
fn merge_pieces(pieces: &[&str], chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let mut windows = Vec::new();
    let mut current: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for &piece in pieces {
        let len = char_len(piece);

        if total + len > chunk_size && !current.is_empty() {
            if let Some(window) = join_pieces(&current) {
                windows.push(window);
            }
            while total > chunk_overlap || (total > 0 && total + len > chunk_size) {
                match current.pop_front() {
                    Some(front) => total -= char_len(front),
                    None => break,
                }
            }
        }

        current.push_back(piece);
        total += len;
    }

    if let Some(window) = join_pieces(&current) {
        windows.push(window);
    }

    windows
}

fn join_pieces(pieces: &VecDeque<&str>) -> Option<String> {
    let joined: String = pieces.iter().copied().collect();
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Assign content-addressed identifiers to an ordered window sequence.
///
/// `hash_len` is clamped to `1..=64`.
pub fn assign_chunk_ids(windows: &[PageRecord], hash_len: usize) -> Vec<Chunk> {
    let hash_len = hash_len.clamp(1, FULL_HASH_LEN);
    let mut chunks = Vec::with_capacity(windows.len());
    let mut previous: Option<(&str, u32)> = None;
    let mut index = 0u32;

    for window in windows {
        let key = (window.source.as_str(), window.page);
        if previous == Some(key) {
            index += 1;
        } else {
            index = 0;
        }
        previous = Some(key);

        let hash = content_hash(&window.text);
        let id = chunk_id(&window.source, window.page, index, &hash[..hash_len]);

        chunks.push(Chunk {
            id,
            source: window.source.clone(),
            page: window.page,
            chunk_index: index,
            text: window.text.clone(),
            hash,
        });
    }

    chunks
}

/// Hex-encoded SHA-256 of the chunk text (UTF-8 bytes).
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compose an identifier from its parts.
pub fn chunk_id(source: &str, page: u32, chunk_index: u32, hash_prefix: &str) -> String {
    format!(
        "{source}{d}{page}{d}{chunk_index}{d}{hash_prefix}",
        d = ID_DELIMITER
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(source: &str, page: u32, text: &str) -> PageRecord {
        PageRecord::new(source, page, text)
    }

    #[test]
    fn test_small_text_single_window() {
        let windows = split_text("Hello, world!", 1000, 100);
        assert_eq!(windows, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_text_no_windows() {
        assert!(split_text("", 1000, 100).is_empty());
        assert!(split_text("   \n\n  ", 1000, 100).is_empty());
    }

    #[test]
    fn test_word_windows_overlap() {
        let windows = split_text("aaaa bbbb cccc dddd", 10, 5);
        assert_eq!(windows, vec!["aaaa bbbb", "bbbb cccc", "cccc dddd"]);
    }

    #[test]
    fn test_paragraphs_preferred() {
        let text = "First paragraph here.\n\nSecond paragraph here.";
        let windows = split_text(text, 30, 0);
        assert_eq!(
            windows,
            vec!["First paragraph here.", "Second paragraph here."]
        );
    }

    #[test]
    fn test_windows_respect_size_limit() {
        let text = (0..200)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        for window in split_text(&text, 50, 10) {
            assert!(window.chars().count() <= 50, "too long: {}", window);
        }
    }

    #[test]
    fn test_unbroken_text_falls_back_to_characters() {
        let text = "x".repeat(25);
        let windows = split_text(&text, 10, 0);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2], "xxxxx");
    }

    #[test]
    fn test_multibyte_text_counts_characters() {
        let text = "ééééé ééééé";
        let windows = split_text(text, 5, 0);
        assert_eq!(windows, vec!["ééééé", "ééééé"]);
    }

    #[test]
    fn test_split_pages_keeps_page_metadata() {
        let pages = vec![page("a.pdf", 1, "one two three"), page("a.pdf", 2, "")];
        let windows = split_pages(&pages, 8, 0);
        assert!(windows.iter().all(|w| w.source == "a.pdf" && w.page == 1));
        assert_eq!(windows.len(), 2);
    }

    #[test]
    fn test_id_format() {
        let chunks = assign_chunk_ids(&[page("data/file.pdf", 10, "body")], 8);
        let hash = content_hash("body");
        assert_eq!(chunks[0].id, format!("data/file.pdf:10:0:{}", &hash[..8]));
        assert_eq!(chunks[0].hash, hash);
    }

    #[test]
    fn test_index_increments_and_resets() {
        let windows = vec![
            page("a.pdf", 1, "w1"),
            page("a.pdf", 1, "w2"),
            page("a.pdf", 2, "w3"),
            page("b.pdf", 2, "w4"),
            page("b.pdf", 2, "w5"),
            page("a.pdf", 1, "w6"),
        ];
        let indices: Vec<u32> = assign_chunk_ids(&windows, 64)
            .iter()
            .map(|c| c.chunk_index)
            .collect();
        assert_eq!(indices, vec![0, 1, 0, 0, 1, 0]);
    }

    #[test]
    fn test_ids_stable_across_runs() {
        let pages = vec![
            page("a.pdf", 1, "Alpha\n\nBeta\n\nGamma\n\nDelta"),
            page("a.pdf", 2, "Epsilon"),
        ];
        let params = ChunkingParams {
            chunk_size: 8,
            chunk_overlap: 0,
            id_hash_len: 64,
        };
        let first = chunk_pages(&pages, &params);
        let second = chunk_pages(&pages, &params);
        assert_eq!(first, second);
    }

    #[test]
    fn test_same_position_different_content_differs() {
        let a = assign_chunk_ids(&[page("a.pdf", 1, "3 + 4 = 7")], 8);
        let b = assign_chunk_ids(&[page("a.pdf", 1, "3 + 4 = 8")], 8);
        assert_eq!(a[0].chunk_index, b[0].chunk_index);
        assert_ne!(a[0].id, b[0].id);
    }

    #[test]
    fn test_reordering_changes_ids() {
        let forward = vec![page("a.pdf", 1, "first"), page("a.pdf", 1, "second")];
        let reversed = vec![page("a.pdf", 1, "second"), page("a.pdf", 1, "first")];
        let f = assign_chunk_ids(&forward, 64);
        let r = assign_chunk_ids(&reversed, 64);
        assert_ne!(f[0].id, r[1].id);
    }

    #[test]
    fn test_hash_len_clamped() {
        let long = assign_chunk_ids(&[page("a.pdf", 1, "x")], 500);
        assert!(long[0].id.ends_with(&content_hash("x")));
        let short = assign_chunk_ids(&[page("a.pdf", 1, "x")], 0);
        assert_eq!(short[0].id.rsplit(':').next().map(str::len), Some(1));
    }
}
