//! Deterministic sliding-window segmentation with page mapping.
//!
//! All offsets are counted in characters, not bytes; slicing maps char
//! indices to byte offsets once per run so multi-byte text never splits
//! inside a code point.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap_percent: usize,
}

impl ChunkingConfig {
    /// Overlap in characters: `floor(chunk_size × overlap_percent / 100)`.
    pub fn overlap(&self) -> usize {
        self.chunk_size * self.overlap_percent / 100
    }
}

/// Half-open character range `[char_start, char_end)` of one page within the
/// full OCR text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageOffset {
    pub page: i64,
    pub char_start: usize,
    pub char_end: usize,
}

/// One emitted window, before it becomes a stored Chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct TextWindow {
    pub index: usize,
    pub char_start: usize,
    /// Exclusive.
    pub char_end: usize,
    pub text: String,
    pub overlap_previous: usize,
    pub overlap_next: usize,
    pub page_number: Option<i64>,
    pub page_range: Option<String>,
}

/// Segment `text` into overlapping windows.
///
/// Window starts advance by `chunk_size − overlap`; emission stops after the
/// first window whose end reaches the text length. Empty input yields no
/// windows.
pub fn chunk_text(
    text: &str,
    cfg: &ChunkingConfig,
    page_offsets: Option<&[PageOffset]>,
) -> Vec<TextWindow> {
    if text.is_empty() || cfg.chunk_size == 0 {
        return Vec::new();
    }

    // Byte offset of every char boundary, plus the terminal boundary.
    let mut boundaries: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
    boundaries.push(text.len());
    let total_chars = boundaries.len() - 1;

    let overlap = cfg.overlap();
    let step = cfg.chunk_size.saturating_sub(overlap).max(1);

    let mut windows = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + cfg.chunk_size).min(total_chars);
        let slice = &text[boundaries[start]..boundaries[end]];
        let index = windows.len();
        let (page_number, page_range) = map_pages(start, end, page_offsets);
        windows.push(TextWindow {
            index,
            char_start: start,
            char_end: end,
            text: slice.to_string(),
            overlap_previous: if index > 0 { overlap } else { 0 },
            overlap_next: 0, // fixed up below once the follower is known
            page_number,
            page_range,
        });
        if end >= total_chars {
            break;
        }
        start += step;
    }

    let last = windows.len() - 1;
    for w in &mut windows[..last] {
        w.overlap_next = overlap;
    }

    windows
}

/// Pages whose range intersects `[start, end)`. A single page sets
/// `page_number`; a span sets `page_number = min` and `page_range = "a-b"`.
fn map_pages(
    start: usize,
    end: usize,
    page_offsets: Option<&[PageOffset]>,
) -> (Option<i64>, Option<String>) {
    let Some(pages) = page_offsets else {
        return (None, None);
    };
    let hit: Vec<i64> = pages
        .iter()
        .filter(|p| p.char_start < end && p.char_end > start)
        .map(|p| p.page)
        .collect();
    match (hit.iter().min(), hit.iter().max()) {
        (Some(&lo), Some(&hi)) if lo == hi => (Some(lo), None),
        (Some(&lo), Some(&hi)) => (Some(lo), Some(format!("{lo}-{hi}"))),
        _ => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(chunk_size: usize, overlap_percent: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            overlap_percent,
        }
    }

    /// Rebuild the input from chunk 0 plus each follower minus its leading
    /// overlap. Any drift here is a chunker bug.
    fn reconstruct(windows: &[TextWindow], overlap: usize) -> String {
        let mut out = String::new();
        for (i, w) in windows.iter().enumerate() {
            if i == 0 {
                out.push_str(&w.text);
            } else {
                out.extend(w.text.chars().skip(overlap));
            }
        }
        out
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", &cfg(2000, 10), None).is_empty());
    }

    #[test]
    fn short_input_is_a_single_chunk_without_overlap() {
        let windows = chunk_text("hello world", &cfg(2000, 10), None);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].char_start, 0);
        assert_eq!(windows[0].char_end, 11);
        assert_eq!(windows[0].overlap_previous, 0);
        assert_eq!(windows[0].overlap_next, 0);
    }

    #[test]
    fn seven_thousand_six_hundred_chars_make_five_windows() {
        let text: String = std::iter::repeat("abcdefghij").take(760).collect();
        assert_eq!(text.chars().count(), 7600);

        let windows = chunk_text(&text, &cfg(2000, 10), None);
        assert_eq!(windows.len(), 5);

        let starts: Vec<usize> = windows.iter().map(|w| w.char_start).collect();
        assert_eq!(starts, vec![0, 1800, 3600, 5400, 7200]);
        assert_eq!(windows[4].char_end, 7600);

        assert_eq!(windows[0].overlap_previous, 0);
        assert_eq!(windows[0].overlap_next, 200);
        for w in &windows[1..4] {
            assert_eq!(w.overlap_previous, 200);
            assert_eq!(w.overlap_next, 200);
        }
        assert_eq!(windows[4].overlap_previous, 200);
        assert_eq!(windows[4].overlap_next, 0);
    }

    #[test]
    fn reconstruction_and_overlap_identity_hold() {
        let text: String = (0..5000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let c = cfg(700, 20);
        let overlap = c.overlap();
        let windows = chunk_text(&text, &c, None);

        assert_eq!(reconstruct(&windows, overlap), text);

        for pair in windows.windows(2) {
            let tail: String = pair[0]
                .text
                .chars()
                .skip(pair[0].text.chars().count() - overlap)
                .collect();
            let head: String = pair[1].text.chars().take(overlap).collect();
            assert_eq!(tail, head, "adjacent overlap bytes must be identical");
        }
    }

    #[test]
    fn multibyte_text_slices_on_char_boundaries() {
        let text: String = std::iter::repeat('é').take(450).collect();
        let windows = chunk_text(&text, &cfg(200, 10), None);
        assert!(windows.len() > 1);
        assert_eq!(reconstruct(&windows, 20), text);
        for w in &windows {
            assert_eq!(w.text.chars().count(), w.char_end - w.char_start);
        }
    }

    #[test]
    fn zero_overlap_tiles_exactly() {
        let text: String = std::iter::repeat('x').take(1000).collect();
        let windows = chunk_text(&text, &cfg(300, 0), None);
        let starts: Vec<usize> = windows.iter().map(|w| w.char_start).collect();
        assert_eq!(starts, vec![0, 300, 600, 900]);
        assert!(windows.iter().all(|w| w.overlap_previous == 0));
        assert_eq!(reconstruct(&windows, 0), text);
    }

    #[test]
    fn page_mapping_single_and_spanning() {
        let text: String = std::iter::repeat('x').take(1000).collect();
        let pages = vec![
            PageOffset { page: 1, char_start: 0, char_end: 400 },
            PageOffset { page: 2, char_start: 400, char_end: 800 },
            PageOffset { page: 3, char_start: 800, char_end: 1000 },
        ];
        let windows = chunk_text(&text, &cfg(300, 0), Some(&pages));

        // [0,300) sits entirely inside page 1.
        assert_eq!(windows[0].page_number, Some(1));
        assert_eq!(windows[0].page_range, None);

        // [300,600) straddles pages 1 and 2.
        assert_eq!(windows[1].page_number, Some(1));
        assert_eq!(windows[1].page_range, Some("1-2".to_string()));

        // [900,1000) is page 3 only.
        assert_eq!(windows[3].page_number, Some(3));
        assert_eq!(windows[3].page_range, None);
    }
}
