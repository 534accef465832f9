//! Recursive character text splitting.
//!
//! Splits on a separator hierarchy, preferring larger structural breaks
//! (paragraphs, then lines, then sentence punctuation, then words) and only
//! falling back to a raw character window when nothing else fits. Adjacent
//! small pieces are merged back up to the chunk size, with a configurable
//! character overlap carried between consecutive chunks.

/// Separator hierarchy shared by all intelligence collections. Includes the
/// CJK sentence terminators the upstream feeds carry.
pub const DEFAULT_SEPARATORS: [&str; 7] = ["\n\n", "\n", "。", "！", "？", ". ", " "];

#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Splits text into chunks no longer than `chunk_size` characters.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let pieces = self.split_recursive(text, 0);
        let merged = self.merge_pieces(pieces);
        merged
            .into_iter()
            .map(|chunk| chunk.trim().to_string())
            .filter(|chunk| !chunk.is_empty())
            .collect()
    }

    /// Breaks text into pieces each at most `chunk_size` long, descending
    /// the separator hierarchy for oversized pieces.
    fn split_recursive(&self, text: &str, separator_index: usize) -> Vec<String> {
        if char_len(text) <= self.chunk_size {
            return vec![text.to_string()];
        }
        let Some(separator) = self.separators.get(separator_index) else {
            return self.window_split(text);
        };

        let parts = split_keep_separator(text, separator);
        if parts.len() <= 1 {
            return self.split_recursive(text, separator_index + 1);
        }

        let mut pieces = Vec::new();
        for part in parts {
            if char_len(&part) <= self.chunk_size {
                pieces.push(part);
            } else {
                pieces.extend(self.split_recursive(&part, separator_index + 1));
            }
        }
        pieces
    }

    /// Raw character window with overlap; the last resort.
    fn window_split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let step = (self.chunk_size - self.chunk_overlap).max(1);
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += step;
        }
        chunks
    }

    /// Greedily merges consecutive pieces into chunks up to `chunk_size`,
    /// retaining a tail of up to `chunk_overlap` characters between chunks.
    fn merge_pieces(&self, pieces: Vec<String>) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: Vec<String> = Vec::new();
        let mut window_len = 0usize;

        for piece in pieces {
            let piece_len = char_len(&piece);
            if window_len + piece_len > self.chunk_size && !window.is_empty() {
                chunks.push(window.concat());
                // Keep the trailing pieces as overlap for the next chunk
                while window_len > self.chunk_overlap
                    || (window_len + piece_len > self.chunk_size && !window.is_empty())
                {
                    let removed = window.remove(0);
                    window_len -= char_len(&removed);
                    if window.is_empty() {
                        break;
                    }
                }
            }
            window_len += piece_len;
            window.push(piece);
        }
        if !window.is_empty() {
            chunks.push(window.concat());
        }
        chunks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Splits on a separator, keeping the separator attached to the preceding
/// part so nothing is lost when pieces are re-joined.
fn split_keep_separator(text: &str, separator: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(separator) {
        let end = pos + separator.len();
        parts.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        parts.push(rest.to_string());
    }
    parts.retain(|p| !p.is_empty());
    parts
}
