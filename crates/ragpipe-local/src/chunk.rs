use ragpipe_core::{Chunk, Document, Error, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Fixed-size character windows with overlap.
///
/// Windows are measured in characters, never splitting a UTF-8 scalar.
/// Chunking is deterministic: the same text and knobs always produce
/// byte-identical chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::NotConfigured("chunk size must be > 0".to_string()));
        }
        if overlap >= size {
            return Err(Error::NotConfigured(format!(
                "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn chunk_document(&self, doc: &Document) -> Vec<Chunk> {
        self.chunk_text(&doc.text, &doc.url)
    }

    pub fn chunk_text(&self, text: &str, source_url: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return Vec::new();
        }
        // Byte offset of every char start, so windows slice on scalar bounds.
        let bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        let n_chars = bounds.len();
        let byte_at = |char_pos: usize| -> usize {
            if char_pos >= n_chars {
                text.len()
            } else {
                bounds[char_pos]
            }
        };

        let stride = self.size - self.overlap;
        let mut out = Vec::new();
        let mut start = 0usize;
        let mut position = 0usize;
        loop {
            let end = (start + self.size).min(n_chars);
            out.push(Chunk {
                text: text[byte_at(start)..byte_at(end)].to_string(),
                source_url: source_url.to_string(),
                position,
            });
            if end >= n_chars {
                break;
            }
            start += stride;
            position += 1;
        }
        out
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}
