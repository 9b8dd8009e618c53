//! In-memory vector index with diversity-aware retrieval.
//!
//! The index lives for one run: ingest fills it, the retriever drains it,
//! nothing is persisted. Selection uses maximum marginal relevance so the
//! chunks handed to the model cover different parts of the evidence instead
//! of five near-copies of the top hit.

use ragpipe_core::Chunk;

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_MMR_LAMBDA: f32 = 0.3;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub relevance: f32,
}

#[derive(Debug, Default)]
pub struct ChunkIndex {
    entries: Vec<(Chunk, Vec<f32>)>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, chunk: Chunk, vector: Vec<f32>) {
        self.entries.push((chunk, vector));
    }

    /// Plain relevance ranking: score desc, insertion order on ties.
    pub fn top_k(&self, query: &[f32], k: usize) -> Vec<RetrievedChunk> {
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (_, v))| (i, cosine_similarity(query, v)))
            .collect();

        // Stable: score desc, then insertion index asc.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(i, score)| RetrievedChunk {
                chunk: self.entries[i].0.clone(),
                relevance: score,
            })
            .collect()
    }

    /// Maximum-marginal-relevance selection.
    ///
    /// Greedily picks the unselected chunk maximizing
    /// `lambda * relevance - (1 - lambda) * max_similarity(selected)` until
    /// `k` chunks are chosen or the index runs out. `lambda = 1.0` reduces to
    /// [`top_k`](Self::top_k); `lambda = 0.0` ignores relevance and spreads
    /// the picks apart. Ties go to the earlier-inserted chunk, so the output
    /// is deterministic for a given index and query.
    pub fn mmr(&self, query: &[f32], k: usize, lambda: f32) -> Vec<RetrievedChunk> {
        let lambda = lambda.clamp(0.0, 1.0);
        if self.entries.is_empty() || k == 0 {
            return Vec::new();
        }

        let relevance: Vec<f32> = self
            .entries
            .iter()
            .map(|(_, v)| cosine_similarity(query, v))
            .collect();

        let mut selected: Vec<usize> = Vec::with_capacity(k.min(self.entries.len()));
        let mut remaining: Vec<usize> = (0..self.entries.len()).collect();

        while selected.len() < k && !remaining.is_empty() {
            let mut best_pos = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for (pos, &idx) in remaining.iter().enumerate() {
                let max_sim = selected
                    .iter()
                    .map(|&s| cosine_similarity(&self.entries[idx].1, &self.entries[s].1))
                    .reduce(f32::max);
                // The redundancy term keeps its sign: anti-similar
                // candidates score above orthogonal ones. No term at all
                // until something is selected.
                let score = match max_sim {
                    Some(sim) => lambda * relevance[idx] - (1.0 - lambda) * sim,
                    None => lambda * relevance[idx],
                };
                // Strict > keeps the earliest index on ties.
                if score > best_score {
                    best_score = score;
                    best_pos = pos;
                }
            }
            selected.push(remaining.remove(best_pos));
        }

        selected
            .into_iter()
            .map(|i| RetrievedChunk {
                chunk: self.entries[i].0.clone(),
                relevance: relevance[i],
            })
            .collect()
    }
}
