//! Pattern indexing: successful interactions as searchable exemplars.
//!
//! Embeddings are pluggable behind [`Embedder`]; the default is a hashed
//! token bag. Search is exact cosine over bounded per-spectrum buckets;
//! approximate indexes can slot in behind the same query surface later.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::quality::QualityRecord;
use crate::trace::Spectrum;
use crate::util::stable_hash64;

/// Admission gate: only near-perfect interactions become patterns.
pub const ADMIT_THRESHOLD: f64 = 0.95;

/// Per-spectrum index capacity.
pub const SPECTRUM_CAP: usize = 1_000;

/// Default number of neighbors returned by a query.
pub const DEFAULT_K: usize = 5;

/// Minimum cosine similarity for query results.
pub const QUERY_THRESHOLD: f32 = 0.85;

/// Pluggable text embedder producing fixed-dimension vectors.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    /// Embed text into a vector of `dimension()` components. Vectors are
    /// L2-normalized so cosine similarity reduces to a dot product.
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Hashed token-bag embedder.
///
/// Tokens are lowercased alphanumeric runs; each token hashes into one
/// of `dim` buckets and the count vector is L2-normalized.
pub struct HashedEmbedder {
    dim: usize,
}

impl HashedEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashedEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (stable_hash64(token) % self.dim as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

/// Cosine similarity. Assumes normalized inputs from [`Embedder::embed`].
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// A successful interaction exemplar.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub pattern_id: Uuid,
    pub embedding: Vec<f32>,
    /// Trace that produced this exemplar.
    pub exemplar_ref: Uuid,
    pub exemplar_text: String,
    pub score: f64,
    pub spectrum: Spectrum,
    pub success_count: u64,
    pub applied_count: u64,
    pub created_at: DateTime<Utc>,
}

/// One query hit.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern_id: Uuid,
    pub exemplar_ref: Uuid,
    pub exemplar_text: String,
    pub similarity: f32,
    pub score: f64,
}

/// Per-spectrum exemplar index.
///
/// Reader-writer discipline: queries take the read lock, admission and
/// bookkeeping take the write lock briefly. The lock is never held
/// across an await point.
pub struct PatternIndex {
    embedder: std::sync::Arc<dyn Embedder>,
    buckets: RwLock<HashMap<Spectrum, Vec<Pattern>>>,
    capacity: usize,
}

impl PatternIndex {
    pub fn new(embedder: std::sync::Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            buckets: RwLock::new(HashMap::new()),
            capacity: SPECTRUM_CAP,
        }
    }

    #[cfg(test)]
    fn with_capacity(embedder: std::sync::Arc<dyn Embedder>, capacity: usize) -> Self {
        Self {
            embedder,
            buckets: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// Admit a quality record as a pattern. Records below the admission
    /// threshold are filtered, not errors. When a bucket is full the
    /// least-applied pattern is evicted.
    pub fn admit(&self, record: &QualityRecord, exemplar_text: &str) -> Option<Uuid> {
        if record.score < ADMIT_THRESHOLD {
            return None;
        }
        let pattern = Pattern {
            pattern_id: Uuid::new_v4(),
            embedding: self.embedder.embed(exemplar_text),
            exemplar_ref: record.trace_id,
            exemplar_text: exemplar_text.to_string(),
            score: record.score,
            spectrum: record.spectrum,
            success_count: 1,
            applied_count: 0,
            created_at: Utc::now(),
        };
        let id = pattern.pattern_id;

        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(record.spectrum).or_default();
        if bucket.len() >= self.capacity {
            // Evict the least-applied pattern; oldest wins ties.
            if let Some(idx) = bucket
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| (p.applied_count, p.created_at))
                .map(|(idx, _)| idx)
            {
                bucket.swap_remove(idx);
            }
        }
        bucket.push(pattern);
        Some(id)
    }

    /// Nearest patterns to `text` within a spectrum, best first.
    pub fn query(&self, spectrum: Spectrum, text: &str, k: usize) -> Vec<PatternMatch> {
        let embedding = self.embedder.embed(text);
        self.query_embedding(spectrum, &embedding, k, QUERY_THRESHOLD)
    }

    /// Nearest patterns to a precomputed embedding.
    pub fn query_embedding(
        &self,
        spectrum: Spectrum,
        embedding: &[f32],
        k: usize,
        threshold: f32,
    ) -> Vec<PatternMatch> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        let Some(bucket) = buckets.get(&spectrum) else {
            return Vec::new();
        };
        let mut matches: Vec<PatternMatch> = bucket
            .iter()
            .filter_map(|p| {
                let similarity = cosine(&p.embedding, embedding);
                (similarity >= threshold).then(|| PatternMatch {
                    pattern_id: p.pattern_id,
                    exemplar_ref: p.exemplar_ref,
                    exemplar_text: p.exemplar_text.clone(),
                    similarity,
                    score: p.score,
                })
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(k.max(1));
        matches
    }

    /// Highest-scoring patterns for a spectrum, best first. Used by the
    /// optimizer to pick grounding exemplars without a query text.
    pub fn top(&self, spectrum: Spectrum, k: usize) -> Vec<PatternMatch> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        let Some(bucket) = buckets.get(&spectrum) else {
            return Vec::new();
        };
        let mut patterns: Vec<&Pattern> = bucket.iter().collect();
        patterns.sort_by(|a, b| b.score.total_cmp(&a.score));
        patterns
            .into_iter()
            .take(k.max(1))
            .map(|p| PatternMatch {
                pattern_id: p.pattern_id,
                exemplar_ref: p.exemplar_ref,
                exemplar_text: p.exemplar_text.clone(),
                similarity: 1.0,
                score: p.score,
            })
            .collect()
    }

    /// Record that a pattern was applied in an optimization.
    pub fn mark_applied(&self, pattern_id: Uuid) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        for bucket in buckets.values_mut() {
            if let Some(pattern) = bucket.iter_mut().find(|p| p.pattern_id == pattern_id) {
                pattern.applied_count += 1;
                return;
            }
        }
    }

    pub fn len(&self, spectrum: Spectrum) -> usize {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets.get(&spectrum).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets.values().map(Vec::len).sum()
    }
}
