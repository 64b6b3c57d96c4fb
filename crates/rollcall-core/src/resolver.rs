//! Identity resolution: assign detected faces to enrolled identities.
//!
//! Builds the N×M similarity matrix between query embeddings and the
//! enrolled gallery, then walks the query rows in input order, letting
//! each row claim its single best identity if that score clears the
//! threshold and nobody has claimed the identity yet.

use crate::types::Embedding;
use ndarray::Array2;
use thiserror::Error;

/// Minimum cosine similarity for a match (inclusive).
pub const DEFAULT_THRESHOLD: f32 = 0.40;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolverError {
    #[error("no enrolled identities in scope")]
    EmptyEnrollment,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("gallery has {actual} entries but the matrix has {expected} columns")]
    GalleryMismatch { expected: usize, actual: usize },
}

/// An enrolled identity's embedding, as handed to the resolver.
#[derive(Debug, Clone)]
pub struct EnrolledEmbedding {
    pub identity_id: String,
    pub embedding: Embedding,
}

/// A query row resolved to an identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Index of the query embedding in the input batch.
    pub query_index: usize,
    pub identity_id: String,
    /// Unrounded similarity score.
    pub confidence: f32,
}

/// Pairwise cosine similarity between query rows and gallery columns.
///
/// Every non-zero row is divided by its norm while stacking, so each cell is
/// a plain dot product. Zero vectors score 0.0 against everything.
#[derive(Debug, Clone)]
pub struct SimilarityMatrix {
    scores: Array2<f32>,
}

impl SimilarityMatrix {
    pub fn compute(queries: &[Embedding], gallery: &[EnrolledEmbedding]) -> Result<Self, ResolverError> {
        let dim = gallery.first().map(|g| g.embedding.dim()).unwrap_or(0);

        let gallery_matrix = stack(gallery.iter().map(|g| &g.embedding), gallery.len(), dim)?;
        let query_matrix = stack(queries.iter(), queries.len(), dim)?;

        Ok(Self {
            scores: query_matrix.dot(&gallery_matrix.t()),
        })
    }

    /// Number of query rows.
    pub fn rows(&self) -> usize {
        self.scores.nrows()
    }

    /// Number of gallery columns.
    pub fn cols(&self) -> usize {
        self.scores.ncols()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        self.scores.get((row, col)).copied()
    }

    /// Column with the highest score in `row`. The first column wins ties.
    pub fn best_in_row(&self, row: usize) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;
        for (col, &score) in self.scores.row(row).iter().enumerate() {
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((col, score)),
            }
        }
        best
    }
}

/// Pack embeddings into a row-major `rows × dim` matrix of unit rows,
/// checking dimensions.
fn stack<'a>(
    embeddings: impl Iterator<Item = &'a Embedding>,
    rows: usize,
    dim: usize,
) -> Result<Array2<f32>, ResolverError> {
    let mut flat = Vec::with_capacity(rows * dim);
    for embedding in embeddings {
        if embedding.dim() != dim {
            return Err(ResolverError::DimensionMismatch {
                expected: dim,
                actual: embedding.dim(),
            });
        }
        let norm = embedding.norm();
        if norm > 0.0 {
            flat.extend(embedding.values.iter().map(|v| v / norm));
        } else {
            flat.extend_from_slice(&embedding.values);
        }
    }
    let len = flat.len();
    Array2::from_shape_vec((rows, dim), flat).map_err(|_| ResolverError::DimensionMismatch {
        expected: rows * dim,
        actual: len,
    })
}

/// Strategy for resolving a batch of query embeddings against a gallery.
pub trait Resolver {
    fn resolve(&self, queries: &[Embedding], gallery: &[EnrolledEmbedding]) -> Result<Vec<Match>, ResolverError>;
}

/// Single-pass greedy resolver.
///
/// Rows are processed strictly in input order. A row whose best identity is
/// below threshold, or already claimed by an earlier row, produces no match;
/// there is no fallback to its second-best candidate. The result is therefore
/// order-dependent and not an optimal bipartite assignment.
#[derive(Debug, Clone, Copy)]
pub struct GreedyResolver {
    pub threshold: f32,
}

impl Default for GreedyResolver {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl GreedyResolver {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Sequential claim pass over a precomputed matrix.
    ///
    /// `gallery` must be the slice the matrix columns were computed from.
    pub fn claim(&self, matrix: &SimilarityMatrix, gallery: &[EnrolledEmbedding]) -> Result<Vec<Match>, ResolverError> {
        if gallery.len() != matrix.cols() {
            return Err(ResolverError::GalleryMismatch {
                expected: matrix.cols(),
                actual: gallery.len(),
            });
        }

        let mut claimed = vec![false; matrix.cols()];
        let mut matches = Vec::new();

        for row in 0..matrix.rows() {
            let Some((col, score)) = matrix.best_in_row(row) else {
                continue;
            };

            if score < self.threshold {
                tracing::debug!(row, score, "resolver: best score below threshold");
                continue;
            }
            if claimed[col] {
                tracing::debug!(
                    row,
                    identity = %gallery[col].identity_id,
                    score,
                    "resolver: identity already claimed"
                );
                continue;
            }

            claimed[col] = true;
            matches.push(Match {
                query_index: row,
                identity_id: gallery[col].identity_id.clone(),
                confidence: score,
            });
        }

        Ok(matches)
    }
}

impl Resolver for GreedyResolver {
    fn resolve(&self, queries: &[Embedding], gallery: &[EnrolledEmbedding]) -> Result<Vec<Match>, ResolverError> {
        if gallery.is_empty() {
            return Err(ResolverError::EmptyEnrollment);
        }
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let matrix = SimilarityMatrix::compute(queries, gallery)?;
        let matches = self.claim(&matrix, gallery)?;

        tracing::debug!(
            queries = queries.len(),
            gallery = gallery.len(),
            matched = matches.len(),
            threshold = self.threshold,
            "resolver: batch resolved"
        );

        Ok(matches)
    }
}
