//! Capture files: the per-face output of an external detector and embedder.
//!
//! ```json
//! {"faces": [{"embedding": [0.01, ...]}, {"error": "face too small"}]}
//! ```
//!
//! Each entry is one detected face region. An entry with `error` (or without
//! an embedding) is a face whose extraction failed.

use anyhow::{Context, Result};
use rollcall_core::{Embedding, EmbeddingExtractor, ExtractionError};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureFile {
    #[serde(default)]
    pub faces: Vec<CapturedFace>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapturedFace {
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub model_version: Option<String>,
}

impl CaptureFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading capture {}", path.display()))?;
        let capture: CaptureFile =
            serde_json::from_str(&raw).with_context(|| format!("parsing capture {}", path.display()))?;
        tracing::debug!(path = %path.display(), faces = capture.faces.len(), "capture loaded");
        Ok(capture)
    }

    /// The single embedding an enrollment capture must carry.
    pub fn single_embedding(self) -> Result<Embedding> {
        let mut extractor = PrecomputedExtractor;
        let mut usable = self.faces.iter().filter_map(|face| extractor.extract(face).ok());
        let first = usable.next().context("capture holds no usable face embedding")?;
        if usable.next().is_some() {
            anyhow::bail!("enrollment capture must hold exactly one face");
        }
        Ok(first)
    }
}

/// Reads embeddings that were already computed by the capture tool.
pub struct PrecomputedExtractor;

impl EmbeddingExtractor for PrecomputedExtractor {
    type Face = CapturedFace;

    fn extract(&mut self, face: &CapturedFace) -> Result<Embedding, ExtractionError> {
        if let Some(reason) = &face.error {
            return Err(ExtractionError(reason.clone()));
        }
        match &face.embedding {
            Some(values) => Ok(Embedding {
                values: values.clone(),
                model_version: face.model_version.clone(),
            }),
            None => Err(ExtractionError("no embedding".into())),
        }
    }
}
