//! Boundary to the external face feature extractor.
//!
//! Turning pixels into an embedding happens outside this crate. The core
//! only needs a fixed-length vector, or a reason there is none.

use crate::types::Embedding;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("no face in frame")]
    NoFace,
    #[error("more than one face in frame")]
    MultipleFaces,
    #[error("feature extraction failed: {0}")]
    Failed(String),
}

/// Produces a (not necessarily normalized) embedding from a face image.
pub trait FeatureExtractor {
    type Image;

    fn extract(&mut self, image: &Self::Image) -> Result<Embedding, ExtractError>;
}

/// What the extractor handed over for one identification attempt.
pub type Probe = Result<Embedding, ExtractError>;

/// Build a probe from a detector's face count and the embedding of the
/// single detected face.
pub fn probe_from_face_count(faces: u32, values: Vec<f32>) -> Probe {
    match faces {
        0 => Err(ExtractError::NoFace),
        1 => Ok(Embedding::new(values)),
        _ => Err(ExtractError::MultipleFaces),
    }
}
