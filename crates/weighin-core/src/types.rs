use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("degenerate embedding: zero or non-finite norm")]
    Degenerate,
    #[error("embedding blob length {0} is not a multiple of 4")]
    BadBlob(usize),
}

/// Opaque identity key.
///
/// `Ord` is numeric `i64` order, not the order of the decimal strings
/// (`IdentityId(4) < IdentityId(11)`). It is the tie-break order used when
/// two cache entries match a probe equally well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row id assigned by persistence to a stored measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementId(pub i64);

/// Face embedding vector (128-dimensional by default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Return an L2-normalized copy.
    ///
    /// A zero or non-finite norm yields [`EmbeddingError::Degenerate`] and
    /// `self` is left untouched.
    pub fn normalize(&self) -> Result<Embedding, EmbeddingError> {
        let norm = self.norm();
        if norm == 0.0 || !norm.is_finite() {
            return Err(EmbeddingError::Degenerate);
        }
        Ok(Embedding {
            values: self.values.iter().map(|x| x / norm).collect(),
        })
    }

    pub fn is_normalized(&self, tolerance: f32) -> bool {
        (self.norm() - 1.0).abs() <= tolerance
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Fails on a length mismatch. A zero-norm operand scores 0.
    pub fn cosine_similarity(&self, other: &Embedding) -> Result<f32, EmbeddingError> {
        if self.values.len() != other.values.len() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 && denom.is_finite() {
            Ok((dot / denom).clamp(-1.0, 1.0))
        } else {
            Ok(0.0)
        }
    }

    /// Little-endian f32 encoding used for storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Embedding, EmbeddingError> {
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingError::BadBlob(bytes.len()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Embedding { values })
    }
}

/// An enrolled person as held by persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: IdentityId,
    pub display_name: String,
    /// `None` for rows enrolled before an embedding was captured.
    pub embedding: Option<Embedding>,
    pub enrolled_at: DateTime<Utc>,
}

/// One raw reading from the scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSample {
    /// Kilograms.
    pub value: f32,
    pub observed_at: Instant,
}

impl WeightSample {
    pub fn new(value: f32, observed_at: Instant) -> Self {
        Self { value, observed_at }
    }
}

/// A committed weight reading for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub identity_id: IdentityId,
    pub weight: f32,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[1.0, 0.0, 0.0]);
        assert!((a.cosine_similarity(&b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!(a.cosine_similarity(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.cosine_similarity(&b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.cosine_similarity(&b).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_similarity_dimension_mismatch() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(
            a.cosine_similarity(&b),
            Err(EmbeddingError::DimensionMismatch { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn test_self_similarity_of_normalized_vectors() {
        let raws: [&[f32]; 4] = [
            &[3.0, 4.0],
            &[0.1, -0.2, 0.3, 0.9],
            &[1e-3, 2e-3, -5e-4],
            &[12.0, -7.5, 0.25, 100.0, -3.0],
        ];
        for raw in raws {
            let v = emb(raw).normalize().unwrap();
            assert!(v.is_normalized(1e-5));
            let sim = v.cosine_similarity(&v).unwrap();
            assert!((sim - 1.0).abs() < 1e-5, "self-similarity {sim} for {raw:?}");
        }
    }

    #[test]
    fn test_normalize_degenerate() {
        let zero = emb(&[0.0; 4]);
        assert_eq!(zero.normalize(), Err(EmbeddingError::Degenerate));
        // Input vector is left as is.
        assert_eq!(zero.values, vec![0.0; 4]);
    }

    #[test]
    fn test_normalize_unit_length() {
        let v = emb(&[3.0, 4.0]).normalize().unwrap();
        assert!((v.values[0] - 0.6).abs() < 1e-6);
        assert!((v.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_identity_id_orders_numerically() {
        assert!(IdentityId(4) < IdentityId(11));
        assert!(IdentityId(-1) < IdentityId(0));
    }

    #[test]
    fn test_blob_codec() {
        let v = emb(&[0.5, -1.25, 3.0]);
        let bytes = v.to_le_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(Embedding::from_le_bytes(&bytes).unwrap(), v);
        assert_eq!(
            Embedding::from_le_bytes(&bytes[..7]),
            Err(EmbeddingError::BadBlob(7))
        );
    }
}
