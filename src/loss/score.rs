//! Scoring functions for entity/candidate vector pairs
//!
//! Each variant maps a pair of vectors to a scalar compatibility score
//! (higher = better match), broadcasting over leading batch dimensions. The
//! same function serves three shapes: a single unbatched pair, elementwise
//! batched pairs, and one query broadcast against many candidates.

use anyhow::Result;
use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use super::error::LossError;

/// A pairwise scoring function
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScoreFn {
    /// Translational distance: `gamma - ||a + r - b||_p`
    ///
    /// `r` is an optional relation vector (absent means zero). Only p = 1 and
    /// p = 2 are supported.
    Translational { gamma: f64, p: u8 },
    /// Dot product
    Dot,
    /// Cosine similarity divided by a positive temperature
    ///
    /// Zero-norm vectors score 0 (the norm is clamped away from zero before
    /// division).
    Cosine { temperature: f64 },
}

impl ScoreFn {
    /// Translational distance with the configuration observed in training
    /// (p = 1).
    pub fn translational(gamma: f64) -> Self {
        Self::Translational { gamma, p: 1 }
    }

    /// Reject unsupported option combinations.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Translational { p, .. } if *p != 1 && *p != 2 => Err(LossError::Configuration(
                format!("unsupported norm order p={p}, expected 1 or 2"),
            )
            .into()),
            Self::Cosine { temperature } if *temperature <= 0.0 => Err(LossError::Configuration(
                format!("cosine temperature must be positive, got {temperature}"),
            )
            .into()),
            _ => Ok(()),
        }
    }

    /// Score `a` against `b`, broadcasting over leading dimensions.
    ///
    /// `relation` only applies to the translational variant and must be
    /// broadcastable against `a`.
    pub fn score(&self, a: &Tensor, b: &Tensor, relation: Option<&Tensor>) -> Result<Tensor> {
        match self {
            Self::Translational { gamma, p } => {
                let shifted = match relation {
                    Some(r) => a.broadcast_add(r)?,
                    None => a.clone(),
                };
                let dist = norm(&shifted.broadcast_sub(b)?, *p)?;
                Ok((*gamma - &dist)?)
            }
            Self::Dot => Ok(a.broadcast_mul(b)?.sum(D::Minus1)?),
            Self::Cosine { temperature } => {
                let cos = normalize(a)?.broadcast_mul(&normalize(b)?)?.sum(D::Minus1)?;
                Ok((cos / *temperature)?)
            }
        }
    }
}

fn norm(x: &Tensor, p: u8) -> Result<Tensor> {
    match p {
        1 => Ok(x.abs()?.sum(D::Minus1)?),
        2 => Ok(x.sqr()?.sum(D::Minus1)?.sqrt()?),
        _ => Err(LossError::Configuration(format!("unsupported norm order p={p}")).into()),
    }
}

/// Normalize vectors to unit length along the last dimension
///
/// Zero-norm vectors stay zero rather than dividing by exact zero.
pub(crate) fn normalize(embeddings: &Tensor) -> Result<Tensor> {
    let norm = embeddings.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    let norm = norm.clamp(1e-12, f64::MAX)?;
    Ok(embeddings.broadcast_div(&norm)?)
}
