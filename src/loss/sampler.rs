//! Negative candidate scoring
//!
//! Two regimes produce the negative half of a contrastive score layout:
//! explicit negatives materialized per query, or in-batch negatives where
//! every other example's candidates serve as the negative pool. The in-batch
//! regime requires identifier tags and masks false negatives (a pool entry
//! that is actually the query's positive) with a finite sentinel score before
//! any loss aggregation.
//!
//! Explicit negatives are drawn upstream and presumed disjoint from the
//! positive by construction, so that regime never consults identifiers; the
//! asymmetry is deliberate.

use anyhow::Result;
use candle_core::Tensor;

use super::error::LossError;
use super::score::{normalize, ScoreFn};

/// Sentinel assigned to masked false-negative scores
///
/// Finite rather than `-inf` so exponentials stay finite through softmax.
pub const DEFAULT_MASK_VALUE: f64 = -1e4;

/// How negatives are obtained for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NegativeRegime {
    /// Negatives arrive as a `[bsz, K, d]` tensor, scored per query
    Explicit,
    /// Negatives arrive as a flat `[P, d]` pool shared by the whole batch
    InBatch,
}

/// Identifier tags used to detect in-batch false negatives
///
/// `query` is aligned with the query slice (`[bsz]`); `negatives` covers the
/// pool (any shape flattening to `[P]`). A pool candidate whose tag equals
/// the query's tag is a duplicate of the true positive.
#[derive(Debug, Clone, Copy)]
pub struct NegativeIdentifiers<'a> {
    pub query: &'a Tensor,
    pub negatives: &'a Tensor,
}

/// Produces negative score tensors under a configured regime
#[derive(Debug, Clone)]
pub struct NegativeSampler {
    regime: NegativeRegime,
    detach_candidates: bool,
    mask_value: f64,
}

impl NegativeSampler {
    pub fn new(regime: NegativeRegime) -> Self {
        Self {
            regime,
            detach_candidates: false,
            mask_value: DEFAULT_MASK_VALUE,
        }
    }

    /// Treat positive/negative vectors as constants: gradient flows only
    /// through the query branch. Used when the embedding side updates
    /// asynchronously.
    pub fn with_detach(mut self, detach: bool) -> Self {
        self.detach_candidates = detach;
        self
    }

    pub fn with_mask_value(mut self, mask_value: f64) -> Self {
        self.mask_value = mask_value;
        self
    }

    pub fn regime(&self) -> NegativeRegime {
        self.regime
    }

    pub fn detach_candidates(&self) -> bool {
        self.detach_candidates
    }

    pub fn mask_value(&self) -> f64 {
        self.mask_value
    }

    /// The positive branch, detached when the sampler is configured to.
    pub fn positive_branch(&self, positive: &Tensor) -> Tensor {
        if self.detach_candidates {
            positive.detach()
        } else {
            positive.clone()
        }
    }

    /// Score a query batch against its negatives.
    ///
    /// Returns `[bsz, K]` for the explicit regime and `[bsz, P]` for the
    /// in-batch regime (false negatives already masked).
    pub fn negative_scores(
        &self,
        score_fn: &ScoreFn,
        query: &Tensor,
        negatives: &Tensor,
        relation: Option<&Tensor>,
        identifiers: Option<NegativeIdentifiers<'_>>,
    ) -> Result<Tensor> {
        let negatives = if self.detach_candidates {
            negatives.detach()
        } else {
            negatives.clone()
        };
        let (bsz, dim) = match query.dims() {
            &[b, d] => (b, d),
            dims => {
                return Err(LossError::ShapeMismatch(format!(
                    "expected [bsz, d] query, got {dims:?}"
                ))
                .into())
            }
        };

        match self.regime {
            NegativeRegime::Explicit => {
                match negatives.dims() {
                    &[nb, _, nd] if nb == bsz && nd == dim => {}
                    dims => {
                        return Err(LossError::ShapeMismatch(format!(
                            "expected [{bsz}, K, {dim}] explicit negatives, got {dims:?}"
                        ))
                        .into())
                    }
                }
                let query = query.unsqueeze(1)?;
                let relation = match relation {
                    Some(r) => Some(r.unsqueeze(1)?),
                    None => None,
                };
                score_fn.score(&query, &negatives, relation.as_ref())
            }
            NegativeRegime::InBatch => {
                let pool = match negatives.dims() {
                    &[p, nd] if nd == dim => p,
                    dims => {
                        return Err(LossError::ShapeMismatch(format!(
                            "expected [P, {dim}] in-batch negative pool, got {dims:?}"
                        ))
                        .into())
                    }
                };
                let ids = identifiers.ok_or_else(|| {
                    LossError::Configuration(
                        "in-batch negatives require identifier tags for false-negative masking"
                            .into(),
                    )
                })?;

                let scores = match score_fn {
                    ScoreFn::Dot => query.matmul(&negatives.t()?)?,
                    ScoreFn::Cosine { temperature } => {
                        let q = normalize(query)?;
                        let n = normalize(&negatives)?;
                        (q.matmul(&n.t()?)? / *temperature)?
                    }
                    ScoreFn::Translational { .. } => {
                        let q = query.unsqueeze(1)?;
                        let n = negatives.unsqueeze(0)?;
                        let relation = match relation {
                            Some(r) => Some(r.unsqueeze(1)?),
                            None => None,
                        };
                        score_fn.score(&q, &n, relation.as_ref())?
                    }
                };

                self.mask_false_negatives(&scores, ids, bsz, pool)
            }
        }
    }

    /// Overwrite the score of every `(query, candidate)` pair whose
    /// identifiers collide with the sentinel value.
    fn mask_false_negatives(
        &self,
        scores: &Tensor,
        ids: NegativeIdentifiers<'_>,
        bsz: usize,
        pool: usize,
    ) -> Result<Tensor> {
        if ids.query.dims() != [bsz] {
            return Err(LossError::ShapeMismatch(format!(
                "expected [{bsz}] query identifiers, got {:?}",
                ids.query.dims()
            ))
            .into());
        }
        if ids.negatives.elem_count() != pool {
            return Err(LossError::ShapeMismatch(format!(
                "expected {pool} negative identifiers, got {}",
                ids.negatives.elem_count()
            ))
            .into());
        }
        let query_ids = ids.query.unsqueeze(1)?;
        let negative_ids = ids.negatives.reshape((pool,))?.unsqueeze(0)?;
        let collision = query_ids.broadcast_eq(&negative_ids)?;

        let sentinel = (scores.ones_like()? * self.mask_value)?;
        Ok(collision.where_cond(&sentinel, scores)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn test_explicit_scores_shape() {
        let device = Device::Cpu;
        let query = Tensor::rand(-1.0f32, 1.0, (2, 4), &device).unwrap();
        let negatives = Tensor::rand(-1.0f32, 1.0, (2, 3, 4), &device).unwrap();

        let sampler = NegativeSampler::new(NegativeRegime::Explicit);
        let scores = sampler
            .negative_scores(&ScoreFn::Dot, &query, &negatives, None, None)
            .unwrap();
        assert_eq!(scores.dims(), &[2, 3]);
    }

    #[test]
    fn test_explicit_rejects_mismatched_batch() {
        let device = Device::Cpu;
        let query = Tensor::rand(-1.0f32, 1.0, (2, 4), &device).unwrap();
        let negatives = Tensor::rand(-1.0f32, 1.0, (3, 3, 4), &device).unwrap();

        let sampler = NegativeSampler::new(NegativeRegime::Explicit);
        let err = sampler
            .negative_scores(&ScoreFn::Dot, &query, &negatives, None, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LossError>(),
            Some(LossError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_in_batch_masks_false_negative_with_sentinel() {
        let device = Device::Cpu;
        let query = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0]], &device).unwrap();
        // Pool of three candidates; candidate 2 shares query 0's identifier.
        let pool = Tensor::new(&[[1.0f32, 1.0], [0.5, 0.5], [2.0, 0.0]], &device).unwrap();
        let query_ids = Tensor::new(&[10i64, 20, 30], &device).unwrap();
        let pool_ids = Tensor::new(&[40i64, 50, 10], &device).unwrap();

        let sampler = NegativeSampler::new(NegativeRegime::InBatch);
        let scores = sampler
            .negative_scores(
                &ScoreFn::Dot,
                &query,
                &pool,
                None,
                Some(NegativeIdentifiers {
                    query: &query_ids,
                    negatives: &pool_ids,
                }),
            )
            .unwrap();

        let rows = scores.to_vec2::<f32>().unwrap();
        // (query 0, candidate 2) collides: sentinel, never the raw score
        assert_eq!(rows[0][2], DEFAULT_MASK_VALUE as f32);
        // unmasked entries keep their raw dot products
        assert!((rows[0][0] - 1.0).abs() < 1e-5);
        assert!((rows[1][1] - 0.5).abs() < 1e-5);
        assert!((rows[2][0] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_in_batch_requires_identifiers() {
        let device = Device::Cpu;
        let query = Tensor::rand(-1.0f32, 1.0, (2, 4), &device).unwrap();
        let pool = Tensor::rand(-1.0f32, 1.0, (4, 4), &device).unwrap();

        let sampler = NegativeSampler::new(NegativeRegime::InBatch);
        let err = sampler
            .negative_scores(&ScoreFn::Dot, &query, &pool, None, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LossError>(),
            Some(LossError::Configuration(_))
        ));
    }

    #[test]
    fn test_detach_blocks_gradient_through_negatives() {
        let device = Device::Cpu;
        let query = Var::rand(-1.0f32, 1.0, (2, 3), &device).unwrap();
        let negatives = Var::rand(-1.0f32, 1.0, (2, 4, 3), &device).unwrap();

        let sampler = NegativeSampler::new(NegativeRegime::Explicit).with_detach(true);
        let scores = sampler
            .negative_scores(&ScoreFn::Dot, query.as_tensor(), negatives.as_tensor(), None, None)
            .unwrap();
        let grads = scores.sum_all().unwrap().backward().unwrap();

        assert!(grads.get(&query).is_some());
        assert!(grads.get(&negatives).is_none());
    }
}
