//! Entity ranking head
//!
//! Listwise ranking of candidate entities against a mention/query
//! representation. The encoder runs once over a flat batch laid out as
//! `bsz` queries, `bsz` positives, then `bsz * K` negatives; this head
//! splits that batch by layout, optionally projects every row through a
//! shared linear, and scores with dot products under the listwise
//! cross-entropy formulation. The in-batch variant widens each query's
//! candidate pool to the whole batch and needs entity ids to mask
//! false negatives.

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::loss::{
    CandidateBatch, CandidateBatchLayout, ContrastiveLossConfig, ContrastiveLossEngine,
    LossError, NegativeIdentifiers, NegativeRegime, ScoreFn,
};

/// Configuration for [`EntityRankingHead`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RankingHeadConfig {
    /// Negatives per query in the flat batch layout
    pub num_negatives: usize,
    /// Score each query against the whole batch's candidates instead of only
    /// its own K negatives
    pub in_batch: bool,
    /// Stop gradient through candidate representations
    pub detach_candidates: bool,
    /// Project representations to this dimension before scoring; `None`
    /// scores raw encoder vectors
    pub project_dim: Option<usize>,
}

impl Default for RankingHeadConfig {
    fn default() -> Self {
        Self {
            num_negatives: 4,
            in_batch: false,
            detach_candidates: false,
            project_dim: None,
        }
    }
}

/// Listwise candidate-entity ranking over a flat encoder batch
pub struct EntityRankingHead {
    ent_head: Option<Linear>,
    engine: ContrastiveLossEngine,
    num_negatives: usize,
    in_batch: bool,
}

impl EntityRankingHead {
    pub fn new(vb: VarBuilder, hidden_size: usize, config: RankingHeadConfig) -> Result<Self> {
        let ent_head = match config.project_dim {
            Some(dim) => Some(candle_nn::linear(hidden_size, dim, vb.pp("ent_head"))?),
            None => None,
        };
        let regime = if config.in_batch {
            NegativeRegime::InBatch
        } else {
            NegativeRegime::Explicit
        };
        let engine = ContrastiveLossEngine::new(ContrastiveLossConfig {
            score_fn: ScoreFn::Dot,
            regime,
            listwise: true,
            detach_candidates: config.detach_candidates,
            ..Default::default()
        })?;

        tracing::debug!(
            "ranking head: {} negatives/query, in_batch={}",
            config.num_negatives,
            config.in_batch
        );

        Ok(Self {
            ent_head,
            engine,
            num_negatives: config.num_negatives,
            in_batch: config.in_batch,
        })
    }

    /// Project a representation through the entity head, if one is
    /// configured.
    pub fn project(&self, representations: &Tensor) -> Result<Tensor> {
        match &self.ent_head {
            Some(linear) => Ok(linear.forward(representations)?),
            None => Ok(representations.clone()),
        }
    }

    /// Scalar listwise loss over a flat `[bsz * (K + 2), hidden]` batch.
    ///
    /// `entity_ids` is a `[bsz * (K + 2)]` integer tensor aligned with the
    /// rows; the in-batch variant slices it by the same layout to mask false
    /// negatives, the explicit variant ignores it.
    pub fn forward(
        &self,
        representations: &Tensor,
        entity_ids: Option<&Tensor>,
    ) -> Result<Tensor> {
        let projected = self.project(representations)?;
        let layout = CandidateBatchLayout::infer(projected.dim(0)?, self.num_negatives)?;
        let groups = layout.split(&projected)?;
        let positive = groups
            .positive
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("layout produced no positive slice"))?;

        if self.in_batch {
            let pool = Tensor::cat(&[positive, &groups.negatives], 0)?;
            let ids = match entity_ids {
                Some(ids) => {
                    let total = layout.total_rows();
                    if ids.dims() != [total] {
                        return Err(LossError::ShapeMismatch(format!(
                            "expected [{total}] row-aligned entity ids, got {:?}",
                            ids.dims()
                        ))
                        .into());
                    }
                    let bsz = layout.bsz();
                    Some((
                        ids.narrow(0, 0, bsz)?,
                        ids.narrow(0, bsz, pool.dim(0)?)?,
                    ))
                }
                None => None,
            };
            let mut batch = CandidateBatch::new(&groups.query, positive, &pool);
            if let Some((query_ids, pool_ids)) = &ids {
                batch = batch.with_identifiers(NegativeIdentifiers {
                    query: query_ids,
                    negatives: pool_ids,
                });
            }
            self.engine.forward(&batch)
        } else {
            let grouped = layout.group_negatives(&groups.negatives)?;
            self.engine
                .forward(&CandidateBatch::new(&groups.query, positive, &grouped))
        }
    }
}

/// Final-position representation of each sequence, `[batch, hidden]`.
///
/// Candidate rows are encoded with the entity mention at the end of the
/// sequence, so the last token carries the mention summary.
pub fn last_token(sequence_output: &Tensor) -> Result<Tensor> {
    let seq_len = sequence_output.dim(1)?;
    Ok(sequence_output.narrow(1, seq_len - 1, 1)?.squeeze(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build_head(device: &Device, config: RankingHeadConfig) -> EntityRankingHead {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        EntityRankingHead::new(vb, 6, config).unwrap()
    }

    #[test]
    fn test_explicit_ranking_loss() {
        let device = Device::Cpu;
        let head = build_head(
            &device,
            RankingHeadConfig {
                num_negatives: 3,
                project_dim: Some(4),
                ..Default::default()
            },
        );

        // bsz = 2, K = 3 => 10 rows
        let representations = Tensor::rand(-1.0f32, 1.0, (10, 6), &device).unwrap();
        let loss = head.forward(&representations, None).unwrap();
        let v = loss.to_scalar::<f32>().unwrap();
        assert!(v.is_finite());
        assert!(v > 0.0);
    }

    #[test]
    fn test_in_batch_requires_entity_ids() {
        let device = Device::Cpu;
        let head = build_head(
            &device,
            RankingHeadConfig {
                num_negatives: 2,
                in_batch: true,
                ..Default::default()
            },
        );

        let representations = Tensor::rand(-1.0f32, 1.0, (8, 6), &device).unwrap();
        let err = head.forward(&representations, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LossError>(),
            Some(LossError::Configuration(_))
        ));

        // row-aligned ids: 2 queries, 2 positives, 4 negatives
        let ids = Tensor::new(&[1i64, 2, 1, 2, 3, 4, 5, 6], &device).unwrap();
        let loss = head.forward(&representations, Some(&ids)).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());
    }

    #[test]
    fn test_in_batch_rejects_short_entity_ids() {
        let device = Device::Cpu;
        let head = build_head(
            &device,
            RankingHeadConfig {
                num_negatives: 2,
                in_batch: true,
                ..Default::default()
            },
        );

        let representations = Tensor::rand(-1.0f32, 1.0, (8, 6), &device).unwrap();
        // 5 ids for an 8-row batch
        let ids = Tensor::new(&[1i64, 2, 3, 4, 5], &device).unwrap();
        let err = head.forward(&representations, Some(&ids)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LossError>(),
            Some(LossError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_unpartitionable_batch_rejected() {
        let device = Device::Cpu;
        let head = build_head(&device, RankingHeadConfig::default());
        // 4 negatives/query needs a multiple of 6 rows
        let representations = Tensor::rand(-1.0f32, 1.0, (7, 6), &device).unwrap();
        let err = head.forward(&representations, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LossError>(),
            Some(LossError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_last_token_selects_final_position() {
        let device = Device::Cpu;
        let sequence_output =
            Tensor::new(&[[[1.0f32, 1.0], [2.0, 2.0], [3.0, 3.0]]], &device).unwrap();
        let last = last_token(&sequence_output).unwrap();
        assert_eq!(last.to_vec2::<f32>().unwrap(), vec![vec![3.0, 3.0]]);
    }
}
