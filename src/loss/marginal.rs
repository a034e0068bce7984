//! Multi-positive marginal cross-entropy
//!
//! Cross-entropy over a flat candidate-position vector when several positions
//! are equally valid gold answers (multi-span extractive QA, multi-segment
//! document search). The numerator marginalizes log-probability over the
//! whole gold set via log-sum-exp instead of picking a single target.

use anyhow::Result;
use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use super::error::LossError;
use super::layout::flatten_segments;
use super::sampler::DEFAULT_MASK_VALUE;

/// Marginal cross-entropy over flattened candidate positions
///
/// Targets arrive as a fixed-width `[N, T_max]` integer array where absent
/// gold slots hold `ignore_index`. Masked slots are gathered at a placeholder
/// index and then overwritten with a finite negative sentinel so they carry
/// ~0 probability mass; an example whose slots are all masked produces a
/// large but finite loss rather than a faulted computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginalSpanLoss {
    ignore_index: i64,
    mask_value: f64,
}

impl Default for MarginalSpanLoss {
    fn default() -> Self {
        Self {
            ignore_index: -1,
            mask_value: DEFAULT_MASK_VALUE,
        }
    }
}

impl MarginalSpanLoss {
    pub fn new(ignore_index: i64) -> Self {
        Self {
            ignore_index,
            ..Default::default()
        }
    }

    pub fn with_mask_value(mut self, mask_value: f64) -> Self {
        self.mask_value = mask_value;
        self
    }

    pub fn ignore_index(&self) -> i64 {
        self.ignore_index
    }

    /// Loss over `[N, L]` logits and `[N, T_max]` gold positions (`I64`).
    ///
    /// Per example: `logsumexp(logits) - logsumexp(logits[gold set])`,
    /// mean-reduced over the batch.
    pub fn forward(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let examples = match logits.dims() {
            &[n, _] => n,
            dims => {
                return Err(LossError::ShapeMismatch(format!(
                    "expected [examples, candidates] logits, got {dims:?}"
                ))
                .into())
            }
        };
        match targets.dims() {
            &[n, _] if n == examples => {}
            dims => {
                return Err(LossError::ShapeMismatch(format!(
                    "expected [{examples}, T_max] targets, got {dims:?}"
                ))
                .into())
            }
        }

        let mask = targets.eq(self.ignore_index)?;

        // Gather at a safe placeholder index for masked slots, then overwrite
        // the gathered values with the sentinel so exp() stays finite.
        let placeholder = targets.zeros_like()?;
        let safe_targets = mask.where_cond(&placeholder, targets)?;
        let gathered = logits.gather(&safe_targets, 1)?;
        let sentinel = (gathered.ones_like()? * self.mask_value)?;
        let gathered = mask.where_cond(&sentinel, &gathered)?;

        let log_score = logsumexp(&gathered)?;
        let log_norm = logsumexp(logits)?;

        Ok((log_norm - log_score)?.mean_all()?)
    }

    /// Segment variant: `[examples, segments, seq_len]` logits are flattened
    /// row-major before the loss. Target indices must already live in the
    /// flattened coordinate space.
    pub fn forward_segments(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let flat = flatten_segments(logits)?;
        self.forward(&flat, targets)
    }
}

/// Stable log-sum-exp along the last dimension
fn logsumexp(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?;
    let summed = shifted.exp()?.sum(D::Minus1)?;
    Ok((summed.log()? + max.squeeze(D::Minus1)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn lse(values: &[f32]) -> f32 {
        let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        max + values.iter().map(|v| (v - max).exp()).sum::<f32>().ln()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_single_gold_reduces_to_plain_cross_entropy() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[5.0f32, 1.0, 1.0, 1.0]], &device).unwrap();
        let targets = Tensor::new(&[[0i64, -1]], &device).unwrap();

        let loss = MarginalSpanLoss::default().forward(&logits, &targets).unwrap();
        // numerator = gathered[0] = 5, so loss = logsumexp(logits) - 5
        let expected = lse(&[5.0, 1.0, 1.0, 1.0]) - 5.0;
        assert!((scalar(&loss) - expected).abs() < 1e-4);
    }

    #[test]
    fn test_two_golds_marginalize_and_lower_the_loss() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[5.0f32, 4.0, 1.0, 1.0]], &device).unwrap();
        let both = Tensor::new(&[[0i64, 1]], &device).unwrap();
        let first_only = Tensor::new(&[[0i64, -1]], &device).unwrap();

        let loss_fn = MarginalSpanLoss::default();
        let marginal = scalar(&loss_fn.forward(&logits, &both).unwrap());
        let single = scalar(&loss_fn.forward(&logits, &first_only).unwrap());

        let expected = lse(&[5.0, 4.0, 1.0, 1.0]) - lse(&[5.0, 4.0]);
        assert!((marginal - expected).abs() < 1e-4);
        // marginalizing over both golds is strictly easier than either alone
        assert!(marginal < single);
    }

    #[test]
    fn test_all_masked_row_is_finite() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2.0f32, 1.0, 0.0]], &device).unwrap();
        let targets = Tensor::new(&[[-1i64, -1]], &device).unwrap();

        let loss = MarginalSpanLoss::default().forward(&logits, &targets).unwrap();
        let v = scalar(&loss);
        // large, but finite: the numerator is logsumexp of all-sentinel slots
        assert!(v.is_finite());
        assert!(v > 1e3);
    }

    #[test]
    fn test_segment_variant_matches_manual_flattening() {
        let device = Device::Cpu;
        let logits =
            Tensor::new(&[[[5.0f32, 1.0, 1.0], [1.0, 4.0, 1.0]]], &device).unwrap();
        // gold at segment 0 position 0 and segment 1 position 1, flattened
        // coordinates 0 and 4
        let targets = Tensor::new(&[[0i64, 4]], &device).unwrap();

        let loss_fn = MarginalSpanLoss::default();
        let seg = scalar(&loss_fn.forward_segments(&logits, &targets).unwrap());

        let flat = Tensor::new(&[[5.0f32, 1.0, 1.0, 1.0, 4.0, 1.0]], &device).unwrap();
        let manual = scalar(&loss_fn.forward(&flat, &targets).unwrap());
        assert!((seg - manual).abs() < 1e-5);
    }

    #[test]
    fn test_batch_mismatch_rejected() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[1.0f32, 2.0]], &device).unwrap();
        let targets = Tensor::new(&[[0i64], [1]], &device).unwrap();
        let err = MarginalSpanLoss::default()
            .forward(&logits, &targets)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LossError>(),
            Some(LossError::ShapeMismatch(_))
        ));
    }
}
