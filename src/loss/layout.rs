//! Named candidate batch layouts
//!
//! Training batches arrive as one flat tensor holding `bsz` queries, their
//! `bsz` positives, and `bsz * K` negatives in that fixed order. The layout
//! makes this partition contract explicit instead of re-deriving offset
//! arithmetic at every call site; downstream code indexes by these offsets,
//! so the query -> positive -> negative order is load-bearing.

use anyhow::Result;
use candle_core::Tensor;

use super::error::LossError;

/// Partition of a flat candidate batch into query/positive/negative groups
///
/// A layout built with [`CandidateBatchLayout::new`] covers `bsz * (K + 2)`
/// rows; [`CandidateBatchLayout::without_positive`] covers the `bsz * (K + 1)`
/// variant used by heads whose positive is drawn elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateBatchLayout {
    bsz: usize,
    num_negatives: usize,
    has_positive: bool,
}

/// Zero-copy views over one partitioned batch
#[derive(Debug, Clone)]
pub struct CandidateGroups {
    /// `[bsz, d]`
    pub query: Tensor,
    /// `[bsz, d]`; absent for layouts without a positive slice
    pub positive: Option<Tensor>,
    /// `[bsz * K, d]`, ungrouped
    pub negatives: Tensor,
}

impl CandidateBatchLayout {
    /// Layout over `bsz * (num_negatives + 2)` rows.
    pub fn new(bsz: usize, num_negatives: usize) -> Result<Self> {
        if bsz == 0 {
            return Err(LossError::InvalidLayout("batch size must be non-zero".into()).into());
        }
        Ok(Self {
            bsz,
            num_negatives,
            has_positive: true,
        })
    }

    /// Layout over `bsz * (num_negatives + 1)` rows (no positive slice).
    pub fn without_positive(bsz: usize, num_negatives: usize) -> Result<Self> {
        if bsz == 0 {
            return Err(LossError::InvalidLayout("batch size must be non-zero".into()).into());
        }
        Ok(Self {
            bsz,
            num_negatives,
            has_positive: false,
        })
    }

    /// Derive the layout from a flat row count and the negatives-per-query
    /// count, as heads do when the batch size varies per step.
    pub fn infer(total_rows: usize, num_negatives: usize) -> Result<Self> {
        let groups = num_negatives + 2;
        if total_rows == 0 || total_rows % groups != 0 {
            return Err(LossError::InvalidLayout(format!(
                "{total_rows} rows are not partitionable into bsz * ({} + 2)",
                num_negatives
            ))
            .into());
        }
        Self::new(total_rows / groups, num_negatives)
    }

    pub fn bsz(&self) -> usize {
        self.bsz
    }

    pub fn num_negatives(&self) -> usize {
        self.num_negatives
    }

    /// Number of rows a conforming flat batch must have.
    pub fn total_rows(&self) -> usize {
        let groups = if self.has_positive {
            self.num_negatives + 2
        } else {
            self.num_negatives + 1
        };
        self.bsz * groups
    }

    /// Split a flat `[total_rows, d]` tensor into query/positive/negative
    /// views without copying.
    pub fn split(&self, flat: &Tensor) -> Result<CandidateGroups> {
        let rows = flat.dim(0)?;
        if rows != self.total_rows() {
            return Err(LossError::InvalidLayout(format!(
                "expected {} rows for bsz={} num_negatives={}, got {rows}",
                self.total_rows(),
                self.bsz,
                self.num_negatives
            ))
            .into());
        }
        let query = flat.narrow(0, 0, self.bsz)?;
        let (positive, neg_start) = if self.has_positive {
            (Some(flat.narrow(0, self.bsz, self.bsz)?), 2 * self.bsz)
        } else {
            (None, self.bsz)
        };
        let negatives = flat.narrow(0, neg_start, self.bsz * self.num_negatives)?;
        Ok(CandidateGroups {
            query,
            positive,
            negatives,
        })
    }

    /// Reshape the ungrouped negative slice to `[bsz, K, d]` for explicit
    /// per-query scoring.
    pub fn group_negatives(&self, negatives: &Tensor) -> Result<Tensor> {
        let rows = negatives.dim(0)?;
        if rows != self.bsz * self.num_negatives {
            return Err(LossError::InvalidLayout(format!(
                "expected {} negative rows, got {rows}",
                self.bsz * self.num_negatives
            ))
            .into());
        }
        Ok(negatives.reshape((self.bsz, self.num_negatives, ()))?)
    }
}

/// Flatten `[examples, segments, seq_len]` logits to
/// `[examples, segments * seq_len]`, preserving row-major order.
///
/// A gathered index `i` in the flattened view maps back to segment `i /
/// seq_len`, position `i % seq_len` (see [`unflatten_index`]).
pub fn flatten_segments(logits: &Tensor) -> Result<Tensor> {
    let (examples, segments, seq_len) = match logits.dims() {
        &[n, s, l] => (n, s, l),
        dims => {
            return Err(LossError::ShapeMismatch(format!(
                "expected [examples, segments, seq_len] logits, got {dims:?}"
            ))
            .into())
        }
    };
    Ok(logits.reshape((examples, segments * seq_len))?)
}

/// Map a flattened candidate index back to `(segment, position)`.
pub fn unflatten_index(flat_index: usize, seq_len: usize) -> (usize, usize) {
    (flat_index / seq_len, flat_index % seq_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::LossError;
    use candle_core::Device;

    #[test]
    fn test_split_lengths_and_concatenation() {
        let device = Device::Cpu;
        let (bsz, k, d) = (3, 2, 4);
        let flat = Tensor::rand(-1.0f32, 1.0, (bsz * (k + 2), d), &device).unwrap();

        let layout = CandidateBatchLayout::new(bsz, k).unwrap();
        let groups = layout.split(&flat).unwrap();

        assert_eq!(groups.query.dims(), &[bsz, d]);
        assert_eq!(groups.positive.as_ref().unwrap().dims(), &[bsz, d]);
        assert_eq!(groups.negatives.dims(), &[bsz * k, d]);

        // The three slices, concatenated in order, reproduce the input.
        let rebuilt = Tensor::cat(
            &[
                &groups.query,
                groups.positive.as_ref().unwrap(),
                &groups.negatives,
            ],
            0,
        )
        .unwrap();
        assert_eq!(
            rebuilt.to_vec2::<f32>().unwrap(),
            flat.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_split_rejects_wrong_length() {
        let device = Device::Cpu;
        let flat = Tensor::zeros((7, 4), candle_core::DType::F32, &device).unwrap();
        let layout = CandidateBatchLayout::new(2, 2).unwrap();
        let err = layout.split(&flat).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LossError>(),
            Some(LossError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_infer_layout() {
        let layout = CandidateBatchLayout::infer(12, 2).unwrap();
        assert_eq!(layout.bsz(), 3);
        assert!(CandidateBatchLayout::infer(13, 2).is_err());
    }

    #[test]
    fn test_without_positive() {
        let device = Device::Cpu;
        let layout = CandidateBatchLayout::without_positive(2, 3).unwrap();
        assert_eq!(layout.total_rows(), 8);
        let flat = Tensor::rand(-1.0f32, 1.0, (8, 4), &device).unwrap();
        let groups = layout.split(&flat).unwrap();
        assert!(groups.positive.is_none());
        assert_eq!(groups.negatives.dims(), &[6, 4]);
    }

    #[test]
    fn test_group_negatives() {
        let device = Device::Cpu;
        let layout = CandidateBatchLayout::new(2, 3).unwrap();
        let negatives = Tensor::rand(-1.0f32, 1.0, (6, 5), &device).unwrap();
        let grouped = layout.group_negatives(&negatives).unwrap();
        assert_eq!(grouped.dims(), &[2, 3, 5]);
    }

    #[test]
    fn test_flatten_segments_row_major() {
        let device = Device::Cpu;
        // 1 example, 2 segments, 3 positions
        let logits = Tensor::new(&[[[0.0f32, 1.0, 2.0], [3.0, 4.0, 5.0]]], &device).unwrap();
        let flat = flatten_segments(&logits).unwrap();
        assert_eq!(flat.dims(), &[1, 6]);
        let v = flat.to_vec2::<f32>().unwrap();
        // flattened index 4 holds segment 1, position 1
        assert_eq!(v[0][4], 4.0);
        assert_eq!(unflatten_index(4, 3), (1, 1));
    }
}
