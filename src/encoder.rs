//! Collaborator traits for the text encoder and the entity embedding store
//!
//! The loss primitives never own model internals: the encoder produces
//! per-token vectors given token ids and a mask, and the embedding store
//! resolves entity/relation indices to vectors. Both are consumed as opaque
//! services; training infrastructure (checkpointing, parameter servers,
//! tokenization) lives elsewhere.

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::Module;

/// Output of one encoder forward pass
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Per-token hidden states `[batch, seq_len, hidden]`
    pub sequence_output: Tensor,
    /// Pooled sentence representation `[batch, hidden]`
    pub pooled_output: Tensor,
}

/// A text encoder producing per-token and pooled vectors
///
/// Token type and position ids are optional; encoders that do not use them
/// ignore the arguments.
pub trait EncoderModel: Send + Sync {
    /// Forward pass over one tokenized batch
    fn encode(
        &self,
        token_ids: &Tensor,
        attention_mask: &Tensor,
        token_type_ids: Option<&Tensor>,
        position_ids: Option<&Tensor>,
    ) -> Result<EncoderOutput>;

    /// Hidden size of the encoder output
    fn hidden_size(&self) -> usize;

    /// Device the encoder runs on
    fn device(&self) -> &Device;
}

/// An entity/relation embedding table, possibly remote or sharded
///
/// Lookups return vectors that participate in the loss graph; gradient
/// delivery back to the store is the caller's concern.
pub trait EmbeddingStore: Send + Sync {
    /// Resolve indices (`U32`, any leading shape) to vectors with a trailing
    /// embedding dimension.
    fn lookup(&self, indices: &Tensor) -> Result<Tensor>;

    /// Embedding dimension
    fn dim(&self) -> usize;
}

/// In-process embedding store backed by a dense `candle_nn::Embedding` table
///
/// Suitable for single-device training and tests; the multi-GPU parameter
/// server implements the same trait elsewhere.
#[derive(Debug, Clone)]
pub struct TableEmbeddingStore {
    table: candle_nn::Embedding,
    dim: usize,
}

impl TableEmbeddingStore {
    pub fn new(table: candle_nn::Embedding, dim: usize) -> Self {
        Self { table, dim }
    }

    /// Build a store from a variable builder, creating the table under
    /// `name`.
    pub fn from_varbuilder(
        vb: candle_nn::VarBuilder,
        name: &str,
        num_entries: usize,
        dim: usize,
    ) -> Result<Self> {
        let table = candle_nn::embedding(num_entries, dim, vb.pp(name))?;
        Ok(Self { table, dim })
    }
}

impl EmbeddingStore for TableEmbeddingStore {
    fn lookup(&self, indices: &Tensor) -> Result<Tensor> {
        Ok(self.table.forward(indices)?)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_table_store_lookup_shapes() {
        let device = Device::Cpu;
        let weights = Tensor::rand(-1.0f32, 1.0, (8, 4), &device).unwrap();
        let store = TableEmbeddingStore::new(candle_nn::Embedding::new(weights, 4), 4);

        let idx = Tensor::new(&[0u32, 3, 7], &device).unwrap();
        let out = store.lookup(&idx).unwrap();
        assert_eq!(out.dims(), &[3, 4]);

        // 2-D index batches keep their leading shape
        let idx = Tensor::zeros((2, 5), DType::U32, &device).unwrap();
        let out = store.lookup(&idx).unwrap();
        assert_eq!(out.dims(), &[2, 5, 4]);
    }
}
