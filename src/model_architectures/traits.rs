//! Backbone Capability Traits
//!
//! A pretrained vision transformer is consumed through one capability
//! interface rather than an inheritance chain: the selective model needs the
//! backbone's patch projection, its learned positional table and CLS token,
//! its transformer blocks, final norm, classification head and dropout hook.
//! Structural substitution (swapping the patch/positional components for a
//! new grid, or the head for a new label set) goes through explicit mutator
//! methods on the same trait, so adapters for other transformer families can
//! implement their own weight surgery.

use anyhow::Result;
use candle_core::Tensor;

/// Capability interface over a pretrained vision transformer backbone.
///
/// Shape contract (D = `embed_dim`, N = `num_patches`):
/// - `patch_embed`: `(B, 3, H, W)` -> `(B, N, D)`
/// - `pos_embed`: `(1, N + 1, D)`, slot 0 reserved for the CLS token
/// - `cls_token`: `(1, 1, D)`
/// - `forward_blocks` / `norm` / `dropout`: `(B, L, D)` -> `(B, L, D)`,
///   sequence length preserved
/// - `head`: `(B, D)` -> `(B, num_classes)`
pub trait VisionBackbone {
    /// Embedding dimension D of the backbone
    fn embed_dim(&self) -> usize;

    /// Number of patch positions N the positional table currently covers
    fn num_patches(&self) -> usize;

    /// Project an image batch into per-patch embeddings, row-major patch order
    fn patch_embed(&self, images: &Tensor) -> Result<Tensor>;

    /// Learned positional embedding table, `(1, N + 1, D)`
    fn pos_embed(&self) -> &Tensor;

    /// Learned classification token, `(1, 1, D)`
    fn cls_token(&self) -> &Tensor;

    /// Run the transformer block stack over a sequence
    fn forward_blocks(&self, sequence: &Tensor) -> Result<Tensor>;

    /// Final normalization over a sequence
    fn norm(&self, sequence: &Tensor) -> Result<Tensor>;

    /// Classification head over the pooled representation
    fn head(&self, pooled: &Tensor) -> Result<Tensor>;

    /// Regularization hook; identity when `train` is false
    fn dropout(&self, sequence: &Tensor, train: bool) -> Result<Tensor>;

    /// Total learned parameter count of the backbone
    fn num_parameters(&self) -> usize;

    /// Replace the patch embedding and positional table for a new patch grid.
    ///
    /// The positional table is freshly initialized (its shape depends on the
    /// grid, so pretrained values cannot carry over); every other component
    /// keeps its weights.
    fn adapt_patch_grid(&mut self, img_size: usize, patch_size: usize) -> Result<()>;

    /// Replace the classification head for a new number of output classes
    fn adapt_head(&mut self, num_classes: usize) -> Result<()>;
}
