//! Spatial Threshold Selector
//!
//! Chooses a fixed number of patches per batch element by combining the raw
//! importance scores with a smooth spatial prior, then gathers the selected
//! embeddings with their positional embeddings injected.
//!
//! Selection policy, two tiers:
//! 1. Patches whose raw score exceeds `threshold` are privileged; within
//!    that set, ranking is by spatially adjusted score (lower original index
//!    wins ties).
//! 2. If fewer than `k` patches clear the threshold, the remainder is
//!    backfilled from the rest, again ranked by adjusted score. Exactly `k`
//!    indices come back for every batch element, always - an all-zero score
//!    row degrades to the first `k` grid positions rather than an error.

use crate::core::{UnifiedError, UnifiedResult};
use candle_core::Tensor;
use std::cmp::Ordering;

/// Spatial smoothing strategy applied to the patch-score grid.
///
/// Implementations must be deterministic and shape-preserving over a
/// `(B, 1, G, G)` grid.
pub trait SpatialSmoothing: Send + Sync {
    fn smooth(&self, score_grid: &Tensor) -> candle_core::Result<Tensor>;
}

/// Normalized Gaussian kernel convolution over the score grid.
///
/// `std` is measured in patch-grid cells; the kernel radius is `ceil(3*std)`
/// with a minimum of one cell, so every patch is rewarded for having
/// high-scoring neighbors and isolated speckle selections are damped.
pub struct GaussianSmoothing {
    radius: usize,
    kernel: Vec<f32>,
}

impl GaussianSmoothing {
    pub fn new(std: f32) -> UnifiedResult<Self> {
        if !(std > 0.0) || !std.is_finite() {
            return Err(UnifiedError::config(
                "selector construction",
                "gaussian_std",
                "must be a positive finite number",
            ));
        }
        let radius = ((3.0 * std).ceil() as usize).max(1);
        let size = 2 * radius + 1;
        let two_sigma_sq = 2.0 * std * std;

        let mut kernel = Vec::with_capacity(size * size);
        let mut sum = 0.0f32;
        for dy in -(radius as i64)..=(radius as i64) {
            for dx in -(radius as i64)..=(radius as i64) {
                let dist_sq = (dy * dy + dx * dx) as f32;
                let weight = (-dist_sq / two_sigma_sq).exp();
                sum += weight;
                kernel.push(weight);
            }
        }
        for weight in &mut kernel {
            *weight /= sum;
        }

        Ok(Self { radius, kernel })
    }
}

impl SpatialSmoothing for GaussianSmoothing {
    fn smooth(&self, score_grid: &Tensor) -> candle_core::Result<Tensor> {
        let size = 2 * self.radius + 1;
        let kernel = Tensor::from_vec(
            self.kernel.clone(),
            (1, 1, size, size),
            score_grid.device(),
        )?;
        score_grid.conv2d(&kernel, self.radius, 1, 1, 1)
    }
}

/// Selects a fixed-size, spatially coherent patch subset.
pub struct SpatialThresholdSelector {
    patch_percentage: f32,
    threshold: f32,
    smoothing: Box<dyn SpatialSmoothing>,
}

impl SpatialThresholdSelector {
    /// Selector with the default Gaussian spatial prior
    pub fn new(patch_percentage: f32, threshold: f32, gaussian_std: f32) -> UnifiedResult<Self> {
        let smoothing = Box::new(GaussianSmoothing::new(gaussian_std)?);
        Self::with_smoothing(patch_percentage, threshold, smoothing)
    }

    /// Selector with a caller-provided smoothing strategy
    pub fn with_smoothing(
        patch_percentage: f32,
        threshold: f32,
        smoothing: Box<dyn SpatialSmoothing>,
    ) -> UnifiedResult<Self> {
        if !(patch_percentage > 0.0 && patch_percentage <= 1.0) {
            return Err(UnifiedError::config(
                "selector construction",
                "patch_percentage",
                format!("must be in (0, 1], got {}", patch_percentage),
            ));
        }
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(UnifiedError::config(
                "selector construction",
                "threshold",
                format!("must be a non-negative finite number, got {}", threshold),
            ));
        }
        Ok(Self {
            patch_percentage,
            threshold,
            smoothing,
        })
    }

    /// Number of patches kept out of `num_patches`, never below one
    pub fn selection_size(&self, num_patches: usize) -> usize {
        let k = (num_patches as f32 * self.patch_percentage).round() as usize;
        k.clamp(1, num_patches)
    }

    /// Raw scores blended with the spatial prior, shape `(B, N)`
    pub fn adjusted_scores(&self, patch_scores: &Tensor) -> UnifiedResult<Tensor> {
        let (batch, num_patches) = patch_scores.dims2().map_err(|_| {
            UnifiedError::validation(
                "patch_scores",
                "rank-2 (B, N)",
                format!("{:?}", patch_scores.shape()),
            )
        })?;
        let side = grid_side(num_patches)?;

        let grid = patch_scores
            .reshape((batch, 1, side, side))
            .map_err(|e| UnifiedError::processing("score grid reshape", e))?;
        let smoothed = self
            .smoothing
            .smooth(&grid)
            .map_err(|e| UnifiedError::processing("spatial smoothing", e))?;
        smoothed
            .reshape((batch, num_patches))
            .map_err(|e| UnifiedError::processing("score grid flatten", e))
    }

    /// Selected original patch indices per batch element, ascending and
    /// unique, exactly `selection_size(N)` of them in every row
    pub fn select_indices(&self, patch_scores: &Tensor) -> UnifiedResult<Vec<Vec<u32>>> {
        let adjusted = self.adjusted_scores(patch_scores)?;
        let raw_rows = patch_scores
            .to_vec2::<f32>()
            .map_err(|e| UnifiedError::processing("score readback", e))?;
        let adjusted_rows = adjusted
            .to_vec2::<f32>()
            .map_err(|e| UnifiedError::processing("adjusted score readback", e))?;

        let num_patches = raw_rows[0].len();
        let k = self.selection_size(num_patches);
        let indices = raw_rows
            .iter()
            .zip(adjusted_rows.iter())
            .map(|(raw, adjusted)| choose_k(raw, adjusted, self.threshold, k))
            .collect();
        Ok(indices)
    }

    /// Gather the selected patch embeddings and add their positional
    /// embeddings, looked up by original patch index (+1 for the CLS slot).
    ///
    /// - `all_patches`: `(B, N, D)`
    /// - `pos_embed`: `(1, N + 1, D)`
    /// - `patch_scores`: `(B, N)`
    /// - `line_drawing`: `(B, 1, H, W)`, must share the batch size
    ///
    /// Output `(B, k, D)`, rows in ascending original-index order so the
    /// position/content correspondence is stable across calls.
    pub fn select(
        &self,
        all_patches: &Tensor,
        pos_embed: &Tensor,
        patch_scores: &Tensor,
        line_drawing: &Tensor,
    ) -> UnifiedResult<Tensor> {
        let (batch, num_patches, embed_dim) = all_patches.dims3().map_err(|_| {
            UnifiedError::validation(
                "all_patches",
                "rank-3 (B, N, D)",
                format!("{:?}", all_patches.shape()),
            )
        })?;

        let score_dims = patch_scores.dims2().map_err(|_| {
            UnifiedError::validation(
                "patch_scores",
                "rank-2 (B, N)",
                format!("{:?}", patch_scores.shape()),
            )
        })?;
        if score_dims != (batch, num_patches) {
            return Err(UnifiedError::validation(
                "patch_scores",
                format!("({}, {})", batch, num_patches),
                format!("({}, {})", score_dims.0, score_dims.1),
            ));
        }

        let pos_dims = pos_embed.dims3().map_err(|_| {
            UnifiedError::validation(
                "pos_embed",
                "rank-3 (1, N + 1, D)",
                format!("{:?}", pos_embed.shape()),
            )
        })?;
        if pos_dims != (1, num_patches + 1, embed_dim) {
            return Err(UnifiedError::validation(
                "pos_embed",
                format!("(1, {}, {})", num_patches + 1, embed_dim),
                format!("({}, {}, {})", pos_dims.0, pos_dims.1, pos_dims.2),
            ));
        }

        let line_batch = line_drawing.dims4().map_err(|_| {
            UnifiedError::validation(
                "line_drawing",
                "rank-4 (B, 1, H, W)",
                format!("{:?}", line_drawing.shape()),
            )
        })?;
        if line_batch.0 != batch {
            return Err(UnifiedError::validation(
                "line_drawing",
                format!("batch size {}", batch),
                format!("batch size {}", line_batch.0),
            ));
        }

        let indices = self.select_indices(patch_scores)?;
        self.gather_selected(all_patches, pos_embed, &indices)
            .map_err(|e| UnifiedError::processing("patch gather", e))
    }

    fn gather_selected(
        &self,
        all_patches: &Tensor,
        pos_embed: &Tensor,
        indices: &[Vec<u32>],
    ) -> candle_core::Result<Tensor> {
        let (batch, num_patches, embed_dim) = all_patches.dims3()?;
        let k = indices[0].len();

        let mut flat = Vec::with_capacity(batch * k);
        for row in indices {
            flat.extend_from_slice(row);
        }
        let index = Tensor::from_vec(flat, (batch, k), all_patches.device())?
            .unsqueeze(2)?
            .expand((batch, k, embed_dim))?
            .contiguous()?;

        let selected = all_patches.contiguous()?.gather(&index, 1)?;

        // Positional rows by original index; +1 skips the CLS slot at 0
        let patch_positions = pos_embed
            .narrow(1, 1, num_patches)?
            .expand((batch, num_patches, embed_dim))?
            .contiguous()?;
        let selected_positions = patch_positions.gather(&index, 1)?;

        selected + selected_positions
    }
}

/// Side length of the square patch grid backing `num_patches`
fn grid_side(num_patches: usize) -> UnifiedResult<usize> {
    let side = (num_patches as f64).sqrt().round() as usize;
    if side * side != num_patches || side == 0 {
        return Err(UnifiedError::validation(
            "patch_scores",
            "a square patch grid",
            format!("{} patches", num_patches),
        ));
    }
    Ok(side)
}

/// Two-tier threshold/backfill choice over one score row.
///
/// `order` is adjusted-score descending with the original index breaking
/// ties; raw-above-threshold patches form tier one, everything else backfills
/// in ranked order. The returned indices are ascending.
fn choose_k(raw: &[f32], adjusted: &[f32], threshold: f32, k: usize) -> Vec<u32> {
    let mut order: Vec<usize> = (0..raw.len()).collect();
    order.sort_by(|&a, &b| {
        adjusted[b]
            .partial_cmp(&adjusted[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });

    let (above, below): (Vec<usize>, Vec<usize>) =
        order.into_iter().partition(|&i| raw[i] > threshold);

    let mut chosen: Vec<u32> = above
        .into_iter()
        .chain(below)
        .take(k)
        .map(|i| i as u32)
        .collect();
    chosen.sort_unstable();
    chosen
}
