//! Patch Importance Scorer
//!
//! Maps a line drawing to one importance score per patch by measuring local
//! line density. No learned parameters: the same input always produces the
//! same scores.

use crate::core::{UnifiedError, UnifiedResult};
use candle_core::Tensor;

/// Scores patches by the line density inside each patch cell.
///
/// Input is a `(B, 1, H, W)` line drawing (0 = background, nonzero = line;
/// arbitrary real intensities are tolerated). Output is `(B, N)` with
/// `N = (H / patch_size) * (W / patch_size)`, patches flattened row-major,
/// each score normalized to [0, 1] by the per-image maximum. An all-zero
/// drawing yields all-zero scores; downstream selection handles that case
/// with a deterministic fallback rather than an error.
#[derive(Debug, Clone)]
pub struct PatchImportanceScorer {
    patch_size: usize,
}

impl PatchImportanceScorer {
    pub fn new(patch_size: usize) -> UnifiedResult<Self> {
        if patch_size == 0 {
            return Err(UnifiedError::config(
                "scorer construction",
                "patch_size",
                "must be at least 1",
            ));
        }
        Ok(Self { patch_size })
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    /// Compute normalized per-patch importance scores, shape `(B, N)`
    pub fn score(&self, line_drawing: &Tensor) -> UnifiedResult<Tensor> {
        let (_, channels, height, width) = line_drawing.dims4().map_err(|_| {
            UnifiedError::validation(
                "line_drawing",
                "rank-4 (B, 1, H, W)",
                format!("{:?}", line_drawing.shape()),
            )
        })?;
        if channels != 1 {
            return Err(UnifiedError::validation(
                "line_drawing",
                "1 channel",
                format!("{} channels", channels),
            ));
        }
        if height != width {
            return Err(UnifiedError::validation(
                "line_drawing",
                "square spatial dims",
                format!("{}x{}", height, width),
            ));
        }
        if height % self.patch_size != 0 {
            return Err(UnifiedError::validation(
                "line_drawing",
                format!("spatial dims divisible by patch_size {}", self.patch_size),
                format!("{}x{}", height, width),
            ));
        }

        self.density(line_drawing)
            .map_err(|e| UnifiedError::processing("patch scoring", e))
    }

    /// Mean absolute intensity per non-overlapping patch cell, max-normalized
    fn density(&self, line_drawing: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, _, _, _) = line_drawing.dims4()?;

        // Kernel == stride == patch_size: each output cell is exactly one
        // patch, row-major once flattened.
        let pooled = line_drawing.abs()?.avg_pool2d(self.patch_size)?;
        let scores = pooled.reshape((batch, ()))?;

        // Per-image max normalization; clamping the denominator keeps an
        // all-zero drawing at all-zero scores instead of NaN.
        let max = scores.max_keepdim(1)?.clamp(1e-6, f64::MAX)?;
        scores.broadcast_div(&max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rstest::rstest;

    fn drawing_from(pixels: Vec<f32>, batch: usize, side: usize) -> Tensor {
        Tensor::from_vec(pixels, (batch, 1, side, side), &Device::Cpu).unwrap()
    }

    fn zeros(batch: usize, side: usize) -> Tensor {
        drawing_from(vec![0f32; batch * side * side], batch, side)
    }

    #[rstest]
    #[case(64, 4, 256)]
    #[case(64, 8, 64)]
    #[case(32, 16, 4)]
    #[case(224, 16, 196)]
    fn test_score_shape(#[case] img_size: usize, #[case] patch_size: usize, #[case] expected: usize) {
        let scorer = PatchImportanceScorer::new(patch_size).unwrap();
        let scores = scorer.score(&zeros(2, img_size)).unwrap();
        assert_eq!(scores.dims2().unwrap(), (2, expected));
    }

    #[test]
    fn test_all_zero_drawing_scores_zero() {
        let scorer = PatchImportanceScorer::new(4).unwrap();
        let scores = scorer.score(&zeros(1, 16)).unwrap();
        let values = scores.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_single_patch_hot() {
        // One bright pixel inside patch (row 0, col 2) of a 4x4 patch grid
        let side = 16;
        let mut pixels = vec![0f32; side * side];
        pixels[2 * 4 + 1] = 1.0; // y=0, x=9 -> grid col 2
        let scorer = PatchImportanceScorer::new(4).unwrap();
        let scores = scorer.score(&drawing_from(pixels, 1, side)).unwrap();
        let values = scores.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        assert_eq!(values.len(), 16);
        for (i, &v) in values.iter().enumerate() {
            if i == 2 {
                assert!((v - 1.0).abs() < 1e-6, "hot patch should normalize to 1");
            } else {
                assert_eq!(v, 0.0, "patch {} should be empty", i);
            }
        }
    }

    #[test]
    fn test_quadrant_confinement() {
        // Lines confined to the top-left quadrant of a 64x64 drawing
        let side = 64;
        let mut pixels = vec![0f32; side * side];
        for y in 0..32 {
            for x in 0..32 {
                if (x + y) % 5 == 0 {
                    pixels[y * side + x] = 1.0;
                }
            }
        }
        let scorer = PatchImportanceScorer::new(4).unwrap();
        let scores = scorer.score(&drawing_from(pixels, 1, side)).unwrap();
        let values = scores.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        let grid = 16;
        for (i, &v) in values.iter().enumerate() {
            let (row, col) = (i / grid, i % grid);
            if row >= 8 || col >= 8 {
                assert_eq!(v, 0.0, "patch ({}, {}) is outside the quadrant", row, col);
            }
        }
        assert!(values.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_negative_intensities_count_as_lines() {
        let side = 8;
        let mut pixels = vec![0f32; side * side];
        pixels[0] = -2.0;
        let scorer = PatchImportanceScorer::new(4).unwrap();
        let scores = scorer.score(&drawing_from(pixels, 1, side)).unwrap();
        let values = scores.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values[0] > 0.0);
    }

    #[test]
    fn test_determinism() {
        let side = 32;
        let pixels: Vec<f32> = (0..side * side).map(|i| (i % 7) as f32 * 0.1).collect();
        let drawing = drawing_from(pixels, 1, side);
        let scorer = PatchImportanceScorer::new(8).unwrap();
        let a = scorer.score(&drawing).unwrap().to_vec2::<f32>().unwrap();
        let b = scorer.score(&drawing).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_scores_in_unit_range() {
        let side = 32;
        let pixels: Vec<f32> = (0..side * side).map(|i| (i % 11) as f32).collect();
        let scorer = PatchImportanceScorer::new(4).unwrap();
        let scores = scorer.score(&drawing_from(pixels, 1, side)).unwrap();
        let values = scores.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| (0.0..=1.0 + 1e-6).contains(&v)));
        let max = values.iter().cloned().fold(f32::MIN, f32::max);
        assert!((max - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_patch_size_rejected() {
        assert!(PatchImportanceScorer::new(0).is_err());
    }

    #[test]
    fn test_wrong_channel_count_rejected() {
        let scorer = PatchImportanceScorer::new(4).unwrap();
        let rgb = Tensor::zeros((1, 3, 16, 16), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            scorer.score(&rgb),
            Err(UnifiedError::Validation { .. })
        ));
    }

    #[test]
    fn test_indivisible_dims_rejected() {
        let scorer = PatchImportanceScorer::new(4).unwrap();
        let drawing = zeros(1, 30);
        assert!(matches!(
            scorer.score(&drawing),
            Err(UnifiedError::Validation { .. })
        ));
    }
}
