//! Selective Vision Transformer
//!
//! The full classification model: patches are scored from the line drawing,
//! a fixed-size spatially coherent subset is selected, and only that subset
//! (plus the CLS token) runs through the transformer backbone.
//!
//! The model works in three stages:
//! 1. Score patches by line drawing density ([`PatchImportanceScorer`])
//! 2. Select important patches with the spatial threshold strategy
//!    ([`SpatialThresholdSelector`]), which also injects positional
//!    embeddings by original patch index
//! 3. Run the selected sequence through the pretrained backbone and
//!    classify from the CLS output

use crate::core::{ConfigErrorType, ModelErrorType, UnifiedError, UnifiedResult};
use crate::model_architectures::traits::VisionBackbone;
use crate::model_architectures::vision::{ViTBackbone, ViTBackboneConfig};
use crate::selection::{PatchImportanceScorer, SpatialThresholdSelector};
use candle_core::{Device, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

fn default_patch_percentage() -> f32 {
    0.4
}
fn default_num_classes() -> usize {
    10
}
fn default_img_size() -> usize {
    64
}
fn default_patch_size() -> usize {
    4
}
fn default_vit_model_name() -> String {
    "vit_tiny_patch16_224".to_string()
}
fn default_threshold() -> f32 {
    0.3
}
fn default_gaussian_std() -> f32 {
    0.25
}

/// Selective model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectiveVitConfig {
    /// Fraction of patches to keep, in (0, 1]
    #[serde(default = "default_patch_percentage")]
    pub patch_percentage: f32,
    /// Number of output classes
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Input image size (square)
    #[serde(default = "default_img_size")]
    pub img_size: usize,
    /// Patch side length; must divide `img_size`
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    /// Backbone checkpoint identifier (local directory or hub id)
    #[serde(default = "default_vit_model_name")]
    pub vit_model_name: String,
    /// Raw-score cutoff that privileges patches during selection
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Spatial smoothing std, in patch-grid cells
    #[serde(default = "default_gaussian_std")]
    pub gaussian_std: f32,
}

impl Default for SelectiveVitConfig {
    fn default() -> Self {
        Self {
            patch_percentage: default_patch_percentage(),
            num_classes: default_num_classes(),
            img_size: default_img_size(),
            patch_size: default_patch_size(),
            vit_model_name: default_vit_model_name(),
            threshold: default_threshold(),
            gaussian_std: default_gaussian_std(),
        }
    }
}

impl SelectiveVitConfig {
    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> UnifiedResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| UnifiedError::Configuration {
                operation: "parse config".to_string(),
                source: ConfigErrorType::ParseError(e.to_string()),
                context: None,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &str) -> UnifiedResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| UnifiedError::IO {
            operation: "read config".to_string(),
            path: Some(path.to_string()),
            source: e,
        })?;
        Self::from_json(&json)
    }

    fn validate(&self) -> UnifiedResult<()> {
        if !(self.patch_percentage > 0.0 && self.patch_percentage <= 1.0) {
            return Err(UnifiedError::config(
                "model construction",
                "patch_percentage",
                format!("must be in (0, 1], got {}", self.patch_percentage),
            ));
        }
        if self.patch_size == 0 {
            return Err(UnifiedError::config(
                "model construction",
                "patch_size",
                "must be at least 1",
            ));
        }
        if self.img_size % self.patch_size != 0 {
            return Err(UnifiedError::config(
                "model construction",
                "img_size",
                format!(
                    "img_size ({}) must be divisible by patch_size ({})",
                    self.img_size, self.patch_size
                ),
            ));
        }
        if self.num_classes == 0 {
            return Err(UnifiedError::config(
                "model construction",
                "num_classes",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    fn grid_side(&self) -> usize {
        self.img_size / self.patch_size
    }
}

/// Static model summary for logging and experiment tracking
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub vit_backbone: String,
    pub img_size: usize,
    pub patch_size: usize,
    pub num_patches: usize,
    pub selected_patches: usize,
    pub patch_percentage: f32,
    pub embed_dim: usize,
    pub num_classes: usize,
    pub total_params: usize,
}

/// Vision Transformer that processes only the patches the line drawing
/// marks as informative.
pub struct SelectiveVisionModel {
    config: SelectiveVitConfig,
    scorer: PatchImportanceScorer,
    selector: SpatialThresholdSelector,
    backbone: Box<dyn VisionBackbone>,
    num_patches: usize,
}

impl SelectiveVisionModel {
    /// Build the model around an already-constructed backbone.
    ///
    /// Validates the configuration, then adapts the backbone to the
    /// configured patch grid and label count (patch projection, positional
    /// table and head are replaced; the pretrained blocks are kept).
    pub fn new(
        config: SelectiveVitConfig,
        mut backbone: Box<dyn VisionBackbone>,
    ) -> UnifiedResult<Self> {
        config.validate()?;

        backbone
            .adapt_patch_grid(config.img_size, config.patch_size)
            .map_err(|e| UnifiedError::Model {
                model_type: ModelErrorType::Backbone,
                operation: "adapt patch grid".to_string(),
                source: e.to_string(),
                context: None,
            })?;
        backbone
            .adapt_head(config.num_classes)
            .map_err(|e| UnifiedError::Model {
                model_type: ModelErrorType::Backbone,
                operation: "adapt head".to_string(),
                source: e.to_string(),
                context: None,
            })?;

        let scorer = PatchImportanceScorer::new(config.patch_size)?;
        let selector = SpatialThresholdSelector::new(
            config.patch_percentage,
            config.threshold,
            config.gaussian_std,
        )?;
        let num_patches = config.grid_side() * config.grid_side();

        Ok(Self {
            config,
            scorer,
            selector,
            backbone,
            num_patches,
        })
    }

    /// Build the model on a pretrained backbone checkpoint
    pub fn from_pretrained(config: SelectiveVitConfig, device: Device) -> UnifiedResult<Self> {
        let backbone = ViTBackbone::from_pretrained(&config.vit_model_name, device)?;
        Self::new(config, Box::new(backbone))
    }

    /// Build the model on a freshly initialized backbone (tests, training
    /// from scratch)
    pub fn from_random(
        config: SelectiveVitConfig,
        backbone_config: ViTBackboneConfig,
        device: Device,
    ) -> UnifiedResult<Self> {
        let backbone = ViTBackbone::random(backbone_config, device)?;
        Self::new(config, Box::new(backbone))
    }

    pub fn config(&self) -> &SelectiveVitConfig {
        &self.config
    }

    /// Inference forward pass: classification logits of shape
    /// `(B, num_classes)`
    pub fn forward(&self, magno_image: &Tensor, line_drawing: &Tensor) -> UnifiedResult<Tensor> {
        self.forward_t(magno_image, line_drawing, false)
    }

    /// Forward pass with an explicit train flag (enables dropout)
    pub fn forward_t(
        &self,
        magno_image: &Tensor,
        line_drawing: &Tensor,
        train: bool,
    ) -> UnifiedResult<Tensor> {
        self.validate_inputs(magno_image, line_drawing)?;

        // 1. Score patches from the line drawing
        let patch_scores = self.scorer.score(line_drawing)?;

        // 2. Embed every patch of the magno image
        let all_patches = self
            .backbone
            .patch_embed(magno_image)
            .map_err(|e| UnifiedError::processing("patch embedding", e))?;

        // 3. Select the spatially coherent subset, positions included
        let selected = self.selector.select(
            &all_patches,
            self.backbone.pos_embed(),
            &patch_scores,
            line_drawing,
        )?;

        // 4..9. CLS token, dropout, transformer blocks, norm, head
        self.classify(&selected, train)
            .map_err(|e| UnifiedError::processing("transformer forward", e))
    }

    fn classify(&self, selected: &Tensor, train: bool) -> anyhow::Result<Tensor> {
        let (batch, _, embed_dim) = selected.dims3()?;

        let cls_pos = self.backbone.pos_embed().narrow(1, 0, 1)?;
        let cls_with_pos = (self.backbone.cls_token() + &cls_pos)?;
        let cls_with_pos = cls_with_pos.expand((batch, 1, embed_dim))?;

        let sequence = Tensor::cat(&[&cls_with_pos, selected], 1)?;
        let sequence = self.backbone.dropout(&sequence, train)?;

        let hidden = self.backbone.forward_blocks(&sequence)?;
        let hidden = self.backbone.norm(&hidden)?;

        let pooled = hidden.i((.., 0, ..))?;
        let logits = self.backbone.head(&pooled)?;
        Ok(logits)
    }

    /// Top-k patch indices by raw score, per batch element, descending.
    ///
    /// Visualization helper: deliberately simpler than the selection used
    /// in `forward` (no spatial term), so the view reflects the scorer
    /// alone.
    pub fn get_selected_patch_indices(
        &self,
        line_drawing: &Tensor,
    ) -> UnifiedResult<Vec<Vec<u32>>> {
        let patch_scores = self.scorer.score(line_drawing)?;
        let rows = patch_scores
            .to_vec2::<f32>()
            .map_err(|e| UnifiedError::processing("score readback", e))?;
        let k = self.get_num_selected_patches();
        Ok(rows.iter().map(|row| top_k_descending(row, k)).collect())
    }

    /// Patch scores reshaped to the 2D grid, shape `(B, 1, S, S)` with
    /// `S = img_size / patch_size`. Flattening the map row-major recovers
    /// the scorer output exactly.
    pub fn get_patch_importance_map(&self, line_drawing: &Tensor) -> UnifiedResult<Tensor> {
        let patch_scores = self.scorer.score(line_drawing)?;
        let (batch, _) = patch_scores
            .dims2()
            .map_err(|e| UnifiedError::processing("importance map", e))?;
        let side = self.config.grid_side();
        patch_scores
            .reshape((batch, 1, side, side))
            .map_err(|e| UnifiedError::processing("importance map reshape", e))
    }

    /// Number of patches the selector keeps per image
    pub fn get_num_selected_patches(&self) -> usize {
        self.selector.selection_size(self.num_patches)
    }

    /// Static configuration summary
    pub fn get_model_info(&self) -> ModelInfo {
        ModelInfo {
            model_name: "SelectiveVisionModel".to_string(),
            vit_backbone: self.config.vit_model_name.clone(),
            img_size: self.config.img_size,
            patch_size: self.config.patch_size,
            num_patches: self.num_patches,
            selected_patches: self.get_num_selected_patches(),
            patch_percentage: self.config.patch_percentage,
            embed_dim: self.backbone.embed_dim(),
            num_classes: self.config.num_classes,
            total_params: self.backbone.num_parameters(),
        }
    }

    fn validate_inputs(&self, magno_image: &Tensor, line_drawing: &Tensor) -> UnifiedResult<()> {
        let s = self.config.img_size;

        let (magno_batch, magno_ch, magno_h, magno_w) = magno_image.dims4().map_err(|_| {
            UnifiedError::validation(
                "magno_image",
                "rank-4 (B, 3, H, W)",
                format!("{:?}", magno_image.shape()),
            )
        })?;
        if magno_ch != 3 {
            return Err(UnifiedError::validation(
                "magno_image",
                "3 channels",
                format!("{} channels", magno_ch),
            ));
        }
        if magno_h != s || magno_w != s {
            return Err(UnifiedError::validation(
                "magno_image",
                format!("{}x{} spatial dims", s, s),
                format!("{}x{}", magno_h, magno_w),
            ));
        }

        let (line_batch, line_ch, line_h, line_w) = line_drawing.dims4().map_err(|_| {
            UnifiedError::validation(
                "line_drawing",
                "rank-4 (B, 1, H, W)",
                format!("{:?}", line_drawing.shape()),
            )
        })?;
        if line_ch != 1 {
            return Err(UnifiedError::validation(
                "line_drawing",
                "1 channel",
                format!("{} channels", line_ch),
            ));
        }
        if line_h != s || line_w != s {
            return Err(UnifiedError::validation(
                "line_drawing",
                format!("{}x{} spatial dims", s, s),
                format!("{}x{}", line_h, line_w),
            ));
        }
        if line_batch != magno_batch {
            return Err(UnifiedError::validation(
                "line_drawing",
                format!("batch size {}", magno_batch),
                format!("batch size {}", line_batch),
            ));
        }
        Ok(())
    }
}

/// Indices of the `k` largest values, descending, lower index first on ties
fn top_k_descending(row: &[f32], k: usize) -> Vec<u32> {
    let mut order: Vec<usize> = (0..row.len()).collect();
    order.sort_by(|&a, &b| {
        row[b]
            .partial_cmp(&row[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    order.into_iter().take(k).map(|i| i as u32).collect()
}
