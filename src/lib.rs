//! # Selective Vision Transformer
//!
//! A Vision Transformer that processes only the image patches an auxiliary
//! "line drawing" signal marks as informative. Patch importance is scored
//! from local line density, a fixed-size spatially coherent subset is
//! selected, and only that subset (plus the CLS token) runs through a
//! pretrained transformer backbone - fewer tokens per image with the
//! informative regions preserved.
//!
//! Pipeline: line drawing -> [`PatchImportanceScorer`] -> scores; magno
//! image -> backbone patch embedding -> all-patch embeddings; (scores,
//! embeddings, positional table, line drawing) ->
//! [`SpatialThresholdSelector`] -> selected sequence; CLS + selected ->
//! transformer blocks -> logits.

#![allow(dead_code)]

pub mod core;
pub mod model_architectures;
pub mod selection;
pub mod selective_vit;

pub use crate::core::{UnifiedError, UnifiedResult};
pub use model_architectures::{ViTBackbone, ViTBackboneConfig, VisionBackbone};
pub use selection::{
    GaussianSmoothing, PatchImportanceScorer, SpatialSmoothing, SpatialThresholdSelector,
};
pub use selective_vit::{ModelInfo, SelectiveVisionModel, SelectiveVitConfig};
