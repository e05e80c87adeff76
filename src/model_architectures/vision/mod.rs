//! Vision Transformer Module
//!
//! Concrete backbone adapter plus image preprocessing helpers for the
//! selective patch pipeline.

pub mod image_utils;
pub mod vit_backbone;

pub use image_utils::{preprocess_line_drawing, preprocess_magno_image, ImagePreprocessingError};
pub use vit_backbone::{ViTBackbone, ViTBackboneConfig};

// Test modules
#[cfg(test)]
pub mod vit_backbone_test;
