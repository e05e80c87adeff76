//! # Model Architectures

#![allow(dead_code)]

pub mod traits;
pub mod vision;

// Re-export the backbone capability interface
pub use traits::VisionBackbone;

// Re-export the concrete ViT adapter
pub use vision::{ViTBackbone, ViTBackboneConfig};
