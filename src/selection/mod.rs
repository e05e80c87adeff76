//! # Patch Selection
//!
//! The two collaborating components that decide which image patches survive:
//! a deterministic per-patch importance scorer driven by the line drawing,
//! and a spatially-aware threshold selector that turns those scores into a
//! fixed-size, position-tagged patch subset.

pub mod patch_scorer;
pub mod spatial_selector;

pub use patch_scorer::PatchImportanceScorer;
pub use spatial_selector::{GaussianSmoothing, SpatialSmoothing, SpatialThresholdSelector};
