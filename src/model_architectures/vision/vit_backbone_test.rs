//! Unit tests for the ViT backbone adapter
//!
//! All tests run on a freshly initialized backbone; no checkpoint files are
//! required.

use super::vit_backbone::{ViTBackbone, ViTBackboneConfig};
use crate::model_architectures::traits::VisionBackbone;
use candle_core::{Device, Tensor};
use rstest::rstest;

fn small_config() -> ViTBackboneConfig {
    ViTBackboneConfig {
        image_size: 32,
        patch_size: 16,
        hidden_size: 16,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        intermediate_size: 32,
        layer_norm_eps: 1e-6,
        drop_rate: 0.0,
        num_classes: 8,
    }
}

fn small_backbone() -> ViTBackbone {
    ViTBackbone::random(small_config(), Device::Cpu).unwrap()
}

#[test]
fn test_random_backbone_component_shapes() {
    let backbone = small_backbone();
    assert_eq!(backbone.embed_dim(), 16);
    assert_eq!(backbone.num_patches(), 4);
    assert_eq!(backbone.pos_embed().dims3().unwrap(), (1, 5, 16));
    assert_eq!(backbone.cls_token().dims3().unwrap(), (1, 1, 16));
}

#[rstest]
#[case(1, 32, 4)]
#[case(3, 32, 4)]
#[case(2, 64, 16)]
fn test_patch_embed_shape(#[case] batch: usize, #[case] img: usize, #[case] expected_n: usize) {
    let backbone = small_backbone();
    let images = Tensor::rand(0f32, 1f32, (batch, 3, img, img), &Device::Cpu).unwrap();
    let embedded = backbone.patch_embed(&images).unwrap();
    assert_eq!(embedded.dims3().unwrap(), (batch, expected_n, 16));
}

#[test]
fn test_patch_embed_rejects_indivisible_image() {
    let backbone = small_backbone();
    let images = Tensor::rand(0f32, 1f32, (1, 3, 30, 30), &Device::Cpu).unwrap();
    assert!(backbone.patch_embed(&images).is_err());
}

#[test]
fn test_forward_blocks_preserves_sequence_shape() {
    let backbone = small_backbone();
    let sequence = Tensor::rand(0f32, 1f32, (2, 5, 16), &Device::Cpu).unwrap();
    let out = backbone.forward_blocks(&sequence).unwrap();
    assert_eq!(out.dims3().unwrap(), (2, 5, 16));

    let normed = backbone.norm(&out).unwrap();
    assert_eq!(normed.dims3().unwrap(), (2, 5, 16));
}

#[test]
fn test_forward_blocks_deterministic() {
    let backbone = small_backbone();
    let sequence = Tensor::rand(0f32, 1f32, (1, 5, 16), &Device::Cpu).unwrap();
    let a = backbone
        .forward_blocks(&sequence)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    let b = backbone
        .forward_blocks(&sequence)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_head_output_classes() {
    let backbone = small_backbone();
    let pooled = Tensor::rand(0f32, 1f32, (2, 16), &Device::Cpu).unwrap();
    let logits = backbone.head(&pooled).unwrap();
    assert_eq!(logits.dims2().unwrap(), (2, 8));
}

#[test]
fn test_dropout_identity_at_inference() {
    let backbone = small_backbone();
    let sequence = Tensor::rand(0f32, 1f32, (1, 5, 16), &Device::Cpu).unwrap();
    let out = backbone.dropout(&sequence, false).unwrap();
    let original = sequence.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let dropped = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(original, dropped);
}

#[test]
fn test_adapt_patch_grid_resizes_components() {
    let mut backbone = small_backbone();
    backbone.adapt_patch_grid(64, 4).unwrap();

    assert_eq!(backbone.num_patches(), 256);
    assert_eq!(backbone.pos_embed().dims3().unwrap(), (1, 257, 16));

    let images = Tensor::rand(0f32, 1f32, (1, 3, 64, 64), &Device::Cpu).unwrap();
    let embedded = backbone.patch_embed(&images).unwrap();
    assert_eq!(embedded.dims3().unwrap(), (1, 256, 16));
}

#[test]
fn test_adapt_patch_grid_rejects_indivisible() {
    let mut backbone = small_backbone();
    assert!(backbone.adapt_patch_grid(30, 4).is_err());
}

#[test]
fn test_fresh_positional_table_is_truncated_normal() {
    let mut backbone = small_backbone();
    backbone.adapt_patch_grid(64, 4).unwrap();
    let values = backbone
        .pos_embed()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert!(values.iter().all(|&v| (-0.04..=0.04).contains(&v)));
    assert!(values.iter().any(|&v| v != 0.0));
}

#[test]
fn test_adapt_head_resizes_output() {
    let mut backbone = small_backbone();
    let before = backbone.num_parameters();

    backbone.adapt_head(3).unwrap();
    let pooled = Tensor::rand(0f32, 1f32, (2, 16), &Device::Cpu).unwrap();
    let logits = backbone.head(&pooled).unwrap();
    assert_eq!(logits.dims2().unwrap(), (2, 3));

    let after = backbone.num_parameters();
    assert!(after < before, "a smaller head means fewer parameters");
}

#[test]
fn test_adapt_head_rejects_zero_classes() {
    let mut backbone = small_backbone();
    assert!(backbone.adapt_head(0).is_err());
}

#[test]
fn test_num_parameters_positive() {
    let backbone = small_backbone();
    assert!(backbone.num_parameters() > 0);
}
