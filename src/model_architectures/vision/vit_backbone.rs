//! Vision Transformer Backbone
//!
//! Adapter over a standard pretrained ViT checkpoint (timm weight layout:
//! fused qkv projections, conv-style patch projection, `pos_embed` with a
//! leading CLS slot). Supports loading from a local directory or the
//! HuggingFace hub, plus a freshly initialized variant for tests and
//! training from scratch.
//!
//! The selective model consumes this type through the [`VisionBackbone`]
//! capability trait and resizes it through the surgery methods: the patch
//! projection and positional table are replaced for the configured grid
//! (their pretrained shapes cannot carry over), the head is replaced for the
//! configured label count, and everything else keeps its pretrained weights.

use crate::core::{ConfigErrorType, ModelErrorType, UnifiedError, UnifiedResult};
use crate::model_architectures::traits::VisionBackbone;
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::init::DEFAULT_KAIMING_NORMAL;
use candle_nn::{layer_norm, linear, Dropout, Init, LayerNorm, Linear, Module, VarBuilder, VarMap};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Deserialize;
use std::path::Path;

fn default_image_size() -> usize {
    224
}
fn default_patch_size() -> usize {
    16
}
fn default_hidden_size() -> usize {
    192
}
fn default_num_hidden_layers() -> usize {
    12
}
fn default_num_attention_heads() -> usize {
    3
}
fn default_intermediate_size() -> usize {
    768
}
fn default_layer_norm_eps() -> f64 {
    1e-6
}
fn default_drop_rate() -> f32 {
    0.0
}
fn default_num_classes() -> usize {
    1000
}

/// Vision Transformer backbone configuration
///
/// Defaults match ViT-Tiny/16 at 224x224, the checkpoint family the
/// selective model is typically built on.
#[derive(Debug, Clone, Deserialize)]
pub struct ViTBackboneConfig {
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_drop_rate")]
    pub drop_rate: f32,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

impl Default for ViTBackboneConfig {
    fn default() -> Self {
        Self::vit_tiny()
    }
}

impl ViTBackboneConfig {
    /// ViT-Tiny/16 configuration (192-dim, 12 layers, 3 heads)
    pub fn vit_tiny() -> Self {
        Self {
            image_size: default_image_size(),
            patch_size: default_patch_size(),
            hidden_size: default_hidden_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            intermediate_size: default_intermediate_size(),
            layer_norm_eps: default_layer_norm_eps(),
            drop_rate: default_drop_rate(),
            num_classes: default_num_classes(),
        }
    }

    /// Load configuration from a local directory or HuggingFace model id
    pub fn from_pretrained(model_id: &str) -> UnifiedResult<Self> {
        let (config_path, _) = resolve_model_files(model_id)?;
        let config_json = std::fs::read_to_string(&config_path).map_err(|e| UnifiedError::IO {
            operation: "read config".to_string(),
            path: Some(config_path.clone()),
            source: e,
        })?;
        serde_json::from_str(&config_json).map_err(|e| UnifiedError::Configuration {
            operation: "parse config".to_string(),
            source: ConfigErrorType::ParseError(e.to_string()),
            context: Some(config_path),
        })
    }

    fn grid_side(&self) -> usize {
        self.image_size / self.patch_size
    }
}

/// Resolve config and weight files (local directory or HuggingFace hub)
fn resolve_model_files(model_id: &str) -> UnifiedResult<(String, String)> {
    if Path::new(model_id).exists() {
        let dir = Path::new(model_id);
        let config_path = dir.join("config.json").to_string_lossy().to_string();
        let weights_path = if dir.join("model.safetensors").exists() {
            dir.join("model.safetensors").to_string_lossy().to_string()
        } else {
            dir.join("pytorch_model.bin").to_string_lossy().to_string()
        };
        Ok((config_path, weights_path))
    } else {
        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, "main".to_string());
        let api = Api::new().map_err(|e| UnifiedError::IO {
            operation: "create HuggingFace API".to_string(),
            path: None,
            source: std::io::Error::other(format!("{}", e)),
        })?;
        let api = api.repo(repo);

        let config = api.get("config.json").map_err(|e| UnifiedError::IO {
            operation: "download config".to_string(),
            path: Some("config.json".to_string()),
            source: std::io::Error::other(format!("{}", e)),
        })?;

        // Prefer safetensors; older ViT exports only ship pytorch_model.bin
        let weights = match api.get("model.safetensors") {
            Ok(path) => path,
            Err(_) => {
                eprintln!("model.safetensors not found for {}, falling back to pytorch_model.bin", model_id);
                api.get("pytorch_model.bin").map_err(|e| UnifiedError::IO {
                    operation: "download weights".to_string(),
                    path: Some("pytorch_model.bin".to_string()),
                    source: std::io::Error::other(format!("{}", e)),
                })?
            }
        };

        Ok((
            config.to_string_lossy().to_string(),
            weights.to_string_lossy().to_string(),
        ))
    }
}

/// Vision Transformer backbone with replaceable patch/positional/head
/// components
pub struct ViTBackbone {
    config: ViTBackboneConfig,
    device: Device,
    patch_embedding: Linear,
    patch_in_features: usize,
    patch_size: usize,
    num_patches: usize,
    cls_token: Tensor,
    pos_embed: Tensor,
    blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
    head: Linear,
    num_classes: usize,
    drop: Dropout,
}

impl ViTBackbone {
    /// Load a pretrained backbone from a local directory or HuggingFace id
    pub fn from_pretrained(model_id: &str, device: Device) -> UnifiedResult<Self> {
        let config = ViTBackboneConfig::from_pretrained(model_id)?;
        let (_, weights_path) = resolve_model_files(model_id)?;

        eprintln!("Loading ViT backbone weights from: {}", weights_path);
        let vb = if weights_path.ends_with(".safetensors") {
            unsafe {
                VarBuilder::from_mmaped_safetensors(&[&weights_path], DType::F32, &device)
            }
        } else {
            VarBuilder::from_pth(&weights_path, DType::F32, &device)
        }
        .map_err(|e| UnifiedError::Model {
            model_type: ModelErrorType::Backbone,
            operation: "load weights".to_string(),
            source: format!("failed to load {}: {}", weights_path, e),
            context: None,
        })?;

        Self::build(config, vb, device).map_err(|e| UnifiedError::Model {
            model_type: ModelErrorType::Backbone,
            operation: "build backbone".to_string(),
            source: e.to_string(),
            context: Some(model_id.to_string()),
        })
    }

    /// Freshly initialized backbone (no pretrained weights)
    ///
    /// Weight layers get Kaiming-normal init, the CLS token and positional
    /// table get normal(0, 0.02), norms start at identity. Used by unit
    /// tests and by training from scratch.
    pub fn random(config: ViTBackboneConfig, device: Device) -> UnifiedResult<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        Self::build(config, vb, device).map_err(|e| UnifiedError::Model {
            model_type: ModelErrorType::Backbone,
            operation: "initialize backbone".to_string(),
            source: e.to_string(),
            context: None,
        })
    }

    /// Backbone configuration
    pub fn config(&self) -> &ViTBackboneConfig {
        &self.config
    }

    fn build(
        config: ViTBackboneConfig,
        vb: VarBuilder,
        device: Device,
    ) -> candle_core::Result<Self> {
        let d = config.hidden_size;
        let p = config.patch_size;
        let num_patches = config.grid_side() * config.grid_side();
        let patch_in_features = 3 * p * p;

        // Checkpoints store the patch projection as a conv kernel
        // [d, 3, p, p]; flattening it gives the equivalent Linear over
        // flattened patch pixels.
        let conv_weight = vb.get_with_hints(
            (d, 3, p, p),
            "patch_embed.proj.weight",
            DEFAULT_KAIMING_NORMAL,
        )?;
        let patch_weight = conv_weight.reshape((d, patch_in_features))?;
        let patch_bias = vb.get_with_hints(d, "patch_embed.proj.bias", Init::Const(0.))?;
        let patch_embedding = Linear::new(patch_weight, Some(patch_bias));

        let cls_token = vb.get_with_hints(
            (1, 1, d),
            "cls_token",
            Init::Randn {
                mean: 0.,
                stdev: 0.02,
            },
        )?;
        let pos_embed = vb.get_with_hints(
            (1, num_patches + 1, d),
            "pos_embed",
            Init::Randn {
                mean: 0.,
                stdev: 0.02,
            },
        )?;

        let mut blocks = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            blocks.push(TransformerBlock::new(&config, vb.pp(format!("blocks.{}", i)))?);
        }

        let final_norm = layer_norm(d, config.layer_norm_eps, vb.pp("norm"))?;
        let head = linear(d, config.num_classes, vb.pp("head"))?;
        let num_classes = config.num_classes;
        let patch_size = p;
        let drop = Dropout::new(config.drop_rate);

        Ok(Self {
            config,
            device,
            patch_embedding,
            patch_in_features,
            patch_size,
            num_patches,
            cls_token,
            pos_embed,
            blocks,
            final_norm,
            head,
            num_classes,
            drop,
        })
    }
}

impl VisionBackbone for ViTBackbone {
    fn embed_dim(&self) -> usize {
        self.config.hidden_size
    }

    fn num_patches(&self) -> usize {
        self.num_patches
    }

    fn patch_embed(&self, images: &Tensor) -> Result<Tensor> {
        let (batch, channels, height, width) = images.dims4()?;
        let p = self.patch_size;
        if channels * p * p != self.patch_in_features {
            anyhow::bail!(
                "patch projection expects {} input features per patch, image has {} channels",
                self.patch_in_features,
                channels
            );
        }
        if height % p != 0 || width % p != 0 {
            anyhow::bail!(
                "image size {}x{} is not a multiple of patch size {}",
                height,
                width,
                p
            );
        }
        let grid_h = height / p;
        let grid_w = width / p;

        // [B, C, H, W] -> [B, grid_h, grid_w, C, p, p] -> [B, N, C*p*p],
        // row-major patch order
        let patches = images
            .reshape((batch, channels, grid_h, p, grid_w, p))?
            .permute((0, 2, 4, 1, 3, 5))?
            .contiguous()?
            .reshape((batch, grid_h * grid_w, channels * p * p))?;

        let embedded = self.patch_embedding.forward(&patches)?;
        Ok(embedded)
    }

    fn pos_embed(&self) -> &Tensor {
        &self.pos_embed
    }

    fn cls_token(&self) -> &Tensor {
        &self.cls_token
    }

    fn forward_blocks(&self, sequence: &Tensor) -> Result<Tensor> {
        let mut hidden = sequence.clone();
        for block in &self.blocks {
            hidden = block.forward(&hidden)?;
        }
        Ok(hidden)
    }

    fn norm(&self, sequence: &Tensor) -> Result<Tensor> {
        let out = self.final_norm.forward(sequence)?;
        Ok(out)
    }

    fn head(&self, pooled: &Tensor) -> Result<Tensor> {
        let out = self.head.forward(pooled)?;
        Ok(out)
    }

    fn dropout(&self, sequence: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.drop.forward(sequence, train)?;
        Ok(out)
    }

    fn num_parameters(&self) -> usize {
        let d = self.config.hidden_size;
        let i = self.config.intermediate_size;
        let patch = d * self.patch_in_features + d;
        let cls = d;
        let pos = (self.num_patches + 1) * d;
        // qkv + out projection + two norms + mlp, per block
        let per_block = (3 * d * d + 3 * d) + (d * d + d) + 2 * (2 * d) + (i * d + i) + (d * i + d);
        let norm = 2 * d;
        let head = self.num_classes * d + self.num_classes;
        patch + cls + pos + self.config.num_hidden_layers * per_block + norm + head
    }

    fn adapt_patch_grid(&mut self, img_size: usize, patch_size: usize) -> Result<()> {
        if patch_size == 0 || img_size % patch_size != 0 {
            anyhow::bail!(
                "img_size {} is not divisible by patch_size {}",
                img_size,
                patch_size
            );
        }
        let d = self.config.hidden_size;
        let grid = img_size / patch_size;
        let num_patches = grid * grid;
        let in_features = 3 * patch_size * patch_size;

        let weight = Tensor::randn(0f32, 0.02f32, (d, in_features), &self.device)?;
        let bias = Tensor::zeros(d, DType::F32, &self.device)?;
        self.patch_embedding = Linear::new(weight, Some(bias));

        // Truncated normal, std 0.02: the pretrained table has the wrong
        // number of positions and cannot be reused.
        let pos = Tensor::randn(0f32, 0.02f32, (1, num_patches + 1, d), &self.device)?
            .clamp(-0.04, 0.04)?;
        self.pos_embed = pos;

        self.patch_size = patch_size;
        self.patch_in_features = in_features;
        self.num_patches = num_patches;
        Ok(())
    }

    fn adapt_head(&mut self, num_classes: usize) -> Result<()> {
        if num_classes == 0 {
            anyhow::bail!("num_classes must be at least 1");
        }
        let d = self.config.hidden_size;
        let weight = Tensor::randn(0f32, 0.02f32, (num_classes, d), &self.device)?;
        let bias = Tensor::zeros(num_classes, DType::F32, &self.device)?;
        self.head = Linear::new(weight, Some(bias));
        self.num_classes = num_classes;
        Ok(())
    }
}

/// Pre-norm transformer block
struct TransformerBlock {
    norm1: LayerNorm,
    attn: SelfAttention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl TransformerBlock {
    fn new(config: &ViTBackboneConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let norm1 = layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("norm1"))?;
        let attn = SelfAttention::new(config, vb.pp("attn"))?;
        let norm2 = layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("norm2"))?;
        let mlp = Mlp::new(config, vb.pp("mlp"))?;
        Ok(Self {
            norm1,
            attn,
            norm2,
            mlp,
        })
    }

    fn forward(&self, hidden: &Tensor) -> candle_core::Result<Tensor> {
        let residual = hidden;
        let hidden = self.norm1.forward(residual)?;
        let hidden = self.attn.forward(&hidden)?;
        let hidden = (hidden + residual)?;

        let residual = &hidden;
        let out = self.norm2.forward(residual)?;
        let out = self.mlp.forward(&out)?;
        let out = (out + residual)?;
        Ok(out)
    }
}

/// Multi-head self-attention
///
/// timm checkpoints fuse q/k/v into one projection; the fused weight is
/// split here so the forward pass reads like the rest of the crate.
struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(config: &ViTBackboneConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let d = config.hidden_size;
        let head_dim = d / config.num_attention_heads;

        let qkv_weight = vb.get_with_hints((3 * d, d), "qkv.weight", DEFAULT_KAIMING_NORMAL)?;
        let qkv_bias = vb.get_with_hints(3 * d, "qkv.bias", Init::Const(0.))?;
        let q_proj = Linear::new(
            qkv_weight.narrow(0, 0, d)?,
            Some(qkv_bias.narrow(0, 0, d)?),
        );
        let k_proj = Linear::new(
            qkv_weight.narrow(0, d, d)?,
            Some(qkv_bias.narrow(0, d, d)?),
        );
        let v_proj = Linear::new(
            qkv_weight.narrow(0, 2 * d, d)?,
            Some(qkv_bias.narrow(0, 2 * d, d)?),
        );
        let out_proj = linear(d, d, vb.pp("proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads: config.num_attention_heads,
            head_dim,
        })
    }

    fn forward(&self, hidden: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, seq_len, hidden_size) = hidden.dims3()?;

        let q = self.q_proj.forward(hidden)?;
        let k = self.k_proj.forward(hidden)?;
        let v = self.v_proj.forward(hidden)?;

        // [B, L, D] -> [B, num_heads, L, head_dim]
        let q = q
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .permute((0, 2, 1, 3))?
            .contiguous()?;
        let k = k
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .permute((0, 2, 1, 3))?
            .contiguous()?;
        let v = v
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .permute((0, 2, 1, 3))?
            .contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.t()?)? * scale)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((batch, seq_len, hidden_size))?;
        self.out_proj.forward(&attn_output)
    }
}

/// Two-layer GELU MLP
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(config: &ViTBackboneConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let fc1 = linear(config.hidden_size, config.intermediate_size, vb.pp("fc1"))?;
        let fc2 = linear(config.intermediate_size, config.hidden_size, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    fn forward(&self, hidden: &Tensor) -> candle_core::Result<Tensor> {
        let hidden = self.fc1.forward(hidden)?;
        let hidden = hidden.gelu()?;
        self.fc2.forward(&hidden)
    }
}
