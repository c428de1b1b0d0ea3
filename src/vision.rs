//! Vision encoder adapter.
//!
//! The underlying image towers are pluggable: anything implementing
//! [`VisionBackbone`] can feed the adapter. The crate ships a CLIP-style tower
//! that records every hidden state (so the penultimate layer is addressable)
//! and a wrapper for the candle-transformers SigLIP vision model; other
//! families (ViT, ConvNeXt) plug in through the trait. Whatever the tower's
//! native output shape, [`ImageEncoder::encode`] normalizes it to a
//! `(batch, tokens, dim)` sequence.
use candle::{IndexOp, Result, Tensor, D};
use candle_nn as nn;
use candle_nn::Module;
use candle_transformers::models::siglip;
use serde::{Deserialize, Serialize};

use crate::config::{AdapterConfig, ClipLayer};

/// Per-channel statistics and input resolution used when no pretrained
/// preprocessor config is available.
#[derive(Debug, Clone, Copy)]
pub struct NormalizationStats {
    pub mean: [f64; 3],
    pub std: [f64; 3],
    pub image_size: usize,
}

const CLIP_MEAN: [f64; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f64; 3] = [0.26862954, 0.26130258, 0.27577711];
const IMAGENET_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f64; 3] = [0.229, 0.224, 0.225];

/// Closed set of supported encoder families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderArch {
    #[serde(rename = "clip")]
    Clip,
    /// CLIP fed through a learned 4x downscale of a tiled input.
    #[serde(rename = "clip+")]
    ClipTiled,
    #[serde(rename = "siglip")]
    Siglip,
    #[serde(rename = "vit")]
    Vit,
    #[serde(rename = "convnext")]
    ConvNext,
    #[serde(rename = "convnextv2")]
    ConvNextV2,
}

impl EncoderArch {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "clip" => Ok(Self::Clip),
            "clip+" => Ok(Self::ClipTiled),
            "siglip" => Ok(Self::Siglip),
            "vit" => Ok(Self::Vit),
            "convnext" => Ok(Self::ConvNext),
            "convnextv2" => Ok(Self::ConvNextV2),
            _ => candle::bail!("unknown image encoder arch: {s}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clip => "clip",
            Self::ClipTiled => "clip+",
            Self::Siglip => "siglip",
            Self::Vit => "vit",
            Self::ConvNext => "convnext",
            Self::ConvNextV2 => "convnextv2",
        }
    }

    /// Families whose towers emit spatial feature maps rather than token
    /// sequences.
    pub fn is_convolutional(&self) -> bool {
        matches!(self, Self::ConvNext | Self::ConvNextV2)
    }

    /// Ratio between the preprocessor input resolution and the tower input
    /// resolution, bridged by the learned tiled preprocessor.
    pub fn downscale_factor(&self) -> usize {
        match self {
            Self::ClipTiled => 4,
            _ => 1,
        }
    }

    pub fn default_stats(&self) -> NormalizationStats {
        match self {
            Self::Clip | Self::ClipTiled => NormalizationStats {
                mean: CLIP_MEAN,
                std: CLIP_STD,
                image_size: 224,
            },
            Self::Siglip | Self::Vit => NormalizationStats {
                mean: [0.5, 0.5, 0.5],
                std: [0.5, 0.5, 0.5],
                image_size: 224,
            },
            Self::ConvNext => NormalizationStats {
                mean: CLIP_MEAN,
                std: CLIP_STD,
                image_size: 320,
            },
            Self::ConvNextV2 => NormalizationStats {
                mean: IMAGENET_MEAN,
                std: IMAGENET_STD,
                image_size: 512,
            },
        }
    }
}

/// Raw outputs of one tower forward pass.
///
/// `hidden_states` runs from the embedding output to the last layer; entries
/// are `(batch, tokens, dim)` for transformer towers and `(batch, channels,
/// h, w)` feature maps for convolutional ones.
pub struct VisionOutput {
    pub hidden_states: Vec<Tensor>,
    /// Pooled, projected embedding, `(batch, dim)`.
    pub image_embeds: Option<Tensor>,
}

/// The pluggable image tower.
pub trait VisionBackbone {
    fn forward(&self, pixel_values: &Tensor) -> Result<VisionOutput>;
    /// Feature dimension of the hidden-state sequence (last channel count for
    /// convolutional towers).
    fn embed_dim(&self) -> usize;
    /// Native sequence length, class token included.
    fn native_tokens(&self) -> usize;
    fn image_size(&self) -> usize;
    /// Dimension of `image_embeds`.
    fn projection_dim(&self) -> usize {
        self.embed_dim()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipVisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub projection_dim: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
}

fn default_num_channels() -> usize {
    3
}

impl ClipVisionConfig {
    // https://huggingface.co/openai/clip-vit-large-patch14/blob/main/config.json
    pub fn vit_large_patch14() -> Self {
        Self {
            hidden_size: 1024,
            intermediate_size: 4096,
            num_hidden_layers: 24,
            num_attention_heads: 16,
            projection_dim: 768,
            num_channels: 3,
            image_size: 224,
            patch_size: 14,
        }
    }

    pub fn vit_base_patch32() -> Self {
        Self {
            hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            projection_dim: 512,
            num_channels: 3,
            image_size: 224,
            patch_size: 32,
        }
    }
}

fn quick_gelu(xs: &Tensor) -> Result<Tensor> {
    xs * nn::ops::sigmoid(&(xs * 1.702f64)?)?
}

#[derive(Debug)]
struct ClipAttention {
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    out_proj: nn::Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl ClipAttention {
    fn new(vs: nn::VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        let embed_dim = c.hidden_size;
        let num_heads = c.num_attention_heads;
        let head_dim = embed_dim / num_heads;
        let q_proj = nn::linear(embed_dim, embed_dim, vs.pp("q_proj"))?;
        let k_proj = nn::linear(embed_dim, embed_dim, vs.pp("k_proj"))?;
        let v_proj = nn::linear(embed_dim, embed_dim, vs.pp("v_proj"))?;
        let out_proj = nn::linear(embed_dim, embed_dim, vs.pp("out_proj"))?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, d) = xs.dims3()?;
        xs.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .reshape((b * self.num_heads, t, d / self.num_heads))
    }
}

impl Module for ClipAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, d) = xs.dims3()?;
        let query = self.split_heads(&(self.q_proj.forward(xs)? * self.scale)?)?;
        let key = self.split_heads(&self.k_proj.forward(xs)?)?;
        let value = self.split_heads(&self.v_proj.forward(xs)?)?;
        let attn = nn::ops::softmax_last_dim(&query.matmul(&key.t()?)?)?;
        let out = attn
            .matmul(&value)?
            .reshape((b, self.num_heads, t, self.head_dim))?
            .transpose(1, 2)?
            .reshape((b, t, d))?;
        self.out_proj.forward(&out)
    }
}

#[derive(Debug)]
struct ClipMlp {
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl ClipMlp {
    fn new(vs: nn::VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        let fc1 = nn::linear(c.hidden_size, c.intermediate_size, vs.pp("fc1"))?;
        let fc2 = nn::linear(c.intermediate_size, c.hidden_size, vs.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for ClipMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&quick_gelu(&self.fc1.forward(xs)?)?)
    }
}

#[derive(Debug)]
struct ClipEncoderLayer {
    self_attn: ClipAttention,
    layer_norm1: nn::LayerNorm,
    mlp: ClipMlp,
    layer_norm2: nn::LayerNorm,
}

impl ClipEncoderLayer {
    fn new(vs: nn::VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        Ok(Self {
            self_attn: ClipAttention::new(vs.pp("self_attn"), c)?,
            layer_norm1: nn::layer_norm(c.hidden_size, 1e-5, vs.pp("layer_norm1"))?,
            mlp: ClipMlp::new(vs.pp("mlp"), c)?,
            layer_norm2: nn::layer_norm(c.hidden_size, 1e-5, vs.pp("layer_norm2"))?,
        })
    }
}

impl Module for ClipEncoderLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = (self.self_attn.forward(&self.layer_norm1.forward(xs)?)? + xs)?;
        self.mlp.forward(&self.layer_norm2.forward(&xs)?)? + xs
    }
}

#[derive(Debug)]
struct ClipVisionEmbeddings {
    patch_embedding: nn::Conv2d,
    class_embedding: Tensor,
    position_embedding: nn::Embedding,
    position_ids: Tensor,
}

impl ClipVisionEmbeddings {
    fn new(vs: nn::VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        let class_embedding = vs.get_with_hints(
            c.hidden_size,
            "class_embedding",
            nn::init::Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;
        let num_positions = (c.image_size / c.patch_size).pow(2) + 1;
        let position_ids = Tensor::arange(0u32, num_positions as u32, vs.device())?;
        let position_embedding =
            nn::embedding(num_positions, c.hidden_size, vs.pp("position_embedding"))?;
        let conv_cfg = nn::Conv2dConfig {
            stride: c.patch_size,
            ..Default::default()
        };
        let patch_embedding = nn::conv2d_no_bias(
            c.num_channels,
            c.hidden_size,
            c.patch_size,
            conv_cfg,
            vs.pp("patch_embedding"),
        )?;
        Ok(Self {
            patch_embedding,
            class_embedding,
            position_embedding,
            position_ids,
        })
    }
}

impl Module for ClipVisionEmbeddings {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let batch_size = pixel_values.dim(0)?;
        let patch_embeds = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let class_embeds =
            self.class_embedding
                .expand((batch_size, 1, self.class_embedding.dim(D::Minus1)?))?;
        let embeddings = Tensor::cat(&[class_embeds, patch_embeds], 1)?;
        let position_embedding = self.position_embedding.forward(&self.position_ids)?;
        embeddings.broadcast_add(&position_embedding)
    }
}

/// CLIP-style vision transformer recording every hidden state, plus the
/// projection head producing the pooled `image_embeds`.
///
/// Weight names follow the transformers `CLIPVisionModelWithProjection`
/// layout so pretrained safetensors load directly.
#[derive(Debug)]
pub struct ClipVisionTower {
    embeddings: ClipVisionEmbeddings,
    pre_layer_norm: nn::LayerNorm,
    layers: Vec<ClipEncoderLayer>,
    post_layer_norm: nn::LayerNorm,
    visual_projection: nn::Linear,
    config: ClipVisionConfig,
}

impl ClipVisionTower {
    pub fn new(vs: nn::VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        let vs_v = vs.pp("vision_model");
        let embeddings = ClipVisionEmbeddings::new(vs_v.pp("embeddings"), c)?;
        let pre_layer_norm = nn::layer_norm(c.hidden_size, 1e-5, vs_v.pp("pre_layrnorm"))?;
        let vs_l = vs_v.pp("encoder").pp("layers");
        let mut layers = Vec::with_capacity(c.num_hidden_layers);
        for index in 0..c.num_hidden_layers {
            layers.push(ClipEncoderLayer::new(vs_l.pp(index.to_string()), c)?)
        }
        let post_layer_norm = nn::layer_norm(c.hidden_size, 1e-5, vs_v.pp("post_layernorm"))?;
        let visual_projection = nn::linear_no_bias(
            c.hidden_size,
            c.projection_dim,
            vs.pp("visual_projection"),
        )?;
        Ok(Self {
            embeddings,
            pre_layer_norm,
            layers,
            post_layer_norm,
            visual_projection,
            config: c.clone(),
        })
    }

    pub fn config(&self) -> &ClipVisionConfig {
        &self.config
    }
}

impl VisionBackbone for ClipVisionTower {
    fn forward(&self, pixel_values: &Tensor) -> Result<VisionOutput> {
        let mut xs = pixel_values
            .apply(&self.embeddings)?
            .apply(&self.pre_layer_norm)?;
        let mut hidden_states = Vec::with_capacity(self.layers.len() + 1);
        hidden_states.push(xs.clone());
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?;
            hidden_states.push(xs.clone());
        }
        let pooled = xs.i((.., 0, ..))?.apply(&self.post_layer_norm)?;
        let image_embeds = self.visual_projection.forward(&pooled)?;
        Ok(VisionOutput {
            hidden_states,
            image_embeds: Some(image_embeds),
        })
    }

    fn embed_dim(&self) -> usize {
        self.config.hidden_size
    }

    fn native_tokens(&self) -> usize {
        (self.config.image_size / self.config.patch_size).pow(2) + 1
    }

    fn image_size(&self) -> usize {
        self.config.image_size
    }

    fn projection_dim(&self) -> usize {
        self.config.projection_dim
    }
}

/// Wrapper for the candle-transformers SigLIP vision model. The model only
/// exposes its final token sequence, so layer selection other than
/// `last_hidden_state` is rejected at encode time.
pub struct SiglipVisionBackbone {
    model: siglip::VisionModel,
    hidden_size: usize,
    native_tokens: usize,
    image_size: usize,
}

impl SiglipVisionBackbone {
    pub fn new(vs: nn::VarBuilder, c: &siglip::VisionConfig) -> Result<Self> {
        let model = siglip::VisionModel::new(c, false, vs)?;
        Ok(Self {
            model,
            hidden_size: c.hidden_size,
            native_tokens: (c.image_size / c.patch_size).pow(2),
            image_size: c.image_size,
        })
    }
}

impl VisionBackbone for SiglipVisionBackbone {
    fn forward(&self, pixel_values: &Tensor) -> Result<VisionOutput> {
        let last_hidden = self.model.forward(pixel_values)?;
        Ok(VisionOutput {
            hidden_states: vec![last_hidden],
            image_embeds: None,
        })
    }

    fn embed_dim(&self) -> usize {
        self.hidden_size
    }

    fn native_tokens(&self) -> usize {
        self.native_tokens
    }

    fn image_size(&self) -> usize {
        self.image_size
    }
}

/// Normalizes heterogeneous tower outputs into one token sequence.
pub struct ImageEncoder {
    arch: EncoderArch,
    clip_layer: ClipLayer,
    backbone: Box<dyn VisionBackbone>,
}

impl ImageEncoder {
    pub fn new(arch: EncoderArch, clip_layer: ClipLayer, backbone: Box<dyn VisionBackbone>) -> Self {
        Self {
            arch,
            clip_layer,
            backbone,
        }
    }

    /// Builds the tower named by the config on `vs`. Weight seeding from a
    /// pretrained checkpoint is handled by the caller; a lookup failure there
    /// is fatal. Convolutional and plain-ViT towers are external collaborators
    /// and come in through [`ImageEncoder::new`] instead.
    pub fn from_config(config: &AdapterConfig, vs: nn::VarBuilder) -> Result<Self> {
        let arch = config.image_encoder_arch;
        let backbone: Box<dyn VisionBackbone> = match arch {
            EncoderArch::Clip | EncoderArch::ClipTiled => {
                let c = match config.image_encoder_path.as_deref() {
                    Some(path) => clip_config_from_source(path)?,
                    None => ClipVisionConfig::vit_large_patch14(),
                };
                Box::new(ClipVisionTower::new(vs, &c)?)
            }
            EncoderArch::Siglip => {
                let c = match config.image_encoder_path.as_deref() {
                    Some(path) => siglip_config_from_source(path)?,
                    None => siglip::VisionConfig {
                        hidden_size: 768,
                        intermediate_size: 3072,
                        num_hidden_layers: 12,
                        num_attention_heads: 12,
                        num_channels: 3,
                        image_size: 224,
                        patch_size: 16,
                        hidden_act: candle_nn::Activation::GeluPytorchTanh,
                        layer_norm_eps: 1e-6,
                    },
                };
                Box::new(SiglipVisionBackbone::new(vs, &c)?)
            }
            EncoderArch::Vit | EncoderArch::ConvNext | EncoderArch::ConvNextV2 => candle::bail!(
                "{} towers are supplied by the caller, use IpAdapter::with_image_encoder",
                arch.as_str()
            ),
        };
        Ok(Self::new(arch, config.clip_layer, backbone))
    }

    pub fn arch(&self) -> EncoderArch {
        self.arch
    }

    pub fn embed_dim(&self) -> usize {
        self.backbone.embed_dim()
    }

    pub fn native_tokens(&self) -> usize {
        self.backbone.native_tokens()
    }

    pub fn image_size(&self) -> usize {
        self.backbone.image_size()
    }

    pub fn projection_dim(&self) -> usize {
        self.backbone.projection_dim()
    }

    /// Runs the tower and returns the configured layer as `(batch, tokens,
    /// dim)`, or `(batch, dim)` for the pooled embedding. Spatial feature maps
    /// are flattened over their spatial axes and transposed so the channel
    /// axis becomes the feature axis.
    pub fn encode(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let out = self.backbone.forward(pixel_values)?;
        let n = out.hidden_states.len();
        let embeds = match self.clip_layer {
            ClipLayer::Penultimate => {
                if n < 2 {
                    candle::bail!(
                        "{} tower does not expose a penultimate hidden state",
                        self.arch.as_str()
                    )
                }
                out.hidden_states[n - 2].clone()
            }
            ClipLayer::LastHidden => match out.hidden_states.last() {
                Some(hs) => hs.clone(),
                None => candle::bail!(
                    "{} tower does not expose hidden states",
                    self.arch.as_str()
                ),
            },
            ClipLayer::ImageEmbeds => match out.image_embeds {
                Some(e) => e,
                None => candle::bail!(
                    "{} tower does not expose a pooled embedding",
                    self.arch.as_str()
                ),
            },
        };
        if embeds.rank() == 4 {
            // (b, c, h, w) -> (b, h*w, c)
            embeds.flatten_from(2)?.transpose(1, 2)
        } else {
            Ok(embeds)
        }
    }
}

fn read_model_json(source: &str, name: &str) -> Result<serde_json::Value> {
    let local = std::path::Path::new(source).join(name);
    let bytes = if local.is_file() {
        std::fs::read(local).map_err(candle::Error::wrap)?
    } else {
        let api = hf_hub::api::sync::Api::new().map_err(candle::Error::wrap)?;
        let path = api
            .model(source.to_string())
            .get(name)
            .map_err(candle::Error::wrap)?;
        std::fs::read(path).map_err(candle::Error::wrap)?
    };
    serde_json::from_slice(&bytes).map_err(candle::Error::wrap)
}

fn clip_config_from_source(source: &str) -> Result<ClipVisionConfig> {
    let value = read_model_json(source, "config.json")?;
    let value = value.get("vision_config").cloned().unwrap_or(value);
    serde_json::from_value(value).map_err(candle::Error::wrap)
}

fn siglip_config_from_source(source: &str) -> Result<siglip::VisionConfig> {
    let value = read_model_json(source, "config.json")?;
    let value = value.get("vision_config").cloned().unwrap_or(value);
    serde_json::from_value(value).map_err(candle::Error::wrap)
}
