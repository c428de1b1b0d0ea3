//! Embedding projectors.
//!
//! Three interchangeable strategies map the encoder's output sequence onto a
//! fixed run of tokens at the backbone's cross-attention width: a linear
//! expansion of the pooled embedding, a perceiver-style resampler, and a
//! zipper resampler with explicit input/output token counts.
use candle::{DType, Result, Tensor, D};
use candle_nn as nn;
use candle_nn::Module;

use crate::backbone::BackboneConfig;
use crate::config::{AdapterConfig, AdapterType};
use crate::vision::ImageEncoder;

/// Linear expansion of a pooled embedding into a short token run.
#[derive(Debug)]
pub struct ImageProjModel {
    proj: nn::Linear,
    norm: nn::LayerNorm,
    num_tokens: usize,
    cross_attention_dim: usize,
}

impl ImageProjModel {
    pub fn new(
        vs: nn::VarBuilder,
        clip_embeddings_dim: usize,
        cross_attention_dim: usize,
        num_tokens: usize,
    ) -> Result<Self> {
        let proj = nn::linear(
            clip_embeddings_dim,
            num_tokens * cross_attention_dim,
            vs.pp("proj"),
        )?;
        let norm = nn::layer_norm(cross_attention_dim, 1e-5, vs.pp("norm"))?;
        Ok(Self {
            proj,
            norm,
            num_tokens,
            cross_attention_dim,
        })
    }
}

impl Module for ImageProjModel {
    fn forward(&self, embeds: &Tensor) -> Result<Tensor> {
        let embeds = match embeds.rank() {
            2 => embeds.clone(),
            3 if embeds.dim(1)? == 1 => embeds.squeeze(1)?,
            _ => candle::bail!(
                "the linear projector expects a pooled (batch, dim) embedding, got {:?}",
                embeds.shape()
            ),
        };
        let batch_size = embeds.dim(0)?;
        let xs = self
            .proj
            .forward(&embeds)?
            .reshape((batch_size, self.num_tokens, self.cross_attention_dim))?;
        self.norm.forward(&xs)
    }
}

#[derive(Debug, Clone)]
pub struct ResamplerConfig {
    pub dim: usize,
    pub depth: usize,
    pub dim_head: usize,
    pub heads: usize,
    pub num_queries: usize,
    pub embedding_dim: usize,
    pub output_dim: usize,
    pub ff_mult: usize,
}

#[derive(Debug)]
struct PerceiverAttention {
    norm_x: nn::LayerNorm,
    norm_latents: nn::LayerNorm,
    to_q: nn::Linear,
    to_kv: nn::Linear,
    to_out: nn::Linear,
    heads: usize,
    scale: f64,
}

impl PerceiverAttention {
    fn new(vs: nn::VarBuilder, dim: usize, dim_head: usize, heads: usize) -> Result<Self> {
        let inner_dim = dim_head * heads;
        let norm_x = nn::layer_norm(dim, 1e-5, vs.pp("norm_x"))?;
        let norm_latents = nn::layer_norm(dim, 1e-5, vs.pp("norm_latents"))?;
        let to_q = nn::linear_no_bias(dim, inner_dim, vs.pp("to_q"))?;
        let to_kv = nn::linear_no_bias(dim, inner_dim * 2, vs.pp("to_kv"))?;
        let to_out = nn::linear_no_bias(inner_dim, dim, vs.pp("to_out"))?;
        Ok(Self {
            norm_x,
            norm_latents,
            to_q,
            to_kv,
            to_out,
            heads,
            scale: 1.0 / f64::sqrt(dim_head as f64),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, d) = xs.dims3()?;
        xs.reshape((b, t, self.heads, d / self.heads))?
            .transpose(1, 2)?
            .reshape((b * self.heads, t, d / self.heads))
    }

    fn merge_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (bh, t, hd) = xs.dims3()?;
        xs.reshape((bh / self.heads, self.heads, t, hd))?
            .transpose(1, 2)?
            .reshape((bh / self.heads, t, hd * self.heads))
    }

    /// Latents attend over the input sequence concatenated with themselves.
    fn forward(&self, xs: &Tensor, latents: &Tensor) -> Result<Tensor> {
        let xs = self.norm_x.forward(xs)?;
        let latents = self.norm_latents.forward(latents)?;
        let query = self.split_heads(&self.to_q.forward(&latents)?)?;
        let kv_input = Tensor::cat(&[&xs, &latents], 1)?;
        let kv = self.to_kv.forward(&kv_input)?.chunk(2, D::Minus1)?;
        let key = self.split_heads(&kv[0])?;
        let value = self.split_heads(&kv[1])?;
        let in_dtype = query.dtype();
        let query = query.to_dtype(DType::F32)?;
        let key = key.to_dtype(DType::F32)?;
        let value = value.to_dtype(DType::F32)?;
        let attn = query.matmul(&(key.t()? * self.scale)?)?;
        let attn = nn::ops::softmax_last_dim(&attn)?;
        let out = attn.matmul(&value)?.to_dtype(in_dtype)?;
        self.to_out.forward(&self.merge_heads(&out)?)
    }
}

#[derive(Debug)]
struct ResamplerMlp {
    norm: nn::LayerNorm,
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl ResamplerMlp {
    fn new(vs: nn::VarBuilder, dim: usize, mult: usize) -> Result<Self> {
        Ok(Self {
            norm: nn::layer_norm(dim, 1e-5, vs.pp("norm"))?,
            fc1: nn::linear_no_bias(dim, dim * mult, vs.pp("fc1"))?,
            fc2: nn::linear_no_bias(dim * mult, dim, vs.pp("fc2"))?,
        })
    }
}

impl Module for ResamplerMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2
            .forward(&self.fc1.forward(&self.norm.forward(xs)?)?.gelu()?)
    }
}

/// Perceiver resampler: a fixed set of learned queries attends over the
/// variable-length input sequence, producing exactly `num_queries` tokens at
/// `output_dim`.
#[derive(Debug)]
pub struct Resampler {
    latents: Tensor,
    proj_in: nn::Linear,
    proj_out: nn::Linear,
    norm_out: nn::LayerNorm,
    layers: Vec<(PerceiverAttention, ResamplerMlp)>,
    num_queries: usize,
    span: tracing::Span,
}

impl Resampler {
    pub fn new(vs: nn::VarBuilder, c: &ResamplerConfig) -> Result<Self> {
        let latents = vs.get_with_hints(
            (c.num_queries, c.dim),
            "latents",
            nn::init::Init::Randn {
                mean: 0.,
                stdev: 1.0 / f64::sqrt(c.dim as f64),
            },
        )?;
        let proj_in = nn::linear(c.embedding_dim, c.dim, vs.pp("proj_in"))?;
        let proj_out = nn::linear(c.dim, c.output_dim, vs.pp("proj_out"))?;
        let norm_out = nn::layer_norm(c.output_dim, 1e-5, vs.pp("norm_out"))?;
        let vs_l = vs.pp("layers");
        let mut layers = Vec::with_capacity(c.depth);
        for index in 0..c.depth {
            let vs_l = vs_l.pp(index.to_string());
            let attn = PerceiverAttention::new(vs_l.pp("attn"), c.dim, c.dim_head, c.heads)?;
            let mlp = ResamplerMlp::new(vs_l.pp("ff"), c.dim, c.ff_mult)?;
            layers.push((attn, mlp))
        }
        let span = tracing::span!(tracing::Level::TRACE, "resampler");
        Ok(Self {
            latents,
            proj_in,
            proj_out,
            norm_out,
            layers,
            num_queries: c.num_queries,
            span,
        })
    }

    pub fn num_queries(&self) -> usize {
        self.num_queries
    }
}

impl Module for Resampler {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = match xs.rank() {
            2 => xs.unsqueeze(1)?,
            3 => xs.clone(),
            r => candle::bail!("the resampler expects a token sequence, got rank {r}"),
        };
        let batch_size = xs.dim(0)?;
        let mut latents = self.latents.unsqueeze(0)?.repeat((batch_size, 1, 1))?;
        let xs = self.proj_in.forward(&xs)?;
        for (attn, mlp) in self.layers.iter() {
            latents = (attn.forward(&xs, &latents)? + latents)?;
            latents = (mlp.forward(&latents)? + latents)?;
        }
        self.norm_out.forward(&self.proj_out.forward(&latents)?)
    }
}

#[derive(Debug, Clone)]
pub struct ZipperConfig {
    pub in_size: usize,
    pub in_tokens: usize,
    pub out_size: usize,
    pub out_tokens: usize,
    pub hidden_size: usize,
    pub hidden_tokens: usize,
    pub num_blocks: usize,
    pub is_conv_input: bool,
}

#[derive(Debug)]
struct ZipperBlock {
    norm: nn::LayerNorm,
    token_mix: nn::Linear,
    channel_mix: nn::Linear,
    residual: bool,
}

impl ZipperBlock {
    fn new(
        vs: nn::VarBuilder,
        in_size: usize,
        in_tokens: usize,
        out_size: usize,
        out_tokens: usize,
    ) -> Result<Self> {
        let norm = nn::layer_norm(in_size, 1e-5, vs.pp("norm"))?;
        let token_mix = nn::linear_no_bias(in_tokens, out_tokens, vs.pp("token_mix"))?;
        let channel_mix = nn::linear(in_size, out_size, vs.pp("channel_mix"))?;
        Ok(Self {
            norm,
            token_mix,
            channel_mix,
            residual: in_size == out_size && in_tokens == out_tokens,
        })
    }
}

impl Module for ZipperBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.norm.forward(xs)?;
        // zip the token axis, then the feature axis
        let ys = self.token_mix.forward(&ys.transpose(1, 2)?)?;
        let ys = ys.transpose(1, 2)?.gelu()?;
        let ys = self.channel_mix.forward(&ys)?;
        if self.residual {
            ys + xs
        } else {
            Ok(ys)
        }
    }
}

/// Resampler variant with explicit input and output token counts.
/// Convolutional encoder families get a second block so the flattened spatial
/// tokens are mixed before compression.
#[derive(Debug)]
pub struct ZipperResampler {
    input_norm: Option<nn::LayerNorm>,
    blocks: Vec<ZipperBlock>,
    norm_out: nn::LayerNorm,
    out_tokens: usize,
}

impl ZipperResampler {
    pub fn new(vs: nn::VarBuilder, c: &ZipperConfig) -> Result<Self> {
        if c.num_blocks == 0 {
            candle::bail!("the zipper resampler needs at least one block")
        }
        let input_norm = if c.is_conv_input {
            Some(nn::layer_norm(c.in_size, 1e-5, vs.pp("input_norm"))?)
        } else {
            None
        };
        let vs_b = vs.pp("blocks");
        let mut blocks = Vec::with_capacity(c.num_blocks);
        for index in 0..c.num_blocks {
            let (in_size, in_tokens) = if index == 0 {
                (c.in_size, c.in_tokens)
            } else {
                (c.hidden_size, c.hidden_tokens)
            };
            let (out_size, out_tokens) = if index == c.num_blocks - 1 {
                (c.out_size, c.out_tokens)
            } else {
                (c.hidden_size, c.hidden_tokens)
            };
            blocks.push(ZipperBlock::new(
                vs_b.pp(index.to_string()),
                in_size,
                in_tokens,
                out_size,
                out_tokens,
            )?)
        }
        let norm_out = nn::layer_norm(c.out_size, 1e-5, vs.pp("norm_out"))?;
        Ok(Self {
            input_norm,
            blocks,
            norm_out,
            out_tokens: c.out_tokens,
        })
    }

    pub fn out_tokens(&self) -> usize {
        self.out_tokens
    }
}

impl Module for ZipperResampler {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = match &self.input_norm {
            Some(norm) => norm.forward(xs)?,
            None => xs.clone(),
        };
        for block in self.blocks.iter() {
            xs = block.forward(&xs)?;
        }
        self.norm_out.forward(&xs)
    }
}

/// The projection strategy selected by the adapter type.
#[derive(Debug)]
pub enum ImageProjection {
    Linear(ImageProjModel),
    Resampler(Resampler),
    Zipper(ZipperResampler),
    /// `ilora`: the raw encoder output is consumed elsewhere.
    None,
}

impl ImageProjection {
    pub fn from_config(
        config: &AdapterConfig,
        backbone: &BackboneConfig,
        encoder: &ImageEncoder,
        vs: nn::VarBuilder,
    ) -> Result<Self> {
        let cross_dim = backbone.cross_attention_dim;
        let num_tokens = if config.num_tokens > 0 {
            config.num_tokens
        } else {
            encoder.native_tokens()
        };
        match config.adapter_type {
            AdapterType::Ip => {
                if config.num_tokens == 0 {
                    candle::bail!("the linear projector needs an explicit num_tokens")
                }
                let proj =
                    ImageProjModel::new(vs, encoder.projection_dim(), cross_dim, config.num_tokens)?;
                Ok(Self::Linear(proj))
            }
            AdapterType::IpPlus => {
                let c = ResamplerConfig {
                    dim: backbone.kind.resampler_dim(cross_dim),
                    depth: 4,
                    dim_head: 64,
                    heads: backbone.kind.resampler_heads(),
                    num_queries: num_tokens,
                    embedding_dim: encoder.embed_dim(),
                    output_dim: backbone.kind.resampler_output_dim(cross_dim),
                    ff_mult: 4,
                };
                Ok(Self::Resampler(Resampler::new(vs, &c)?))
            }
            AdapterType::Zipper => {
                let is_conv = encoder.arch().is_convolutional();
                let c = ZipperConfig {
                    in_size: encoder.embed_dim(),
                    in_tokens: encoder.native_tokens(),
                    out_size: cross_dim,
                    out_tokens: num_tokens,
                    hidden_size: encoder.embed_dim(),
                    hidden_tokens: encoder.native_tokens(),
                    num_blocks: if is_conv { 2 } else { 1 },
                    is_conv_input: is_conv,
                };
                Ok(Self::Zipper(ZipperResampler::new(vs, &c)?))
            }
            AdapterType::Ilora => Ok(Self::None),
        }
    }

    /// Output token count, `None` for the pass-through projection.
    pub fn num_tokens(&self) -> Option<usize> {
        match self {
            Self::Linear(p) => Some(p.num_tokens),
            Self::Resampler(r) => Some(r.num_queries()),
            Self::Zipper(z) => Some(z.out_tokens()),
            Self::None => None,
        }
    }

    pub fn project(&self, embeds: &Tensor) -> Result<Tensor> {
        match self {
            Self::Linear(p) => p.forward(embeds),
            Self::Resampler(r) => r.forward(embeds),
            Self::Zipper(z) => z.forward(embeds),
            Self::None => Ok(embeds.clone()),
        }
    }
}
