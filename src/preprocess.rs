//! Image preprocessing in front of the vision tower.
//!
//! Two layers: a stats-based processor (resize + per-channel normalization,
//! quad-tile splitting, unconditional noise drop) and, for the `clip+`
//! family, a small learned convolution stack that maps the 4x-resolution
//! tiled input down to the tower resolution.
use candle::{DType, Result, Tensor};
use candle_nn as nn;
use candle_nn::Module;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::vision::NormalizationStats;

/// Input tensors are expected in [0, 1]; this band allows for slight bleed
/// from upstream augmentation.
const PIXEL_MIN: f32 = -0.3;
const PIXEL_MAX: f32 = 1.3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub image_mean: [f64; 3],
    pub image_std: [f64; 3],
    pub size: usize,
}

impl ProcessorConfig {
    pub fn from_stats(stats: &NormalizationStats) -> Self {
        Self {
            image_mean: stats.mean,
            image_std: stats.std,
            size: stats.image_size,
        }
    }

    /// Reads `preprocessor_config.json` from a local directory or the hub.
    /// An unreadable source is recovered by falling back to the family
    /// defaults; the encoder statistics then match a freshly trained tower.
    pub fn from_pretrained(source: &str, fallback: &NormalizationStats) -> Self {
        match read_processor_json(source) {
            Ok(cfg) => cfg.resolve(fallback),
            Err(err) => {
                tracing::warn!(
                    "could not load preprocessor config from {source}: {err}, using defaults"
                );
                Self::from_stats(fallback)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawProcessorConfig {
    image_mean: Option<[f64; 3]>,
    image_std: Option<[f64; 3]>,
    size: Option<serde_json::Value>,
    crop_size: Option<serde_json::Value>,
}

impl RawProcessorConfig {
    fn resolve(self, fallback: &NormalizationStats) -> ProcessorConfig {
        let size = self
            .crop_size
            .as_ref()
            .and_then(parse_size)
            .or_else(|| self.size.as_ref().and_then(parse_size))
            .unwrap_or(fallback.image_size);
        ProcessorConfig {
            image_mean: self.image_mean.unwrap_or(fallback.mean),
            image_std: self.image_std.unwrap_or(fallback.std),
            size,
        }
    }
}

fn parse_size(value: &serde_json::Value) -> Option<usize> {
    if let Some(n) = value.as_u64() {
        return Some(n as usize);
    }
    for key in ["height", "shortest_edge"] {
        if let Some(n) = value.get(key).and_then(|v| v.as_u64()) {
            return Some(n as usize);
        }
    }
    None
}

fn read_processor_json(source: &str) -> Result<RawProcessorConfig> {
    let local = std::path::Path::new(source).join("preprocessor_config.json");
    let bytes = if local.is_file() {
        std::fs::read(local).map_err(candle::Error::wrap)?
    } else {
        let api = hf_hub::api::sync::Api::new().map_err(candle::Error::wrap)?;
        let path = api
            .model(source.to_string())
            .get("preprocessor_config.json")
            .map_err(candle::Error::wrap)?;
        std::fs::read(path).map_err(candle::Error::wrap)?
    };
    serde_json::from_slice(&bytes).map_err(candle::Error::wrap)
}

/// Nearest-neighbor resize of a `(b, c, h, w)` tensor, both directions.
pub fn resize_nearest(xs: &Tensor, target_h: usize, target_w: usize) -> Result<Tensor> {
    let (_b, _c, h, w) = xs.dims4()?;
    if h == target_h && w == target_w {
        return Ok(xs.clone());
    }
    let rows: Vec<u32> = (0..target_h).map(|i| (i * h / target_h) as u32).collect();
    let cols: Vec<u32> = (0..target_w).map(|i| (i * w / target_w) as u32).collect();
    let rows = Tensor::from_vec(rows, target_h, xs.device())?;
    let cols = Tensor::from_vec(cols, target_w, xs.device())?;
    xs.index_select(&rows, 2)?.index_select(&cols, 3)
}

/// Splits a 2x2-tiled batch into its quadrants, stacked along the batch axis
/// in column-major tile order.
pub fn split_quad(xs: &Tensor, quad_count: usize) -> Result<Tensor> {
    let rows = xs.chunk(2, 2)?;
    let top = rows[0].chunk(2, 3)?;
    let bottom = rows[1].chunk(2, 3)?;
    let quads = [&top[0], &bottom[0], &top[1], &bottom[1]];
    let take = quad_count.clamp(1, 4);
    Tensor::cat(&quads[..take], 0)
}

/// Stats-based preprocessing: range validation, resize to the tower input
/// resolution and per-channel normalization.
pub struct ImageProcessor {
    mean: Tensor,
    std: Tensor,
    size: usize,
}

impl ImageProcessor {
    pub fn new(
        config: &ProcessorConfig,
        size: usize,
        device: &candle::Device,
        dtype: DType,
    ) -> Result<Self> {
        let mean = Tensor::new(&config.image_mean, device)?
            .reshape((3, 1, 1))?
            .to_dtype(dtype)?;
        let std = Tensor::new(&config.image_std, device)?
            .reshape((3, 1, 1))?
            .to_dtype(dtype)?;
        Ok(Self { mean, std, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check_range(&self, xs: &Tensor) -> Result<()> {
        let flat = xs.flatten_all()?.to_dtype(DType::F32)?;
        let min = flat.min(0)?.to_scalar::<f32>()?;
        let max = flat.max(0)?.to_scalar::<f32>()?;
        if min < PIXEL_MIN || max > PIXEL_MAX {
            candle::bail!(
                "image tensor values must be between 0 and 1, got min {min} max {max}"
            )
        }
        Ok(())
    }

    pub fn normalize(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_sub(&self.mean)?.broadcast_div(&self.std)
    }

    /// Validates the [0, 1] input range, resizes and normalizes.
    pub fn preprocess(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = match xs.rank() {
            3 => xs.unsqueeze(0)?,
            4 => xs.clone(),
            r => candle::bail!("expected a (b, 3, h, w) pixel tensor, got rank {r}"),
        };
        self.check_range(&xs)?;
        let xs = resize_nearest(&xs, self.size, self.size)?;
        self.normalize(&xs)
    }

    /// Replaces the conditioning input for an unconditional pass: low
    /// magnitude noise under a per-sample random scale, or zeros. Noise keeps
    /// the tower from collapsing onto one constant embedding.
    pub fn drop_input(&self, xs: &Tensor, noise: bool) -> Result<Tensor> {
        if !noise {
            return Ok(xs.zeros_like()?.detach());
        }
        let scale = Tensor::rand(0f32, 1f32, (xs.dim(0)?, 1, 1, 1), xs.device())?
            .to_dtype(xs.dtype())?;
        Ok(xs.rand_like(0., 1.)?.broadcast_mul(&scale)?.detach())
    }

    /// Normalization for inputs that were already resized and rescaled:
    /// re-quantize to 8-bit steps, then apply the channel statistics.
    pub fn normalize_quantized(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = ((xs * 255.)?.clamp(0f32, 255f32)?.round()? / 255.)?;
        self.normalize(&xs)
    }

    /// File-based convenience path: shortest-edge resize, center crop,
    /// rescale and normalize a decoded image into `(3, size, size)`.
    pub fn preprocess_image(&self, image: &DynamicImage) -> Result<Tensor> {
        let size = self.size as u32;
        let image = image.resize_to_fill(size, size, image::imageops::FilterType::CatmullRom);
        let data = image.to_rgb8().into_raw();
        let xs = Tensor::from_vec(data, (self.size, self.size, 3), self.mean.device())?
            .to_dtype(DType::F32)?
            .permute((2, 0, 1))?;
        let xs = (xs / 255.)?.to_dtype(self.mean.dtype())?;
        self.normalize(&xs.unsqueeze(0)?)?.squeeze(0)
    }
}

/// Learned 4x downscale for the `clip+` family: two strided convolutions and
/// a projection back to rgb, with an average-pooled skip path.
#[derive(Debug)]
pub struct TiledPreprocessor {
    conv_in: nn::Conv2d,
    conv_mid: nn::Conv2d,
    conv_out: nn::Conv2d,
}

impl TiledPreprocessor {
    pub fn new(vs: nn::VarBuilder, channels: usize) -> Result<Self> {
        let cfg = nn::Conv2dConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };
        let conv_in = nn::conv2d(3, channels, 3, cfg, vs.pp("conv_in"))?;
        let conv_mid = nn::conv2d(channels, channels, 3, cfg, vs.pp("conv_mid"))?;
        let out_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_out = nn::conv2d(channels, 3, 3, out_cfg, vs.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            conv_mid,
            conv_out,
        })
    }
}

impl Module for TiledPreprocessor {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs.avg_pool2d(4)?;
        let xs = nn::ops::silu(&self.conv_in.forward(xs)?)?;
        let xs = nn::ops::silu(&self.conv_mid.forward(&xs)?)?;
        self.conv_out.forward(&xs)? + residual
    }
}
