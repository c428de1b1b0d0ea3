//! Image-prompt adapter (IP-Adapter) conditioning for candle diffusion
//! backbones.
//!
//! A reference image, run through a pluggable vision tower and a small
//! projection network, becomes a fixed run of extra context tokens. One
//! injected processor per cross-attention site attends over those tokens
//! through its own key/value projections and blends the result into the text
//! attention output under a runtime-adjustable scale, leaving the backbone's
//! interface untouched.
//!
//! ```no_run
//! use candle::{DType, Device};
//! use candle_ip_adapter::{AdapterConfig, AdapterType, EncoderArch, IpAdapter};
//! # fn run(backbone: &mut impl candle_ip_adapter::CrossAttnBackbone) -> candle::Result<()> {
//! let config = AdapterConfig::new(AdapterType::IpPlus, EncoderArch::Clip);
//! let adapter = IpAdapter::new(config, backbone, &Device::Cpu, DType::F32)?;
//! # let (text_embeds, images) = todo!();
//! let embeds = adapter.image_embeds(&images, false, false, false, 4)?;
//! let augmented = adapter.forward(&text_embeds, &embeds)?;
//! adapter.set_scale(0.6);
//! # Ok(())
//! # }
//! ```
pub mod adapter;
pub mod attention;
pub mod backbone;
pub mod config;
pub mod merge;
pub mod preprocess;
pub mod projector;
pub mod vision;
pub mod weights;

pub use adapter::{CachedVisionOutput, IpAdapter};
pub use attention::{AdapterControl, CrossAttention, IpAttnProcessor};
pub use backbone::{AttentionSite, BackboneConfig, BackboneKind, CrossAttnBackbone};
pub use config::{AdapterConfig, AdapterType, ClipLayer};
pub use merge::merge_overlap;
pub use preprocess::{ImageProcessor, ProcessorConfig, TiledPreprocessor};
pub use projector::{ImageProjModel, ImageProjection, Resampler, ZipperResampler};
pub use vision::{
    ClipVisionConfig, ClipVisionTower, EncoderArch, ImageEncoder, SiglipVisionBackbone,
    VisionBackbone, VisionOutput,
};
