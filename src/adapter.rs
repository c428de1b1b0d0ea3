//! The adapter orchestrator.
//!
//! Owns the preprocessing pipeline, the encoder, the projection and one
//! injected processor per cross-attention site of the backbone. All trainable
//! adapter parameters live in a single `VarMap`, which makes checkpoint
//! save/load a matter of section-prefixed tensor names and lets weight merges
//! land in place through `Var::set`.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

use candle::{DType, Device, Result, Tensor, Var};
use candle_nn::{Module, VarBuilder, VarMap};

use crate::attention::{AdapterControl, IpAttnProcessor};
use crate::backbone::{hidden_size_for_site, AttentionSite, BackboneConfig, CrossAttnBackbone};
use crate::config::{AdapterConfig, ClipLayer};
use crate::preprocess::{split_quad, ImageProcessor, ProcessorConfig, TiledPreprocessor};
use crate::projector::ImageProjection;
use crate::vision::{EncoderArch, ImageEncoder};
use crate::weights::{self, section_of};

/// Precomputed encoder outputs keyed by image identity, used to skip the
/// vision tower during training.
pub struct CachedVisionOutput {
    pub last_hidden_state: Tensor,
    pub penultimate_hidden_states: Option<Tensor>,
    pub image_embeds: Option<Tensor>,
}

pub struct IpAdapter {
    config: AdapterConfig,
    backbone_config: BackboneConfig,
    control: Arc<AdapterControl>,
    image_processor: ImageProcessor,
    tiled_preprocessor: Option<TiledPreprocessor>,
    encoder: ImageEncoder,
    projection: ImageProjection,
    processors: BTreeMap<String, Arc<IpAttnProcessor>>,
    sites: Vec<AttentionSite>,
    varmap: VarMap,
    additional_loss: Mutex<Option<Tensor>>,
    unconditional: Tensor,
    num_tokens: usize,
    device: Device,
    dtype: DType,
    /// Noise rather than zeros for unconditional passes.
    pub noise_unconditional: bool,
}

impl IpAdapter {
    /// Builds the full stack: encoder (seeded from the configured pretrained
    /// source), preprocessing, projection, and one processor per
    /// cross-attention site, installed into `backbone`.
    pub fn new<B: CrossAttnBackbone + ?Sized>(
        config: AdapterConfig,
        backbone: &mut B,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, dtype, device);
        let encoder = ImageEncoder::from_config(&config, vs.pp(weights::IMAGE_ENCODER))?;
        if let Some(source) = config.image_encoder_path.as_deref() {
            let tensors = load_encoder_tensors(source, device)?;
            weights::seed_section(&varmap, weights::IMAGE_ENCODER, &tensors)?;
        }
        Self::assemble(config, backbone, encoder, varmap, device, dtype)
    }

    /// Same, with a caller-supplied vision tower. The tower's weights are not
    /// part of the adapter state in this case.
    pub fn with_image_encoder<B: CrossAttnBackbone + ?Sized>(
        config: AdapterConfig,
        backbone: &mut B,
        encoder: ImageEncoder,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        Self::assemble(config, backbone, encoder, VarMap::new(), device, dtype)
    }

    fn assemble<B: CrossAttnBackbone + ?Sized>(
        config: AdapterConfig,
        backbone: &mut B,
        encoder: ImageEncoder,
        mut varmap: VarMap,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let vs = VarBuilder::from_varmap(&varmap, dtype, device);
        let backbone_config = backbone.config().clone();

        let stats = config.image_encoder_arch.default_stats();
        let processor_cfg = match config.image_encoder_path.as_deref() {
            Some(source) => ProcessorConfig::from_pretrained(source, &stats),
            None => ProcessorConfig::from_stats(&stats),
        };
        // quad inputs come in as a 2x2 tile, the tiled family at 4x the tower
        // resolution
        let mut input_size = encoder.image_size();
        if config.quad_image {
            input_size = encoder.image_size() * 2;
        }
        if config.image_encoder_arch == EncoderArch::ClipTiled {
            input_size = encoder.image_size() * EncoderArch::ClipTiled.downscale_factor();
        }
        let image_processor = ImageProcessor::new(&processor_cfg, input_size, device, dtype)?;
        let tiled_preprocessor = if config.image_encoder_arch == EncoderArch::ClipTiled {
            Some(TiledPreprocessor::new(vs.pp(weights::PREPROCESSOR), 64)?)
        } else {
            None
        };

        let projection =
            ImageProjection::from_config(&config, &backbone_config, &encoder, vs.pp(weights::IMAGE_PROJ))?;
        let num_tokens = if config.num_tokens > 0 {
            config.num_tokens
        } else {
            encoder.native_tokens()
        };

        let control = Arc::new(AdapterControl::new());
        let (processors, sites) = bind_processors(
            backbone,
            &backbone_config,
            &vs,
            &mut varmap,
            num_tokens,
            Arc::downgrade(&control),
            device,
            dtype,
        )?;
        backbone.install_processors(processors.clone())?;
        tracing::info!("bound {} injected attention processors", processors.len());

        let zeros = Tensor::zeros((1, 3, input_size, input_size), dtype, device)?;
        let unconditional = image_processor.preprocess(&zeros)?;

        let adapter = Self {
            config,
            backbone_config,
            control,
            image_processor,
            tiled_preprocessor,
            encoder,
            projection,
            processors,
            sites,
            varmap,
            additional_loss: Mutex::new(None),
            unconditional,
            num_tokens,
            device: device.clone(),
            dtype,
            noise_unconditional: true,
        };
        if let Some(path) = adapter.config.name_or_path.clone() {
            adapter.load(path)?;
        }
        adapter.set_scale(1.0);
        Ok(adapter)
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn backbone_config(&self) -> &BackboneConfig {
        &self.backbone_config
    }

    pub fn encoder(&self) -> &ImageEncoder {
        &self.encoder
    }

    pub fn processors(&self) -> &BTreeMap<String, Arc<IpAttnProcessor>> {
        &self.processors
    }

    /// The cross-attention sites resolved at construction; fixed for the
    /// adapter's lifetime.
    pub fn attention_sites(&self) -> &[AttentionSite] {
        &self.sites
    }

    /// Number of image tokens appended to every context sequence.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn scale(&self) -> f64 {
        self.control.scale()
    }

    /// Broadcast to every bound processor through the shared control state.
    pub fn set_scale(&self, scale: f64) {
        self.control.set_scale(scale)
    }

    pub fn is_active(&self) -> bool {
        self.control.is_active()
    }

    pub fn set_active(&self, active: bool) {
        self.control.set_active(active)
    }

    /// Premade pixel values for a zero-image conditioning pass.
    pub fn unconditional(&self) -> &Tensor {
        &self.unconditional
    }

    /// Auxiliary loss accumulated by quad-consistency training, if any.
    pub fn take_additional_loss(&self) -> Option<Tensor> {
        self.additional_loss.lock().unwrap().take()
    }

    /// The full extraction pipeline: raw `[0, 1]` pixels (or preprocessed
    /// pixel values) to one conditioning embedding per input image.
    ///
    /// `drop` replaces the input for unconditional passes. `quad_count` only
    /// matters in quad mode and bounds how many quadrants are kept.
    pub fn image_embeds(
        &self,
        tensors_0_1: &Tensor,
        drop: bool,
        is_training: bool,
        has_been_preprocessed: bool,
        quad_count: usize,
    ) -> Result<Tensor> {
        let is_training = is_training && self.config.train;
        let train_encoder = is_training && self.config.train_image_encoder;
        let xs = match tensors_0_1.rank() {
            3 => tensors_0_1.unsqueeze(0)?,
            4 => tensors_0_1.clone(),
            r => candle::bail!("expected a (b, 3, h, w) pixel tensor, got rank {r}"),
        };
        let xs = xs.to_device(&self.device)?.to_dtype(self.dtype)?;
        let pixels = if !has_been_preprocessed {
            let xs = if drop {
                self.image_processor
                    .drop_input(&xs, self.noise_unconditional)?
            } else {
                xs
            };
            self.image_processor.preprocess(&xs)?
        } else if drop {
            let xs = self
                .image_processor
                .drop_input(&xs, self.noise_unconditional)?;
            self.image_processor.normalize_quantized(&xs)?
        } else {
            xs
        };
        let pixels = if self.config.quad_image {
            split_quad(&pixels, quad_count)?
        } else {
            pixels
        };
        let pixels = match &self.tiled_preprocessor {
            Some(pre) => pre.forward(&pixels)?,
            None => pixels,
        };
        let pixels = if train_encoder { pixels } else { pixels.detach() };
        let embeds = self.encoder.encode(&pixels)?;
        let embeds = if self.config.quad_image {
            if train_encoder {
                self.accumulate_quad_loss(&embeds, quad_count)?;
            }
            quad_average(&embeds, quad_count)?
        } else {
            embeds
        };
        if train_encoder {
            Ok(embeds)
        } else {
            Ok(embeds.detach())
        }
    }

    /// Cache-backed variant of [`IpAdapter::image_embeds`] for training
    /// throughput; entries are concatenated along the batch axis.
    pub fn image_embeds_from_cache(
        &self,
        outputs: &[CachedVisionOutput],
        quad_count: usize,
    ) -> Result<Tensor> {
        if outputs.is_empty() {
            candle::bail!("empty vision output cache")
        }
        let mut chunks = Vec::with_capacity(outputs.len());
        for out in outputs {
            let t = match self.config.clip_layer {
                ClipLayer::LastHidden => out.last_hidden_state.clone(),
                ClipLayer::Penultimate => match &out.penultimate_hidden_states {
                    Some(t) => t.clone(),
                    None => candle::bail!("cache entry has no penultimate hidden states"),
                },
                ClipLayer::ImageEmbeds => match &out.image_embeds {
                    Some(t) => t.clone(),
                    None => candle::bail!("cache entry has no pooled embedding"),
                },
            };
            chunks.push(t.to_device(&self.device)?.to_dtype(self.dtype)?);
        }
        let embeds = Tensor::cat(&chunks, 0)?;
        let embeds = if self.config.quad_image {
            quad_average(&embeds, quad_count)?
        } else {
            embeds
        };
        Ok(embeds.detach())
    }

    /// Projects the image embedding and appends the resulting tokens to the
    /// text embedding sequence. With the `ilora` adapter type the text
    /// embeddings pass through unchanged.
    pub fn forward(&self, text_embeds: &Tensor, image_embeds: &Tensor) -> Result<Tensor> {
        if matches!(self.projection, ImageProjection::None) {
            return Ok(text_embeds.clone());
        }
        let image_embeds = image_embeds.to_device(&self.device)?.to_dtype(self.dtype)?;
        let tokens = self.projection.project(&image_embeds)?;
        Tensor::cat(&[text_embeds, &tokens], 1)
    }

    /// Direct access to the projection, mostly for drivers that manage the
    /// concatenation themselves.
    pub fn project(&self, image_embeds: &Tensor) -> Result<Tensor> {
        self.projection.project(image_embeds)
    }

    fn accumulate_quad_loss(&self, embeds: &Tensor, quad_count: usize) -> Result<()> {
        let chunks = embeds.chunk(quad_count.clamp(1, 4), 0)?;
        if chunks.len() < 2 {
            return Ok(());
        }
        let mut total: Option<Tensor> = None;
        let mut pairs = 0usize;
        for i in 0..chunks.len() {
            for j in (i + 1)..chunks.len() {
                let loss = candle_nn::loss::mse(&chunks[i], &chunks[j])?;
                total = Some(match total {
                    Some(t) => (t + loss)?,
                    None => loss,
                });
                pairs += 1;
            }
        }
        if let Some(total) = total {
            // the pairwise consistency term is a gentle nudge only
            let loss = ((total / pairs as f64)? * 1e-2)?;
            let mut slot = self.additional_loss.lock().unwrap();
            *slot = Some(match slot.take() {
                Some(prev) => (prev + loss)?,
                None => loss,
            });
        }
        Ok(())
    }

    fn save_section_names(&self) -> Vec<&'static str> {
        if self.config.train_only_image_encoder {
            return vec![weights::IMAGE_ENCODER];
        }
        let mut sections = vec![weights::IMAGE_PROJ, weights::IP_ADAPTER];
        if self.config.train_image_encoder {
            sections.push(weights::IMAGE_ENCODER);
        }
        if self.tiled_preprocessor.is_some() {
            sections.push(weights::PREPROCESSOR);
        }
        sections
    }

    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        weights::save_sections(&self.varmap, &self.save_section_names(), path)
    }

    pub fn load<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let tensors = weights::load_file(path, &self.device)?;
        self.load_state(&tensors)
    }

    /// Applies a checkpoint: known sections are loaded (merging shape
    /// mismatches), unknown layouts fall back to the pure-encoder reading
    /// when the adapter only trains the encoder.
    pub fn load_state(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let known = [
            weights::IMAGE_PROJ,
            weights::IP_ADAPTER,
            weights::IMAGE_ENCODER,
            weights::PREPROCESSOR,
        ];
        let has_sections = tensors.keys().any(|k| known.contains(&section_of(k)));
        if !has_sections {
            if self.config.train_only_image_encoder {
                return weights::seed_section(&self.varmap, weights::IMAGE_ENCODER, tensors);
            }
            tracing::warn!("checkpoint holds no adapter sections, nothing to load");
            return Ok(());
        }
        let mut sections = vec![weights::IMAGE_PROJ, weights::IP_ADAPTER];
        if self.config.train_image_encoder || self.config.train_only_image_encoder {
            sections.push(weights::IMAGE_ENCODER);
        }
        if self.tiled_preprocessor.is_some() {
            sections.push(weights::PREPROCESSOR);
        }
        weights::apply_sections(&self.varmap, &sections, tensors)
    }

    /// The variables the optimizer should see, per the training flags.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let data = self.varmap.data().lock().unwrap();
        data.iter()
            .filter(|(name, _)| {
                let section = section_of(name);
                if self.config.train_only_image_encoder {
                    return section == weights::IMAGE_ENCODER;
                }
                if section == weights::IMAGE_PROJ
                    || section == weights::IP_ADAPTER
                    || section == weights::PREPROCESSOR
                {
                    return true;
                }
                section == weights::IMAGE_ENCODER && self.config.train_image_encoder
            })
            .map(|(_, var)| var.clone())
            .collect()
    }
}

/// Elementwise mean of the `quad_count` groups stacked along the batch axis.
fn quad_average(embeds: &Tensor, quad_count: usize) -> Result<Tensor> {
    let chunks = embeds.chunk(quad_count.clamp(1, 4), 0)?;
    let mut sum = chunks[0].clone();
    for chunk in chunks.iter().skip(1) {
        sum = (sum + chunk)?;
    }
    sum / chunks.len() as f64
}

#[allow(clippy::too_many_arguments)]
fn bind_processors<B: CrossAttnBackbone + ?Sized>(
    backbone: &B,
    backbone_config: &BackboneConfig,
    vs: &VarBuilder,
    varmap: &mut VarMap,
    num_tokens: usize,
    control: Weak<AdapterControl>,
    device: &Device,
    dtype: DType,
) -> Result<(BTreeMap<String, Arc<IpAttnProcessor>>, Vec<AttentionSite>)> {
    let mut processors = BTreeMap::new();
    let mut sites = Vec::new();
    for (name, cross_attention_dim) in backbone.attention_sites() {
        let Some(cross_attention_dim) = cross_attention_dim else {
            continue;
        };
        let hidden_size = hidden_size_for_site(&name, backbone_config)?;
        let prefix = format!("{}.{}", weights::IP_ADAPTER, sites.len());
        let processor = IpAttnProcessor::new(
            vs.pp(&prefix),
            hidden_size,
            cross_attention_dim,
            num_tokens,
            control.clone(),
        )?;
        // warm start from the site's text projections so training does not
        // begin from random-noise attention
        let (to_k, to_v) = backbone.attn_kv_weights(&name)?;
        let init_scale = backbone_config.kind.kv_init_scale();
        let to_k = (to_k.to_dtype(dtype)?.to_device(device)? * init_scale)?;
        let to_v = (to_v.to_dtype(dtype)?.to_device(device)? * init_scale)?;
        varmap.set_one(format!("{prefix}.to_k_ip.weight"), &to_k)?;
        varmap.set_one(format!("{prefix}.to_v_ip.weight"), &to_v)?;
        sites.push(AttentionSite {
            name: name.clone(),
            hidden_size,
            cross_attention_dim,
        });
        processors.insert(name, Arc::new(processor));
    }
    if processors.is_empty() {
        candle::bail!("backbone exposes no cross-attention sites")
    }
    Ok((processors, sites))
}

fn load_encoder_tensors(source: &str, device: &Device) -> Result<HashMap<String, Tensor>> {
    let local = std::path::Path::new(source).join("model.safetensors");
    let path = if local.is_file() {
        local
    } else {
        let api = hf_hub::api::sync::Api::new().map_err(candle::Error::wrap)?;
        api.model(source.to_string())
            .get("model.safetensors")
            .map_err(candle::Error::wrap)?
    };
    candle::safetensors::load(path, device)
}
