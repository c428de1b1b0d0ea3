use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use candle_ip_adapter::{
    AdapterConfig, AdapterType, BackboneConfig, BackboneKind, ClipLayer, ClipVisionConfig,
    ClipVisionTower, CrossAttention, CrossAttnBackbone, EncoderArch, ImageEncoder, ImageProcessor,
    IpAdapter, IpAttnProcessor, ProcessorConfig, VisionBackbone, VisionOutput,
};

const CROSS_DIM: usize = 768;

/// Two self-attention sites plus eight cross-attention sites spread over the
/// down/mid/up blocks of a miniature unet-shaped backbone.
struct TestBackbone {
    config: BackboneConfig,
    attns: BTreeMap<String, CrossAttention>,
    sites: Vec<(String, Option<usize>)>,
    processors: BTreeMap<String, Arc<IpAttnProcessor>>,
}

fn hidden_for(name: &str) -> usize {
    if name.starts_with("down_blocks.0") || name.starts_with("up_blocks.1") {
        32
    } else {
        64
    }
}

impl TestBackbone {
    fn new(device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let config = BackboneConfig {
            kind: BackboneKind::Sd,
            cross_attention_dim: CROSS_DIM,
            block_out_channels: vec![32, 64],
        };
        let names = [
            ("down_blocks.0.attentions.0.transformer_blocks.0.attn1", None),
            (
                "down_blocks.0.attentions.0.transformer_blocks.0.attn2",
                Some(CROSS_DIM),
            ),
            (
                "down_blocks.0.attentions.1.transformer_blocks.0.attn2",
                Some(CROSS_DIM),
            ),
            (
                "down_blocks.1.attentions.0.transformer_blocks.0.attn2",
                Some(CROSS_DIM),
            ),
            (
                "down_blocks.1.attentions.1.transformer_blocks.0.attn2",
                Some(CROSS_DIM),
            ),
            ("mid_block.attentions.0.transformer_blocks.0.attn1", None),
            (
                "mid_block.attentions.0.transformer_blocks.0.attn2",
                Some(CROSS_DIM),
            ),
            (
                "up_blocks.0.attentions.0.transformer_blocks.0.attn2",
                Some(CROSS_DIM),
            ),
            (
                "up_blocks.0.attentions.1.transformer_blocks.0.attn2",
                Some(CROSS_DIM),
            ),
            (
                "up_blocks.1.attentions.0.transformer_blocks.0.attn2",
                Some(CROSS_DIM),
            ),
        ];
        let mut attns = BTreeMap::new();
        let mut sites = Vec::new();
        for (name, cross_dim) in names {
            let hidden = hidden_for(name);
            let attn = CrossAttention::new(
                vs.pp(name),
                hidden,
                cross_dim,
                hidden / 8,
                8,
            )?;
            attns.insert(name.to_string(), attn);
            sites.push((name.to_string(), cross_dim));
        }
        Ok(Self {
            config,
            attns,
            sites,
            processors: BTreeMap::new(),
        })
    }

    fn attn(&self, name: &str) -> &CrossAttention {
        &self.attns[name]
    }

    /// Routes through the installed processor when one is bound to the site.
    fn forward_site(
        &self,
        name: &str,
        xs: &Tensor,
        context: Option<&Tensor>,
    ) -> candle::Result<Tensor> {
        match self.processors.get(name) {
            Some(processor) => processor.forward(self.attn(name), xs, context),
            None => self.attn(name).forward(xs, context),
        }
    }
}

impl CrossAttnBackbone for TestBackbone {
    fn config(&self) -> &BackboneConfig {
        &self.config
    }

    fn attention_sites(&self) -> Vec<(String, Option<usize>)> {
        self.sites.clone()
    }

    fn attn_kv_weights(&self, site: &str) -> candle::Result<(Tensor, Tensor)> {
        match self.attns.get(site) {
            Some(attn) => Ok(attn.kv_weights()),
            None => candle::bail!("no attention module at {site}"),
        }
    }

    fn install_processors(
        &mut self,
        processors: BTreeMap<String, Arc<IpAttnProcessor>>,
    ) -> candle::Result<()> {
        self.processors = processors;
        Ok(())
    }
}

/// Deterministic stand-in tower; the output depends on the input mean only.
struct StubTower {
    embed_dim: usize,
    tokens: usize,
    image_size: usize,
    projection_dim: usize,
    conv: bool,
}

impl VisionBackbone for StubTower {
    fn forward(&self, pixel_values: &Tensor) -> candle::Result<VisionOutput> {
        let b = pixel_values.dim(0)?;
        let mean = pixel_values
            .to_dtype(DType::F32)?
            .mean_all()?
            .to_scalar::<f32>()?;
        let dev = pixel_values.device();
        if self.conv {
            let side = (self.tokens as f64).sqrt() as usize;
            let map = Tensor::full(mean, (b, self.embed_dim, side, side), dev)?;
            Ok(VisionOutput {
                hidden_states: vec![map.clone(), map],
                image_embeds: None,
            })
        } else {
            let hs = Tensor::full(mean, (b, self.tokens, self.embed_dim), dev)?;
            let pooled = Tensor::full(mean, (b, self.projection_dim), dev)?;
            Ok(VisionOutput {
                hidden_states: vec![hs.clone(), hs],
                image_embeds: Some(pooled),
            })
        }
    }

    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn native_tokens(&self) -> usize {
        self.tokens
    }

    fn image_size(&self) -> usize {
        self.image_size
    }

    fn projection_dim(&self) -> usize {
        self.projection_dim
    }
}

fn stub_encoder(clip_layer: ClipLayer) -> ImageEncoder {
    ImageEncoder::new(
        EncoderArch::Clip,
        clip_layer,
        Box::new(StubTower {
            embed_dim: 24,
            tokens: 5,
            image_size: 16,
            projection_dim: 16,
            conv: false,
        }),
    )
}

#[test]
fn linear_scenario_binds_every_cross_site() -> Result<()> {
    let dev = Device::Cpu;
    let mut backbone = TestBackbone::new(&dev)?;
    let config = AdapterConfig::new(AdapterType::Ip, EncoderArch::Clip);
    let adapter = IpAdapter::with_image_encoder(
        config,
        &mut backbone,
        stub_encoder(ClipLayer::ImageEmbeds),
        &dev,
        DType::F32,
    )?;
    assert_eq!(adapter.processors().len(), 8);
    assert_eq!(adapter.attention_sites().len(), 8);
    assert_eq!(backbone.processors.len(), 8);
    for site in adapter.attention_sites() {
        assert_eq!(site.cross_attention_dim, CROSS_DIM);
        assert_eq!(site.hidden_size, hidden_for(&site.name));
    }
    let embeds = Tensor::rand(0f32, 1f32, (2, 16), &dev)?;
    assert_eq!(adapter.project(&embeds)?.dims(), [2, 4, CROSS_DIM]);
    Ok(())
}

#[test]
fn inactive_processor_matches_plain_attention() -> Result<()> {
    let dev = Device::Cpu;
    let mut backbone = TestBackbone::new(&dev)?;
    let config = AdapterConfig::new(AdapterType::Ip, EncoderArch::Clip);
    let adapter = IpAdapter::with_image_encoder(
        config,
        &mut backbone,
        stub_encoder(ClipLayer::ImageEmbeds),
        &dev,
        DType::F32,
    )?;
    adapter.set_active(false);
    let site = "mid_block.attentions.0.transformer_blocks.0.attn2";
    let xs = Tensor::rand(0f32, 1f32, (2, 7, 64), &dev)?;
    let ctx = Tensor::rand(0f32, 1f32, (2, 9, CROSS_DIM), &dev)?;
    let injected = backbone.forward_site(site, &xs, Some(&ctx))?;
    let plain = backbone.attn(site).forward(&xs, Some(&ctx))?;
    assert_eq!(injected.to_vec3::<f32>()?, plain.to_vec3::<f32>()?);
    // self-attention path is untouched
    let self_site = "mid_block.attentions.0.transformer_blocks.0.attn1";
    assert!(backbone.processors.get(self_site).is_none());
    Ok(())
}

#[test]
fn scale_zero_matches_inactive_and_full_scale_differs() -> Result<()> {
    let dev = Device::Cpu;
    let mut backbone = TestBackbone::new(&dev)?;
    let config = AdapterConfig::new(AdapterType::Ip, EncoderArch::Clip);
    let adapter = IpAdapter::with_image_encoder(
        config,
        &mut backbone,
        stub_encoder(ClipLayer::ImageEmbeds),
        &dev,
        DType::F32,
    )?;
    let site = "down_blocks.1.attentions.0.transformer_blocks.0.attn2";
    let xs = Tensor::rand(0f32, 1f32, (2, 7, 64), &dev)?;
    let ctx = Tensor::rand(0f32, 1f32, (2, 9, CROSS_DIM), &dev)?;
    let ip_tokens = Tensor::rand(0f32, 1f32, (2, adapter.num_tokens(), CROSS_DIM), &dev)?;
    let ctx_aug = Tensor::cat(&[&ctx, &ip_tokens], 1)?;

    adapter.set_active(false);
    let base = backbone.forward_site(site, &xs, Some(&ctx))?;

    adapter.set_active(true);
    adapter.set_scale(0.0);
    let zeroed = backbone.forward_site(site, &xs, Some(&ctx_aug))?;
    assert_eq!(base.to_vec3::<f32>()?, zeroed.to_vec3::<f32>()?);

    // the injected projections were warm-started from the (nonzero) text
    // weights, so full scale must move the output
    adapter.set_scale(1.0);
    let active = backbone.forward_site(site, &xs, Some(&ctx_aug))?;
    let diff = (&active - &base)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(diff > 1e-6, "conditioning had no effect, diff {diff}");
    Ok(())
}

#[test]
fn forward_appends_tokens_and_runs_every_site() -> Result<()> {
    let dev = Device::Cpu;
    let mut backbone = TestBackbone::new(&dev)?;
    let config = AdapterConfig::new(AdapterType::Ip, EncoderArch::Clip);
    let adapter = IpAdapter::with_image_encoder(
        config,
        &mut backbone,
        stub_encoder(ClipLayer::ImageEmbeds),
        &dev,
        DType::F32,
    )?;
    let images = Tensor::rand(0f32, 1f32, (2, 3, 16, 16), &dev)?;
    let embeds = adapter.image_embeds(&images, false, false, false, 4)?;
    let text = Tensor::rand(0f32, 1f32, (2, 6, CROSS_DIM), &dev)?;
    let augmented = adapter.forward(&text, &embeds)?;
    assert_eq!(augmented.dims(), [2, 6 + adapter.num_tokens(), CROSS_DIM]);
    for (name, cross_dim) in backbone.attention_sites() {
        let hidden = hidden_for(&name);
        let xs = Tensor::rand(0f32, 1f32, (2, 7, hidden), &dev)?;
        let out = match cross_dim {
            Some(_) => backbone.forward_site(&name, &xs, Some(&augmented))?,
            None => backbone.forward_site(&name, &xs, None)?,
        };
        assert_eq!(out.dims(), [2, 7, hidden]);
    }
    // unconditional pixel values are premade at the processor input size
    assert_eq!(adapter.unconditional().dims(), [1, 3, 16, 16]);
    Ok(())
}

#[test]
fn token_count_invariant_across_projectors() -> Result<()> {
    let dev = Device::Cpu;

    // resampler with an explicit token count
    let mut backbone = TestBackbone::new(&dev)?;
    let mut config = AdapterConfig::new(AdapterType::IpPlus, EncoderArch::Clip);
    config.num_tokens = 6;
    config.clip_layer = ClipLayer::Penultimate;
    let adapter = IpAdapter::with_image_encoder(
        config,
        &mut backbone,
        stub_encoder(ClipLayer::Penultimate),
        &dev,
        DType::F32,
    )?;
    let images = Tensor::rand(0f32, 1f32, (2, 3, 16, 16), &dev)?;
    let embeds = adapter.image_embeds(&images, false, false, false, 4)?;
    assert_eq!(embeds.dims(), [2, 5, 24]);
    assert_eq!(adapter.project(&embeds)?.dims(), [2, 6, CROSS_DIM]);

    // unset token count falls back to the tower's native sequence length
    let mut backbone = TestBackbone::new(&dev)?;
    let mut config = AdapterConfig::new(AdapterType::IpPlus, EncoderArch::Clip);
    config.num_tokens = 0;
    config.clip_layer = ClipLayer::Penultimate;
    let adapter = IpAdapter::with_image_encoder(
        config,
        &mut backbone,
        stub_encoder(ClipLayer::Penultimate),
        &dev,
        DType::F32,
    )?;
    assert_eq!(adapter.num_tokens(), 5);
    assert_eq!(adapter.project(&embeds)?.dims(), [2, 5, CROSS_DIM]);

    // zipper over a convolutional tower: feature maps are flattened into
    // tokens before projection
    let mut backbone = TestBackbone::new(&dev)?;
    let mut config = AdapterConfig::new(AdapterType::Zipper, EncoderArch::ConvNextV2);
    config.num_tokens = 8;
    config.clip_layer = ClipLayer::LastHidden;
    let conv_encoder = ImageEncoder::new(
        EncoderArch::ConvNextV2,
        ClipLayer::LastHidden,
        Box::new(StubTower {
            embed_dim: 24,
            tokens: 16,
            image_size: 16,
            projection_dim: 24,
            conv: true,
        }),
    );
    let adapter =
        IpAdapter::with_image_encoder(config, &mut backbone, conv_encoder, &dev, DType::F32)?;
    let embeds = adapter.image_embeds(&images, false, false, false, 4)?;
    assert_eq!(embeds.dims(), [2, 16, 24]);
    assert_eq!(adapter.project(&embeds)?.dims(), [2, 8, CROSS_DIM]);
    Ok(())
}

#[test]
fn quad_average_matches_single_encode() -> Result<()> {
    let dev = Device::Cpu;
    let tower_config = ClipVisionConfig {
        hidden_size: 16,
        intermediate_size: 32,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        projection_dim: 8,
        num_channels: 3,
        image_size: 16,
        patch_size: 8,
    };
    let towermap = VarMap::new();
    let tower = ClipVisionTower::new(
        VarBuilder::from_varmap(&towermap, DType::F32, &dev),
        &tower_config,
    )?;
    let mut backbone = TestBackbone::new(&dev)?;
    let mut config = AdapterConfig::new(AdapterType::IpPlus, EncoderArch::Clip);
    config.quad_image = true;
    config.num_tokens = 0;
    config.clip_layer = ClipLayer::Penultimate;
    let encoder = ImageEncoder::new(EncoderArch::Clip, ClipLayer::Penultimate, Box::new(tower));
    let adapter = IpAdapter::with_image_encoder(config, &mut backbone, encoder, &dev, DType::F32)?;

    let single = Tensor::rand(0f32, 1f32, (1, 3, 16, 16), &dev)?;
    let row = Tensor::cat(&[&single, &single], 3)?;
    let tiled = Tensor::cat(&[&row, &row], 2)?;
    let quad_embeds = adapter.image_embeds(&tiled, false, false, false, 4)?;

    // a second tower over the same variables encodes the lone sub-image
    let tower = ClipVisionTower::new(
        VarBuilder::from_varmap(&towermap, DType::F32, &dev),
        &tower_config,
    )?;
    let encoder = ImageEncoder::new(EncoderArch::Clip, ClipLayer::Penultimate, Box::new(tower));
    let stats = EncoderArch::Clip.default_stats();
    let processor = ImageProcessor::new(
        &ProcessorConfig {
            image_mean: stats.mean,
            image_std: stats.std,
            size: 16,
        },
        16,
        &dev,
        DType::F32,
    )?;
    let direct = encoder.encode(&processor.preprocess(&single)?)?;

    assert_eq!(quad_embeds.dims(), direct.dims());
    let diff = (&quad_embeds - &direct)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(diff < 1e-5, "quad average drifted from single encode: {diff}");
    Ok(())
}

#[test]
fn unconditional_drop_produces_valid_embeddings() -> Result<()> {
    let dev = Device::Cpu;
    let mut backbone = TestBackbone::new(&dev)?;
    let config = AdapterConfig::new(AdapterType::Ip, EncoderArch::Clip);
    let adapter = IpAdapter::with_image_encoder(
        config,
        &mut backbone,
        stub_encoder(ClipLayer::ImageEmbeds),
        &dev,
        DType::F32,
    )?;
    let images = Tensor::rand(0f32, 1f32, (2, 3, 16, 16), &dev)?;
    let dropped = adapter.image_embeds(&images, true, false, false, 4)?;
    assert_eq!(dropped.dims(), [2, 16]);
    // out-of-band inputs stay fatal
    let bad = Tensor::full(2f32, (2, 3, 16, 16), &dev)?;
    assert!(adapter.image_embeds(&bad, false, false, false, 4).is_err());
    Ok(())
}

fn latents_of(adapter: &IpAdapter) -> Result<Vec<Vec<f32>>> {
    let data = adapter.varmap().data().lock().unwrap();
    let latents = data
        .get("image_proj.latents")
        .expect("resampler latents missing");
    Ok(latents.as_tensor().to_vec2::<f32>()?)
}

#[test]
fn merge_round_trip_preserves_overlap_and_remainder() -> Result<()> {
    let dev = Device::Cpu;
    let path = std::env::temp_dir().join(format!(
        "candle-ip-adapter-merge-{}.safetensors",
        std::process::id()
    ));

    let mut backbone = TestBackbone::new(&dev)?;
    let mut config = AdapterConfig::new(AdapterType::IpPlus, EncoderArch::Clip);
    config.num_tokens = 8;
    config.clip_layer = ClipLayer::Penultimate;
    let saved = IpAdapter::with_image_encoder(
        config.clone(),
        &mut backbone,
        stub_encoder(ClipLayer::Penultimate),
        &dev,
        DType::F32,
    )?;
    saved.save(&path)?;
    let saved_latents = latents_of(&saved)?;

    // shrink: the live 4-token latents are fully covered by the checkpoint
    let mut backbone = TestBackbone::new(&dev)?;
    let mut config_small = config.clone();
    config_small.num_tokens = 4;
    let small = IpAdapter::with_image_encoder(
        config_small,
        &mut backbone,
        stub_encoder(ClipLayer::Penultimate),
        &dev,
        DType::F32,
    )?;
    small.load(&path)?;
    let small_latents = latents_of(&small)?;
    assert_eq!(small_latents.as_slice(), &saved_latents[..4]);

    // grow: the overlap comes from the checkpoint, the rest keeps its
    // pre-load initialization
    let mut backbone = TestBackbone::new(&dev)?;
    let mut config_large = config.clone();
    config_large.num_tokens = 16;
    let large = IpAdapter::with_image_encoder(
        config_large,
        &mut backbone,
        stub_encoder(ClipLayer::Penultimate),
        &dev,
        DType::F32,
    )?;
    let pre_load = latents_of(&large)?;
    large.load(&path)?;
    let post_load = latents_of(&large)?;
    assert_eq!(&post_load[..8], saved_latents.as_slice());
    assert_eq!(&post_load[8..], &pre_load[8..]);

    std::fs::remove_file(&path).ok();
    Ok(())
}

#[test]
fn trainable_vars_follow_training_flags() -> Result<()> {
    let dev = Device::Cpu;
    let mut backbone = TestBackbone::new(&dev)?;
    let mut config = AdapterConfig::new(AdapterType::Ip, EncoderArch::Clip);
    config.train = true;
    let adapter = IpAdapter::with_image_encoder(
        config,
        &mut backbone,
        stub_encoder(ClipLayer::ImageEmbeds),
        &dev,
        DType::F32,
    )?;
    // 8 sites x 2 projections + image_proj {proj, norm} weights and biases
    let vars = adapter.trainable_vars();
    assert_eq!(vars.len(), 8 * 2 + 4);
    Ok(())
}
