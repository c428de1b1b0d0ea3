//! Contract with the generative backbone.
//!
//! The backbone stays an external collaborator: it enumerates its attention
//! sites, hands out the text key/value weights for warm starts, and accepts
//! the processor map the orchestrator builds. Hidden sizes are derived from
//! the structural site names against the backbone's own channel layout.
use std::collections::BTreeMap;
use std::sync::Arc;

use candle::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::attention::IpAttnProcessor;

/// Backbone families the adapter specializes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackboneKind {
    #[serde(rename = "sd")]
    Sd,
    #[serde(rename = "sdxl")]
    Sdxl,
    #[serde(rename = "pixart")]
    Pixart,
}

impl BackboneKind {
    pub fn resampler_heads(&self) -> usize {
        match self {
            Self::Sd => 12,
            Self::Sdxl | Self::Pixart => 20,
        }
    }

    pub fn resampler_dim(&self, cross_attention_dim: usize) -> usize {
        match self {
            Self::Sd => cross_attention_dim,
            Self::Sdxl => 1280,
            Self::Pixart => 4096,
        }
    }

    pub fn resampler_output_dim(&self, cross_attention_dim: usize) -> usize {
        match self {
            Self::Pixart => 4096,
            _ => cross_attention_dim,
        }
    }

    /// PixArt-class transformers destabilize when the injected projections
    /// start at the full text-projection magnitude.
    pub fn kv_init_scale(&self) -> f64 {
        match self {
            Self::Pixart => 0.01,
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackboneConfig {
    pub kind: BackboneKind,
    pub cross_attention_dim: usize,
    pub block_out_channels: Vec<usize>,
}

/// One cross-attention location, resolved at construction time.
#[derive(Debug, Clone)]
pub struct AttentionSite {
    pub name: String,
    pub hidden_size: usize,
    pub cross_attention_dim: usize,
}

fn block_index(rest: &str) -> Result<usize> {
    match rest.split('.').next().and_then(|s| s.parse::<usize>().ok()) {
        Some(index) => Ok(index),
        None => candle::bail!("cannot parse a block index out of {rest}"),
    }
}

/// Maps a structural site name onto the hidden size of its block.
pub fn hidden_size_for_site(name: &str, config: &BackboneConfig) -> Result<usize> {
    let channels = &config.block_out_channels;
    if name.starts_with("mid_block") {
        match channels.last() {
            Some(c) => Ok(*c),
            None => candle::bail!("backbone config has no block channels"),
        }
    } else if let Some(rest) = name.strip_prefix("up_blocks.") {
        let index = block_index(rest)?;
        match channels.iter().rev().nth(index) {
            Some(c) => Ok(*c),
            None => candle::bail!("up block {index} out of range for {name}"),
        }
    } else if let Some(rest) = name.strip_prefix("down_blocks.") {
        let index = block_index(rest)?;
        match channels.get(index) {
            Some(c) => Ok(*c),
            None => candle::bail!("down block {index} out of range for {name}"),
        }
    } else if name.starts_with("transformer_blocks") {
        Ok(config.cross_attention_dim)
    } else {
        candle::bail!("unknown attention site name: {name}")
    }
}

/// What the adapter needs from the generative backbone.
pub trait CrossAttnBackbone {
    fn config(&self) -> &BackboneConfig;

    /// Every attention site in forward order; the cross-attention dimension
    /// is `None` for self-attention sites, which are left untouched.
    fn attention_sites(&self) -> Vec<(String, Option<usize>)>;

    /// Text key/value projection weights at a cross-attention site.
    fn attn_kv_weights(&self, site: &str) -> Result<(Tensor, Tensor)>;

    /// Installs one injected processor per cross-attention site.
    fn install_processors(
        &mut self,
        processors: BTreeMap<String, Arc<IpAttnProcessor>>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackboneConfig {
        BackboneConfig {
            kind: BackboneKind::Sd,
            cross_attention_dim: 768,
            block_out_channels: vec![320, 640, 1280, 1280],
        }
    }

    #[test]
    fn hidden_sizes_follow_block_layout() -> Result<()> {
        let c = config();
        assert_eq!(hidden_size_for_site("mid_block.attentions.0.attn2", &c)?, 1280);
        assert_eq!(hidden_size_for_site("down_blocks.1.attentions.0.attn2", &c)?, 640);
        assert_eq!(hidden_size_for_site("up_blocks.0.attentions.0.attn2", &c)?, 1280);
        assert_eq!(hidden_size_for_site("up_blocks.3.attentions.1.attn2", &c)?, 320);
        assert_eq!(hidden_size_for_site("transformer_blocks.4.attn2", &c)?, 768);
        Ok(())
    }

    #[test]
    fn unknown_sites_are_rejected() {
        let c = config();
        assert!(hidden_size_for_site("bottleneck.attn", &c).is_err());
        assert!(hidden_size_for_site("down_blocks.9.attn2", &c).is_err());
    }

    #[test]
    fn pixart_overrides() {
        assert_eq!(BackboneKind::Pixart.resampler_dim(768), 4096);
        assert_eq!(BackboneKind::Pixart.resampler_output_dim(768), 4096);
        assert_eq!(BackboneKind::Sd.resampler_output_dim(768), 768);
        assert_eq!(BackboneKind::Sdxl.resampler_heads(), 20);
        assert!((BackboneKind::Pixart.kv_init_scale() - 0.01).abs() < f64::EPSILON);
    }
}
