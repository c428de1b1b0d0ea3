//! Configuration surface consumed by the adapter.
//!
//! All of this is deserializable from the training/inference driver's config
//! file; the enums are closed so an unknown encoder architecture or adapter
//! type fails before any weights are touched.
use candle::Result;
use serde::{Deserialize, Serialize};

use crate::vision::EncoderArch;

/// Which projection strategy turns encoder output into context tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterType {
    /// Linear expansion of the pooled embedding into a short token run.
    #[serde(rename = "ip")]
    Ip,
    /// Perceiver-style resampler over the full hidden-state sequence.
    #[serde(rename = "ip+")]
    IpPlus,
    /// Zipper resampler with explicit input/output token counts.
    #[serde(rename = "ipz")]
    Zipper,
    /// Encoder output is consumed by an external LoRA, no projection here.
    #[serde(rename = "ilora")]
    Ilora,
}

impl AdapterType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ip" => Ok(Self::Ip),
            "ip+" => Ok(Self::IpPlus),
            "ipz" => Ok(Self::Zipper),
            "ilora" => Ok(Self::Ilora),
            _ => candle::bail!("unknown adapter type: {s}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::IpPlus => "ip+",
            Self::Zipper => "ipz",
            Self::Ilora => "ilora",
        }
    }
}

/// Which encoder output the projector reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipLayer {
    #[serde(rename = "penultimate_hidden_states")]
    Penultimate,
    #[serde(rename = "last_hidden_state")]
    LastHidden,
    /// The pooled, projected embedding.
    #[default]
    #[serde(rename = "image_embeds")]
    ImageEmbeds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(rename = "type")]
    pub adapter_type: AdapterType,
    pub image_encoder_arch: EncoderArch,
    /// Directory or hub id holding the pretrained encoder weights and the
    /// preprocessor config. When unset the encoder is freshly initialized.
    #[serde(default)]
    pub image_encoder_path: Option<String>,
    /// Adapter checkpoint to load right after construction.
    #[serde(default)]
    pub name_or_path: Option<String>,
    /// Number of context tokens appended to the text sequence. 0 means "use
    /// the encoder's native sequence length".
    #[serde(default = "default_num_tokens")]
    pub num_tokens: usize,
    /// Input is a 2x2 tiled composite whose quadrants are encoded separately
    /// and averaged.
    #[serde(default)]
    pub quad_image: bool,
    #[serde(default)]
    pub clip_layer: ClipLayer,
    #[serde(default)]
    pub train: bool,
    #[serde(default)]
    pub train_image_encoder: bool,
    #[serde(default)]
    pub train_only_image_encoder: bool,
}

fn default_num_tokens() -> usize {
    4
}

impl AdapterConfig {
    pub fn new(adapter_type: AdapterType, image_encoder_arch: EncoderArch) -> Self {
        Self {
            adapter_type,
            image_encoder_arch,
            image_encoder_path: None,
            name_or_path: None,
            num_tokens: default_num_tokens(),
            quad_image: false,
            clip_layer: ClipLayer::default(),
            train: false,
            train_image_encoder: false,
            train_only_image_encoder: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_config_from_json() {
        let cfg: AdapterConfig = serde_json::from_str(
            r#"{
                "type": "ip+",
                "image_encoder_arch": "clip",
                "num_tokens": 16,
                "clip_layer": "penultimate_hidden_states",
                "quad_image": true
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.adapter_type, AdapterType::IpPlus);
        assert_eq!(cfg.num_tokens, 16);
        assert_eq!(cfg.clip_layer, ClipLayer::Penultimate);
        assert!(cfg.quad_image);
        assert!(!cfg.train);
    }

    #[test]
    fn unknown_adapter_type_is_rejected() {
        let res = serde_json::from_str::<AdapterConfig>(
            r#"{"type": "ip-mega", "image_encoder_arch": "clip"}"#,
        );
        assert!(res.is_err());
        assert!(AdapterType::parse("ip-mega").is_err());
    }
}
