//! Persisted adapter state.
//!
//! One safetensors file, flat keys prefixed by section: `image_proj.*`,
//! `ip_adapter.<site index>.*`, optionally `image_encoder.*` and
//! `preprocessor.*`. Sections absent from a checkpoint are skipped so legacy
//! layouts keep loading; shape mismatches go through the lossy merge.
use std::collections::HashMap;
use std::path::Path;

use candle::{Device, Result, Tensor};
use candle_nn::VarMap;

use crate::merge::merge_overlap;

pub const IMAGE_PROJ: &str = "image_proj";
pub const IP_ADAPTER: &str = "ip_adapter";
pub const IMAGE_ENCODER: &str = "image_encoder";
pub const PREPROCESSOR: &str = "preprocessor";

pub fn section_of(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// Clones all variables belonging to the given sections.
pub fn collect_sections(varmap: &VarMap, sections: &[&str]) -> HashMap<String, Tensor> {
    let data = varmap.data().lock().unwrap();
    data.iter()
        .filter(|(name, _)| sections.contains(&section_of(name)))
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect()
}

pub fn save_sections<P: AsRef<Path>>(varmap: &VarMap, sections: &[&str], path: P) -> Result<()> {
    let tensors = collect_sections(varmap, sections);
    candle::safetensors::save(&tensors, path)
}

pub fn load_file<P: AsRef<Path>>(path: P, device: &Device) -> Result<HashMap<String, Tensor>> {
    candle::safetensors::load(path, device)
}

/// Applies checkpoint tensors onto the live variables of the given sections.
/// Keys missing from the checkpoint keep their live values; shape mismatches
/// are reconciled through [`merge_overlap`].
pub fn apply_sections(
    varmap: &VarMap,
    sections: &[&str],
    tensors: &HashMap<String, Tensor>,
) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    for (name, var) in data.iter() {
        if !sections.contains(&section_of(name)) {
            continue;
        }
        let Some(value) = tensors.get(name) else {
            continue;
        };
        if var.dims() == value.dims() {
            let value = value.to_dtype(var.dtype())?.to_device(var.device())?;
            var.set(&value)?;
        } else {
            tracing::warn!(
                "merging {name}: {:?} <- {:?}",
                var.shape(),
                value.shape()
            );
            let merged = merge_overlap(var.as_tensor(), value)?;
            var.set(&merged)?;
        }
    }
    Ok(())
}

/// Seeds one section from an un-prefixed tensor map, e.g. a pretrained
/// encoder checkpoint. Unlike [`apply_sections`] every live variable of the
/// section must be present: a partial encoder would be silently broken.
pub fn seed_section(
    varmap: &VarMap,
    section: &str,
    tensors: &HashMap<String, Tensor>,
) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    let prefix = format!("{section}.");
    for (name, var) in data.iter() {
        let Some(suffix) = name.strip_prefix(&prefix) else {
            continue;
        };
        match tensors.get(suffix) {
            Some(value) => {
                let value = value.to_dtype(var.dtype())?.to_device(var.device())?;
                var.set(&value)?
            }
            None => candle::bail!("pretrained checkpoint is missing {suffix}"),
        }
    }
    Ok(())
}
