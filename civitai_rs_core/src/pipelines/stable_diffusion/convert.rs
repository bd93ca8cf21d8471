//! Splits single-file Stable Diffusion 1.x checkpoints (LDM key layout, as distributed on
//! CivitAI) into separate UNet, VAE and CLIP text encoder safetensors files.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Result;
use candle_core::{safetensors::MmapedSafetensors, Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

const UNET_PREFIX: &str = "model.diffusion_model.";
const VAE_PREFIX: &str = "first_stage_model.";
const CLIP_PREFIX: &str = "cond_stage_model.transformer.";
const SDXL_MARKER: &str = "conditioner.embedders.";
const OPEN_CLIP_MARKER: &str = "cond_stage_model.model.";

const UNET_LAYERS_PER_BLOCK: usize = 2;
const VAE_UP_BLOCKS: usize = 4;

const UNET_RESNET_RENAMES: [(&str, &str); 6] = [
    ("in_layers.0.", "norm1."),
    ("in_layers.2.", "conv1."),
    ("out_layers.0.", "norm2."),
    ("out_layers.3.", "conv2."),
    ("emb_layers.1.", "time_emb_proj."),
    ("skip_connection.", "conv_shortcut."),
];
const VAE_RESNET_RENAMES: [(&str, &str); 1] = [("nin_shortcut.", "conv_shortcut.")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Component {
    Unet,
    Vae,
    TextEncoder,
}

impl Component {
    fn file_name(&self) -> &'static str {
        match self {
            Self::Unet => "unet.safetensors",
            Self::Vae => "vae.safetensors",
            Self::TextEncoder => "text_encoder.safetensors",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Unet => "unet",
            Self::Vae => "vae",
            Self::TextEncoder => "text encoder",
        }
    }
}

/// Locations of the converted component weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ComponentFiles {
    pub unet: PathBuf,
    pub vae: PathBuf,
    pub text_encoder: PathBuf,
}

impl ComponentFiles {
    fn in_dir(dir: &Path) -> Self {
        Self {
            unet: dir.join(Component::Unet.file_name()),
            vae: dir.join(Component::Vae.file_name()),
            text_encoder: dir.join(Component::TextEncoder.file_name()),
        }
    }

    fn path(&self, component: Component) -> &Path {
        match component {
            Component::Unet => &self.unet,
            Component::Vae => &self.vae,
            Component::TextEncoder => &self.text_encoder,
        }
    }

    fn all_exist(&self) -> bool {
        [&self.unet, &self.vae, &self.text_encoder]
            .iter()
            .all(|path| path.is_file())
    }
}

/// `models/civitai_model_1.safetensors` -> `models/civitai_model_1_components/`
pub(crate) fn cache_dir(checkpoint: &Path) -> PathBuf {
    let stem = checkpoint
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    checkpoint.with_file_name(format!("{stem}_components"))
}

/// Convert `checkpoint` into component files, reusing a previous conversion if present.
pub(crate) fn convert_checkpoint(checkpoint: &Path, silent: bool) -> Result<ComponentFiles> {
    let dir = cache_dir(checkpoint);
    let files = ComponentFiles::in_dir(&dir);
    if files.all_exist() {
        info!("reusing converted components in {}.", dir.display());
        return Ok(files);
    }

    info!("converting {} into components.", checkpoint.display());
    let safetensors = unsafe { MmapedSafetensors::new(checkpoint)? };
    let names = safetensors
        .tensors()
        .into_iter()
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
    check_architecture(&names)?;

    let bar = if silent {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(names.len() as u64).with_style(
            ProgressStyle::with_template("{msg} [{bar:40.green}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        )
    };
    bar.set_message("Converting checkpoint");

    let mut components: HashMap<Component, HashMap<String, Tensor>> = HashMap::new();
    for name in &names {
        if let Some((component, key)) = convert_key(name) {
            let tensor = safetensors.load(name, &Device::Cpu)?;
            let tensor = match component {
                Component::Vae => squeeze_vae_attention(&key, tensor)?,
                Component::Unet | Component::TextEncoder => tensor,
            };
            components.entry(component).or_default().insert(key, tensor);
        }
        bar.inc(1);
    }
    bar.finish();

    fs::create_dir_all(&dir)?;
    for component in [Component::Unet, Component::Vae, Component::TextEncoder] {
        let Some(tensors) = components.get(&component).filter(|t| !t.is_empty()) else {
            anyhow::bail!(
                "checkpoint {} contains no {} weights, expected a Stable Diffusion 1.x checkpoint",
                checkpoint.display(),
                component.label()
            );
        };
        save_atomically(tensors, files.path(component))?;
    }

    Ok(files)
}

fn save_atomically(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    let partial = path.with_extension("safetensors.part");
    candle_core::safetensors::save(tensors, &partial)?;
    fs::rename(&partial, path)?;
    Ok(())
}

fn check_architecture(names: &[String]) -> Result<()> {
    if names.iter().any(|name| name.starts_with(SDXL_MARKER)) {
        anyhow::bail!("SDXL checkpoints are not supported, only Stable Diffusion 1.x");
    }
    if names.iter().any(|name| name.starts_with(OPEN_CLIP_MARKER)) {
        anyhow::bail!("Stable Diffusion 2.x checkpoints are not supported, only Stable Diffusion 1.x");
    }
    Ok(())
}

/// Map a checkpoint key to the component it belongs to and its name within that component.
///
/// Keys belonging to nothing we load (EMA weights, noise schedule buffers) yield `None`.
pub(crate) fn convert_key(name: &str) -> Option<(Component, String)> {
    if let Some(key) = name.strip_prefix(UNET_PREFIX) {
        convert_unet_key(key).map(|key| (Component::Unet, key))
    } else if let Some(key) = name.strip_prefix(VAE_PREFIX) {
        convert_vae_key(key).map(|key| (Component::Vae, key))
    } else if let Some(key) = name.strip_prefix(CLIP_PREFIX) {
        convert_clip_key(key).map(|key| (Component::TextEncoder, key))
    } else {
        None
    }
}

fn rename_prefix(rest: &str, renames: &[(&str, &str)]) -> String {
    renames
        .iter()
        .find_map(|(from, to)| rest.strip_prefix(from).map(|tail| format!("{to}{tail}")))
        .unwrap_or_else(|| rest.to_string())
}

fn convert_unet_key(key: &str) -> Option<String> {
    let mut parts = key.splitn(3, '.');
    let head = parts.next()?;
    let index = parts.next()?;
    let rest = parts.next()?;
    match (head, index) {
        ("time_embed", "0") => Some(format!("time_embedding.linear_1.{rest}")),
        ("time_embed", "2") => Some(format!("time_embedding.linear_2.{rest}")),
        ("out", "0") => Some(format!("conv_norm_out.{rest}")),
        ("out", "2") => Some(format!("conv_out.{rest}")),
        ("input_blocks", index) => convert_input_block(index.parse().ok()?, rest),
        ("middle_block", index) => convert_middle_block(index, rest),
        ("output_blocks", index) => convert_output_block(index.parse().ok()?, rest),
        _ => None,
    }
}

fn convert_input_block(index: usize, rest: &str) -> Option<String> {
    let (layer, rest) = rest.split_once('.')?;
    if index == 0 {
        return (layer == "0").then(|| format!("conv_in.{rest}"));
    }
    let block = (index - 1) / (UNET_LAYERS_PER_BLOCK + 1);
    let position = (index - 1) % (UNET_LAYERS_PER_BLOCK + 1);
    match layer {
        "0" => Some(match rest.strip_prefix("op.") {
            Some(param) => format!("down_blocks.{block}.downsamplers.0.conv.{param}"),
            None => format!(
                "down_blocks.{block}.resnets.{position}.{}",
                rename_prefix(rest, &UNET_RESNET_RENAMES)
            ),
        }),
        "1" => Some(format!("down_blocks.{block}.attentions.{position}.{rest}")),
        _ => None,
    }
}

fn convert_middle_block(index: &str, rest: &str) -> Option<String> {
    match index {
        "0" => Some(format!(
            "mid_block.resnets.0.{}",
            rename_prefix(rest, &UNET_RESNET_RENAMES)
        )),
        "1" => Some(format!("mid_block.attentions.0.{rest}")),
        "2" => Some(format!(
            "mid_block.resnets.1.{}",
            rename_prefix(rest, &UNET_RESNET_RENAMES)
        )),
        _ => None,
    }
}

fn convert_output_block(index: usize, rest: &str) -> Option<String> {
    let (layer, rest) = rest.split_once('.')?;
    let block = index / (UNET_LAYERS_PER_BLOCK + 1);
    let position = index % (UNET_LAYERS_PER_BLOCK + 1);
    match layer {
        "0" => Some(format!(
            "up_blocks.{block}.resnets.{position}.{}",
            rename_prefix(rest, &UNET_RESNET_RENAMES)
        )),
        // The first up block has no attention, its upsampler takes slot 1.
        "1" if rest.starts_with("conv.") => Some(format!("up_blocks.{block}.upsamplers.0.{rest}")),
        "1" => Some(format!("up_blocks.{block}.attentions.{position}.{rest}")),
        "2" => Some(format!("up_blocks.{block}.upsamplers.0.{rest}")),
        _ => None,
    }
}

fn convert_vae_key(key: &str) -> Option<String> {
    let (side, rest) = key.split_once('.')?;
    match side {
        "quant_conv" | "post_quant_conv" => Some(key.to_string()),
        "encoder" | "decoder" => convert_vae_coder(rest).map(|rest| format!("{side}.{rest}")),
        _ => None,
    }
}

fn convert_vae_coder(rest: &str) -> Option<String> {
    if let Some(param) = rest.strip_prefix("norm_out.") {
        return Some(format!("conv_norm_out.{param}"));
    }
    if rest.starts_with("conv_in.") || rest.starts_with("conv_out.") {
        return Some(rest.to_string());
    }
    if let Some(mid) = rest.strip_prefix("mid.") {
        let (part, tail) = mid.split_once('.')?;
        return match part {
            "block_1" => Some(format!(
                "mid_block.resnets.0.{}",
                rename_prefix(tail, &VAE_RESNET_RENAMES)
            )),
            "block_2" => Some(format!(
                "mid_block.resnets.1.{}",
                rename_prefix(tail, &VAE_RESNET_RENAMES)
            )),
            "attn_1" => {
                let (layer, param) = tail.split_once('.')?;
                let layer = match layer {
                    "norm" => "group_norm",
                    "q" => "query",
                    "k" => "key",
                    "v" => "value",
                    "proj_out" => "proj_attn",
                    _ => return None,
                };
                Some(format!("mid_block.attentions.0.{layer}.{param}"))
            }
            _ => None,
        };
    }

    let (direction, tail) = rest.split_once('.')?;
    let (index, tail) = tail.split_once('.')?;
    let index: usize = index.parse().ok()?;
    let (kind, tail) = tail.split_once('.')?;
    match (direction, kind) {
        ("down", "block") => {
            let (position, param) = tail.split_once('.')?;
            Some(format!(
                "down_blocks.{index}.resnets.{position}.{}",
                rename_prefix(param, &VAE_RESNET_RENAMES)
            ))
        }
        ("down", "downsample") => Some(format!("down_blocks.{index}.downsamplers.0.{tail}")),
        // Decoder up blocks are stored in reverse order.
        ("up", "block") => {
            let block = VAE_UP_BLOCKS.checked_sub(index + 1)?;
            let (position, param) = tail.split_once('.')?;
            Some(format!(
                "up_blocks.{block}.resnets.{position}.{}",
                rename_prefix(param, &VAE_RESNET_RENAMES)
            ))
        }
        ("up", "upsample") => {
            let block = VAE_UP_BLOCKS.checked_sub(index + 1)?;
            Some(format!("up_blocks.{block}.upsamplers.0.{tail}"))
        }
        _ => None,
    }
}

fn convert_clip_key(key: &str) -> Option<String> {
    if key.ends_with("position_ids") {
        return None;
    }
    if key.starts_with("text_model.") {
        Some(key.to_string())
    } else {
        Some(format!("text_model.{key}"))
    }
}

/// The VAE mid-block attention uses 1x1 convolutions where the loader expects linear layers.
fn squeeze_vae_attention(key: &str, tensor: Tensor) -> candle_core::Result<Tensor> {
    if key.contains(".mid_block.attentions.0.") && tensor.rank() == 4 {
        tensor.squeeze(3)?.squeeze(2)
    } else {
        Ok(tensor)
    }
}
