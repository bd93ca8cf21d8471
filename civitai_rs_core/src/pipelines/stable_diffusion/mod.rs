mod convert;

use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, schedulers::Scheduler, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::sync::ApiBuilder;
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use super::{DiffusionGenerationParams, ModelPipeline, Offloading};

const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const DEFAULT_PAD_TOKEN: &str = "<|endoftext|>";
const UNET_IN_CHANNELS: usize = 4;
const LATENT_CHANNELS: usize = 4;
const VAE_SCALE: f64 = 0.18215;

pub(crate) struct StableDiffusionPipeline {
    tokenizer: Tokenizer,
    max_tokens: usize,
    pad_id: u32,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    device: Device,
    dtype: DType,
    /// Where the text encoder and VAE run; the host when offloading.
    stage_device: Device,
    stage_dtype: DType,
    silent: bool,
}

impl StableDiffusionPipeline {
    pub(crate) fn load(
        checkpoint: &Path,
        tokenizer: Option<PathBuf>,
        device: &Device,
        dtype: DType,
        offloading_type: Option<Offloading>,
        silent: bool,
    ) -> Result<Self> {
        let components = convert::convert_checkpoint(checkpoint, silent)?;
        let config = sd_config();

        let tokenizer_file = match tokenizer {
            Some(path) => path,
            None => fetch_tokenizer(silent)?,
        };
        let tokenizer = Tokenizer::from_file(&tokenizer_file).map_err(anyhow::Error::msg)?;
        let pad_token = config
            .clip
            .pad_with
            .clone()
            .unwrap_or_else(|| DEFAULT_PAD_TOKEN.to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .ok_or_else(|| anyhow::anyhow!("tokenizer has no `{pad_token}` token"))?;

        let (stage_device, stage_dtype) = match offloading_type {
            Some(Offloading::Full) => {
                info!("keeping the text encoder and VAE in host memory.");
                (Device::Cpu, DType::F32)
            }
            None => (device.clone(), dtype),
        };

        let use_flash_attn = cfg!(feature = "flash-attn") && device.is_cuda();
        if use_flash_attn {
            info!("using memory-efficient (flash) attention.");
        } else {
            warn!("memory-efficient attention is not available, using standard attention.");
        }

        let text_model = stable_diffusion::build_clip_transformer(
            &config.clip,
            &components.text_encoder,
            &stage_device,
            DType::F32,
        )?;
        let vae = config.build_vae(&components.vae, &stage_device, stage_dtype)?;
        let unet = config.build_unet(
            &components.unet,
            device,
            UNET_IN_CHANNELS,
            use_flash_attn,
            dtype,
        )?;
        info!("pipeline ready.");

        Ok(Self {
            tokenizer,
            max_tokens: config.clip.max_position_embeddings,
            pad_id,
            text_model,
            unet,
            vae,
            device: device.clone(),
            dtype,
            stage_device,
            stage_dtype,
            silent,
        })
    }

    /// CLIP embeddings for each prompt, `(prompts.len(), context, hidden)`.
    fn encode_prompts(&self, prompts: &[String]) -> Result<Tensor> {
        let max_len = self.max_tokens;
        let mut embeddings = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let mut tokens = self
                .tokenizer
                .encode(prompt.as_str(), true)
                .map_err(anyhow::Error::msg)?
                .get_ids()
                .to_vec();
            if tokens.len() > max_len {
                anyhow::bail!(
                    "the prompt is too long, {} > max-tokens ({max_len})",
                    tokens.len()
                );
            }
            tokens.resize(max_len, self.pad_id);
            let tokens = Tensor::new(tokens.as_slice(), &self.stage_device)?.unsqueeze(0)?;
            embeddings.push(self.text_model.forward(&tokens)?);
        }
        Ok(Tensor::cat(&embeddings, 0)?)
    }

    /// Gaussian latents drawn on the host so a seed gives the same image on every device.
    fn initial_latents(&self, batch: usize, params: &DiffusionGenerationParams) -> Result<Tensor> {
        let shape = (
            batch,
            LATENT_CHANNELS,
            params.height / 8,
            params.width / 8,
        );
        let len = batch * LATENT_CHANNELS * (params.height / 8) * (params.width / 8);
        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let data = (0..len)
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect::<Vec<_>>();
        Ok(Tensor::from_vec(data, shape, &Device::Cpu)?.to_device(&self.device)?)
    }

    fn step_bar(&self, steps: usize) -> ProgressBar {
        if self.silent {
            return ProgressBar::hidden();
        }
        ProgressBar::new(steps as u64).with_style(
            ProgressStyle::with_template("Denoising [{bar:40.magenta}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        )
    }
}

impl ModelPipeline for StableDiffusionPipeline {
    fn forward(
        &mut self,
        prompts: Vec<String>,
        params: DiffusionGenerationParams,
    ) -> Result<Tensor> {
        if params.height % 8 != 0 || params.width % 8 != 0 {
            anyhow::bail!(
                "height and width must be multiples of 8, got {}x{}",
                params.width,
                params.height
            );
        }
        let batch = prompts.len();
        let use_guidance = params.guidance_scale > 1.0;

        let cond = self.encode_prompts(&prompts)?;
        let text_embeddings = if use_guidance {
            let negative = params.negative_prompt.clone().unwrap_or_default();
            let uncond = self.encode_prompts(&vec![negative; batch])?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        let text_embeddings = text_embeddings
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;

        let mut scheduler = sd_config().build_scheduler(params.num_steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latents = self.initial_latents(batch, &params)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let bar = self.step_bar(timesteps.len());
        for &timestep in &timesteps {
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
                (uncond + ((text - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            bar.inc(1);
        }
        bar.finish();

        let latents = latents
            .to_device(&self.stage_device)?
            .to_dtype(self.stage_dtype)?;
        let images = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let images = ((images.to_dtype(DType::F32)? / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let images = (images.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
        Ok(images)
    }
}

fn sd_config() -> StableDiffusionConfig {
    StableDiffusionConfig::v1_5(None, None, None)
}

fn fetch_tokenizer(silent: bool) -> Result<PathBuf> {
    let api = ApiBuilder::new()
        .with_progress(!silent)
        .build()
        .map_err(|e| anyhow::Error::msg(e.to_string()))?;
    api.model(CLIP_TOKENIZER_REPO.to_string())
        .get("tokenizer.json")
        .map_err(|e| anyhow::Error::msg(e.to_string()))
}
