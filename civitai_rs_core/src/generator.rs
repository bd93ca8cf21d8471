use std::path::{Path, PathBuf};

use anyhow::Result;
use civitai_rs_common::{
    get_token, DownloadRequest, Downloader, ModelFetcher, ModelSource, TokenSource,
};
use tracing::{error, info};

use crate::{
    config::GeneratorConfig,
    error::GeneratorError,
    pipelines::{encode_png, DiffusionGenerationParams, Pipeline},
};

/// A single text-to-image request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub num_steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// A request for `prompt` with the default 30 steps, 7.5 guidance and 512x512 output.
    pub fn new<S: ToString>(prompt: S) -> Self {
        let defaults = DiffusionGenerationParams::default();
        Self {
            prompt: prompt.to_string(),
            negative_prompt: defaults.negative_prompt,
            num_steps: defaults.num_steps,
            guidance_scale: defaults.guidance_scale,
            width: defaults.width,
            height: defaults.height,
            seed: defaults.seed,
        }
    }

    pub fn with_negative_prompt<S: ToString>(mut self, negative_prompt: S) -> Self {
        self.negative_prompt = Some(negative_prompt.to_string());
        self
    }

    pub fn with_num_steps(mut self, num_steps: usize) -> Self {
        self.num_steps = num_steps;
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    pub fn with_size(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validate(&self) -> Result<(), GeneratorError> {
        if self.prompt.trim().is_empty() {
            return Err(GeneratorError::InvalidRequest(
                "the prompt is empty".to_string(),
            ));
        }
        if self.num_steps == 0 {
            return Err(GeneratorError::InvalidRequest(
                "at least one denoising step is required".to_string(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(GeneratorError::InvalidRequest(format!(
                "image size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }

    fn params(&self) -> DiffusionGenerationParams {
        DiffusionGenerationParams {
            height: self.height,
            width: self.width,
            num_steps: self.num_steps,
            guidance_scale: self.guidance_scale,
            negative_prompt: self.negative_prompt.clone(),
            seed: self.seed,
        }
    }
}

/// Make sure the checkpoint for `source` is on disk and return its path.
///
/// A missing CivitAI checkpoint is downloaded with `fetcher`. The token is read first, and
/// without one nothing is requested.
pub fn ensure_model(
    source: &ModelSource,
    model_dir: &Path,
    token: &TokenSource,
    fetcher: &dyn ModelFetcher,
) -> Result<PathBuf, GeneratorError> {
    let path = source.local_path(model_dir);
    if path.is_file() {
        info!("Found model at {}", path.display());
        return Ok(path);
    }
    let model = match source {
        ModelSource::Civitai(model) => model,
        ModelSource::LocalFile(_) => return Err(GeneratorError::MissingCheckpoint { path }),
    };

    info!("Model not found at {}. Downloading...", path.display());
    let token = get_token(token).ok_or_else(|| GeneratorError::MissingCredential {
        token_source: token.clone(),
    })?;
    let request = DownloadRequest::new(model.url(), token, model_dir);
    fetcher
        .fetch_model(&request)
        .ok_or_else(|| GeneratorError::DownloadFailed {
            url: model.url().to_string(),
        })
}

/// Turns prompts into PNG images.
///
/// Cloning is cheap and clones share one model. Concurrent [`ImageGenerator::generate`] calls
/// are served one at a time.
#[derive(Clone)]
pub struct ImageGenerator {
    pipeline: Pipeline,
}

impl ImageGenerator {
    /// Fetch the checkpoint if needed and load the pipeline.
    pub fn initialize(config: &GeneratorConfig) -> Result<Self> {
        let downloader = Downloader::new(config.silent)?;
        Self::initialize_with(config, &downloader)
    }

    /// Like [`ImageGenerator::initialize`], downloading through `fetcher`.
    pub fn initialize_with(config: &GeneratorConfig, fetcher: &dyn ModelFetcher) -> Result<Self> {
        info!("Initializing image generator for {}", config.source);
        let checkpoint = ensure_model(&config.source, &config.model_dir, &config.token, fetcher)?;
        let pipeline = Pipeline::load(
            &checkpoint,
            config.silent,
            config.tokenizer.clone(),
            config.offloading,
            &config.dtype,
        )?;
        Ok(Self::from_pipeline(pipeline))
    }

    pub fn from_pipeline(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Generate one image and return it PNG-encoded.
    pub fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>> {
        request.validate()?;
        let images = self
            .pipeline
            .forward(vec![request.prompt.clone()], request.params())
            .inspect_err(|e| error!("Error generating image: {e}"))?;
        let image = images
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("the pipeline returned no image"))?;
        encode_png(&image)
    }
}
