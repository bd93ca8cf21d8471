mod stable_diffusion;

use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Result;
use candle_core::Tensor;
use image::{DynamicImage, ImageFormat, RgbImage};
use tracing::info;

use crate::util::{select_device, ModelDType, TryIntoDType};
use stable_diffusion::StableDiffusionPipeline;

/// Generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffusionGenerationParams {
    pub height: usize,
    pub width: usize,
    /// The number of denoising steps. More denoising steps usually lead to a higher quality image at the
    /// expense of slower inference.
    pub num_steps: usize,
    /// Higher guidance scale encourages to generate images that are closely linked to the text `prompt`,
    /// usually at the expense of lower image quality. Values of 1 or less disable guidance.
    pub guidance_scale: f64,
    /// What the image should not contain. Applied to every prompt in the batch.
    pub negative_prompt: Option<String>,
    /// Seed for the initial latents. Random when unset.
    pub seed: Option<u64>,
}

impl Default for DiffusionGenerationParams {
    fn default() -> Self {
        Self {
            height: 512,
            width: 512,
            num_steps: 30,
            guidance_scale: 7.5,
            negative_prompt: None,
            seed: None,
        }
    }
}

/// Offloading setting during loading.
///
/// - Full: keep the text encoder and VAE in CPU memory, only the UNet lives on the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Offloading {
    Full,
}

/// A loaded diffusion model.
///
/// `forward` returns a `(batch, 3, height, width)` tensor of `u8` pixels.
pub trait ModelPipeline: Send {
    fn forward(&mut self, prompts: Vec<String>, params: DiffusionGenerationParams)
        -> Result<Tensor>;
}

/// Represents the model and provides methods to load and interact with it.
///
/// Calls to [`Pipeline::forward`] are serialized: the model sits behind a mutex.
#[derive(Clone)]
pub struct Pipeline {
    model: Arc<Mutex<dyn ModelPipeline>>,
}

impl Pipeline {
    /// Load a Stable Diffusion 1.x single-file checkpoint.
    ///
    /// - `tokenizer` is a CLIP `tokenizer.json`; when `None` it is fetched from the Hugging Face hub.
    /// - Set `silent` to not show progress bars.
    pub fn load(
        checkpoint: impl AsRef<Path>,
        silent: bool,
        tokenizer: Option<PathBuf>,
        offloading_type: Option<Offloading>,
        dtype: &ModelDType,
    ) -> Result<Self> {
        let checkpoint = checkpoint.as_ref();
        info!("loading checkpoint: {}.", checkpoint.display());

        let device = select_device(silent)?;
        let dtype = dtype.try_into_dtype(&device, silent)?;

        let model = StableDiffusionPipeline::load(
            checkpoint,
            tokenizer,
            &device,
            dtype,
            offloading_type,
            silent,
        )?;
        Ok(Self::from_model(model))
    }

    /// Wrap an already constructed model.
    pub fn from_model<M: ModelPipeline + 'static>(model: M) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
        }
    }

    /// Generate images based on prompts and generation parameters.
    ///
    /// If multiple prompts are given, they are run together as a batch.
    pub fn forward(
        &self,
        prompts: Vec<String>,
        params: DiffusionGenerationParams,
    ) -> Result<Vec<DynamicImage>> {
        let img = {
            let mut model = self
                .model
                .lock()
                .map_err(|_| anyhow::anyhow!("a previous generation panicked, the model is unusable"))?;
            model.forward(prompts, params)?
        };

        let (_b, c, h, w) = img.dims4()?;
        if c != 3 {
            anyhow::bail!("Expected 3 channels in image output, got {c}");
        }
        let mut images = Vec::new();
        for b_img in img.chunk(img.dim(0)?, 0)? {
            let flattened = b_img.squeeze(0)?.permute((1, 2, 0))?.flatten_all()?;
            #[allow(clippy::cast_possible_truncation)]
            images.push(DynamicImage::ImageRgb8(
                RgbImage::from_raw(w as u32, h as u32, flattened.to_vec1::<u8>()?)
                    .ok_or_else(|| anyhow::anyhow!("RgbImage has invalid capacity."))?,
            ));
        }
        Ok(images)
    }
}

/// Encode an image as PNG.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use candle_core::{Device, Tensor};
    use image::GenericImageView;

    use super::{encode_png, DiffusionGenerationParams, ModelPipeline, Pipeline};

    /// Emits one image per prompt, pixel value = prompt index.
    struct Constant {
        channels: usize,
    }

    impl ModelPipeline for Constant {
        fn forward(
            &mut self,
            prompts: Vec<String>,
            params: DiffusionGenerationParams,
        ) -> Result<Tensor> {
            let (b, h, w) = (prompts.len(), params.height, params.width);
            let data = (0..b)
                .flat_map(|i| std::iter::repeat(i as u8).take(self.channels * h * w))
                .collect::<Vec<_>>();
            Ok(Tensor::from_vec(data, (b, self.channels, h, w), &Device::Cpu)?)
        }
    }

    #[test]
    fn converts_batches_to_images() -> Result<()> {
        let pipeline = Pipeline::from_model(Constant { channels: 3 });
        let params = DiffusionGenerationParams {
            height: 4,
            width: 6,
            ..Default::default()
        };

        let images = pipeline.forward(vec!["a".into(), "b".into()], params)?;

        assert_eq!(images.len(), 2);
        assert_eq!(images[1].dimensions(), (6, 4));
        assert_eq!(images[1].to_rgb8().get_pixel(5, 3).0, [1, 1, 1]);
        Ok(())
    }

    #[test]
    fn rejects_non_rgb_output() {
        let pipeline = Pipeline::from_model(Constant { channels: 1 });
        let params = DiffusionGenerationParams {
            height: 2,
            width: 2,
            ..Default::default()
        };
        assert!(pipeline.forward(vec!["a".into()], params).is_err());
    }

    #[test]
    fn png_encoding_is_lossless() -> Result<()> {
        let image = image::DynamicImage::ImageRgb8(image::RgbImage::from_fn(3, 2, |x, y| {
            image::Rgb([x as u8 * 40, y as u8 * 90, 7])
        }));
        let bytes = encode_png(&image)?;
        assert_eq!(&bytes[1..4], b"PNG");
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!(decoded.to_rgb8(), image.to_rgb8());
        Ok(())
    }

    #[test]
    fn defaults_match_generation_contract() {
        let params = DiffusionGenerationParams::default();
        assert_eq!((params.width, params.height), (512, 512));
        assert_eq!(params.num_steps, 30);
        assert_eq!(params.guidance_scale, 7.5);
        assert_eq!(params.negative_prompt, None);
    }
}
