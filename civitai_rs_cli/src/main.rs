use cliclack::input;
use std::{path::PathBuf, time::Instant};

use civitai_rs_common::{fetch, get_token};
use civitai_rs_core::{
    CivitaiModel, GenerationRequest, GeneratorConfig, ImageGenerator, ModelDType, ModelSource,
    Offloading, TokenSource, DEFAULT_MODEL_DIR, DEFAULT_MODEL_VERSION,
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

/// Checkpoint fetched by the standalone `download` command.
const DOWNLOAD_URL_DEFAULT: &str = "https://civitai.com/api/download/models/1199750?type=Model&format=SafeTensor&size=pruned&fp=fp16";
const OUTPUT_DEFAULT: &str = "generated_pony.png";
const PROMPT_DEFAULT: &str = "score_9, score_8_up, a cute pony in a flower meadow, highly detailed";

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a CivitAI checkpoint.
    Download {
        /// CivitAI download URL.
        #[arg(long, default_value = DOWNLOAD_URL_DEFAULT)]
        url: String,

        /// Directory the checkpoint is written to.
        #[arg(long, default_value = DEFAULT_MODEL_DIR)]
        output_dir: PathBuf,

        /// Where to read the CivitAI token: `literal:<value>`, `env[:NAME]`, `path:<file>` or `none`.
        #[arg(long, default_value_t = TokenSource::default())]
        token: TokenSource,
    },

    /// Generate one image and write it to a file.
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(short, long, default_value = PROMPT_DEFAULT)]
        prompt: String,

        /// What the image should not contain.
        #[arg(long)]
        negative_prompt: Option<String>,

        /// Number of denoising steps. A higher number of steps often means higher quality.
        #[arg(short, long, default_value_t = 30)]
        num_steps: usize,

        /// Guidance scale. Values of 1 or less disable classifier-free guidance.
        #[arg(short, long, default_value_t = 7.5)]
        scale: f64,

        #[arg(long, default_value_t = 512)]
        width: usize,

        #[arg(long, default_value_t = 512)]
        height: usize,

        /// Seed for the initial noise. Random when not given.
        #[arg(long)]
        seed: Option<u64>,

        #[arg(short, long, default_value = OUTPUT_DEFAULT)]
        output: PathBuf,
    },

    /// Load the model once, then generate images for prompts entered interactively.
    Interactive {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(short, long, default_value_t = 30)]
        num_steps: usize,

        #[arg(short, long, default_value_t = 7.5)]
        scale: f64,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// CivitAI download URL of the checkpoint. Defaults to model version 439889.
    #[arg(long, conflicts_with = "local_file")]
    url: Option<String>,

    /// Use an existing checkpoint instead of downloading one.
    #[arg(long)]
    local_file: Option<PathBuf>,

    /// Directory holding downloaded checkpoints.
    #[arg(long, default_value = DEFAULT_MODEL_DIR)]
    model_dir: PathBuf,

    /// Where to read the CivitAI token: `literal:<value>`, `env[:NAME]`, `path:<file>` or `none`.
    #[arg(long, default_value_t = TokenSource::default())]
    token: TokenSource,

    #[arg(long, value_enum, default_value_t = ModelDType::Auto)]
    dtype: ModelDType,

    /// Keep the text encoder and VAE in CPU memory.
    #[arg(long, value_enum)]
    offloading: Option<Offloading>,

    /// CLIP `tokenizer.json`. Fetched from the Hugging Face hub when not given.
    #[arg(long)]
    tokenizer: Option<PathBuf>,
}

impl ModelArgs {
    fn into_config(self) -> anyhow::Result<GeneratorConfig> {
        let source = match (self.local_file, self.url) {
            (Some(path), _) => ModelSource::local(path),
            (None, Some(url)) => ModelSource::from_url(url)?,
            (None, None) => ModelSource::Civitai(CivitaiModel::from_version_id(DEFAULT_MODEL_VERSION)),
        };
        Ok(GeneratorConfig {
            source,
            model_dir: self.model_dir,
            token: self.token,
            tokenizer: self.tokenizer,
            dtype: self.dtype,
            offloading: self.offloading,
            silent: false,
        })
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Download {
            url,
            output_dir,
            token,
        } => download(url, output_dir, &token),
        Command::Generate {
            model,
            prompt,
            negative_prompt,
            num_steps,
            scale,
            width,
            height,
            seed,
            output,
        } => {
            let generator = ImageGenerator::initialize(&model.into_config()?)?;
            let mut request = GenerationRequest::new(prompt)
                .with_num_steps(num_steps)
                .with_guidance_scale(scale)
                .with_size(width, height);
            request.negative_prompt = negative_prompt;
            request.seed = seed;

            let start = Instant::now();
            let png = generator.generate(&request)?;
            let end = Instant::now();
            println!(
                "Image generation took: {:.2}s",
                end.duration_since(start).as_secs_f32()
            );

            std::fs::write(&output, png)?;
            info!("Image saved to {}", output.display());
            Ok(())
        }
        Command::Interactive {
            model,
            num_steps,
            scale,
        } => interactive(model.into_config()?, num_steps, scale),
    }
}

/// A missing token only skips the download here.
fn download(url: String, output_dir: PathBuf, token: &TokenSource) -> anyhow::Result<()> {
    let Some(token) = get_token(token) else {
        warn!("No CivitAI token found in `{token}`, skipping the download.");
        return Ok(());
    };
    match fetch(&url, &token, output_dir) {
        Some(path) => println!("Model saved to {}", path.display()),
        None => println!("Download failed."),
    }
    Ok(())
}

fn interactive(config: GeneratorConfig, num_steps: usize, scale: f64) -> anyhow::Result<()> {
    let generator = ImageGenerator::initialize(&config)?;

    let height: usize = input("Height:")
        .default_input("512")
        .validate(|input: &String| {
            let value = input.parse::<usize>().map_err(|e| e.to_string())?;
            if value == 0 || value % 8 != 0 {
                Err("A nonzero multiple of 8 is required!".to_string())
            } else {
                Ok(())
            }
        })
        .interact()?;
    let width: usize = input("Width:")
        .default_input("512")
        .validate(|input: &String| {
            let value = input.parse::<usize>().map_err(|e| e.to_string())?;
            if value == 0 || value % 8 != 0 {
                Err("A nonzero multiple of 8 is required!".to_string())
            } else {
                Ok(())
            }
        })
        .interact()?;

    loop {
        let prompt: String = input("Prompt:")
            .validate(|input: &String| {
                if input.is_empty() {
                    Err("Prompt is required!")
                } else {
                    Ok(())
                }
            })
            .interact()?;

        let start = Instant::now();

        let png = generator.generate(
            &GenerationRequest::new(prompt)
                .with_num_steps(num_steps)
                .with_guidance_scale(scale)
                .with_size(width, height),
        )?;

        let end = Instant::now();
        println!(
            "Image generation took: {:.2}s",
            end.duration_since(start).as_secs_f32()
        );

        let out_file: String = input("Save image to:")
            .default_input(OUTPUT_DEFAULT)
            .validate(|input: &String| {
                if input.is_empty() {
                    Err("Image path is required!")
                } else if PathBuf::from(input)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    != Some("png")
                {
                    Err(".png extension is required!")
                } else {
                    Ok(())
                }
            })
            .interact()?;

        std::fs::write(out_file, png)?;
    }
}
