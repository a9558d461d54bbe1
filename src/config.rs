// Configuration - command-line flags and environment, resolved once at startup

use clap::Parser;
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL_ID: &str = "runwayml/stable-diffusion-v1-5";
pub const DEFAULT_OUTPUT_DIR: &str = "img";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "promptcanvas",
    author,
    version,
    about = "Type a short prompt, get a Stable Diffusion image saved to disk",
    long_about = None
)]
pub struct Args {
    /// Output folder; relative paths resolve against the executable's directory
    #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Hugging Face repo of the diffusion model
    #[arg(long = "model_id", default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    /// Classifier-free guidance scale
    #[arg(long = "guidance_scale", default_value_t = 8.0)]
    pub guidance_scale: f64,

    /// Number of inference steps
    #[arg(long = "steps", visible_alias = "num_inference_steps", default_value_t = 50)]
    pub steps: usize,

    /// Image width (multiple of 8)
    #[arg(long, default_value_t = 512)]
    pub width: usize,

    /// Image height (multiple of 8)
    #[arg(long, default_value_t = 512)]
    pub height: usize,

    /// Fixed seed for reproducible images
    #[arg(long)]
    pub seed: Option<u64>,

    /// Force CPU even if a GPU is available
    #[arg(long)]
    pub cpu: bool,

    /// Gemini model used to rewrite prompts
    #[arg(long = "text_model", env = "GEMINI_MODEL", default_value = gemini::DEFAULT_MODEL)]
    pub text_model: String,

    /// Never call the text backend, even when an API key is set
    #[arg(long = "no_enhance")]
    pub no_enhance: bool,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Immutable startup configuration shared by the whole session
#[derive(Debug, Clone)]
pub struct Settings {
    pub output_dir: PathBuf,
    pub model_id: String,
    pub guidance_scale: f64,
    pub steps: usize,
    pub width: usize,
    pub height: usize,
    pub seed: Option<u64>,
    pub use_cpu: bool,
    pub text_model: String,
    pub enhance: bool,
    pub verbose: bool,
}

impl Settings {
    pub fn from_args(args: Args) -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        if exe_dir.is_none() {
            tracing::warn!("Could not locate the executable, output resolves against the working directory");
        }

        Self {
            output_dir: resolve_output_dir(&args.output, exe_dir.as_deref()),
            model_id: args.model_id,
            guidance_scale: args.guidance_scale,
            steps: args.steps,
            width: args.width,
            height: args.height,
            seed: args.seed,
            use_cpu: args.cpu,
            text_model: args.text_model,
            enhance: !args.no_enhance,
            verbose: args.verbose,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            model_id: DEFAULT_MODEL_ID.to_string(),
            guidance_scale: 8.0,
            steps: 50,
            width: 512,
            height: 512,
            seed: None,
            use_cpu: false,
            text_model: gemini::DEFAULT_MODEL.to_string(),
            enhance: true,
            verbose: false,
        }
    }
}

/// Absolute paths are kept; relative ones are joined onto `base` when known
pub fn resolve_output_dir(output: &Path, base: Option<&Path>) -> PathBuf {
    match base {
        Some(base) if output.is_relative() => base.join(output),
        _ => output.to_path_buf(),
    }
}
