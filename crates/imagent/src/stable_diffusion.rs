// Stable Diffusion implementation using Candle

use crate::{
    validate_dimensions, GeneratedImage, ImageGenError, ImageGenerator, Result, SynthesisRequest,
};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use std::path::PathBuf;
use tokenizers::Tokenizer;

/// CLIP tokenizer shared by the v1.5 and v2.1 pipelines
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// Latent scaling factor of the SD 1.x/2.x VAE
const VAE_SCALE: f64 = 0.18215;

/// Supported Stable Diffusion architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    /// Stable Diffusion v1.5
    V1_5,
    /// Stable Diffusion v2.1
    V2_1,
}

impl StableDiffusionVersion {
    /// Guess the architecture from a Hugging Face repo id.
    /// SDXL and Turbo repos need dual text encoders and yield `None`.
    pub fn from_model_id(model_id: &str) -> Option<Self> {
        let id = model_id.to_lowercase();
        if id.contains("turbo") || id.contains("xl") {
            None
        } else if id.contains("stable-diffusion-2") {
            Some(Self::V2_1)
        } else {
            Some(Self::V1_5)
        }
    }

    fn sd_config(&self, width: usize, height: usize) -> StableDiffusionConfig {
        let (w, h) = (Some(width), Some(height));
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, h, w),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, h, w),
        }
    }
}

/// A Stable Diffusion pipeline with tokenizer, text encoder, VAE and UNet
/// resident in memory. Loading happens once in [`StableDiffusionGenerator::load`].
pub struct StableDiffusionGenerator {
    version: StableDiffusionVersion,
    model_id: String,
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl StableDiffusionGenerator {
    /// Download (or reuse from the hub cache) and load every pipeline component
    pub fn load(model_id: &str, use_cpu: bool) -> Result<Self> {
        let version = StableDiffusionVersion::from_model_id(model_id).ok_or_else(|| {
            ImageGenError::InvalidConfig(format!(
                "{} looks like an SDXL model; only SD v1.5 and v2.1 architectures are supported",
                model_id
            ))
        })?;

        let device = if use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)?
        };

        let dtype = if device.is_cuda() {
            DType::F16
        } else {
            DType::F32
        };

        tracing::info!(
            "Loading Stable Diffusion {:?} from {} on {}",
            version,
            model_id,
            if device.is_cuda() { "cuda" } else { "cpu" }
        );

        // Image size only affects the scheduler/latent shape, not the weights
        let sd_config = version.sd_config(512, 512);
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| ImageGenError::HfHub(format!("Failed to create API: {}", e)))?;

        tracing::debug!("Downloading tokenizer from: {}", TOKENIZER_REPO);
        let tokenizer_path = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .map_err(|e| ImageGenError::HfHub(format!("Failed to download tokenizer.json: {}", e)))?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| ImageGenError::Tokenization(e.to_string()))?;

        let pad_token = sd_config
            .clip
            .pad_with
            .as_deref()
            .unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| ImageGenError::Tokenization(format!("Pad token {} not found", pad_token)))?;

        let fetch = |filename: &str| -> Result<PathBuf> {
            api.model(model_id.to_string())
                .get(filename)
                .map_err(|e| ImageGenError::HfHub(format!("{}: {}", filename, e)))
        };

        tracing::info!("Loading CLIP text encoder");
        let clip_weights = weights_for(dtype, &fetch, "text_encoder/model")?;
        let text_model = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            clip_weights,
            &device,
            dtype,
        )
        .map_err(|e| ImageGenError::ModelLoading(format!("text encoder: {}", e)))?;

        tracing::info!("Loading VAE");
        let vae_weights = weights_for(dtype, &fetch, "vae/diffusion_pytorch_model")?;
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .map_err(|e| ImageGenError::ModelLoading(format!("vae: {}", e)))?;

        tracing::info!("Loading UNet");
        let unet_weights = weights_for(dtype, &fetch, "unet/diffusion_pytorch_model")?;
        let unet = sd_config
            .build_unet(
                unet_weights,
                &device,
                4,     // standard latent channels
                false, // no flash attention
                dtype,
            )
            .map_err(|e| ImageGenError::ModelLoading(format!("unet: {}", e)))?;

        tracing::info!("Pipeline ready");

        Ok(Self {
            version,
            model_id: model_id.to_string(),
            device,
            dtype,
            sd_config,
            tokenizer,
            pad_id,
            text_model,
            vae,
            unet,
        })
    }

    pub fn version(&self) -> StableDiffusionVersion {
        self.version
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_cuda(&self) -> bool {
        self.device.is_cuda()
    }

    fn text_embeddings(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.sd_config.clip.max_position_embeddings;

        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| ImageGenError::Tokenization(e.to_string()))?
            .get_ids()
            .to_vec();

        // CLIP has a fixed context window, longer prompts are cut
        if tokens.len() > max_len {
            tracing::warn!(
                "Prompt is {} tokens, truncating to {}",
                tokens.len(),
                max_len
            );
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, self.pad_id);

        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }
}

/// Prefer fp16 weights when running in half precision, fall back to fp32
fn weights_for(
    dtype: DType,
    fetch: &dyn Fn(&str) -> Result<PathBuf>,
    stem: &str,
) -> Result<PathBuf> {
    if dtype == DType::F16 {
        match fetch(&format!("{}.fp16.safetensors", stem)) {
            Ok(path) => return Ok(path),
            Err(_) => tracing::warn!("fp16 weights for {} not found, falling back to fp32", stem),
        }
    }
    fetch(&format!("{}.safetensors", stem))
}

/// Standard normal noise from a seeded `StdRng` (Box-Muller).
/// Candle's CPU backend cannot be seeded, so `Tensor::randn` is not reproducible there.
fn seeded_noise(
    seed: u64,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let (b, c, h, w) = shape;
    let len = b * c * h * w;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut values = Vec::with_capacity(len + 1);
    while values.len() < len {
        // 1 - [0, 1) keeps the radius argument away from ln(0)
        let u1: f64 = 1.0 - rng.gen::<f64>();
        let u2: f64 = rng.gen();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f64::consts::PI * u2;
        values.push((radius * angle.cos()) as f32);
        values.push((radius * angle.sin()) as f32);
    }
    values.truncate(len);

    Ok(Tensor::from_vec(values, shape, device)?)
}

impl ImageGenerator for StableDiffusionGenerator {
    fn generate(&self, request: &SynthesisRequest) -> Result<GeneratedImage> {
        tracing::info!("Generating image with Stable Diffusion {:?}", self.version);
        tracing::debug!("Prompt: {}", request.prompt);
        tracing::debug!("Negative prompt: {}", request.negative_prompt);

        validate_dimensions(request.width, request.height)?;

        let seed = request.seed.unwrap_or_else(rand::random);
        tracing::info!("Using seed: {}", seed);

        let guided = request.guidance_scale > 1.0;

        // 1. Encode prompts; the negative prompt takes the unconditional slot
        let text_embeddings = self.text_embeddings(&request.prompt)?;
        let text_embeddings = if guided {
            let uncond_embeddings = self.text_embeddings(&request.negative_prompt)?;
            Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?
        } else {
            text_embeddings
        };
        let text_embeddings = text_embeddings.to_dtype(self.dtype)?;

        // 2. Scheduler for this step count
        let sd_config = self.version.sd_config(request.width, request.height);
        let mut scheduler = sd_config.build_scheduler(request.num_steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        // 3. Initial noise, drawn on the host so the seed means the same on every device
        let latents = seeded_noise(
            seed,
            (1, 4, request.height / 8, request.width / 8),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        // 4. Diffusion loop
        tracing::info!("Running diffusion for {} steps", timesteps.len());
        for (step_idx, &timestep) in timesteps.iter().enumerate() {
            tracing::debug!("Step {}/{}", step_idx + 1, timesteps.len());

            let latent_model_input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };

            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;

            let noise_pred = if guided {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
                (uncond + ((text - uncond)? * request.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        // 5. Decode latents
        tracing::info!("Decoding latents to image");
        let image = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;

        // 6. Convert to RGB bytes
        let (_, _, height, width) = image.dims4()?;
        let data = image.i(0)?.permute((1, 2, 0))?.to_vec3::<u8>()?;
        let data: Vec<u8> = data.into_iter().flatten().flatten().collect();

        Ok(GeneratedImage {
            data,
            width: width as u32,
            height: height as u32,
            prompt: request.prompt.clone(),
            seed,
        })
    }
}
