// imagent - image synthesis from text prompts
// Wraps a Stable Diffusion pipeline built on Candle behind the `ImageGenerator` trait

mod stable_diffusion;

pub mod error;

pub use error::{ImageGenError, Result};
pub use stable_diffusion::{StableDiffusionGenerator, StableDiffusionVersion};

use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// One synthesis call: prompts plus the sampler knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Text describing what the image should contain
    pub prompt: String,

    /// Text describing what the image should avoid
    pub negative_prompt: String,

    /// Classifier-free guidance scale, passed to the sampler as-is
    pub guidance_scale: f64,

    /// Number of denoising steps
    pub num_steps: usize,

    /// Width of the generated image (must be multiple of 8)
    pub width: usize,

    /// Height of the generated image (must be multiple of 8)
    pub height: usize,

    /// Random seed for reproducibility (None for random)
    pub seed: Option<u64>,
}

impl SynthesisRequest {
    pub fn new(prompt: impl Into<String>, negative_prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: negative_prompt.into(),
            ..Self::default()
        }
    }
}

impl Default for SynthesisRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            guidance_scale: 8.0,
            num_steps: 50,
            width: 512,
            height: 512,
            seed: None,
        }
    }
}

/// Result of image generation
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    /// Image data as RGB bytes
    pub data: Vec<u8>,

    /// Image width
    pub width: u32,

    /// Image height
    pub height: u32,

    /// Prompt used to generate the image
    pub prompt: String,

    /// Seed used for generation
    pub seed: u64,
}

impl GeneratedImage {
    /// Encode the raster as PNG bytes
    pub fn encode_png(&self) -> Result<Vec<u8>> {
        use image::{ImageBuffer, ImageFormat, Rgb};

        let img: ImageBuffer<Rgb<u8>, &[u8]> =
            ImageBuffer::from_raw(self.width, self.height, self.data.as_slice()).ok_or_else(
                || {
                    ImageGenError::ImageProcessing(format!(
                        "buffer of {} bytes does not hold a {}x{} RGB image",
                        self.data.len(),
                        self.width,
                        self.height
                    ))
                },
            )?;

        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, ImageFormat::Png)?;
        Ok(bytes.into_inner())
    }
}

/// Trait for image generation backends
pub trait ImageGenerator {
    /// Generate one image for the given request
    fn generate(&self, request: &SynthesisRequest) -> Result<GeneratedImage>;
}

/// Width and height must both be multiples of 8 (latents are 1/8 scale)
pub fn validate_dimensions(width: usize, height: usize) -> Result<()> {
    if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
        return Err(ImageGenError::InvalidConfig(format!(
            "Width and height must be non-zero multiples of 8 (got {}x{})",
            width, height
        )));
    }
    Ok(())
}
