// promptcanvas - interactive prompt-to-image loop
// Short prompts are optionally rewritten by a Gemini text model, rendered with
// Stable Diffusion and saved as timestamped PNG files.

pub mod config;
pub mod enhance;
pub mod error;
pub mod persist;
pub mod session;
pub mod telemetry;

pub use config::{Args, Settings};
pub use enhance::{Enhancement, PromptEnhancer, PromptPair};
pub use error::{Error, Result};
pub use session::{Context, LoopState, Session, SessionStats};
