//! Minimal client for the Gemini text-generation API
//!
//! Only single-turn, non-streaming `generateContent` calls are supported.

mod client;
mod error;

pub use client::{
    Candidate, Content, DEFAULT_BASE_URL, DEFAULT_MODEL, GeminiClient, GenerateContentRequest,
    GenerateContentResponse, Part,
};
pub use error::{GeminiError, Result};
