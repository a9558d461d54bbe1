// Session - the interactive read / enhance / synthesize / save loop

use crate::config::Settings;
use crate::enhance::{Enhancement, PromptEnhancer, PromptPair};
use crate::error::Result;
use crate::persist;
use imagent::{ImageGenerator, SynthesisRequest};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;

/// Read one line, replacing invalid UTF-8 instead of failing.
/// Returns `None` at end of input.
async fn read_line_lossy<R>(input: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if input.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

/// Words that end the session, matched case-insensitively
pub const SENTINELS: &[&str] = &["quit", "exit"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingInput,
    Processing,
    Terminated,
}

/// What a single input line asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Skip,
    Quit,
    Prompt(&'a str),
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a str) -> Self {
        let text = line.trim();
        if text.is_empty() {
            Command::Skip
        } else if SENTINELS.iter().any(|s| text.eq_ignore_ascii_case(s)) {
            Command::Quit
        } else {
            Command::Prompt(text)
        }
    }
}

/// Result of handling one line
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ignored,
    Saved(PathBuf),
    Failed(String),
    Terminated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub processed: usize,
    pub saved: usize,
    pub failed: usize,
    pub degraded: usize,
}

/// Handles created once at startup and shared by every iteration
pub struct Context<G> {
    pub settings: Settings,
    pub generator: G,
    pub enhancer: Option<Box<dyn PromptEnhancer>>,
}

impl<G: ImageGenerator> Context<G> {
    pub fn new(
        settings: Settings,
        generator: G,
        enhancer: Option<Box<dyn PromptEnhancer>>,
    ) -> Self {
        Self {
            settings,
            generator,
            enhancer,
        }
    }

    /// Build the synthesis call for a prompt pair using the startup knobs
    pub fn synthesis_request(&self, pair: &PromptPair) -> SynthesisRequest {
        SynthesisRequest {
            prompt: pair.positive_text.clone(),
            negative_prompt: pair.negative_text.clone(),
            guidance_scale: self.settings.guidance_scale,
            num_steps: self.settings.steps,
            width: self.settings.width,
            height: self.settings.height,
            seed: self.settings.seed,
        }
    }
}

/// Loop controller. Owns only its state machine and counters; everything else is borrowed.
pub struct Session<'a, G> {
    ctx: &'a Context<G>,
    state: LoopState,
    stats: SessionStats,
}

impl<'a, G: ImageGenerator> Session<'a, G> {
    pub fn new(ctx: &'a Context<G>) -> Self {
        Self {
            ctx,
            state: LoopState::AwaitingInput,
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Read lines until a sentinel or end of input
    pub async fn run<R>(&mut self, mut input: R) -> Result<SessionStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::new();

        while self.state != LoopState::Terminated {
            print!("\n🖌  Describe an image (quit/exit to stop): ");
            std::io::stdout().flush()?;

            match read_line_lossy(&mut input, &mut buf).await? {
                Some(line) => {
                    self.handle_line(&line).await;
                }
                None => {
                    println!();
                    tracing::debug!("End of input");
                    self.state = LoopState::Terminated;
                }
            }
        }

        tracing::info!(
            "Session finished: {} prompt(s), {} saved, {} failed, {} enhancement fallback(s)",
            self.stats.processed,
            self.stats.saved,
            self.stats.failed,
            self.stats.degraded
        );
        Ok(self.stats)
    }

    /// Advance the state machine by one input line
    pub async fn handle_line(&mut self, line: &str) -> Outcome {
        if self.state == LoopState::Terminated {
            return Outcome::Terminated;
        }

        match Command::parse(line) {
            Command::Skip => Outcome::Ignored,
            Command::Quit => {
                println!("👋 Bye");
                self.state = LoopState::Terminated;
                Outcome::Terminated
            }
            Command::Prompt(text) => {
                self.state = LoopState::Processing;
                let outcome = self.process(text).await;
                self.stats.processed += 1;
                self.state = LoopState::AwaitingInput;
                outcome
            }
        }
    }

    async fn process(&mut self, text: &str) -> Outcome {
        let pair = match &self.ctx.enhancer {
            Some(enhancer) => {
                println!("✨ Enhancing prompt...");
                let enhancement = enhancer.enhance(text).await;
                if let Enhancement::Degraded(_, reason) = &enhancement {
                    eprintln!("⚠️  Prompt enhancement failed ({}), using fallback prompt", reason);
                    self.stats.degraded += 1;
                }
                enhancement.into_pair()
            }
            None => PromptPair::passthrough(text),
        };

        println!("📝 Prompt: {}", pair.positive_text);
        tracing::debug!("Negative prompt: {}", pair.negative_text);

        let request = self.ctx.synthesis_request(&pair);
        println!("🎨 Generating image ({} steps)...", request.num_steps);

        let image = match self.ctx.generator.generate(&request) {
            Ok(image) => image,
            Err(e) => {
                tracing::error!("Image generation failed: {}", e);
                self.stats.failed += 1;
                return Outcome::Failed(e.to_string());
            }
        };

        match persist::save_image(&image, text, &self.ctx.settings.output_dir) {
            Ok(path) => {
                println!("💾 Saved: {} (seed {})", path.display(), image.seed);
                self.stats.saved += 1;
                Outcome::Saved(path)
            }
            Err(e) => {
                tracing::error!("Saving image failed: {}", e);
                self.stats.failed += 1;
                Outcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enhance::{FALLBACK_NEGATIVE_PROMPT, ModelEnhancer, TextBackend};
    use crate::error::Error;
    use async_trait::async_trait;
    use imagent::{GeneratedImage, ImageGenError};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every request; fails when `fail` is set
    #[derive(Default)]
    struct RecordingGenerator {
        requests: Mutex<Vec<SynthesisRequest>>,
        fail: bool,
    }

    impl ImageGenerator for RecordingGenerator {
        fn generate(&self, request: &SynthesisRequest) -> imagent::Result<GeneratedImage> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(ImageGenError::ModelLoading("out of memory".into()));
            }
            Ok(GeneratedImage {
                data: vec![42; 8 * 8 * 3],
                width: 8,
                height: 8,
                prompt: request.prompt.clone(),
                seed: 3,
            })
        }
    }

    /// Enhancer that counts calls and upper-cases the input
    #[derive(Default)]
    struct ShoutingEnhancer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PromptEnhancer for ShoutingEnhancer {
        async fn enhance(&self, raw: &str) -> Enhancement {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Enhancement::Enhanced(PromptPair {
                positive_text: raw.to_uppercase(),
                negative_text: "dull".into(),
            })
        }
    }

    /// Text backend that is never reachable
    struct OfflineBackend;

    #[async_trait]
    impl TextBackend for OfflineBackend {
        async fn complete(&self, _prompt: &str) -> crate::Result<String> {
            Err(Error::Enhancement("connection refused".into()))
        }
    }

    fn context(dir: &std::path::Path, generator: RecordingGenerator) -> Context<RecordingGenerator> {
        let settings = Settings {
            output_dir: dir.to_path_buf(),
            guidance_scale: 7.0,
            steps: 12,
            width: 8,
            height: 8,
            ..Settings::default()
        };
        Context::new(settings, generator, None)
    }

    fn png_files(dir: &std::path::Path) -> Vec<String> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse(""), Command::Skip);
        assert_eq!(Command::parse(" \t "), Command::Skip);
        assert_eq!(Command::parse("quit"), Command::Quit);
        assert_eq!(Command::parse("  EXIT "), Command::Quit);
        assert_eq!(Command::parse("Quit"), Command::Quit);
        assert_eq!(Command::parse("quit now"), Command::Prompt("quit now"));
        assert_eq!(Command::parse(" a cat "), Command::Prompt("a cat"));
    }

    #[tokio::test]
    async fn test_sleeping_cat_without_backend() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), RecordingGenerator::default());
        let mut session = Session::new(&ctx);

        let outcome = session.handle_line("a sleeping cat").await;

        let requests = ctx.generator.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt, "a sleeping cat");
        assert_eq!(requests[0].negative_prompt, FALLBACK_NEGATIVE_PROMPT);
        assert_eq!(requests[0].guidance_scale, 7.0);
        assert_eq!(requests[0].num_steps, 12);

        let Outcome::Saved(path) = outcome else {
            panic!("expected a saved image, got {:?}", outcome);
        };
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_a sleeping cat.png"), "{}", name);
        let stamp = &name[..15];
        assert_eq!(stamp.as_bytes()[8], b'_');
        assert!(stamp[..8].chars().all(|c| c.is_ascii_digit()));
        assert!(stamp[9..].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(png_files(dir.path()), vec![name]);
        assert_eq!(session.state(), LoopState::AwaitingInput);
    }

    #[tokio::test]
    async fn test_generation_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let generator = RecordingGenerator {
            fail: true,
            ..Default::default()
        };
        let ctx = context(dir.path(), generator);
        let mut session = Session::new(&ctx);

        let outcome = session.handle_line("a sleeping cat").await;

        assert!(matches!(outcome, Outcome::Failed(ref msg) if msg.contains("out of memory")));
        assert!(png_files(dir.path()).is_empty());
        assert_eq!(session.state(), LoopState::AwaitingInput);
        assert_eq!(session.stats().failed, 1);

        // the loop keeps going
        assert!(matches!(session.handle_line("another").await, Outcome::Failed(_)));
        assert_eq!(ctx.generator.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_blank_lines_touch_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), RecordingGenerator::default());
        ctx.enhancer = Some(Box::new(ShoutingEnhancer::default()));
        let mut session = Session::new(&ctx);

        for line in ["", "   ", "\t"] {
            assert_eq!(session.handle_line(line).await, Outcome::Ignored);
            assert_eq!(session.state(), LoopState::AwaitingInput);
        }
        assert!(ctx.generator.requests.lock().unwrap().is_empty());
        assert_eq!(session.stats(), SessionStats::default());
    }

    #[tokio::test]
    async fn test_sentinel_stops_processing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), RecordingGenerator::default());
        let mut session = Session::new(&ctx);

        assert_eq!(session.handle_line("ExIt").await, Outcome::Terminated);
        assert_eq!(session.state(), LoopState::Terminated);
        assert_eq!(session.handle_line("a cat").await, Outcome::Terminated);
        assert!(ctx.generator.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enhancer_used_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), RecordingGenerator::default());
        ctx.enhancer = Some(Box::new(ShoutingEnhancer::default()));
        let mut session = Session::new(&ctx);

        session.handle_line("a red fox").await;

        let requests = ctx.generator.requests.lock().unwrap();
        assert_eq!(requests[0].prompt, "A RED FOX");
        assert_eq!(requests[0].negative_prompt, "dull");
        // filename follows what the user typed
        let files = png_files(dir.path());
        assert!(files[0].ends_with("_a red fox.png"));
    }

    #[tokio::test]
    async fn test_failed_enhancement_still_saves_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), RecordingGenerator::default());
        ctx.enhancer = Some(Box::new(ModelEnhancer::new(OfflineBackend)));
        let mut session = Session::new(&ctx);

        let outcome = session.handle_line("a sleeping cat").await;

        let fallback = PromptPair::fallback("a sleeping cat");
        let requests = ctx.generator.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt, fallback.positive_text);
        assert_eq!(requests[0].negative_prompt, fallback.negative_text);

        assert!(matches!(outcome, Outcome::Saved(_)), "{:?}", outcome);
        let files = png_files(dir.path());
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("_a sleeping cat.png"));

        let stats = session.stats();
        assert_eq!(stats.degraded, 1);
        assert_eq!(stats.saved, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_run_survives_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), RecordingGenerator::default());
        let mut session = Session::new(&ctx);

        let input: &[u8] = b"caf\xe9 scene\r\nsecond\nquit\n";
        let stats = session.run(input).await.unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(session.state(), LoopState::Terminated);
        let prompts: Vec<String> = ctx
            .generator
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect();
        assert_eq!(prompts, vec!["caf\u{fffd} scene", "second"]);
    }

    #[tokio::test]
    async fn test_run_processes_each_line_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), RecordingGenerator::default());
        let mut session = Session::new(&ctx);

        let input: &[u8] = b"first\n\n  \nsecond\nQUIT\nnever reached\n";
        let stats = session.run(input).await.unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.saved, 2);
        assert_eq!(session.state(), LoopState::Terminated);
        let prompts: Vec<String> = ctx
            .generator
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect();
        assert_eq!(prompts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_run_stops_at_end_of_input() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), RecordingGenerator::default());
        let mut session = Session::new(&ctx);

        let input: &[u8] = b"only one";
        let stats = session.run(input).await.unwrap();

        assert_eq!(stats.processed, 1);
        assert_eq!(session.state(), LoopState::Terminated);
    }
}
