// promptcanvas - describe an image, get a PNG

use anyhow::Context as _;
use clap::Parser;
use imagent::StableDiffusionGenerator;
use promptcanvas::{Args, Context, Session, Settings, enhance, telemetry};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // HF_TOKEN and GEMINI_API_KEY may live in a .env file
    let dotenv = dotenvy::dotenv();

    let args = Args::parse();
    telemetry::init(args.verbose);

    match dotenv {
        Ok(path) => tracing::debug!("Loaded .env file from: {}", path.display()),
        Err(e) => tracing::debug!(".env file not loaded: {}", e),
    }

    if let Err(e) = run(Settings::from_args(args)).await {
        eprintln!("{}", fatal_message(&e));
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    println!("🖼️  promptcanvas");
    println!("================================\n");

    let enhancer = enhance::enhancer_from_env(settings.enhance, &settings.text_model);

    println!("📦 Loading {} (first run downloads the weights)...", settings.model_id);
    let generator = StableDiffusionGenerator::load(&settings.model_id, settings.use_cpu)
        .with_context(|| format!("loading diffusion model {}", settings.model_id))?;

    print_banner(&settings, &generator, enhancer.is_some());

    let ctx = Context::new(settings, generator, enhancer);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stats = Session::new(&ctx)
        .run(stdin)
        .await
        .context("reading from standard input")?;

    println!(
        "✓ Done: {} image(s) saved to {}",
        stats.saved,
        ctx.settings.output_dir.display()
    );
    Ok(())
}

fn print_banner(settings: &Settings, generator: &StableDiffusionGenerator, enhance: bool) {
    println!("✓ Model ready");
    println!("  Model:     {} ({:?})", generator.model_id(), generator.version());
    println!("  Device:    {}", if generator.is_cuda() { "cuda" } else { "cpu" });
    println!("  Steps:     {}", settings.steps);
    println!("  Guidance:  {}", settings.guidance_scale);
    println!("  Size:      {}x{}", settings.width, settings.height);
    if let Some(seed) = settings.seed {
        println!("  Seed:      {}", seed);
    }
    println!("  Output:    {}", settings.output_dir.display());
    println!(
        "  Enhancer:  {}",
        if enhance {
            settings.text_model.as_str()
        } else {
            "off (prompts used as typed)"
        }
    );
}

fn fatal_message(err: &anyhow::Error) -> String {
    format!("❌ Fatal: {:#}", err)
}
