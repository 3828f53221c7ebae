use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use lm_engine::gguf::Gguf;
use lm_engine::{Engine, GenerateRequest, Settings};

#[derive(Parser)]
#[command(name = "lmtool", about = "GGUF model inspection and generation")]
struct Cli {
    /// Write engine trace logs to this directory (requires the `trace`
    /// feature; stderr when omitted)
    #[arg(long, global = true)]
    trace_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print model metadata, hyperparameters and the tensor directory
    Info {
        /// Path to the GGUF model file
        model_file: PathBuf,
        /// List every tensor with shape and dtype
        #[arg(long)]
        tensors: bool,
    },

    /// Generate text from a prompt
    Generate {
        /// Path to the GGUF model file
        model_file: PathBuf,
        /// Prompt text
        prompt: String,
        /// Anchor/system text encoded ahead of the prompt
        #[arg(long)]
        anchor: Option<String>,
        /// Maximum number of generated tokens
        #[arg(short = 'n', long, default_value = "128")]
        max_tokens: usize,
        /// Sampling temperature
        #[arg(short, long, default_value = "0.8")]
        temperature: f32,
        /// Nucleus cutoff; 1.0 switches to top-k sampling
        #[arg(long, default_value = "0.95")]
        top_p: f32,
        /// Fixed RNG seed for reproducible output
        #[arg(long)]
        seed: Option<u64>,
        /// Settings TOML file overriding the built-in defaults
        #[arg(long)]
        settings: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    lm_engine::trace_init::init_tracing(cli.trace_dir.as_deref());
    match cli.command {
        Command::Info {
            model_file,
            tensors,
        } => info(&model_file, tensors),
        Command::Generate {
            model_file,
            prompt,
            anchor,
            max_tokens,
            temperature,
            top_p,
            seed,
            settings,
        } => generate(
            &model_file,
            &prompt,
            anchor.as_deref(),
            max_tokens,
            temperature,
            top_p,
            seed,
            settings.as_deref(),
        ),
    }
}

fn info(model_file: &Path, tensors: bool) -> anyhow::Result<()> {
    let gguf = Gguf::open(model_file)
        .with_context(|| format!("failed to open {}", model_file.display()))?;

    println!("version:   {}", gguf.version);
    println!("tensors:   {}", gguf.tensors().len());
    println!("metadata:  {}", gguf.metadata().len());

    let mut keys: Vec<&String> = gguf.metadata().keys().collect();
    keys.sort();
    for key in keys {
        match gguf.meta(key) {
            Some(value) if !matches!(value, lm_engine::gguf::MetaValue::Array(_)) => {
                println!("  {key} = {value:?}");
            }
            Some(lm_engine::gguf::MetaValue::Array(items)) => {
                println!("  {key} = [{} items]", items.len());
            }
            _ => {}
        }
    }

    if tensors {
        for t in gguf.tensors() {
            println!("  {:40} {:?} {:?}", t.name, t.dims, t.dtype);
        }
    }

    // A full engine load also validates shapes and the tokenizer.
    let engine = Engine::from_gguf(gguf, Settings::default())?;
    println!("{}", engine.config_summary());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn generate(
    model_file: &Path,
    prompt: &str,
    anchor: Option<&str>,
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
    seed: Option<u64>,
    settings_file: Option<&Path>,
) -> anyhow::Result<()> {
    let settings = match settings_file {
        Some(path) => {
            let toml = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Settings::from_toml(&toml)?
        }
        None => Settings::default(),
    };

    let mut engine = Engine::load_with(model_file, settings)
        .with_context(|| format!("failed to load {}", model_file.display()))?;
    eprintln!("{}", engine.config_summary());

    let req = GenerateRequest {
        prompt,
        anchor,
        max_tokens,
        temperature,
        top_p,
        seed,
        ..GenerateRequest::default()
    };

    let mut stdout = std::io::stdout().lock();
    let (tokens, stop) = engine.generate_with(&req, |_, piece| {
        let _ = stdout.write_all(piece);
        let _ = stdout.flush();
    });
    let _ = stdout.write_all(b"\n");
    eprintln!("[{tokens} tokens, stop: {stop:?}]");
    Ok(())
}
