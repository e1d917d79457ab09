//! Token generation example.
//!
//! Loads a checkpoint directory and generates from a prompt given as
//! token ids. Tokenize the prompt with the model's own tokenizer first.
//!
//! Run with:
//! ```bash
//! RUST_LOG=info cargo run --release -p ember --example generate -- \
//!     /path/to/model 1 15043 29892 --max-tokens 32 --temperature 0.7
//! ```

use anyhow::{bail, Context, Result};
use ember::prelude::*;
use std::io::{self, Write};
use tracing_subscriber::EnvFilter;

struct Args {
    model_dir: String,
    prompt: Vec<u32>,
    max_tokens: usize,
    params: SamplingParams,
    threads: Option<usize>,
    dtype: Option<DType>,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let Some(model_dir) = args.next() else {
        bail!("usage: generate <model_dir> <token ids...> [--max-tokens N] [--temperature T] [--top-k K] [--top-p P] [--seed S] [--threads N] [--dtype f32|f16|bf16]");
    };
    let mut parsed = Args {
        model_dir,
        prompt: Vec::new(),
        max_tokens: 64,
        params: SamplingParams::greedy(),
        threads: None,
        dtype: None,
    };
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().with_context(|| format!("{} needs a value", flag));
        match arg.as_str() {
            "--max-tokens" => parsed.max_tokens = value(&arg)?.parse()?,
            "--temperature" => parsed.params.temperature = value(&arg)?.parse()?,
            "--top-k" => parsed.params.top_k = value(&arg)?.parse()?,
            "--top-p" => parsed.params.top_p = value(&arg)?.parse()?,
            "--seed" => parsed.params.seed = value(&arg)?.parse()?,
            "--threads" => parsed.threads = Some(value(&arg)?.parse()?),
            "--dtype" => {
                parsed.dtype = Some(match value(&arg)?.as_str() {
                    "f32" => DType::F32,
                    "f16" => DType::F16,
                    "bf16" => DType::BF16,
                    other => bail!("unsupported dtype {}", other),
                })
            }
            token => parsed
                .prompt
                .push(token.parse().with_context(|| format!("bad token id {:?}", token))?),
        }
    }
    if parsed.prompt.is_empty() {
        bail!("no prompt tokens given");
    }
    Ok(parsed)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = parse_args()?;

    let mut builder = Engine::builder()
        .model_dir(&args.model_dir)
        .max_tokens(args.max_tokens)
        .sampling(args.params);
    if let Some(threads) = args.threads {
        builder = builder.threads(threads);
    }
    if let Some(dtype) = args.dtype {
        builder = builder.dtype(dtype);
    }
    let engine = builder.build()?;

    println!(
        "Model: {} layers, hidden {}, vocab {}",
        engine.model_config().num_hidden_layers,
        engine.model_config().hidden_size,
        engine.vocab_size()
    );
    println!("Prompt: {:?}\n", args.prompt);

    let stdout = io::stdout();
    let request = GenerateRequest::new(args.prompt);
    let result = engine.generate_stream(&request, |token| {
        let mut out = stdout.lock();
        // a closed stdout ends generation
        write!(out, "{} ", token).and_then(|_| out.flush()).is_ok()
    })?;

    println!(
        "\n\n{} tokens in {:.2}s ({:.1} tok/s){}",
        result.num_generated_tokens,
        result.elapsed.as_secs_f64(),
        result.tokens_per_second(),
        if result.stopped_on_eos { ", stopped on eos" } else { "" }
    );
    Ok(())
}
