//! Golden token validation against a reference implementation.
//!
//! Replays pre-computed token sequences (for example produced with
//! Hugging Face Transformers in fp32, greedy) and reports the first
//! divergence of each case.
//!
//! Run with:
//! ```bash
//! cargo run --release -p ember-core --example golden_validation -- \
//!     /path/to/model golden_cases.json [f32|f16|bf16]
//! ```

use ember_core::backend::default_backend;
use ember_core::model::{GoldenHarness, GoldenOutcome, LoadOptions, Transformer};
use ember_core::tensor::DType;
use std::path::Path;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: golden_validation <model_dir> <golden_cases.json> [f32|f16|bf16]");
        std::process::exit(1);
    }
    let model_dir = Path::new(&args[1]);
    let dtype = match args.get(3).map(String::as_str) {
        None | Some("f32") => DType::F32,
        Some("f16") => DType::F16,
        Some("bf16") => DType::BF16,
        Some(other) => anyhow::bail!("unsupported dtype {}", other),
    };

    println!("Golden Token Validation");
    println!("=======================\n");

    let harness = GoldenHarness::from_file(Path::new(&args[2]))?;
    println!("Loaded {} cases", harness.cases().len());
    for case in harness.cases() {
        println!(
            "  - {}: {} prompt tokens, {} expected",
            case.name,
            case.prompt.len(),
            case.expected.len()
        );
    }

    let backend = default_backend();
    println!("\nBackend: {} ({} threads), dtype {}", backend.name(), backend.threads(), dtype);
    let options = LoadOptions {
        dtype,
        max_context: None,
    };
    let load_start = Instant::now();
    let mut model = Transformer::from_dir(model_dir, &options, backend)?;
    println!("Loaded in {:.2}s\n", load_start.elapsed().as_secs_f64());

    let summary = harness.run(&mut model);
    println!("{}", summary);

    for result in summary.results.iter().filter(|r| !r.passed()) {
        if let GoldenOutcome::Diverged { index, .. } = result.outcome {
            let from = index.saturating_sub(3);
            let case = harness.cases().iter().find(|c| c.name == result.name);
            if let Some(case) = case {
                println!("{} around position {}:", result.name, index);
                println!("  expected {:?}", &case.expected[from..case.expected.len().min(index + 4)]);
                println!("  actual   {:?}", &result.actual[from.min(result.actual.len())..result.actual.len().min(index + 4)]);
            }
        }
    }

    if summary.all_passed() {
        println!("All golden cases passed");
        Ok(())
    } else {
        eprintln!("{} of {} cases failed", summary.failed(), summary.total());
        std::process::exit(1);
    }
}
