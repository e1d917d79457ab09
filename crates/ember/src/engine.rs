//! High-level inference engine.

use anyhow::{ensure, Context, Result};
use ember_core::{
    backend::{default_backend, Backend},
    capability::Capability,
    kernels::SamplingParams,
    model::{LoadOptions, ModelConfig, Transformer},
    tensor::DType,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Configuration for the inference engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding `config.json` and `*.safetensors`.
    pub model_dir: PathBuf,
    /// Weight and cache element type; the backend's preference when `None`.
    pub dtype: Option<DType>,
    /// Backend to bind; the process default when `None`.
    pub capability: Option<Capability>,
    /// Threads per kernel call; the backend's default when `None`.
    pub threads: Option<usize>,
    /// Cap on context length.
    pub max_context: Option<usize>,
    /// Sampling used when a request carries none.
    pub sampling: SamplingParams,
    /// Generation budget used when a request carries none.
    pub max_tokens: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::new(),
            dtype: None,
            capability: None,
            threads: None,
            max_context: None,
            sampling: SamplingParams::default(),
            max_tokens: 256,
        }
    }
}

/// Builder for creating an Engine.
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set model directory.
    pub fn model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.model_dir = dir.into();
        self
    }

    /// Set weight and cache element type.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.config.dtype = Some(dtype);
        self
    }

    /// Prefer a backend capability.
    pub fn backend(mut self, capability: Capability) -> Self {
        self.config.capability = Some(capability);
        self
    }

    /// Set threads per kernel call.
    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = Some(threads);
        self
    }

    /// Cap the context length.
    pub fn max_context(mut self, tokens: usize) -> Self {
        self.config.max_context = Some(tokens);
        self
    }

    /// Set default sampling parameters.
    pub fn sampling(mut self, params: SamplingParams) -> Self {
        self.config.sampling = params;
        self
    }

    /// Set default generation budget.
    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    /// Load the model and bind a backend.
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        ensure!(
            !config.model_dir.as_os_str().is_empty(),
            "engine needs a model directory"
        );

        let mut backend = match config.capability {
            Some(capability) => Backend::create(capability),
            None => (*default_backend()).clone(),
        };
        if let Some(threads) = config.threads {
            backend = backend.with_threads(threads);
        }
        let options = LoadOptions {
            dtype: config.dtype.unwrap_or_else(|| backend.preferred_dtype()),
            max_context: config.max_context,
        };

        let start = Instant::now();
        let model = Transformer::from_dir(&config.model_dir, &options, Arc::new(backend))
            .with_context(|| format!("loading model from {}", config.model_dir.display()))?;
        info!(
            dir = %config.model_dir.display(),
            backend = model.backend().name(),
            threads = model.backend().threads(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "engine ready"
        );

        Ok(Engine {
            model_config: model.config().clone(),
            config,
            model: Mutex::new(model),
        })
    }
}

/// High-level inference engine.
///
/// One model instance serves one request at a time; concurrent callers
/// queue on the model lock.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    model_config: ModelConfig,
    model: Mutex<Transformer>,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Get engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get model configuration.
    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    /// Vocabulary size token ids must stay below.
    pub fn vocab_size(&self) -> usize {
        self.model_config.vocab_size
    }

    /// Run a request to completion.
    pub fn generate(&self, request: &GenerateRequest) -> Result<GenerateResult> {
        let mut tokens = Vec::new();
        let mut result = self.generate_stream(request, |token| {
            tokens.push(token);
            true
        })?;
        result.tokens = tokens;
        Ok(result)
    }

    /// Run a request, handing each token to `on_token` as it is sampled.
    /// Returning false from `on_token` stops generation. The returned
    /// result carries counts but no tokens.
    pub fn generate_stream<F>(&self, request: &GenerateRequest, mut on_token: F) -> Result<GenerateResult>
    where
        F: FnMut(u32) -> bool,
    {
        ensure!(!request.prompt.is_empty(), "prompt is empty");
        let params = request.params.unwrap_or(self.config.sampling);
        let max_tokens = request.max_tokens.unwrap_or(self.config.max_tokens);

        let start = Instant::now();
        let mut model = self.model.lock();
        let mut last = None;
        let produced = model
            .generate_stream(&request.prompt, &params, max_tokens, |token| {
                last = Some(token);
                on_token(token)
            })
            .context("generation failed")?;
        let stopped_on_eos = last.is_some_and(|t| model.is_eos(t));
        drop(model);

        Ok(GenerateResult {
            tokens: Vec::new(),
            num_prompt_tokens: request.prompt.len(),
            num_generated_tokens: produced,
            stopped_on_eos,
            elapsed: start.elapsed(),
        })
    }
}

/// A generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Prompt token ids.
    pub prompt: Vec<u32>,
    /// Generation budget; the engine default when absent.
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Sampling parameters; the engine default when absent.
    #[serde(default)]
    pub params: Option<SamplingParams>,
}

impl GenerateRequest {
    /// Request with engine defaults.
    pub fn new(prompt: Vec<u32>) -> Self {
        Self {
            prompt,
            max_tokens: None,
            params: None,
        }
    }

    /// Set maximum tokens to generate.
    pub fn max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = Some(n);
        self
    }

    /// Set sampling parameters.
    pub fn params(mut self, params: SamplingParams) -> Self {
        self.params = Some(params);
        self
    }

    /// Greedy decoding.
    pub fn greedy(self) -> Self {
        self.params(SamplingParams::greedy())
    }
}

/// Result of generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    /// Generated token ids, end-of-sequence included.
    pub tokens: Vec<u32>,
    /// Number of prompt tokens.
    pub num_prompt_tokens: usize,
    /// Number of generated tokens.
    pub num_generated_tokens: usize,
    /// Whether the last token ended the sequence.
    pub stopped_on_eos: bool,
    /// Wall time of the call, prompt pass included.
    pub elapsed: Duration,
}

impl GenerateResult {
    /// Generated tokens per second of wall time.
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.num_generated_tokens as f64 / secs
        } else {
            0.0
        }
    }
}
