//! Transformer model implementation.
//!
//! Owns the weights, the rotary tables and one KV cache per layer. A
//! forward call extends the caches by the chunk it is given; generation
//! resets them, runs the prompt, then feeds one sampled token at a time.

use super::config::ModelConfig;
use super::kv_cache::KvCache;
use super::layer::TransformerLayer;
use super::linear::Linear;
use super::loader::WeightLoader;
use super::norm::Norm;
use super::rope::RotaryEmbedding;
use crate::backend::Backend;
use crate::error::{try_alloc, EmberError, Result};
use crate::kernels::{SamplingParams, Transpose};
use crate::tensor::{DType, Tensor, TensorMeta, TensorView, TensorViewMut};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options for building a [`Transformer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Element type of weights and KV caches.
    pub dtype: DType,
    /// Cap on cached positions; `max_position_embeddings` when `None`.
    pub max_context: Option<usize>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            dtype: DType::F32,
            max_context: None,
        }
    }
}

/// Output projection to vocabulary logits.
#[derive(Debug, Clone)]
enum LmHead {
    /// Reuse the embedding table `[vocab, hidden]`.
    Tied,
    /// Separate `lm_head.weight`.
    Separate(Linear),
}

/// A transformer model for inference.
#[derive(Debug)]
pub struct Transformer {
    config: ModelConfig,
    backend: Arc<Backend>,
    embed_tokens: Tensor,
    layers: Vec<TransformerLayer>,
    norm: Norm,
    lm_head: LmHead,
    rotary: RotaryEmbedding,
    cache: KvCache,
    last_logits: Vec<f32>,
}

impl Transformer {
    /// Load `config.json` and every safetensors file in `dir`.
    pub fn from_dir(dir: &Path, options: &LoadOptions, backend: Arc<Backend>) -> Result<Self> {
        let config = ModelConfig::from_file(&dir.join("config.json"))?;
        let loader = WeightLoader::from_dir(dir, options.dtype)?;
        Self::from_loader(config, loader, options, backend)
    }

    /// Build from a parsed config and loaded weights.
    pub fn from_loader(
        config: ModelConfig,
        mut loader: WeightLoader,
        options: &LoadOptions,
        backend: Arc<Backend>,
    ) -> Result<Self> {
        config.validate()?;
        if !options.dtype.is_executable() {
            return Err(EmberError::UnsupportedDType(options.dtype));
        }

        let embed_tokens = loader.take("model.embed_tokens.weight")?;
        if embed_tokens.dims() != [config.vocab_size, config.hidden_size] {
            return Err(EmberError::ModelError(format!(
                "embedding table {:?}, expected [{}, {}]",
                embed_tokens.dims(),
                config.vocab_size,
                config.hidden_size
            )));
        }

        let layers = (0..config.num_hidden_layers)
            .map(|i| TransformerLayer::load(&mut loader, &config, i))
            .collect::<Result<Vec<_>>>()?;
        let (kind, eps) = config.norm();
        let norm = Norm::load(&mut loader, "model.norm", kind, eps)?;
        if norm.dim() != config.hidden_size {
            return Err(EmberError::ModelError(format!(
                "final norm of width {} for hidden size {}",
                norm.dim(),
                config.hidden_size
            )));
        }

        let lm_head = if loader.contains("lm_head.weight") {
            let head = Linear::load(&mut loader, "lm_head", false)?;
            if head.in_features() != config.hidden_size || head.out_features() != config.vocab_size {
                return Err(EmberError::ModelError(format!(
                    "lm_head {}→{}, expected {}→{}",
                    head.in_features(),
                    head.out_features(),
                    config.hidden_size,
                    config.vocab_size
                )));
            }
            LmHead::Separate(head)
        } else if config.tie_word_embeddings {
            LmHead::Tied
        } else {
            return Err(EmberError::ModelError(
                "lm_head.weight missing and word embeddings are not tied".into(),
            ));
        };

        if !loader.is_empty() {
            debug!(unused = loader.len(), "weights left unused after load");
        }

        let capacity = options
            .max_context
            .map_or(config.max_position_embeddings, |cap| cap.min(config.max_position_embeddings));
        let head_dim = config.head_dim();
        let rotary = RotaryEmbedding::new(head_dim, capacity, config.rope_theta)?;
        let cache = KvCache::new(
            config.num_hidden_layers,
            options.dtype,
            capacity,
            config.num_kv_heads(),
            head_dim,
        )?;

        info!(
            model_type = %config.model_type,
            layers = config.num_hidden_layers,
            hidden = config.hidden_size,
            vocab = config.vocab_size,
            dtype = %options.dtype,
            capacity,
            tied = matches!(lm_head, LmHead::Tied),
            backend = backend.name(),
            "model loaded"
        );

        Ok(Self {
            config,
            backend,
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            cache,
            last_logits: Vec::new(),
        })
    }

    /// Get model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Backend the model runs on.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Positions already in the caches.
    pub fn position(&self) -> usize {
        self.cache.len()
    }

    /// Positions the caches can hold.
    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Logits of the last position of the most recent forward call.
    pub fn last_logits(&self) -> &[f32] {
        &self.last_logits
    }

    /// Rewind every layer's cache to empty.
    pub fn reset_cache(&mut self) {
        self.cache.reset();
        self.last_logits.clear();
    }

    /// Whether `token` ends a sequence.
    pub fn is_eos(&self, token: u32) -> bool {
        self.config.eos_token_ids().contains(&token)
    }

    /// Run `tokens` after the cached positions and return logits
    /// `[tokens.len(), vocab]`.
    pub fn forward(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
        let start = self.position();
        let hidden = self.forward_hidden(tokens)?;
        let vocab = self.config.vocab_size;
        let logits = match self.project(&hidden, tokens.len()) {
            Ok(logits) => logits,
            Err(e) => {
                self.cache.truncate(start);
                return Err(e);
            }
        };
        self.last_logits.clear();
        self.last_logits
            .extend_from_slice(&logits[(tokens.len() - 1) * vocab..]);
        Ok(logits)
    }

    /// Run `tokens` after the cached positions and return the final-norm
    /// hidden states `[tokens.len(), hidden]`.
    ///
    /// On error the caches are rewound to where they were.
    pub fn forward_hidden(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
        let start = self.position();
        if tokens.is_empty() {
            return Err(EmberError::InvalidShape("forward over zero tokens".into()));
        }
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= self.config.vocab_size) {
            return Err(EmberError::ModelError(format!(
                "token {} outside vocabulary of {}",
                bad, self.config.vocab_size
            )));
        }
        let needed = start + tokens.len();
        if needed > self.capacity() {
            return Err(EmberError::CapacityExceeded {
                needed,
                capacity: self.capacity(),
            });
        }

        let result = self.run_layers(tokens, start);
        if result.is_err() {
            self.cache.truncate(start);
        }
        result
    }

    fn run_layers(&mut self, tokens: &[u32], start: usize) -> Result<Vec<f32>> {
        let hidden_size = self.config.hidden_size;
        let positions: Vec<usize> = (start..start + tokens.len()).collect();
        let mut hidden = try_alloc(tokens.len() * hidden_size, 0.0f32, "hidden states")?;
        self.backend
            .embedding(&self.embed_tokens.view(), tokens, &mut hidden);

        for (layer, cache) in self.layers.iter().zip(self.cache.iter_mut()) {
            layer.forward(&self.backend, &mut hidden, &positions, &self.rotary, cache)?;
        }
        self.norm.forward_in_place(&self.backend, &mut hidden)?;
        Ok(hidden)
    }

    fn project(&self, hidden: &[f32], tokens: usize) -> Result<Vec<f32>> {
        let vocab = self.config.vocab_size;
        let mut logits = try_alloc(tokens * vocab, 0.0f32, "logits")?;
        match &self.lm_head {
            LmHead::Separate(head) => head.forward(&self.backend, hidden, &mut logits)?,
            LmHead::Tied => {
                let a = TensorView::wrap_f32(&[tokens, self.config.hidden_size], hidden)?;
                let mut c = TensorViewMut::wrap_f32_mut(&[tokens, vocab], &mut logits)?;
                self.backend.gemm(
                    &a,
                    &self.embed_tokens.view(),
                    &mut c,
                    Transpose::No,
                    Transpose::Yes,
                );
            }
        }
        Ok(logits)
    }

    /// Generate into `out` and return the number of tokens written.
    pub fn generate(&mut self, prompt: &[u32], params: &SamplingParams, out: &mut [u32]) -> Result<usize> {
        let mut written = 0;
        self.generate_stream(prompt, params, out.len(), |token| {
            out[written] = token;
            written += 1;
            true
        })
    }

    /// Generate up to `max_tokens`, handing each token to `on_token` as it
    /// is sampled. Stops after an end-of-sequence token (which is emitted),
    /// when `on_token` returns false, or when the caches are full.
    ///
    /// A failed prompt pass is an error. A failed decode step stops the
    /// loop and the tokens already emitted are counted.
    pub fn generate_stream<F>(
        &mut self,
        prompt: &[u32],
        params: &SamplingParams,
        max_tokens: usize,
        mut on_token: F,
    ) -> Result<usize>
    where
        F: FnMut(u32) -> bool,
    {
        self.reset_cache();
        if max_tokens == 0 {
            return Ok(0);
        }
        self.forward(prompt)?;

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut produced = 0;
        loop {
            let token = self.backend.sample(&self.last_logits, params, &mut rng);
            produced += 1;
            if !on_token(token) || self.is_eos(token) || produced >= max_tokens {
                break;
            }
            if self.position() >= self.capacity() {
                warn!(produced, capacity = self.capacity(), "generation stopped: context full");
                break;
            }
            if let Err(e) = self.forward(&[token]) {
                warn!(error = %e, produced, "generation stopped by a failed step");
                break;
            }
        }
        debug!(prompt = prompt.len(), produced, "generation finished");
        Ok(produced)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::kernels::test_util::random_vec;
    use crate::model::loader::test_support::safetensors_bytes;

    pub(crate) const HIDDEN: usize = 8;
    pub(crate) const HEADS: usize = 2;
    pub(crate) const HEAD_DIM: usize = 4;
    pub(crate) const VOCAB: usize = 16;
    const INTERMEDIATE: usize = 16;
    const LAYERS: usize = 2;

    pub(crate) fn tiny_config(tied: bool) -> ModelConfig {
        ModelConfig::from_json(&format!(
            r#"{{
                "vocab_size": {VOCAB},
                "hidden_size": {HIDDEN},
                "intermediate_size": {INTERMEDIATE},
                "num_attention_heads": {HEADS},
                "num_key_value_heads": 1,
                "num_hidden_layers": {LAYERS},
                "max_position_embeddings": 32,
                "rms_norm_eps": 1e-6,
                "hidden_act": "silu",
                "eos_token_id": 15,
                "tie_word_embeddings": {tied}
            }}"#
        ))
        .unwrap()
    }

    /// Safetensors bytes for [`tiny_config`] with seeded random weights.
    pub(crate) fn tiny_weights(tied: bool) -> Vec<u8> {
        let mut seed = 100;
        let mut next = |n: usize| {
            seed += 1;
            random_vec(n, seed).into_iter().map(|x| x * 0.5).collect::<Vec<f32>>()
        };
        let kv = HEAD_DIM;
        let mut tensors: Vec<(String, Vec<usize>, Vec<f32>)> = vec![
            ("model.embed_tokens.weight".into(), vec![VOCAB, HIDDEN], next(VOCAB * HIDDEN)),
            ("model.norm.weight".into(), vec![HIDDEN], vec![1.0; HIDDEN]),
        ];
        if !tied {
            tensors.push(("lm_head.weight".into(), vec![VOCAB, HIDDEN], next(VOCAB * HIDDEN)));
        }
        for i in 0..LAYERS {
            let p = format!("model.layers.{i}");
            let shapes: [(&str, [usize; 2]); 7] = [
                ("self_attn.q_proj", [HEADS * HEAD_DIM, HIDDEN]),
                ("self_attn.k_proj", [kv, HIDDEN]),
                ("self_attn.v_proj", [kv, HIDDEN]),
                ("self_attn.o_proj", [HIDDEN, HEADS * HEAD_DIM]),
                ("mlp.gate_proj", [INTERMEDIATE, HIDDEN]),
                ("mlp.up_proj", [INTERMEDIATE, HIDDEN]),
                ("mlp.down_proj", [HIDDEN, INTERMEDIATE]),
            ];
            for (name, [r, c]) in shapes {
                tensors.push((format!("{p}.{name}.weight"), vec![r, c], next(r * c)));
            }
            tensors.push((format!("{p}.input_layernorm.weight"), vec![HIDDEN], vec![1.0; HIDDEN]));
            tensors.push((format!("{p}.post_attention_layernorm.weight"), vec![HIDDEN], vec![1.0; HIDDEN]));
        }
        let refs: Vec<(&str, Vec<usize>, Vec<f32>)> = tensors
            .iter()
            .map(|(n, s, v)| (n.as_str(), s.clone(), v.clone()))
            .collect();
        safetensors_bytes(&refs)
    }

    pub(crate) fn tiny_model(tied: bool, dtype: DType) -> Transformer {
        let loader = WeightLoader::from_bytes(&tiny_weights(tied), dtype).unwrap();
        let options = LoadOptions {
            dtype,
            max_context: None,
        };
        Transformer::from_loader(tiny_config(tied), loader, &options, Arc::new(Backend::scalar())).unwrap()
    }
}
