//! Model-independent generation defaults consumed by `set_default_options`.

use serde::{Deserialize, Serialize};

/// Generation defaults shared across providers.
///
/// Every field is optional; adapters map the populated ones into their
/// vendor-specific option keys (`max_tokens` vs `num_predict` vs
/// `maxOutputTokens`, ...). Fields a vendor does not understand are ignored
/// by that vendor's adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub min_p: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub stop_sequences: Option<Vec<String>>,
    /// Base URL override for locally hosted Ollama instances.
    pub ollama_endpoint: Option<String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.stop_sequences = Some(stop);
        self
    }

    pub fn with_ollama_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.ollama_endpoint = Some(endpoint.into());
        self
    }
}
