//! Scheduler, request and sampling configuration
//!
//! Every optional request parameter is enumerated in [`RequestConfig`] with its
//! default, and validated once when the request is created.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::request::TokenId;
use crate::tensor::TensorPtr;

/// Hard ceiling on beams per request
pub const MAX_BEAM_WIDTH: usize = 64;

/// Baseline diversity rate when a request does not set one
pub const DEFAULT_DIVERSITY_RATE: f32 = 0.0;

/// Baseline length penalty when a request does not set one
pub const DEFAULT_LENGTH_PENALTY: f32 = 0.0;

/// When beam search may stop before every beam has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyStopping {
    /// Keep going until every beam finished or the length limit is hit
    Never,
    /// Stop once no unfinished beam can beat the best finished one
    Heuristic,
    /// Stop as soon as the first beam finishes
    #[default]
    Always,
}

/// Sampling parameters for a request; immutable once admitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub beam_width: usize,
    pub temperature: Option<f32>,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub random_seed: Option<u64>,
    pub beam_search_diversity_rate: Option<f32>,
    pub length_penalty: Option<f32>,
    pub early_stopping: Option<EarlyStopping>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            beam_width: 1,
            temperature: None,
            top_k: None,
            top_p: None,
            random_seed: None,
            beam_search_diversity_rate: None,
            length_penalty: None,
            early_stopping: None,
        }
    }
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self {
            top_k: Some(1),
            ..Default::default()
        }
    }

    pub fn beam_search(beam_width: usize) -> Self {
        Self {
            beam_width,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.beam_width == 0 || self.beam_width > MAX_BEAM_WIDTH {
            return Err(EngineError::configuration(format!(
                "beam width {} outside 1..={}",
                self.beam_width, MAX_BEAM_WIDTH
            )));
        }
        if let Some(t) = self.temperature {
            if !(t >= 0.0) {
                return Err(EngineError::invalid_argument(format!("temperature {} must be >= 0", t)));
            }
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(EngineError::invalid_argument(format!("top_p {} outside (0, 1]", p)));
            }
        }
        if self.top_k == Some(0) {
            return Err(EngineError::invalid_argument("top_k must be positive"));
        }
        Ok(())
    }
}

/// Every optional parameter a request can carry, with its default
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub max_new_tokens: usize,
    pub sampling: SamplingConfig,
    /// Higher runs first; ties go by admission order
    pub priority: u32,
    pub streaming: bool,
    pub end_id: Option<TokenId>,
    pub pad_id: Option<TokenId>,
    pub embedding_bias: Option<TensorPtr>,
    pub bad_words: Option<TensorPtr>,
    pub stop_words: Option<TensorPtr>,
    pub prompt_embedding_table: Option<TensorPtr>,
    pub prompt_vocab_size: Option<usize>,
    pub lora_weights: Option<TensorPtr>,
    pub lora_config: Option<TensorPtr>,
    pub return_log_probs: bool,
    /// Keep the logits of the last context chunk on the request
    pub return_context_logits: bool,
    /// Collect per-step generation logits, merged into one host tensor on retirement
    pub return_generation_logits: bool,
    pub draft_tokens: Option<Vec<TokenId>>,
    pub draft_logits: Option<TensorPtr>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 16,
            sampling: SamplingConfig::default(),
            priority: 0,
            streaming: false,
            end_id: None,
            pad_id: None,
            embedding_bias: None,
            bad_words: None,
            stop_words: None,
            prompt_embedding_table: None,
            prompt_vocab_size: None,
            lora_weights: None,
            lora_config: None,
            return_log_probs: false,
            return_context_logits: false,
            return_generation_logits: false,
            draft_tokens: None,
            draft_logits: None,
        }
    }
}

impl RequestConfig {
    pub fn new(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Default::default()
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_end_id(mut self, end_id: TokenId) -> Self {
        self.end_id = Some(end_id);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_draft_tokens(mut self, draft_tokens: Vec<TokenId>) -> Self {
        self.draft_tokens = Some(draft_tokens);
        self
    }

    pub fn with_log_probs(mut self) -> Self {
        self.return_log_probs = true;
        self
    }

    pub fn with_context_logits(mut self) -> Self {
        self.return_context_logits = true;
        self
    }

    pub fn with_generation_logits(mut self) -> Self {
        self.return_generation_logits = true;
        self
    }

    /// Check the optional-parameter pairings
    pub fn validate(&self) -> Result<()> {
        self.sampling.validate()?;

        if self.prompt_embedding_table.is_some() != self.prompt_vocab_size.is_some() {
            return Err(EngineError::invalid_argument(
                "prompt embedding table and prompt vocab size must both be provided for prompt tuning",
            ));
        }
        if self.lora_weights.is_some() != self.lora_config.is_some() {
            return Err(EngineError::invalid_argument(
                "LoRA weights and LoRA config must be provided together",
            ));
        }
        if self.draft_logits.is_some() && self.draft_tokens.is_none() {
            return Err(EngineError::invalid_argument(
                "draft tokens must be specified when draft logits are given",
            ));
        }
        let has_drafts = self.draft_tokens.as_ref().is_some_and(|d| !d.is_empty());
        if has_drafts && self.sampling.beam_width > 1 {
            return Err(EngineError::invalid_argument(
                "draft tokens are only supported with beam width 1",
            ));
        }
        Ok(())
    }
}

/// Limits of the batch the scheduler drives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of batch slots
    pub max_batch_size: usize,
    pub max_beam_width: usize,
    /// Longest prompt accepted; also the cap applied when a request is paused,
    /// further capped by `max_num_tokens` when chunked context is off
    pub max_input_len: usize,
    /// Prompt plus generated tokens
    pub max_seq_len: usize,
    pub max_attention_window: usize,
    /// Positions at the start of the window that are never evicted
    pub sink_token_length: usize,
    /// Token budget per step, `None` for unbounded
    pub max_num_tokens: Option<usize>,
    pub enable_chunked_context: bool,
    /// Context chunks other than the last are multiples of this
    pub context_chunk_unit: usize,
    /// Pause a lower-priority slot holder when a higher-priority request is waiting
    pub preempt_lower_priority: bool,
    pub pipeline_parallelism: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            max_beam_width: 4,
            max_input_len: 1024,
            max_seq_len: 2048,
            max_attention_window: 2048,
            sink_token_length: 0,
            max_num_tokens: None,
            enable_chunked_context: false,
            context_chunk_unit: 1,
            preempt_lower_priority: false,
            pipeline_parallelism: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(EngineError::configuration("max_batch_size must be positive"));
        }
        if self.max_beam_width == 0 || self.max_beam_width > MAX_BEAM_WIDTH {
            return Err(EngineError::configuration(format!(
                "max_beam_width {} outside 1..={}",
                self.max_beam_width, MAX_BEAM_WIDTH
            )));
        }
        if self.max_input_len == 0 || self.max_input_len > self.max_seq_len {
            return Err(EngineError::configuration(format!(
                "max_input_len {} must be in 1..={} (max_seq_len)",
                self.max_input_len, self.max_seq_len
            )));
        }
        if self.max_attention_window == 0 || self.sink_token_length >= self.max_attention_window {
            return Err(EngineError::configuration(format!(
                "sink_token_length {} must be smaller than max_attention_window {}",
                self.sink_token_length, self.max_attention_window
            )));
        }
        if self.context_chunk_unit == 0 {
            return Err(EngineError::configuration("context_chunk_unit must be positive"));
        }
        if self.max_num_tokens == Some(0) {
            return Err(EngineError::configuration("max_num_tokens must be positive"));
        }
        if let Some(budget) = self.max_num_tokens {
            // A non-final chunk rounded down to the unit would never fit
            if self.enable_chunked_context && self.context_chunk_unit > budget {
                return Err(EngineError::configuration(format!(
                    "context_chunk_unit {} exceeds the step budget of {} tokens",
                    self.context_chunk_unit, budget
                )));
            }
        }
        if self.pipeline_parallelism != 1 {
            return Err(EngineError::configuration(format!(
                "pipelined execution over {} stages is not supported",
                self.pipeline_parallelism
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tensor::HostTensor;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(RequestConfig::default().validate().is_ok());
        assert_eq!(SamplingConfig::default().beam_width, 1);
        assert_eq!(EarlyStopping::default(), EarlyStopping::Always);
    }

    #[test]
    fn test_beam_width_ceiling() {
        let err = SamplingConfig::beam_search(MAX_BEAM_WIDTH + 1).validate().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(SamplingConfig::beam_search(MAX_BEAM_WIDTH).validate().is_ok());
        assert!(SamplingConfig::beam_search(0).validate().is_err());
    }

    #[test]
    fn test_optional_pairs() {
        let table: TensorPtr = Arc::new(HostTensor::zeros(vec![4, 8]));

        let config = RequestConfig {
            prompt_embedding_table: Some(table.clone()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidArgument(_))));

        let config = RequestConfig {
            prompt_embedding_table: Some(table.clone()),
            prompt_vocab_size: Some(4),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = RequestConfig {
            draft_logits: Some(table.clone()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidArgument(_))));

        let config = RequestConfig {
            lora_config: Some(table),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn test_drafts_need_single_beam() {
        let config = RequestConfig::new(8)
            .with_sampling(SamplingConfig::beam_search(2))
            .with_draft_tokens(vec![1, 2]);
        assert!(matches!(config.validate(), Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn test_scheduler_config_rejects_bad_window() {
        let config = SchedulerConfig {
            max_attention_window: 16,
            sink_token_length: 16,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));

        let config = SchedulerConfig {
            pipeline_parallelism: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_chunk_unit_must_fit_budget() {
        let config = SchedulerConfig {
            max_num_tokens: Some(4),
            enable_chunked_context: true,
            context_chunk_unit: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));

        let config = SchedulerConfig {
            context_chunk_unit: 4,
            ..config
        };
        assert!(config.validate().is_ok());

        // without chunking the unit is never applied
        let config = SchedulerConfig {
            context_chunk_unit: 8,
            enable_chunked_context: false,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduler_config_from_partial_json() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"max_batch_size": 2, "enable_chunked_context": true}"#).unwrap();
        assert_eq!(config.max_batch_size, 2);
        assert!(config.enable_chunked_context);
        assert_eq!(config.max_seq_len, 2048);

        let sampling: SamplingConfig =
            serde_json::from_str(r#"{"beam_width": 3, "early_stopping": "heuristic"}"#).unwrap();
        assert_eq!(sampling.beam_width, 3);
        assert_eq!(sampling.early_stopping, Some(EarlyStopping::Heuristic));
    }
}
