use std::sync::Arc;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunk::ContextCursor;
use crate::config::{RequestConfig, SamplingConfig};
use crate::error::{EngineError, Result};
use crate::ledger::TokenLedger;
use crate::tensor::{HostTensor, MemoryKind, TensorPtr};

/// Unique identifier for a request
pub type RequestId = u64;

/// Vocabulary index
pub type TokenId = u32;

/// Lifecycle state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Prompt not (fully) processed yet; also where paused requests land
    ContextInit,
    GenerationInProgress,
    GenerationComplete,
    /// The compute step failed while the request was batched
    Failed,
}

/// Reason for completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    EndId,
    StopWords,
    Length,
    Timeout,
    /// The compute step reported that no remaining beam can improve
    Converged,
    Cancelled,
    Error,
}

/// A single generation request and everything it has produced so far
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    /// Prompt length at admission, never changes
    orig_prompt_len: usize,
    /// Grows when a single-beam request is paused and its output folded in
    prompt_len: usize,
    max_new_tokens: usize,
    sampling: SamplingConfig,
    priority: u32,
    state: RequestState,
    streaming: bool,
    end_id: Option<TokenId>,
    pad_id: Option<TokenId>,
    slot: Option<usize>,

    ledger: TokenLedger,
    cursor: ContextCursor,
    /// Highest position already reported to a streaming consumer
    max_sent_token_pos: usize,

    embedding_bias: Option<TensorPtr>,
    bad_words: Option<TensorPtr>,
    stop_words: Option<TensorPtr>,
    prompt_embedding_table: Option<TensorPtr>,
    prompt_vocab_size: Option<usize>,
    lora_weights: Option<TensorPtr>,
    lora_config: Option<TensorPtr>,

    return_log_probs: bool,
    return_context_logits: bool,
    return_generation_logits: bool,
    draft_tokens: Vec<TokenId>,
    draft_logits: Option<TensorPtr>,

    context_logits_host: Option<TensorPtr>,
    /// Per-step logits until the request retires
    generation_logits_fragments: Vec<TensorPtr>,
    generation_logits_host: Option<TensorPtr>,

    finish_reason: Option<FinishReason>,
    error: Option<String>,
}

impl Request {
    pub fn new(id: RequestId, prompt: Vec<TokenId>, config: RequestConfig) -> Result<Self> {
        if prompt.is_empty() {
            return Err(EngineError::invalid_argument(format!(
                "request {} has an empty prompt",
                id
            )));
        }
        config.validate()?;

        let prompt_len = prompt.len();
        let beam_width = config.sampling.beam_width;

        Ok(Self {
            id,
            orig_prompt_len: prompt_len,
            prompt_len,
            max_new_tokens: config.max_new_tokens,
            sampling: config.sampling,
            priority: config.priority,
            state: RequestState::ContextInit,
            streaming: config.streaming,
            end_id: config.end_id,
            pad_id: config.pad_id,
            slot: None,
            ledger: TokenLedger::new(&prompt, beam_width),
            cursor: ContextCursor::new(),
            max_sent_token_pos: prompt_len - 1,
            embedding_bias: config.embedding_bias,
            bad_words: config.bad_words,
            stop_words: config.stop_words,
            prompt_embedding_table: config.prompt_embedding_table,
            prompt_vocab_size: config.prompt_vocab_size,
            lora_weights: config.lora_weights,
            lora_config: config.lora_config,
            return_log_probs: config.return_log_probs,
            return_context_logits: config.return_context_logits,
            return_generation_logits: config.return_generation_logits,
            draft_tokens: config.draft_tokens.unwrap_or_default(),
            draft_logits: config.draft_logits,
            context_logits_host: None,
            generation_logits_fragments: Vec::new(),
            generation_logits_host: None,
            finish_reason: None,
            error: None,
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn orig_prompt_len(&self) -> usize {
        self.orig_prompt_len
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    pub fn beam_width(&self) -> usize {
        self.sampling.beam_width
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn end_id(&self) -> Option<TokenId> {
        self.end_id
    }

    pub fn pad_id(&self) -> Option<TokenId> {
        self.pad_id
    }

    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Failure message, set when the request ended in [`RequestState::Failed`]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_context_init_state(&self) -> bool {
        self.state == RequestState::ContextInit
    }

    pub fn is_generation_in_progress_state(&self) -> bool {
        self.state == RequestState::GenerationInProgress
    }

    pub fn is_generation_complete_state(&self) -> bool {
        self.state == RequestState::GenerationComplete
    }

    pub fn is_failed(&self) -> bool {
        self.state == RequestState::Failed
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RequestState::GenerationComplete | RequestState::Failed)
    }

    // ---- context chunking ----

    /// Size the next context chunk; clamped to what is left of the prompt
    pub fn set_context_chunk_size(&mut self, size: usize) -> Result<()> {
        self.require_context("set the context chunk size")?;
        self.cursor.set_chunk_size(size, self.prompt_len);
        Ok(())
    }

    pub fn context_chunk_size(&self) -> Result<usize> {
        self.require_context("query the context chunk size")?;
        self.cursor.chunk_size().ok_or_else(|| {
            EngineError::invalid_state(format!("request {} has no context chunk size set", self.id))
        })
    }

    pub fn context_current_position(&self) -> usize {
        self.cursor.position()
    }

    pub fn context_remaining_length(&self) -> usize {
        self.cursor.remaining(self.prompt_len)
    }

    /// Tokens the next context step will process
    pub fn next_context_chunk_len(&self) -> usize {
        if self.is_context_init_state() {
            self.cursor.next_chunk_len(self.prompt_len)
        } else {
            0
        }
    }

    pub fn is_full_context_request(&self) -> bool {
        self.is_context_init_state() && !self.cursor.is_chunked() && self.cursor.position() == 0
    }

    pub fn is_first_context_chunk(&self) -> bool {
        self.is_full_context_request()
            || (self.is_context_init_state() && self.cursor.is_first_chunk())
    }

    pub fn is_last_context_chunk(&self) -> bool {
        self.is_full_context_request()
            || (self.is_context_init_state() && self.cursor.is_last_chunk(self.prompt_len))
    }

    /// Advance past the current chunk, or to the end of the prompt if unchunked
    pub fn move_to_next_context_chunk(&mut self) -> Result<()> {
        self.require_context("move to the next context chunk")?;
        self.cursor.advance(self.prompt_len);
        Ok(())
    }

    // ---- tokens ----

    pub fn num_tokens(&self, beam: usize) -> Result<usize> {
        self.ledger.num_tokens(beam)
    }

    pub fn max_beam_num_tokens(&self) -> usize {
        self.ledger.max_beam_num_tokens()
    }

    pub fn token(&self, beam: usize, pos: usize) -> Result<TokenId> {
        self.ledger.token(beam, pos)
    }

    pub fn tokens(&self, beam: usize) -> Result<&[TokenId]> {
        self.ledger.tokens(beam)
    }

    pub fn all_tokens(&self) -> &[Vec<TokenId>] {
        self.ledger.all_tokens()
    }

    /// Tokens produced after the current prompt
    pub fn max_num_generated_tokens(&self) -> usize {
        self.max_beam_num_tokens().saturating_sub(self.prompt_len)
    }

    /// Everything after the original prompt, including tokens folded into the prompt by a pause
    pub fn output_tokens(&self, beam: usize) -> Result<&[TokenId]> {
        Ok(&self.tokens(beam)?[self.orig_prompt_len..])
    }

    /// Generation budget left before the length limit
    pub fn remaining_new_tokens(&self) -> usize {
        self.max_new_tokens.saturating_sub(self.max_num_generated_tokens())
    }

    /// Append one token per beam; the first call after the last context chunk starts generation
    pub fn add_new_tokens(&mut self, beam_tokens: &[TokenId]) -> Result<()> {
        match self.state {
            RequestState::GenerationInProgress => {}
            RequestState::ContextInit if self.cursor.is_complete(self.prompt_len) => {}
            RequestState::ContextInit => {
                return Err(EngineError::invalid_state(format!(
                    "request {} still has {} context tokens to process",
                    self.id,
                    self.context_remaining_length()
                )));
            }
            state => {
                return Err(EngineError::invalid_state(format!(
                    "request {} cannot accept tokens in state {:?}",
                    self.id, state
                )));
            }
        }
        self.ledger.push_step(beam_tokens)?;
        if self.state == RequestState::ContextInit {
            debug!("Request {} entered generation", self.id);
            self.state = RequestState::GenerationInProgress;
        }
        Ok(())
    }

    /// Replace every beam's generated tokens, e.g. after beam lineage was rewritten
    pub fn set_generated_tokens(&mut self, generated: &[Vec<TokenId>]) -> Result<()> {
        if !self.is_generation_in_progress_state() {
            return Err(EngineError::invalid_state(format!(
                "request {} is not generating (state {:?})",
                self.id, self.state
            )));
        }
        self.ledger.replace_generated(self.prompt_len, generated)
    }

    // ---- pause ----

    /// Evict the request from its slot and send it back to the context phase.
    ///
    /// Single-beam requests fold what they generated into the prompt, capped at
    /// `max_input_len`, and give up that much of their generation budget. Beam
    /// search requests restart from the prompt. The streaming watermark is
    /// kept, so positions generated again after resuming are not reported twice.
    pub fn pause(&mut self, max_input_len: usize) -> Result<()> {
        if self.is_terminal() {
            return Err(EngineError::invalid_state(format!(
                "request {} already finished (state {:?})",
                self.id, self.state
            )));
        }
        if max_input_len < self.prompt_len {
            return Err(EngineError::invalid_argument(format!(
                "max input length {} is shorter than the prompt of request {} ({} tokens)",
                max_input_len, self.id, self.prompt_len
            )));
        }

        if self.beam_width() > 1 {
            self.ledger.truncate(self.prompt_len);
            self.ledger.clear_log_probs();
        } else {
            let new_prompt_len = max_input_len.min(self.prompt_len + self.max_num_generated_tokens());
            self.ledger.truncate(new_prompt_len);
            self.ledger.truncate_log_probs(new_prompt_len - self.orig_prompt_len);
            self.max_new_tokens = self.max_new_tokens.saturating_sub(new_prompt_len - self.prompt_len);
            self.prompt_len = new_prompt_len;
        }

        // The watermark stays put: regenerated positions were already reported
        self.state = RequestState::ContextInit;
        self.cursor.reset();
        self.slot = None;
        debug!(
            "Paused request {}: prompt {} tokens, {} new tokens left",
            self.id, self.prompt_len, self.max_new_tokens
        );
        Ok(())
    }

    // ---- streaming watermark ----

    pub fn max_sent_token_pos(&self) -> usize {
        self.max_sent_token_pos
    }

    pub fn set_max_sent_token_pos(&mut self, pos: usize) -> Result<()> {
        if pos <= self.max_sent_token_pos {
            return Err(EngineError::invalid_argument(format!(
                "watermark {} does not advance past {} for request {}",
                pos, self.max_sent_token_pos, self.id
            )));
        }
        self.max_sent_token_pos = pos;
        Ok(())
    }

    // ---- log probabilities ----

    pub fn return_log_probs(&self) -> bool {
        self.return_log_probs
    }

    pub fn log_probs(&self, beam: usize) -> Result<&[f32]> {
        self.ledger.log_probs(beam)
    }

    pub fn all_log_probs(&self) -> &[Vec<f32>] {
        self.ledger.all_log_probs()
    }

    /// Rewrite the log probs of everything generated since the current prompt
    pub fn set_log_probs(&mut self, beam: usize, log_probs: &[f32]) -> Result<()> {
        let keep = self.prompt_len - self.orig_prompt_len;
        self.ledger.set_log_probs(beam, keep, log_probs)
    }

    pub fn append_log_probs(&mut self, beam: usize, log_probs: &[f32]) -> Result<()> {
        let keep = self.ledger.log_probs(beam)?.len();
        self.ledger.set_log_probs(beam, keep, log_probs)
    }

    pub fn cum_log_probs(&self) -> &[f32] {
        self.ledger.cum_log_probs()
    }

    pub fn set_cum_log_prob(&mut self, beam: usize, value: f32) -> Result<()> {
        self.ledger.set_cum_log_prob(beam, value)
    }

    // ---- speculative decoding ----

    pub fn draft_tokens(&self) -> &[TokenId] {
        &self.draft_tokens
    }

    pub fn has_draft_tokens(&self) -> bool {
        !self.draft_tokens.is_empty()
    }

    pub fn set_draft_tokens(&mut self, draft_tokens: Vec<TokenId>) -> Result<()> {
        if !draft_tokens.is_empty() && self.beam_width() > 1 {
            return Err(EngineError::invalid_argument(format!(
                "request {} uses beam width {}; draft tokens need beam width 1",
                self.id,
                self.beam_width()
            )));
        }
        self.draft_tokens = draft_tokens;
        Ok(())
    }

    pub fn draft_logits(&self) -> Option<&TensorPtr> {
        self.draft_logits.as_ref()
    }

    pub fn set_draft_logits(&mut self, draft_logits: TensorPtr) -> Result<()> {
        if !self.has_draft_tokens() {
            return Err(EngineError::invalid_argument(format!(
                "request {} has no draft tokens to attach logits to",
                self.id
            )));
        }
        self.draft_logits = Some(draft_logits);
        Ok(())
    }

    // ---- optional tensors ----

    pub fn embedding_bias(&self) -> Option<&TensorPtr> {
        self.embedding_bias.as_ref()
    }

    pub fn bad_words(&self) -> Option<&TensorPtr> {
        self.bad_words.as_ref()
    }

    pub fn stop_words(&self) -> Option<&TensorPtr> {
        self.stop_words.as_ref()
    }

    pub fn prompt_embedding_table(&self) -> Option<&TensorPtr> {
        self.prompt_embedding_table.as_ref()
    }

    pub fn prompt_vocab_size(&self) -> Option<usize> {
        self.prompt_vocab_size
    }

    pub fn lora_weights(&self) -> Option<&TensorPtr> {
        self.lora_weights.as_ref()
    }

    pub fn lora_config(&self) -> Option<&TensorPtr> {
        self.lora_config.as_ref()
    }

    pub fn move_prompt_embedding_table_to_device(&mut self, device: &Device) -> Result<()> {
        migrate(&mut self.prompt_embedding_table, device)
    }

    /// Only the weights move; the LoRA config stays where it is
    pub fn move_lora_weights_to_device(&mut self, device: &Device) -> Result<()> {
        migrate(&mut self.lora_weights, device)
    }

    // ---- logits capture ----

    pub fn return_context_logits(&self) -> bool {
        self.return_context_logits
    }

    pub fn return_generation_logits(&self) -> bool {
        self.return_generation_logits
    }

    pub fn context_logits_host(&self) -> Option<&TensorPtr> {
        self.context_logits_host.as_ref()
    }

    pub fn set_context_logits_host(&mut self, logits: TensorPtr) {
        self.context_logits_host = Some(logits);
    }

    pub fn generation_logits_fragments(&self) -> &[TensorPtr] {
        &self.generation_logits_fragments
    }

    pub fn add_generation_logits_fragment(&mut self, fragment: TensorPtr) {
        self.generation_logits_fragments.push(fragment);
    }

    pub fn clear_generation_logits_fragments(&mut self) {
        self.generation_logits_fragments.clear();
    }

    pub fn generation_logits_host(&self) -> Option<&TensorPtr> {
        self.generation_logits_host.as_ref()
    }

    pub fn set_generation_logits_host(&mut self, logits: TensorPtr) {
        self.generation_logits_host = Some(logits);
    }

    /// Stack the collected fragments along their first dimension into the
    /// host buffer and drop them. Every fragment must share its trailing
    /// (vocabulary) dimension.
    pub fn merge_generation_logits_fragments(&mut self) -> Result<()> {
        let Some(first) = self.generation_logits_fragments.first() else {
            return Ok(());
        };
        let vocab = first.shape().last().copied().unwrap_or(0);
        let mut rows = 0;
        let mut data = Vec::new();
        for fragment in &self.generation_logits_fragments {
            let shape = fragment.shape();
            if shape.last().copied().unwrap_or(0) != vocab || vocab == 0 {
                return Err(EngineError::invalid_argument(format!(
                    "generation logits fragment of shape {:?} does not match vocabulary size {} for request {}",
                    shape, vocab, self.id
                )));
            }
            let values = fragment.read_f32()?;
            rows += values.len() / vocab;
            data.extend(values);
        }
        let merged = HostTensor::new(vec![rows, vocab], data)?;
        debug!("Request {} merged {} generation logits rows", self.id, rows);
        self.generation_logits_host = Some(Arc::new(merged));
        self.generation_logits_fragments.clear();
        Ok(())
    }

    // ---- scheduler-driven transitions ----

    pub(crate) fn assign_slot(&mut self, slot: usize) -> Result<()> {
        if let Some(held) = self.slot {
            return Err(EngineError::invalid_state(format!(
                "request {} already holds slot {}",
                self.id, held
            )));
        }
        self.slot = Some(slot);
        Ok(())
    }

    pub(crate) fn take_slot(&mut self) -> Option<usize> {
        self.slot.take()
    }

    pub(crate) fn complete(&mut self, reason: FinishReason) -> Result<()> {
        if self.is_terminal() {
            return Err(EngineError::invalid_state(format!(
                "request {} already finished (state {:?})",
                self.id, self.state
            )));
        }
        debug!("Request {} complete: {:?}", self.id, reason);
        self.state = RequestState::GenerationComplete;
        self.finish_reason = Some(reason);
        Ok(())
    }

    /// Terminal failure; tokens produced so far are kept
    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("Request {} failed: {}", self.id, message);
        self.state = RequestState::Failed;
        self.finish_reason = Some(FinishReason::Error);
        self.error = Some(message);
    }

    fn require_context(&self, what: &str) -> Result<()> {
        if !self.is_context_init_state() {
            return Err(EngineError::invalid_state(format!(
                "cannot {} for request {} in state {:?}",
                what, self.id, self.state
            )));
        }
        Ok(())
    }
}

fn migrate(tensor: &mut Option<TensorPtr>, device: &Device) -> Result<()> {
    if let Some(current) = tensor {
        if current.memory_kind() == MemoryKind::Host {
            *tensor = Some(current.to_device(device)?);
        }
    }
    Ok(())
}
