//! Per-beam token and log-probability ledger
//!
//! Every beam holds the prompt followed by its generated tokens. Tokens are
//! appended for all beams in lock-step, so beam lengths never diverge.

use crate::error::{EngineError, Result};
use crate::request::TokenId;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenLedger {
    /// [beam_width][prompt + generated]
    tokens: Vec<Vec<TokenId>>,
    /// [beam_width][tokens after the original prompt]
    log_probs: Vec<Vec<f32>>,
    /// [beam_width]
    cum_log_probs: Vec<f32>,
}

impl TokenLedger {
    /// Scatter the prompt to every beam
    pub fn new(prompt: &[TokenId], beam_width: usize) -> Self {
        Self {
            tokens: vec![prompt.to_vec(); beam_width],
            log_probs: vec![Vec::new(); beam_width],
            cum_log_probs: vec![0.0; beam_width],
        }
    }

    pub fn beam_width(&self) -> usize {
        self.tokens.len()
    }

    pub fn num_tokens(&self, beam: usize) -> Result<usize> {
        Ok(self.beam(beam)?.len())
    }

    /// Longest beam; equal to every beam's length
    pub fn max_beam_num_tokens(&self) -> usize {
        self.tokens.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn token(&self, beam: usize, pos: usize) -> Result<TokenId> {
        self.beam(beam)?.get(pos).copied().ok_or_else(|| {
            EngineError::invalid_argument(format!("position {} out of range for beam {}", pos, beam))
        })
    }

    pub fn tokens(&self, beam: usize) -> Result<&[TokenId]> {
        self.beam(beam).map(Vec::as_slice)
    }

    pub fn all_tokens(&self) -> &[Vec<TokenId>] {
        &self.tokens
    }

    /// Append one token per beam
    pub fn push_step(&mut self, beam_tokens: &[TokenId]) -> Result<()> {
        self.check_beam_count(beam_tokens.len(), "tokens")?;
        for (beam, &token) in self.tokens.iter_mut().zip(beam_tokens) {
            beam.push(token);
        }
        Ok(())
    }

    /// Replace everything after `prompt_len` on every beam
    pub fn replace_generated(&mut self, prompt_len: usize, generated: &[Vec<TokenId>]) -> Result<()> {
        self.check_beam_count(generated.len(), "generated sequences")?;
        if let Some(first) = generated.first() {
            if generated.iter().any(|g| g.len() != first.len()) {
                return Err(EngineError::invalid_argument(
                    "generated sequences must have the same length on every beam",
                ));
            }
        }
        if self.tokens.iter().any(|beam| beam.len() < prompt_len) {
            return Err(EngineError::invariant(format!(
                "ledger shorter than prompt length {}",
                prompt_len
            )));
        }
        for (beam, replacement) in self.tokens.iter_mut().zip(generated) {
            beam.truncate(prompt_len);
            beam.extend_from_slice(replacement);
        }
        Ok(())
    }

    /// Truncate every beam to `len` tokens
    pub fn truncate(&mut self, len: usize) {
        for beam in &mut self.tokens {
            beam.truncate(len);
        }
    }

    pub fn log_probs(&self, beam: usize) -> Result<&[f32]> {
        self.log_probs
            .get(beam)
            .map(Vec::as_slice)
            .ok_or_else(|| self.beam_out_of_range(beam))
    }

    pub fn all_log_probs(&self) -> &[Vec<f32>] {
        &self.log_probs
    }

    /// Keep the first `keep` log probs of `beam` and append `log_probs`
    pub fn set_log_probs(&mut self, beam: usize, keep: usize, log_probs: &[f32]) -> Result<()> {
        let err = self.beam_out_of_range(beam);
        let entry = self.log_probs.get_mut(beam).ok_or(err)?;
        entry.resize(keep, 0.0);
        entry.extend_from_slice(log_probs);
        Ok(())
    }

    pub fn truncate_log_probs(&mut self, len: usize) {
        for lp in &mut self.log_probs {
            lp.truncate(len);
        }
    }

    pub fn clear_log_probs(&mut self) {
        for lp in &mut self.log_probs {
            lp.clear();
        }
    }

    pub fn cum_log_probs(&self) -> &[f32] {
        &self.cum_log_probs
    }

    pub fn set_cum_log_prob(&mut self, beam: usize, value: f32) -> Result<()> {
        let err = self.beam_out_of_range(beam);
        *self.cum_log_probs.get_mut(beam).ok_or(err)? = value;
        Ok(())
    }

    fn beam(&self, beam: usize) -> Result<&Vec<TokenId>> {
        self.tokens.get(beam).ok_or_else(|| self.beam_out_of_range(beam))
    }

    fn beam_out_of_range(&self, beam: usize) -> EngineError {
        EngineError::invalid_argument(format!(
            "beam {} out of range for beam width {}",
            beam,
            self.tokens.len()
        ))
    }

    fn check_beam_count(&self, got: usize, what: &str) -> Result<()> {
        if got != self.tokens.len() {
            return Err(EngineError::invalid_argument(format!(
                "expected {} for {} beams, got {}",
                what,
                self.tokens.len(),
                got
            )));
        }
        Ok(())
    }
}
