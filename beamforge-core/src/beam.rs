//! Beam hypothesis tracking
//!
//! A flat arena indexed by `(slot, beam, position)`. Lineage is recorded as a
//! parent beam index per generated position, so each `(beam, position)` entry
//! is written exactly once per slot assignment and finished beams stay frozen.

use serde::{Deserialize, Serialize};

use crate::config::{EarlyStopping, DEFAULT_DIVERSITY_RATE, DEFAULT_LENGTH_PENALTY, MAX_BEAM_WIDTH};
use crate::error::{EngineError, Result};
use crate::request::{FinishReason, TokenId};

/// Initial cumulative log prob of every beam but the first, so the first step
/// only expands the shared context.
pub const INACTIVE_BEAM_LOG_PROB: f32 = -1e20;

/// Why a beam stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FinishedState {
    #[default]
    Unfinished,
    EndId,
    StopWords,
    Length,
    Timeout,
}

impl FinishedState {
    pub fn is_finished(self) -> bool {
        self != FinishedState::Unfinished
    }

    pub fn finish_reason(self) -> Option<FinishReason> {
        match self {
            FinishedState::Unfinished => None,
            FinishedState::EndId => Some(FinishReason::EndId),
            FinishedState::StopWords => Some(FinishReason::StopWords),
            FinishedState::Length => Some(FinishReason::Length),
            FinishedState::Timeout => Some(FinishReason::Timeout),
        }
    }
}

/// Optional buffers the tracker is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerBuffers {
    pub sequence_lengths: bool,
    pub finished: bool,
}

impl Default for TrackerBuffers {
    fn default() -> Self {
        Self {
            sequence_lengths: true,
            finished: true,
        }
    }
}

/// Per-slot beam search knobs, broadcast across the slot's beams
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotKnobs {
    pub diversity_rate: f32,
    pub length_penalty: f32,
    pub early_stopping: EarlyStopping,
}

impl Default for SlotKnobs {
    fn default() -> Self {
        Self {
            diversity_rate: DEFAULT_DIVERSITY_RATE,
            length_penalty: DEFAULT_LENGTH_PENALTY,
            early_stopping: EarlyStopping::default(),
        }
    }
}

/// Knobs for a setup call: each is absent, one value for every slot, or one value per slot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeamSetupParams {
    pub diversity_rate: Option<Vec<f32>>,
    pub length_penalty: Option<Vec<f32>>,
    pub early_stopping: Option<Vec<EarlyStopping>>,
}

/// What the compute step produced for one beam
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamStep {
    pub token: TokenId,
    pub log_prob: f32,
    pub cum_log_prob: f32,
    /// Beam extended by this step; must have been unfinished before it
    pub parent: usize,
    pub finished: FinishedState,
}

/// Each beam's generated tokens, reconstructed from lineage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatheredBeams {
    pub tokens: Vec<Vec<TokenId>>,
    pub log_probs: Vec<Vec<f32>>,
}

#[derive(Debug)]
pub struct BeamHypotheses {
    max_batch_size: usize,
    max_beam_width: usize,
    max_seq_len: usize,
    buffers: TrackerBuffers,

    /// [slot]; 0 while the slot is unassigned
    beam_widths: Vec<usize>,
    input_lengths: Vec<usize>,
    sequence_limit_lengths: Vec<usize>,
    end_ids: Vec<Option<TokenId>>,
    knobs: Vec<SlotKnobs>,

    /// [slot][beam]
    sequence_lengths: Option<Vec<usize>>,
    finished: Option<Vec<FinishedState>>,
    cum_log_probs: Vec<f32>,

    /// [slot][beam][position]
    output_ids: Vec<TokenId>,
    parent_ids: Vec<usize>,
    log_probs: Vec<f32>,
}

impl BeamHypotheses {
    pub fn new(
        max_batch_size: usize,
        max_beam_width: usize,
        max_seq_len: usize,
        buffers: TrackerBuffers,
    ) -> Result<Self> {
        if max_beam_width == 0 || max_beam_width > MAX_BEAM_WIDTH {
            return Err(EngineError::configuration(format!(
                "beam width {} outside 1..={}",
                max_beam_width, MAX_BEAM_WIDTH
            )));
        }
        if max_beam_width > 1 && !buffers.sequence_lengths {
            return Err(EngineError::configuration(
                "beam search needs a sequence length buffer",
            ));
        }

        let beams = max_batch_size * max_beam_width;
        let cells = beams * max_seq_len;
        Ok(Self {
            max_batch_size,
            max_beam_width,
            max_seq_len,
            buffers,
            beam_widths: vec![0; max_batch_size],
            input_lengths: vec![0; max_batch_size],
            sequence_limit_lengths: vec![0; max_batch_size],
            end_ids: vec![None; max_batch_size],
            knobs: vec![SlotKnobs::default(); max_batch_size],
            sequence_lengths: buffers.sequence_lengths.then(|| vec![0; beams]),
            finished: buffers.finished.then(|| vec![FinishedState::Unfinished; beams]),
            cum_log_probs: vec![0.0; beams],
            output_ids: vec![0; cells],
            parent_ids: vec![0; cells],
            log_probs: vec![0.0; cells],
        })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_beam_width(&self) -> usize {
        self.max_beam_width
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn buffers(&self) -> TrackerBuffers {
        self.buffers
    }

    /// Populate the per-slot knobs before a step.
    ///
    /// Nothing is written unless every knob validates.
    pub fn setup(&mut self, batch_slots: &[usize], params: &BeamSetupParams) -> Result<()> {
        for &slot in batch_slots {
            self.check_slot(slot)?;
        }
        if params.length_penalty.is_some() && !self.buffers.sequence_lengths {
            return Err(EngineError::configuration(
                "length penalty needs a sequence length buffer",
            ));
        }
        if params.early_stopping.is_some() && !self.buffers.finished {
            return Err(EngineError::configuration(
                "early stopping needs a finished state buffer",
            ));
        }
        let n = batch_slots.len();
        check_broadcast("diversity rate", params.diversity_rate.as_deref(), n)?;
        check_broadcast("length penalty", params.length_penalty.as_deref(), n)?;
        check_broadcast("early stopping", params.early_stopping.as_deref(), n)?;

        for (i, &slot) in batch_slots.iter().enumerate() {
            let knobs = &mut self.knobs[slot];
            if let Some(v) = broadcast(params.diversity_rate.as_deref(), i) {
                knobs.diversity_rate = v;
            }
            if let Some(v) = broadcast(params.length_penalty.as_deref(), i) {
                knobs.length_penalty = v;
            }
            if let Some(v) = broadcast(params.early_stopping.as_deref(), i) {
                knobs.early_stopping = v;
            }
        }
        Ok(())
    }

    /// Prepare a freshly assigned slot for a request whose context has `input_len` tokens
    pub fn init_slot(
        &mut self,
        slot: usize,
        beam_width: usize,
        input_len: usize,
        max_new_tokens: usize,
        end_id: Option<TokenId>,
    ) -> Result<()> {
        self.check_slot(slot)?;
        if beam_width == 0 || beam_width > self.max_beam_width {
            return Err(EngineError::configuration(format!(
                "beam width {} outside 1..={}",
                beam_width, self.max_beam_width
            )));
        }
        if input_len + max_new_tokens > self.max_seq_len {
            return Err(EngineError::invalid_argument(format!(
                "{} input + {} new tokens exceed max sequence length {}",
                input_len, max_new_tokens, self.max_seq_len
            )));
        }

        self.reset_slot(slot);
        self.beam_widths[slot] = beam_width;
        self.input_lengths[slot] = input_len;
        self.sequence_limit_lengths[slot] = input_len + max_new_tokens;
        self.end_ids[slot] = end_id;

        let base = slot * self.max_beam_width;
        if let Some(lengths) = &mut self.sequence_lengths {
            lengths[base..base + beam_width].fill(input_len);
        }
        self.cum_log_probs[base] = 0.0;
        self.cum_log_probs[base + 1..base + beam_width].fill(INACTIVE_BEAM_LOG_PROB);
        Ok(())
    }

    /// Return the slot to its pristine state
    pub fn reset_slot(&mut self, slot: usize) {
        if slot >= self.max_batch_size {
            return;
        }
        self.beam_widths[slot] = 0;
        self.input_lengths[slot] = 0;
        self.sequence_limit_lengths[slot] = 0;
        self.end_ids[slot] = None;
        self.knobs[slot] = SlotKnobs::default();

        let beams = slot * self.max_beam_width..(slot + 1) * self.max_beam_width;
        if let Some(lengths) = &mut self.sequence_lengths {
            lengths[beams.clone()].fill(0);
        }
        if let Some(finished) = &mut self.finished {
            finished[beams.clone()].fill(FinishedState::Unfinished);
        }
        self.cum_log_probs[beams].fill(0.0);

        let stride = self.max_beam_width * self.max_seq_len;
        let cells = slot * stride..(slot + 1) * stride;
        self.output_ids[cells.clone()].fill(0);
        self.parent_ids[cells.clone()].fill(0);
        self.log_probs[cells].fill(0.0);
    }

    /// Only a single contiguous iteration over the whole batch is supported
    pub fn check_step_shape(&self, ite: usize, local_batch_size: usize, batch_size: usize) -> Result<()> {
        if ite != 0 || local_batch_size != batch_size {
            return Err(EngineError::configuration(format!(
                "step iteration {} over local batch {} of {} is not supported",
                ite, local_batch_size, batch_size
            )));
        }
        Ok(())
    }

    pub fn beam_width(&self, slot: usize) -> usize {
        self.beam_widths.get(slot).copied().unwrap_or(0)
    }

    pub fn input_length(&self, slot: usize) -> usize {
        self.input_lengths.get(slot).copied().unwrap_or(0)
    }

    /// `input_length + max_new_tokens`, the length at which beams stop
    pub fn sequence_limit_length(&self, slot: usize) -> usize {
        self.sequence_limit_lengths.get(slot).copied().unwrap_or(0)
    }

    pub fn end_id(&self, slot: usize) -> Option<TokenId> {
        self.end_ids.get(slot).copied().flatten()
    }

    pub fn knobs(&self, slot: usize) -> SlotKnobs {
        self.knobs.get(slot).copied().unwrap_or_default()
    }

    pub fn sequence_length(&self, slot: usize, beam: usize) -> Option<usize> {
        let idx = self.beam_index(slot, beam)?;
        self.sequence_lengths.as_ref().map(|l| l[idx])
    }

    pub fn finished_state(&self, slot: usize, beam: usize) -> Option<FinishedState> {
        let idx = self.beam_index(slot, beam)?;
        self.finished.as_ref().map(|f| f[idx])
    }

    pub fn is_beam_finished(&self, slot: usize, beam: usize) -> bool {
        self.finished_state(slot, beam).is_some_and(FinishedState::is_finished)
    }

    /// Per-beam finished flags of an assigned slot
    pub fn finished_mask(&self, slot: usize) -> Vec<bool> {
        (0..self.beam_width(slot))
            .map(|beam| self.is_beam_finished(slot, beam))
            .collect()
    }

    /// Every beam of the slot has finished
    pub fn is_slot_done(&self, slot: usize) -> bool {
        let width = self.beam_width(slot);
        width > 0 && (0..width).all(|beam| self.is_beam_finished(slot, beam))
    }

    pub fn cum_log_prob(&self, slot: usize, beam: usize) -> Option<f32> {
        self.beam_index(slot, beam).map(|idx| self.cum_log_probs[idx])
    }

    pub fn cum_log_probs(&self, slot: usize) -> &[f32] {
        let base = slot.min(self.max_batch_size) * self.max_beam_width;
        &self.cum_log_probs[base..base + self.beam_width(slot)]
    }

    pub fn parent_id(&self, slot: usize, beam: usize, pos: usize) -> Option<usize> {
        self.cell_index(slot, beam, pos).map(|idx| self.parent_ids[idx])
    }

    pub fn output_id(&self, slot: usize, beam: usize, pos: usize) -> Option<TokenId> {
        self.cell_index(slot, beam, pos).map(|idx| self.output_ids[idx])
    }

    /// Check a step's outputs for `slot` without recording anything
    pub fn validate_step(&self, slot: usize, outputs: &[BeamStep]) -> Result<()> {
        self.check_slot(slot)?;
        let width = self.beam_width(slot);
        if width == 0 {
            return Err(EngineError::invalid_state(format!("slot {} is not initialised", slot)));
        }
        if outputs.len() != width {
            return Err(EngineError::invalid_argument(format!(
                "slot {} expects {} beam outputs, got {}",
                slot,
                width,
                outputs.len()
            )));
        }
        let finished_before = self.finished_mask(slot);
        for (beam, out) in outputs.iter().enumerate() {
            if finished_before[beam] {
                continue;
            }
            if out.parent >= width || finished_before[out.parent] {
                return Err(EngineError::invalid_argument(format!(
                    "slot {} beam {} has parent {} which was not an active beam",
                    slot, beam, out.parent
                )));
            }
            if let Some(len) = self.sequence_length(slot, beam) {
                if len >= self.max_seq_len {
                    return Err(EngineError::invariant(format!(
                        "slot {} beam {} already holds {} tokens",
                        slot, beam, len
                    )));
                }
            }
        }
        Ok(())
    }

    /// Record one step for `slot`; beams finished before the step are left untouched
    pub fn commit(&mut self, slot: usize, outputs: &[BeamStep]) -> Result<()> {
        self.validate_step(slot, outputs)?;
        let finished_before = self.finished_mask(slot);
        let base = slot * self.max_beam_width;

        for (beam, out) in outputs.iter().enumerate() {
            if finished_before[beam] {
                continue;
            }
            let idx = base + beam;
            self.cum_log_probs[idx] = out.cum_log_prob;
            if let Some(finished) = &mut self.finished {
                finished[idx] = out.finished;
            }
            if let Some(lengths) = &mut self.sequence_lengths {
                let pos = lengths[idx];
                lengths[idx] += 1;
                let cell = idx * self.max_seq_len + pos;
                self.output_ids[cell] = out.token;
                self.parent_ids[cell] = out.parent;
                self.log_probs[cell] = out.log_prob;
            }
        }
        Ok(())
    }

    /// Reconstruct every beam's generated tokens by walking parents back from its last position.
    ///
    /// Beams shorter than the longest one are padded with the end id.
    pub fn gather_tree(&self, slot: usize) -> Result<GatheredBeams> {
        self.check_slot(slot)?;
        if !self.buffers.sequence_lengths {
            return Err(EngineError::configuration(
                "gathering beams needs a sequence length buffer",
            ));
        }
        let width = self.beam_width(slot);
        let input_len = self.input_length(slot);
        let mut gathered = GatheredBeams::default();

        for beam in 0..width {
            let seq_len = self.sequence_length(slot, beam).unwrap_or(input_len);
            let mut tokens = Vec::with_capacity(seq_len - input_len);
            let mut log_probs = Vec::with_capacity(seq_len - input_len);
            let mut current = beam;
            for pos in (input_len..seq_len).rev() {
                let cell = self.cell_index(slot, current, pos).ok_or_else(|| {
                    EngineError::invariant(format!("lineage of slot {} left the arena at {}", slot, pos))
                })?;
                tokens.push(self.output_ids[cell]);
                log_probs.push(self.log_probs[cell]);
                current = self.parent_ids[cell];
                if current >= width {
                    return Err(EngineError::invariant(format!(
                        "slot {} position {} has parent {} outside beam width {}",
                        slot, pos, current, width
                    )));
                }
            }
            tokens.reverse();
            log_probs.reverse();
            gathered.tokens.push(tokens);
            gathered.log_probs.push(log_probs);
        }

        let longest = gathered.tokens.iter().map(Vec::len).max().unwrap_or(0);
        let pad = self.end_id(slot).unwrap_or_default();
        for (tokens, log_probs) in gathered.tokens.iter_mut().zip(&mut gathered.log_probs) {
            tokens.resize(longest, pad);
            log_probs.resize(longest, 0.0);
        }
        Ok(gathered)
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.max_batch_size {
            return Err(EngineError::invalid_argument(format!(
                "slot {} outside batch of {}",
                slot, self.max_batch_size
            )));
        }
        Ok(())
    }

    fn beam_index(&self, slot: usize, beam: usize) -> Option<usize> {
        (slot < self.max_batch_size && beam < self.max_beam_width).then(|| slot * self.max_beam_width + beam)
    }

    fn cell_index(&self, slot: usize, beam: usize, pos: usize) -> Option<usize> {
        let idx = self.beam_index(slot, beam)?;
        (pos < self.max_seq_len).then(|| idx * self.max_seq_len + pos)
    }
}

fn check_broadcast<T>(name: &str, values: Option<&[T]>, batch_size: usize) -> Result<()> {
    match values {
        Some(v) if v.len() != 1 && v.len() != batch_size => Err(EngineError::invalid_argument(format!(
            "{} takes 1 or {} values, got {}",
            name,
            batch_size,
            v.len()
        ))),
        _ => Ok(()),
    }
}

fn broadcast<T: Copy>(values: Option<&[T]>, i: usize) -> Option<T> {
    values.map(|v| if v.len() == 1 { v[0] } else { v[i] })
}
