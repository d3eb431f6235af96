//! Contract between the scheduler and the external compute step
//!
//! The scheduler hands the compute step an immutable snapshot of the batch and
//! gets back, per token-producing slot, one [`BeamStep`] per beam. Nothing is
//! committed until every output has been validated.

use crate::beam::{BeamHypotheses, BeamStep};
use crate::cache_indirection::CacheIndirection;
use crate::request::{Request, RequestId};
use crate::tensor::TensorPtr;

/// What a batch entry asks of the compute step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// Process prompt positions `start..start + len`
    Context { start: usize, len: usize, is_last: bool },
    /// Produce one token per beam, after verifying any draft tokens
    Generation,
}

#[derive(Debug)]
pub struct SlotInput<'a> {
    pub request: &'a Request,
    pub slot: usize,
    pub phase: StepPhase,
}

impl SlotInput<'_> {
    pub fn request_id(&self) -> RequestId {
        self.request.id()
    }

    /// Last context chunks and generation entries produce tokens
    pub fn produces_tokens(&self) -> bool {
        match self.phase {
            StepPhase::Context { is_last, .. } => is_last,
            StepPhase::Generation => true,
        }
    }

    /// Tokens this entry costs against the step budget
    pub fn num_tokens(&self) -> usize {
        match self.phase {
            StepPhase::Context { len, .. } => len,
            StepPhase::Generation => self.request.beam_width() * (1 + self.request.draft_tokens().len()),
        }
    }
}

#[derive(Debug)]
pub struct StepInputs<'a> {
    pub step: u64,
    pub entries: Vec<SlotInput<'a>>,
    /// Requests retired since the previous step; per-request state kept by
    /// the compute step can be dropped for these
    pub retired: &'a [RequestId],
    pub hypotheses: &'a BeamHypotheses,
    pub indirection: &'a CacheIndirection,
}

impl StepInputs<'_> {
    pub fn num_tokens(&self) -> usize {
        self.entries.iter().map(SlotInput::num_tokens).sum()
    }

    pub fn num_context_entries(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.phase, StepPhase::Context { .. }))
            .count()
    }

    pub fn num_generation_entries(&self) -> usize {
        self.entries.len() - self.num_context_entries()
    }
}

/// Result for one token-producing slot
#[derive(Debug, Clone, Default)]
pub struct SlotOutput {
    pub slot: usize,
    /// One step per beam
    pub beams: Vec<BeamStep>,
    /// Draft tokens accepted before `beams`, oldest first; single-beam only
    pub accepted_drafts: Vec<BeamStep>,
    /// The compute step decided no remaining beam can improve the result
    pub request_done: bool,
    pub context_logits: Option<TensorPtr>,
    pub generation_logits: Option<TensorPtr>,
}

#[derive(Debug, Clone, Default)]
pub struct StepOutputs {
    pub slots: Vec<SlotOutput>,
}

/// The external numeric step: attention, logits, sampling, beam selection
pub trait ComputeStep {
    /// Process exactly the given batch
    fn execute(&mut self, inputs: &StepInputs<'_>) -> anyhow::Result<StepOutputs>;
}

impl<F> ComputeStep for F
where
    F: FnMut(&StepInputs<'_>) -> anyhow::Result<StepOutputs>,
{
    fn execute(&mut self, inputs: &StepInputs<'_>) -> anyhow::Result<StepOutputs> {
        self(inputs)
    }
}
