use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::beam::BeamStep;
use crate::compute::{ComputeStep, SlotInput, SlotOutput, StepInputs, StepOutputs, StepPhase};
use crate::config::{RequestConfig, SchedulerConfig};
use crate::decoding::DecodingState;
use crate::error::{EngineError, Result};
use crate::request::{FinishReason, Request, RequestId, TokenId};
use crate::slots::{SlotAllocator, SlotStats};

/// Tokens (and optionally log probs) delivered to a request's consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub request_id: RequestId,
    /// Per beam. Streaming single-beam responses carry only the new tokens,
    /// every other response carries everything after the original prompt.
    pub beams: Vec<Vec<TokenId>>,
    pub log_probs: Option<Vec<Vec<f32>>>,
    pub cum_log_probs: Vec<f32>,
    pub is_final: bool,
    pub finish_reason: Option<FinishReason>,
    pub error: Option<String>,
}

/// Returned by [`Scheduler::add_request`]
#[derive(Debug)]
pub struct RequestHandle {
    pub id: RequestId,
    pub responses: mpsc::UnboundedReceiver<Response>,
}

/// What one call to [`Scheduler::step`] did
#[derive(Debug, Default)]
pub struct StepReport {
    pub step: u64,
    pub context_requests: Vec<RequestId>,
    pub generation_requests: Vec<RequestId>,
    pub num_tokens: usize,
    pub completed: Vec<RequestId>,
    pub failed: Vec<(RequestId, EngineError)>,
    pub paused: Vec<RequestId>,
    /// Requests still waiting for a slot
    pub waiting: usize,
}

impl StepReport {
    /// Nothing was handed to the compute step
    pub fn is_idle(&self) -> bool {
        self.context_requests.is_empty() && self.generation_requests.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub admitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
    pub paused: u64,
    pub steps: u64,
    pub generated_tokens: u64,
    pub active: usize,
    pub waiting: usize,
    pub slots: SlotStats,
}

/// Request scheduler with continuous batching
/// Owns every live request, the slot table and the per-slot decoding arena,
/// and drives one compute step at a time.
///
/// Retired requests are held until [`Scheduler::take_completed`] drains them;
/// long-running callers must drain regularly.
pub struct Scheduler {
    config: SchedulerConfig,
    /// Live requests in admission order
    requests: BTreeMap<RequestId, Request>,
    senders: HashMap<RequestId, mpsc::UnboundedSender<Response>>,
    /// Retired requests not yet collected by the caller, in retirement order
    completed: Vec<Request>,
    completed_index: HashMap<RequestId, usize>,
    /// Retired since the last compute step
    retired: Vec<RequestId>,
    slots: SlotAllocator,
    decoding: DecodingState,
    next_id: RequestId,
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let decoding = DecodingState::new(&config)?;
        info!(
            "Scheduler ready: {} slots, beam width <= {}, max sequence {}",
            config.max_batch_size, config.max_beam_width, config.max_seq_len
        );
        Ok(Self {
            slots: SlotAllocator::new(config.max_batch_size),
            decoding,
            config,
            requests: BTreeMap::new(),
            senders: HashMap::new(),
            completed: Vec::new(),
            completed_index: HashMap::new(),
            retired: Vec::new(),
            next_id: 0,
            stats: SchedulerStats::default(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn decoding(&self) -> &DecodingState {
        &self.decoding
    }

    /// Validate and admit a request; nothing is consumed if validation fails
    pub fn add_request(&mut self, prompt: Vec<TokenId>, config: RequestConfig) -> Result<RequestHandle> {
        if prompt.len() > self.config.max_input_len {
            return Err(EngineError::invalid_argument(format!(
                "prompt of {} tokens exceeds max input length {}",
                prompt.len(),
                self.config.max_input_len
            )));
        }
        if config.max_new_tokens == 0 {
            return Err(EngineError::invalid_argument("max_new_tokens must be positive"));
        }
        if prompt.len() + config.max_new_tokens > self.config.max_seq_len {
            return Err(EngineError::invalid_argument(format!(
                "{} prompt + {} new tokens exceed max sequence length {}",
                prompt.len(),
                config.max_new_tokens,
                self.config.max_seq_len
            )));
        }
        if let Some(budget) = self.config.max_num_tokens {
            let draft_len = config.draft_tokens.as_ref().map_or(0, Vec::len);
            let generation_cost = config.sampling.beam_width * (1 + draft_len);
            if generation_cost > budget || (!self.config.enable_chunked_context && prompt.len() > budget) {
                return Err(EngineError::invalid_argument(format!(
                    "request never fits the step budget of {} tokens",
                    budget
                )));
            }
        }
        if config.sampling.beam_width > self.config.max_beam_width {
            return Err(EngineError::configuration(format!(
                "beam width {} exceeds the configured maximum {}",
                config.sampling.beam_width, self.config.max_beam_width
            )));
        }

        let id = self.next_id;
        let request = Request::new(id, prompt, config)?;
        self.next_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        debug!(
            "Adding request {} ({} prompt tokens, beam width {})",
            id,
            request.prompt_len(),
            request.beam_width()
        );
        self.requests.insert(id, request);
        self.senders.insert(id, tx);
        self.stats.admitted += 1;
        Ok(RequestHandle { id, responses: rx })
    }

    /// Look up a live or retired request
    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(&id).or_else(|| {
            self.completed_index
                .get(&id)
                .and_then(|&index| self.completed.get(index))
        })
    }

    /// Drain retired requests
    pub fn take_completed(&mut self) -> Vec<Request> {
        self.completed_index.clear();
        std::mem::take(&mut self.completed)
    }

    pub fn num_completed(&self) -> usize {
        self.completed.len()
    }

    pub fn num_active(&self) -> usize {
        self.requests.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.requests.values().filter(|r| r.slot().is_none()).count()
    }

    pub fn has_work(&self) -> bool {
        !self.requests.is_empty()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            active: self.num_active(),
            waiting: self.num_waiting(),
            slots: self.slots.stats(),
            ..self.stats
        }
    }

    /// Evict a request from its slot; it resumes from the context phase later
    pub fn pause(&mut self, id: RequestId) -> Result<()> {
        let max_input_len = self.resume_prompt_cap();
        let request = self.requests.get_mut(&id).ok_or(EngineError::RequestNotFound(id))?;
        let slot = request.slot();
        request.pause(max_input_len)?;
        if let Some(slot) = slot {
            self.slots.release(slot, &mut self.decoding)?;
        }
        self.stats.paused += 1;
        Ok(())
    }

    /// Cancel a live request and deliver what it produced so far
    pub fn abort(&mut self, id: RequestId) -> Result<()> {
        let request = self.requests.get_mut(&id).ok_or(EngineError::RequestNotFound(id))?;
        request.complete(FinishReason::Cancelled)?;
        debug!("Aborted request {}", id);
        self.stats.aborted += 1;
        self.deliver(id)?;
        self.retire(id)
    }

    /// Longest prompt a paused request may resume with. Without chunking the
    /// whole prompt goes in one step, so it must also fit the step budget.
    fn resume_prompt_cap(&self) -> usize {
        match self.config.max_num_tokens {
            Some(budget) if !self.config.enable_chunked_context => budget.min(self.config.max_input_len),
            _ => self.config.max_input_len,
        }
    }

    /// Attach draft tokens for the request's next generation step
    pub fn set_draft_tokens(&mut self, id: RequestId, draft_tokens: Vec<TokenId>) -> Result<()> {
        let budget = self.config.max_num_tokens;
        let request = self.requests.get_mut(&id).ok_or(EngineError::RequestNotFound(id))?;
        if let Some(budget) = budget {
            let cost = request.beam_width() * (1 + draft_tokens.len());
            if cost > budget {
                return Err(EngineError::invalid_argument(format!(
                    "{} draft tokens do not fit the step budget of {} tokens",
                    draft_tokens.len(),
                    budget
                )));
            }
        }
        request.set_draft_tokens(draft_tokens)
    }

    /// Run one batched step through `compute`
    pub fn step(&mut self, compute: &mut dyn ComputeStep) -> Result<StepReport> {
        let mut report = StepReport::default();
        self.assign_slots(&mut report)?;

        let batch = self.assemble_batch()?;
        report.waiting = self.num_waiting();
        if batch.is_empty() {
            return Ok(report);
        }

        let retired = std::mem::take(&mut self.retired);
        self.stats.steps += 1;
        report.step = self.stats.steps;
        for &(id, phase) in &batch {
            match phase {
                StepPhase::Context { .. } => report.context_requests.push(id),
                StepPhase::Generation => report.generation_requests.push(id),
            }
        }

        let result = {
            let inputs = self.snapshot(&batch, &retired, report.step)?;
            report.num_tokens = inputs.num_tokens();
            debug!(
                "Step {}: {} context, {} generation, {} tokens",
                report.step,
                inputs.num_context_entries(),
                inputs.num_generation_entries(),
                report.num_tokens
            );
            compute
                .execute(&inputs)
                .and_then(|outputs| self.validate_outputs(&batch, outputs))
        };

        match result {
            Ok(outputs) => self.commit(&batch, outputs, &mut report)?,
            Err(err) => self.fail_batch(&batch, err, &mut report)?,
        }
        Ok(report)
    }

    /// Live requests by descending priority, then admission order
    fn priority_order(&self) -> Vec<RequestId> {
        let mut order: Vec<(Reverse<u32>, RequestId)> = self
            .requests
            .values()
            .map(|r| (Reverse(r.priority()), r.id()))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, id)| id).collect()
    }

    /// Give waiting requests a slot in priority order
    fn assign_slots(&mut self, report: &mut StepReport) -> Result<()> {
        let waiting: Vec<RequestId> = self
            .priority_order()
            .into_iter()
            .filter(|id| {
                self.requests
                    .get(id)
                    .is_some_and(|r| r.is_context_init_state() && r.slot().is_none())
            })
            .collect();

        for id in waiting {
            let slot = match self.slots.acquire(id) {
                Ok(slot) => slot,
                Err(EngineError::NoCapacity { .. }) if self.config.preempt_lower_priority => {
                    match self.preemption_victim(id) {
                        Some(victim) => {
                            warn!("Preempting request {} for higher-priority request {}", victim, id);
                            self.pause(victim)?;
                            report.paused.push(victim);
                            self.slots.acquire(id)?
                        }
                        None => break,
                    }
                }
                Err(EngineError::NoCapacity { .. }) => break,
                Err(err) => return Err(err),
            };

            let request = self
                .requests
                .get_mut(&id)
                .ok_or_else(|| EngineError::invariant(format!("request {} vanished", id)))?;
            request.assign_slot(slot)?;
            if let Err(err) = self.decoding.init_slot(slot, request) {
                request.take_slot();
                self.slots.release(slot, &mut self.decoding)?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Lowest-priority slot holder below `waiting`'s priority; the newest one on ties
    fn preemption_victim(&self, waiting: RequestId) -> Option<RequestId> {
        let priority = self.requests.get(&waiting)?.priority();
        self.requests
            .values()
            .filter(|r| r.slot().is_some() && r.priority() < priority)
            .min_by_key(|r| (r.priority(), Reverse(r.id())))
            .map(Request::id)
    }

    /// Pick the entries of this step within the token budget.
    ///
    /// Generation entries go first so running requests are never starved by
    /// incoming prompts.
    fn assemble_batch(&mut self) -> Result<Vec<(RequestId, StepPhase)>> {
        let mut budget = self.config.max_num_tokens.unwrap_or(usize::MAX);
        let mut batch = Vec::new();
        let order = self.priority_order();

        for id in &order {
            let request = self.live(*id)?;
            if request.slot().is_none() || !request.is_generation_in_progress_state() {
                continue;
            }
            let cost = request.beam_width() * (1 + request.draft_tokens().len());
            if cost > budget {
                continue;
            }
            budget -= cost;
            batch.push((request.id(), StepPhase::Generation));
        }

        let chunked = self.config.enable_chunked_context;
        let unit = self.config.context_chunk_unit;
        for id in &order {
            let request = self
                .requests
                .get_mut(id)
                .ok_or(EngineError::RequestNotFound(*id))?;
            if request.slot().is_none() || !request.is_context_init_state() {
                continue;
            }
            let remaining = request.context_remaining_length();
            if chunked {
                let mut chunk = remaining.min(budget);
                if chunk < remaining {
                    chunk -= chunk % unit;
                }
                if chunk == 0 {
                    continue;
                }
                request.set_context_chunk_size(chunk)?;
            } else if remaining > budget {
                continue;
            }

            let len = request.next_context_chunk_len();
            budget -= len;
            batch.push((
                request.id(),
                StepPhase::Context {
                    start: request.context_current_position(),
                    len,
                    is_last: request.is_last_context_chunk(),
                },
            ));
        }
        Ok(batch)
    }

    fn snapshot<'a>(
        &'a self,
        batch: &[(RequestId, StepPhase)],
        retired: &'a [RequestId],
        step: u64,
    ) -> Result<StepInputs<'a>> {
        let entries = batch
            .iter()
            .map(|&(id, phase)| {
                let request = self.live(id)?;
                let slot = request
                    .slot()
                    .ok_or_else(|| EngineError::invariant(format!("batched request {} has no slot", id)))?;
                Ok(SlotInput { request, slot, phase })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(StepInputs {
            step,
            entries,
            retired,
            hypotheses: self.decoding.hypotheses(),
            indirection: self.decoding.indirection(),
        })
    }

    /// Every token-producing entry has exactly one well-formed output, and nothing else does
    fn validate_outputs(
        &self,
        batch: &[(RequestId, StepPhase)],
        outputs: StepOutputs,
    ) -> anyhow::Result<HashMap<usize, SlotOutput>> {
        let mut by_slot = HashMap::with_capacity(outputs.slots.len());
        for output in outputs.slots {
            let slot = output.slot;
            if by_slot.insert(slot, output).is_some() {
                anyhow::bail!("duplicate output for slot {}", slot);
            }
        }

        let mut expected = 0;
        for &(id, phase) in batch {
            let produces = match phase {
                StepPhase::Context { is_last, .. } => is_last,
                StepPhase::Generation => true,
            };
            let request = self.live(id)?;
            let slot = request
                .slot()
                .ok_or_else(|| anyhow::anyhow!("batched request {} has no slot", id))?;
            let output = by_slot.get(&slot);
            if !produces {
                if output.is_some() {
                    anyhow::bail!("unexpected output for slot {} mid-context", slot);
                }
                continue;
            }
            expected += 1;
            let output = output.ok_or_else(|| anyhow::anyhow!("no output for slot {}", slot))?;
            self.validate_output(request, output)?;
        }

        if by_slot.len() != expected {
            anyhow::bail!("{} outputs for {} token-producing slots", by_slot.len(), expected);
        }
        Ok(by_slot)
    }

    fn validate_output(&self, request: &Request, output: &SlotOutput) -> anyhow::Result<()> {
        let drafts = output.accepted_drafts.len();
        if drafts > 0 {
            if request.beam_width() != 1 {
                anyhow::bail!("request {} accepted drafts with {} beams", request.id(), request.beam_width());
            }
            if drafts > request.draft_tokens().len() {
                anyhow::bail!(
                    "request {} accepted {} of {} draft tokens",
                    request.id(),
                    drafts,
                    request.draft_tokens().len()
                );
            }
            if output.accepted_drafts.iter().any(|d| d.parent != 0 || d.finished.is_finished()) {
                anyhow::bail!("request {} has a malformed accepted draft", request.id());
            }
        }
        if drafts + 1 > request.remaining_new_tokens() {
            anyhow::bail!(
                "request {} produced {} tokens with {} left in its budget",
                request.id(),
                drafts + 1,
                request.remaining_new_tokens()
            );
        }
        self.decoding.validate_step(output.slot, &output.beams)?;
        Ok(())
    }

    fn commit(
        &mut self,
        batch: &[(RequestId, StepPhase)],
        mut outputs: HashMap<usize, SlotOutput>,
        report: &mut StepReport,
    ) -> Result<()> {
        for &(id, phase) in batch {
            let request = self.live_mut(id)?;
            let slot = request
                .slot()
                .ok_or_else(|| EngineError::invariant(format!("batched request {} has no slot", id)))?;

            if let StepPhase::Context { .. } = phase {
                request.move_to_next_context_chunk()?;
            }
            let Some(output) = outputs.remove(&slot) else {
                continue;
            };

            self.commit_tokens(id, slot, output)?;
            self.deliver(id)?;
            if self.live(id)?.is_terminal() {
                report.completed.push(id);
                self.retire(id)?;
            }
        }
        Ok(())
    }

    fn commit_tokens(&mut self, id: RequestId, slot: usize, output: SlotOutput) -> Result<()> {
        for draft in &output.accepted_drafts {
            self.decoding.commit(slot, std::slice::from_ref(draft))?;
            self.commit_single_beam(id, draft)?;
        }
        self.decoding.commit(slot, &output.beams)?;

        let request = self
            .requests
            .get_mut(&id)
            .ok_or(EngineError::RequestNotFound(id))?;
        if request.beam_width() == 1 {
            let step = output.beams[0];
            self.commit_single_beam(id, &step)?;
        } else {
            let tokens: Vec<TokenId> = output.beams.iter().map(|b| b.token).collect();
            request.add_new_tokens(&tokens)?;
            let gathered = self.decoding.hypotheses().gather_tree(slot)?;
            request.set_generated_tokens(&gathered.tokens)?;
            if request.return_log_probs() {
                for (beam, log_probs) in gathered.log_probs.iter().enumerate() {
                    request.set_log_probs(beam, log_probs)?;
                }
            }
            for beam in 0..request.beam_width() {
                let cum = self.decoding.hypotheses().cum_log_prob(slot, beam).unwrap_or_default();
                request.set_cum_log_prob(beam, cum)?;
            }
        }
        self.stats.generated_tokens += (output.accepted_drafts.len() + 1) as u64;

        let request = self
            .requests
            .get_mut(&id)
            .ok_or(EngineError::RequestNotFound(id))?;
        if request.has_draft_tokens() {
            request.set_draft_tokens(Vec::new())?;
        }
        if let Some(logits) = output.context_logits.filter(|_| request.return_context_logits()) {
            request.set_context_logits_host(logits);
        }
        if let Some(logits) = output.generation_logits.filter(|_| request.return_generation_logits()) {
            request.add_generation_logits_fragment(logits);
        }

        let hypotheses = self.decoding.hypotheses();
        let beam_reason = (0..request.beam_width())
            .find_map(|beam| hypotheses.finished_state(slot, beam).and_then(|f| f.finish_reason()));
        let reason = if hypotheses.is_slot_done(slot) {
            beam_reason
        } else if output.request_done {
            Some(beam_reason.unwrap_or(FinishReason::Converged))
        } else if request.remaining_new_tokens() == 0 {
            Some(FinishReason::Length)
        } else {
            None
        };
        if let Some(reason) = reason {
            request.complete(reason)?;
            self.stats.completed += 1;
        }
        Ok(())
    }

    fn commit_single_beam(&mut self, id: RequestId, step: &BeamStep) -> Result<()> {
        let request = self.live_mut(id)?;
        request.add_new_tokens(&[step.token])?;
        if request.return_log_probs() {
            request.append_log_probs(0, &[step.log_prob])?;
        }
        request.set_cum_log_prob(0, step.cum_log_prob)
    }

    /// Fail every request of the step; tokens produced before the step are kept
    fn fail_batch(
        &mut self,
        batch: &[(RequestId, StepPhase)],
        err: anyhow::Error,
        report: &mut StepReport,
    ) -> Result<()> {
        warn!("Step {} failed for {} requests: {:#}", report.step, batch.len(), err);
        let err = Arc::new(err);
        for &(id, _) in batch {
            self.live_mut(id)?.fail(err.to_string());
            self.stats.failed += 1;
            self.deliver(id)?;
            self.retire(id)?;
            report.failed.push((id, EngineError::ComputeStep(err.clone())));
        }
        Ok(())
    }

    /// Send whatever the request's consumer is due
    fn deliver(&mut self, id: RequestId) -> Result<()> {
        let request = self.live_mut(id)?;
        let is_final = request.is_terminal();
        if !request.is_streaming() && !is_final {
            return Ok(());
        }

        let (beams, log_probs) = if request.is_streaming() && request.beam_width() == 1 {
            let tokens = request.tokens(0)?;
            let start = request.max_sent_token_pos() + 1;
            let new_tokens = tokens.get(start..).unwrap_or_default().to_vec();
            if !new_tokens.is_empty() {
                request.set_max_sent_token_pos(start + new_tokens.len() - 1)?;
            } else if !is_final {
                return Ok(());
            }
            let log_probs = request.return_log_probs().then(|| {
                let all = request.all_log_probs()[0].as_slice();
                vec![all[all.len().saturating_sub(new_tokens.len())..].to_vec()]
            });
            (vec![new_tokens], log_probs)
        } else {
            let beams = (0..request.beam_width())
                .map(|beam| request.output_tokens(beam).map(<[TokenId]>::to_vec))
                .collect::<Result<Vec<_>>>()?;
            let log_probs = request
                .return_log_probs()
                .then(|| request.all_log_probs().to_vec());
            (beams, log_probs)
        };

        let response = Response {
            request_id: id,
            beams,
            log_probs,
            cum_log_probs: request.cum_log_probs().to_vec(),
            is_final,
            finish_reason: request.finish_reason(),
            error: request.error().map(str::to_owned),
        };
        if let Some(tx) = self.senders.get(&id) {
            // The consumer may have gone away; the request still runs to completion
            let _ = tx.send(response);
        }
        Ok(())
    }

    /// Free the slot of a terminal request and move it to the completed list
    fn retire(&mut self, id: RequestId) -> Result<()> {
        let mut request = self.requests.remove(&id).ok_or(EngineError::RequestNotFound(id))?;
        if let Some(slot) = request.take_slot() {
            self.slots.release(slot, &mut self.decoding)?;
        }
        if let Err(err) = request.merge_generation_logits_fragments() {
            warn!("Dropping generation logits of request {}: {}", id, err);
            request.clear_generation_logits_fragments();
        }
        self.senders.remove(&id);
        self.retired.push(id);
        info!(
            "Request {} finished ({:?}), {} tokens generated",
            id,
            request.finish_reason(),
            request.max_beam_num_tokens() - request.orig_prompt_len()
        );
        self.completed_index.insert(id, self.completed.len());
        self.completed.push(request);
        Ok(())
    }

    fn live(&self, id: RequestId) -> Result<&Request> {
        self.requests.get(&id).ok_or(EngineError::RequestNotFound(id))
    }

    fn live_mut(&mut self, id: RequestId) -> Result<&mut Request> {
        self.requests.get_mut(&id).ok_or(EngineError::RequestNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::FinishedState;
    use crate::config::SamplingConfig;

    /// Every beam extends itself with a token derived from its length
    fn echo(inputs: &StepInputs<'_>) -> anyhow::Result<StepOutputs> {
        let slots = inputs
            .entries
            .iter()
            .filter(|e| e.produces_tokens())
            .map(|e| {
                let len = e.request.max_beam_num_tokens() as TokenId;
                SlotOutput {
                    slot: e.slot,
                    beams: (0..e.request.beam_width())
                        .map(|beam| BeamStep {
                            token: 100 + len,
                            log_prob: -0.5,
                            cum_log_prob: -0.5 * len as f32,
                            parent: beam,
                            finished: FinishedState::Unfinished,
                        })
                        .collect(),
                    ..Default::default()
                }
            })
            .collect();
        Ok(StepOutputs { slots })
    }

    fn scheduler(config: SchedulerConfig) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            max_input_len: 32,
            max_seq_len: 64,
            max_attention_window: 64,
            ..config
        })
        .unwrap()
    }

    #[test]
    fn test_add_request_validation() {
        let mut sched = scheduler(SchedulerConfig {
            max_beam_width: 2,
            ..Default::default()
        });
        let err = sched.add_request(vec![1; 33], RequestConfig::new(4)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        let err = sched.add_request(vec![1; 32], RequestConfig::new(33)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        let config = RequestConfig::new(4).with_sampling(SamplingConfig::beam_search(3));
        assert!(matches!(sched.add_request(vec![1], config), Err(EngineError::Configuration(_))));
        assert!(sched.add_request(vec![], RequestConfig::new(4)).is_err());
        assert_eq!(sched.stats().slots.free_slots, 8);

        let first = sched.add_request(vec![1, 2], RequestConfig::new(4)).unwrap();
        let second = sched.add_request(vec![3], RequestConfig::new(4)).unwrap();
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        assert_eq!(sched.num_waiting(), 2);
    }

    #[test]
    fn test_runs_to_length() {
        let mut sched = scheduler(SchedulerConfig::default());
        let mut handle = sched.add_request(vec![1, 2, 3, 4], RequestConfig::new(3)).unwrap();

        let report = sched.step(&mut echo).unwrap();
        assert_eq!(report.context_requests, vec![handle.id]);
        assert!(handle.responses.try_recv().is_err());

        sched.step(&mut echo).unwrap();
        let report = sched.step(&mut echo).unwrap();
        assert_eq!(report.completed, vec![handle.id]);
        assert!(!sched.has_work());

        let response = handle.responses.try_recv().unwrap();
        assert!(response.is_final);
        assert_eq!(response.finish_reason, Some(FinishReason::Length));
        assert_eq!(response.beams, vec![vec![104, 105, 106]]);

        let done = sched.take_completed();
        assert_eq!(done.len(), 1);
        assert!(done[0].is_generation_complete_state());
        assert_eq!(sched.stats().slots.free_slots, 8);
    }

    #[test]
    fn test_streaming_delivers_each_token_once() {
        let mut sched = scheduler(SchedulerConfig::default());
        let config = RequestConfig::new(3).with_streaming(true);
        let mut handle = sched.add_request(vec![1, 2], config).unwrap();
        while sched.has_work() {
            sched.step(&mut echo).unwrap();
        }
        let mut streamed = Vec::new();
        let mut finals = 0;
        while let Ok(response) = handle.responses.try_recv() {
            streamed.extend_from_slice(&response.beams[0]);
            finals += response.is_final as usize;
        }
        assert_eq!(streamed, vec![102, 103, 104]);
        assert_eq!(finals, 1);
    }

    #[test]
    fn test_idle_step() {
        let mut sched = scheduler(SchedulerConfig::default());
        let report = sched.step(&mut echo).unwrap();
        assert!(report.is_idle());
        assert_eq!(sched.stats().steps, 0);
    }

    #[test]
    fn test_preempts_lower_priority() {
        let mut sched = scheduler(SchedulerConfig {
            max_batch_size: 1,
            preempt_lower_priority: true,
            ..Default::default()
        });
        let low = sched.add_request(vec![1, 2, 3], RequestConfig::new(8)).unwrap();
        sched.step(&mut echo).unwrap();
        sched.step(&mut echo).unwrap();

        let high = sched
            .add_request(vec![4, 5], RequestConfig::new(2).with_priority(5))
            .unwrap();
        let report = sched.step(&mut echo).unwrap();
        assert_eq!(report.paused, vec![low.id]);
        assert_eq!(report.context_requests, vec![high.id]);

        let paused = sched.request(low.id).unwrap();
        assert!(paused.is_context_init_state());
        assert_eq!(paused.prompt_len(), 5);
        assert_eq!(paused.max_new_tokens(), 6);
    }

    #[test]
    fn test_preempted_request_resumes_within_budget() {
        let mut sched = Scheduler::new(SchedulerConfig {
            max_batch_size: 1,
            max_input_len: 16,
            max_seq_len: 16,
            max_attention_window: 16,
            max_num_tokens: Some(6),
            preempt_lower_priority: true,
            ..Default::default()
        })
        .unwrap();
        let low = sched.add_request(vec![1; 5], RequestConfig::new(8)).unwrap();
        for _ in 0..3 {
            sched.step(&mut echo).unwrap();
        }
        assert_eq!(sched.request(low.id).unwrap().max_num_generated_tokens(), 3);

        sched
            .add_request(vec![2, 3], RequestConfig::new(2).with_priority(5))
            .unwrap();
        let report = sched.step(&mut echo).unwrap();
        assert_eq!(report.paused, vec![low.id]);

        // the whole resumed prompt must fit one unchunked step
        let paused = sched.request(low.id).unwrap();
        assert_eq!(paused.prompt_len(), 6);
        assert_eq!(paused.max_new_tokens(), 7);

        for _ in 0..32 {
            if !sched.has_work() {
                break;
            }
            sched.step(&mut echo).unwrap();
        }
        assert!(!sched.has_work());
        let low = sched.request(low.id).unwrap();
        assert_eq!(low.finish_reason(), Some(FinishReason::Length));
        assert_eq!(low.output_tokens(0).unwrap().len(), 8);
    }

    #[test]
    fn test_streaming_survives_preemption() {
        let mut sched = Scheduler::new(SchedulerConfig {
            max_batch_size: 1,
            max_input_len: 6,
            max_seq_len: 16,
            max_attention_window: 16,
            preempt_lower_priority: true,
            ..Default::default()
        })
        .unwrap();
        let mut low = sched
            .add_request(vec![1, 2, 3, 4], RequestConfig::new(8).with_streaming(true))
            .unwrap();
        for _ in 0..4 {
            sched.step(&mut echo).unwrap();
        }
        assert_eq!(sched.request(low.id).unwrap().max_sent_token_pos(), 7);

        sched
            .add_request(vec![9], RequestConfig::new(2).with_priority(5))
            .unwrap();
        let report = sched.step(&mut echo).unwrap();
        assert_eq!(report.paused, vec![low.id]);
        let paused = sched.request(low.id).unwrap();
        assert_eq!(paused.prompt_len(), 6);
        assert_eq!(paused.max_sent_token_pos(), 7);

        while sched.has_work() {
            sched.step(&mut echo).unwrap();
        }

        let mut streamed = Vec::new();
        let mut finals = 0;
        while let Ok(response) = low.responses.try_recv() {
            streamed.extend_from_slice(&response.beams[0]);
            finals += response.is_final as usize;
        }
        assert_eq!(streamed, (104..112).collect::<Vec<TokenId>>());
        assert_eq!(finals, 1);
        let done = sched.request(low.id).unwrap();
        assert_eq!(done.output_tokens(0).unwrap(), streamed.as_slice());
    }

    #[test]
    fn test_completed_lookup_until_drained() {
        let mut sched = scheduler(SchedulerConfig::default());
        let ids: Vec<RequestId> = (0..3)
            .map(|i| sched.add_request(vec![1; i + 1], RequestConfig::new(2)).unwrap().id)
            .collect();
        while sched.has_work() {
            sched.step(&mut echo).unwrap();
        }
        assert_eq!(sched.num_completed(), 3);
        for &id in &ids {
            assert!(sched.request(id).unwrap().is_generation_complete_state());
        }

        let done = sched.take_completed();
        assert_eq!(done.iter().map(Request::id).collect::<Vec<_>>(), ids);
        assert_eq!(sched.num_completed(), 0);
        assert!(ids.iter().all(|&id| sched.request(id).is_none()));
    }

    #[test]
    fn test_waits_without_preemption() {
        let mut sched = scheduler(SchedulerConfig {
            max_batch_size: 1,
            ..Default::default()
        });
        let first = sched.add_request(vec![1], RequestConfig::new(2)).unwrap();
        let second = sched
            .add_request(vec![2], RequestConfig::new(2).with_priority(9))
            .unwrap();
        // the higher-priority request takes the only slot first
        let report = sched.step(&mut echo).unwrap();
        assert_eq!(report.context_requests, vec![second.id]);
        assert_eq!(report.waiting, 1);
        assert!(report.paused.is_empty());

        sched.step(&mut echo).unwrap();
        let report = sched.step(&mut echo).unwrap();
        assert_eq!(report.context_requests, vec![first.id]);
    }

    #[test]
    fn test_abort_and_pause_unknown() {
        let mut sched = scheduler(SchedulerConfig::default());
        let mut handle = sched.add_request(vec![1, 2], RequestConfig::new(4)).unwrap();
        sched.step(&mut echo).unwrap();
        sched.abort(handle.id).unwrap();

        let response = handle.responses.try_recv().unwrap();
        assert_eq!(response.finish_reason, Some(FinishReason::Cancelled));
        assert_eq!(response.beams, vec![vec![102]]);
        assert_eq!(sched.stats().slots.free_slots, 8);
        assert!(matches!(sched.abort(handle.id), Err(EngineError::RequestNotFound(_))));
        assert!(matches!(sched.pause(77), Err(EngineError::RequestNotFound(77))));
    }

    #[test]
    fn test_missing_output_fails_step() {
        let mut sched = scheduler(SchedulerConfig::default());
        let mut handle = sched.add_request(vec![1, 2], RequestConfig::new(4)).unwrap();
        let mut silent = |_: &StepInputs<'_>| -> anyhow::Result<StepOutputs> { Ok(StepOutputs::default()) };
        let report = sched.step(&mut silent).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, EngineError::ComputeStep(_)));
        let response = handle.responses.try_recv().unwrap();
        assert_eq!(response.finish_reason, Some(FinishReason::Error));
        assert!(response.error.is_some());
    }
}
