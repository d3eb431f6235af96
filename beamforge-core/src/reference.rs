//! Reference host decoder
//!
//! A CPU implementation of [`ComputeStep`] over a deterministic pseudo-model:
//! the logits for a position depend only on the decoder seed, the previous
//! token and the position. It drives the scheduler end to end without a real
//! model and makes no numeric claims.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::beam::{BeamHypotheses, BeamStep, FinishedState, INACTIVE_BEAM_LOG_PROB};
use crate::compute::{ComputeStep, SlotInput, SlotOutput, StepInputs, StepOutputs, StepPhase};
use crate::config::{EarlyStopping, SamplingConfig};
use crate::request::{RequestId, TokenId};
use crate::tensor::{HostTensor, TensorPtr};

#[derive(Debug, Clone)]
pub struct ReferenceConfig {
    pub vocab_size: usize,
    pub seed: u64,
    /// Attach context and generation logits to every output
    pub capture_logits: bool,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            seed: 42,
            capture_logits: false,
        }
    }
}

/// Token sampler with configurable parameters
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sample a token from a probability distribution
    pub fn sample(&mut self, probs: &[f32], sampling: &SamplingConfig) -> TokenId {
        if sampling.top_k == Some(1) || sampling.temperature == Some(0.0) {
            argmax(probs)
        } else if let Some(top_p) = sampling.top_p {
            self.sample_top_p(probs, top_p)
        } else if let Some(top_k) = sampling.top_k {
            self.sample_top_k(probs, top_k)
        } else {
            self.sample_multinomial(probs)
        }
    }

    fn sample_top_p(&mut self, probs: &[f32], top_p: f32) -> TokenId {
        let indexed = sorted_desc(probs);

        let mut cumsum = 0.0;
        let mut cutoff = indexed.len();
        for (i, (_, p)) in indexed.iter().enumerate() {
            cumsum += p;
            if cumsum >= top_p {
                cutoff = i + 1;
                break;
            }
        }
        self.pick(&indexed[..cutoff])
    }

    fn sample_top_k(&mut self, probs: &[f32], top_k: usize) -> TokenId {
        let mut indexed = sorted_desc(probs);
        indexed.truncate(top_k);
        self.pick(&indexed)
    }

    fn sample_multinomial(&mut self, probs: &[f32]) -> TokenId {
        let indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        self.pick(&indexed)
    }

    fn pick(&mut self, candidates: &[(usize, f32)]) -> TokenId {
        let sum: f32 = candidates.iter().map(|(_, p)| p).sum();
        let r = self.rng.gen::<f32>() * sum;
        let mut cumsum = 0.0;
        for &(idx, p) in candidates {
            cumsum += p;
            if cumsum >= r {
                return idx as TokenId;
            }
        }
        candidates.last().map_or(0, |&(idx, _)| idx as TokenId)
    }
}

pub struct ReferenceDecoder {
    config: ReferenceConfig,
    device: Device,
    /// One sampler per request for its whole life, so seeded sampling
    /// continues the same stream across preemption
    samplers: HashMap<RequestId, Sampler>,
}

impl ReferenceDecoder {
    pub fn new(config: ReferenceConfig) -> Self {
        Self {
            config,
            device: Device::Cpu,
            samplers: HashMap::new(),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    /// Requests holding sampler state
    pub fn num_samplers(&self) -> usize {
        self.samplers.len()
    }

    /// Raw logits the pseudo-model produces after `prev` at `pos`
    pub fn logits(&self, prev: TokenId, pos: usize) -> Vec<f32> {
        let seed = self.config.seed
            ^ (prev as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (pos as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        let mut rng = StdRng::seed_from_u64(seed);
        (0..self.config.vocab_size).map(|_| rng.gen_range(-4.0f32..4.0)).collect()
    }

    /// Log-softmax over `logits` after temperature scaling
    fn log_probs(&self, logits: &[f32], temperature: Option<f32>) -> Result<Vec<f32>> {
        let logits = Tensor::from_vec(logits.to_vec(), logits.len(), &self.device)?;
        let logits = match temperature {
            Some(t) if t > 0.0 && t != 1.0 => (logits / t as f64)?,
            _ => logits,
        };
        Ok(candle_nn::ops::log_softmax(&logits, 0)?.to_vec1::<f32>()?)
    }

    fn capture(&self, rows: &[Vec<f32>]) -> Result<Option<TensorPtr>> {
        if !self.config.capture_logits || rows.is_empty() {
            return Ok(None);
        }
        let data = rows.concat();
        let tensor = HostTensor::new(vec![rows.len(), self.config.vocab_size], data)?;
        Ok(Some(Arc::new(tensor)))
    }

    fn decode_single(&mut self, input: &SlotInput<'_>, hyps: &BeamHypotheses) -> Result<SlotOutput> {
        let request = input.request;
        let sampling = request.sampling();
        let end_id = request.end_id();
        let tokens = request.tokens(0)?;
        let mut prev = *tokens.last().ok_or_else(|| anyhow!("request {} has no tokens", request.id()))?;
        let mut pos = tokens.len();
        let mut cum = hyps.cum_log_prob(input.slot, 0).unwrap_or(0.0);
        let mut budget = request.remaining_new_tokens();
        let mut rows = Vec::new();

        // Greedy verification: accept drafts while they match the argmax
        let mut accepted = Vec::new();
        if input.phase == StepPhase::Generation {
            for &draft in request.draft_tokens() {
                if budget <= 1 || Some(draft) == end_id {
                    break;
                }
                let logits = self.logits(prev, pos);
                let lp = self.log_probs(&logits, None)?;
                if argmax(&lp) != draft {
                    break;
                }
                let log_prob = lp[draft as usize];
                cum += log_prob;
                accepted.push(BeamStep {
                    token: draft,
                    log_prob,
                    cum_log_prob: cum,
                    parent: 0,
                    finished: FinishedState::Unfinished,
                });
                rows.push(logits);
                prev = draft;
                pos += 1;
                budget -= 1;
            }
        }

        let logits = self.logits(prev, pos);
        let lp = self.log_probs(&logits, sampling.temperature)?;
        rows.push(logits);
        let probs: Vec<f32> = lp.iter().map(|l| l.exp()).collect();
        let seed = sampling.random_seed.unwrap_or(self.config.seed ^ request.id());
        let token = self
            .samplers
            .entry(request.id())
            .or_insert_with(|| Sampler::new(seed))
            .sample(&probs, sampling);
        let log_prob = lp[token as usize];

        let finished = if Some(token) == end_id {
            FinishedState::EndId
        } else if budget <= 1 {
            FinishedState::Length
        } else {
            FinishedState::Unfinished
        };

        let mut output = SlotOutput {
            slot: input.slot,
            beams: vec![BeamStep {
                token,
                log_prob,
                cum_log_prob: cum + log_prob,
                parent: 0,
                finished,
            }],
            accepted_drafts: accepted,
            ..Default::default()
        };
        self.attach_logits(&mut output, input.phase, &rows)?;
        Ok(output)
    }

    fn decode_beams(&self, input: &SlotInput<'_>, hyps: &BeamHypotheses) -> Result<SlotOutput> {
        let request = input.request;
        let slot = input.slot;
        let width = request.beam_width();
        let end_id = request.end_id();
        let knobs = hyps.knobs(slot);
        let finished_before = hyps.finished_mask(slot);
        let active: Vec<usize> = (0..width).filter(|&b| !finished_before[b]).collect();

        let mut candidates = Vec::new();
        let mut rows = Vec::with_capacity(active.len());
        for &beam in &active {
            let tokens = request.tokens(beam)?;
            let prev = *tokens.last().ok_or_else(|| anyhow!("beam {} has no tokens", beam))?;
            let logits = self.logits(prev, tokens.len());
            let lp = self.log_probs(&logits, request.sampling().temperature)?;
            rows.push(logits);

            let cum = hyps.cum_log_prob(slot, beam).unwrap_or(INACTIVE_BEAM_LOG_PROB);
            let mut ranked: Vec<usize> = (0..lp.len()).collect();
            ranked.sort_by(|&a, &b| lp[b].total_cmp(&lp[a]));
            ranked.truncate(width);
            for (rank, token) in ranked.into_iter().enumerate() {
                candidates.push(Candidate {
                    beam,
                    token: token as TokenId,
                    log_prob: lp[token],
                    cum_log_prob: cum + lp[token],
                    score: cum + lp[token] - knobs.diversity_rate * rank as f32,
                });
            }
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(active.len());

        let input_len = hyps.input_length(slot);
        let limit = hyps.sequence_limit_length(slot);
        let generated = |beam: usize| hyps.sequence_length(slot, beam).unwrap_or(input_len) - input_len;

        // Finished beams are frozen; their outputs are ignored on commit
        let mut beams: Vec<BeamStep> = (0..width)
            .map(|beam| BeamStep {
                token: end_id.unwrap_or_default(),
                log_prob: 0.0,
                cum_log_prob: hyps.cum_log_prob(slot, beam).unwrap_or(0.0),
                parent: beam,
                finished: hyps.finished_state(slot, beam).unwrap_or_default(),
            })
            .collect();
        for (&beam, cand) in active.iter().zip(&candidates) {
            let new_len = input_len + generated(cand.beam) + 1;
            let finished = if Some(cand.token) == end_id {
                FinishedState::EndId
            } else if new_len >= limit {
                FinishedState::Length
            } else {
                FinishedState::Unfinished
            };
            beams[beam] = BeamStep {
                token: cand.token,
                log_prob: cand.log_prob,
                cum_log_prob: cand.cum_log_prob,
                parent: cand.beam,
                finished,
            };
        }

        let lengths: Vec<usize> = (0..width)
            .map(|beam| {
                if finished_before[beam] {
                    generated(beam)
                } else {
                    generated(beams[beam].parent) + 1
                }
            })
            .collect();
        let request_done = early_stop(knobs.early_stopping, knobs.length_penalty, &beams, &lengths);

        let mut output = SlotOutput {
            slot,
            beams,
            request_done,
            ..Default::default()
        };
        self.attach_logits(&mut output, input.phase, &rows)?;
        Ok(output)
    }

    fn attach_logits(&self, output: &mut SlotOutput, phase: StepPhase, rows: &[Vec<f32>]) -> Result<()> {
        let captured = self.capture(rows)?;
        match phase {
            StepPhase::Context { .. } => output.context_logits = captured,
            StepPhase::Generation => output.generation_logits = captured,
        }
        Ok(())
    }
}

impl ComputeStep for ReferenceDecoder {
    fn execute(&mut self, inputs: &StepInputs<'_>) -> Result<StepOutputs> {
        for id in inputs.retired {
            self.samplers.remove(id);
        }
        let mut outputs = StepOutputs::default();
        for input in inputs.entries.iter().filter(|e| e.produces_tokens()) {
            let output = if input.request.beam_width() == 1 {
                self.decode_single(input, inputs.hypotheses)?
            } else {
                self.decode_beams(input, inputs.hypotheses)?
            };
            outputs.slots.push(output);
        }
        Ok(outputs)
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    beam: usize,
    token: TokenId,
    log_prob: f32,
    cum_log_prob: f32,
    score: f32,
}

/// Length-normalised score
fn normalized_score(cum_log_prob: f32, len: usize, length_penalty: f32) -> f32 {
    if length_penalty == 0.0 || len == 0 {
        cum_log_prob
    } else {
        cum_log_prob / ((5.0 + len as f32) / 6.0).powf(length_penalty)
    }
}

/// Whether the request can stop before every beam finished; ties keep generating
fn early_stop(policy: EarlyStopping, length_penalty: f32, beams: &[BeamStep], lengths: &[usize]) -> bool {
    let score = |b: usize| normalized_score(beams[b].cum_log_prob, lengths[b], length_penalty);
    let best_finished = (0..beams.len())
        .filter(|&b| beams[b].finished.is_finished())
        .map(score)
        .max_by(f32::total_cmp);
    let best_open = (0..beams.len())
        .filter(|&b| !beams[b].finished.is_finished())
        .map(score)
        .max_by(f32::total_cmp);

    match (policy, best_finished, best_open) {
        (_, Some(_), None) => true,
        (EarlyStopping::Always, Some(_), _) => true,
        (EarlyStopping::Heuristic, Some(finished), Some(open)) => finished > open,
        _ => false,
    }
}

fn sorted_desc(probs: &[f32]) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed
}

fn argmax(values: &[f32]) -> TokenId {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i as TokenId)
}
