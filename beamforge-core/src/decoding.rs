//! Per-slot decoding arena: beam hypotheses plus cache indirection

use crate::beam::{BeamHypotheses, BeamSetupParams, BeamStep, TrackerBuffers};
use crate::cache_indirection::CacheIndirection;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::request::Request;

#[derive(Debug)]
pub struct DecodingState {
    hypotheses: BeamHypotheses,
    indirection: CacheIndirection,
}

impl DecodingState {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        Ok(Self {
            hypotheses: BeamHypotheses::new(
                config.max_batch_size,
                config.max_beam_width,
                config.max_seq_len,
                TrackerBuffers::default(),
            )?,
            indirection: CacheIndirection::new(
                config.max_batch_size,
                config.max_beam_width,
                config.max_attention_window,
                config.sink_token_length,
            )?,
        })
    }

    pub fn hypotheses(&self) -> &BeamHypotheses {
        &self.hypotheses
    }

    pub fn indirection(&self) -> &CacheIndirection {
        &self.indirection
    }

    /// Prepare `slot` for the generation phase of `request` and load its knobs
    pub fn init_slot(&mut self, slot: usize, request: &Request) -> Result<()> {
        self.hypotheses.init_slot(
            slot,
            request.beam_width(),
            request.prompt_len(),
            request.max_new_tokens(),
            request.end_id(),
        )?;
        self.indirection.reset_slot(slot);

        let sampling = request.sampling();
        let params = BeamSetupParams {
            diversity_rate: sampling.beam_search_diversity_rate.map(|v| vec![v]),
            length_penalty: sampling.length_penalty.map(|v| vec![v]),
            early_stopping: sampling.early_stopping.map(|v| vec![v]),
        };
        self.hypotheses.setup(&[slot], &params)
    }

    pub fn reset_slot(&mut self, slot: usize) {
        self.hypotheses.reset_slot(slot);
        self.indirection.reset_slot(slot);
    }

    pub fn validate_step(&self, slot: usize, outputs: &[BeamStep]) -> Result<()> {
        self.hypotheses.validate_step(slot, outputs)
    }

    /// Commit one step into the tracker, then refresh the indirection rows
    pub fn commit(&mut self, slot: usize, outputs: &[BeamStep]) -> Result<()> {
        let finished_before = self.hypotheses.finished_mask(slot);
        self.hypotheses.commit(slot, outputs)?;
        self.indirection.update(slot, &self.hypotheses, &finished_before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::FinishedState;
    use crate::config::{EarlyStopping, RequestConfig, SamplingConfig};

    #[test]
    fn test_init_commit_reset() {
        let config = SchedulerConfig {
            max_batch_size: 2,
            max_beam_width: 2,
            max_seq_len: 16,
            max_input_len: 8,
            max_attention_window: 16,
            ..Default::default()
        };
        let mut state = DecodingState::new(&config).unwrap();
        let sampling = SamplingConfig {
            length_penalty: Some(0.7),
            early_stopping: Some(EarlyStopping::Never),
            ..SamplingConfig::beam_search(2)
        };
        let request = Request::new(1, vec![1, 2, 3], RequestConfig::new(4).with_sampling(sampling)).unwrap();
        state.init_slot(1, &request).unwrap();
        assert_eq!(state.hypotheses().knobs(1).length_penalty, 0.7);
        assert_eq!(state.hypotheses().knobs(1).early_stopping, EarlyStopping::Never);

        let outputs = [
            BeamStep {
                token: 7,
                log_prob: -0.1,
                cum_log_prob: -0.1,
                parent: 0,
                finished: FinishedState::Unfinished,
            },
            BeamStep {
                token: 8,
                log_prob: -0.2,
                cum_log_prob: -0.2,
                parent: 0,
                finished: FinishedState::Unfinished,
            },
        ];
        state.commit(1, &outputs).unwrap();
        assert_eq!(state.indirection().get(1, 1, 3).unwrap(), 1);

        state.reset_slot(1);
        assert_eq!(state.hypotheses().beam_width(1), 0);
        assert_eq!(state.indirection().get(1, 1, 3).unwrap(), 0);
    }
}
