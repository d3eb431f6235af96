//! Cache indirection: which beam's key/value history each position reads from
//!
//! The table holds `max_attention_window` cyclic slots per `(slot, beam)`. The
//! first `sink_token_length` positions are never evicted; later positions wrap
//! around the remaining window.

use crate::beam::BeamHypotheses;
use crate::error::{EngineError, Result};

/// Cyclic window slot that position `pos` occupies
pub fn step_circ(pos: usize, max_attention_window: usize, sink_token_length: usize) -> usize {
    if pos < sink_token_length {
        pos
    } else {
        sink_token_length + (pos - sink_token_length) % (max_attention_window - sink_token_length)
    }
}

#[derive(Debug)]
pub struct CacheIndirection {
    max_batch_size: usize,
    max_beam_width: usize,
    max_attention_window: usize,
    sink_token_length: usize,
    /// [slot][beam][window]
    table: Vec<u32>,
}

impl CacheIndirection {
    pub fn new(
        max_batch_size: usize,
        max_beam_width: usize,
        max_attention_window: usize,
        sink_token_length: usize,
    ) -> Result<Self> {
        if max_attention_window == 0 || sink_token_length >= max_attention_window {
            return Err(EngineError::configuration(format!(
                "sink token length {} must be smaller than attention window {}",
                sink_token_length, max_attention_window
            )));
        }
        Ok(Self {
            max_batch_size,
            max_beam_width,
            max_attention_window,
            sink_token_length,
            table: vec![0; max_batch_size * max_beam_width * max_attention_window],
        })
    }

    pub fn max_attention_window(&self) -> usize {
        self.max_attention_window
    }

    pub fn sink_token_length(&self) -> usize {
        self.sink_token_length
    }

    /// Identity mapping: every entry reads beam 0
    pub fn reset_slot(&mut self, slot: usize) {
        if slot < self.max_batch_size {
            let block = self.slot_range(slot);
            self.table[block].fill(0);
        }
    }

    /// Source beam for absolute position `pos` of `(slot, beam)`
    pub fn get(&self, slot: usize, beam: usize, pos: usize) -> Result<usize> {
        let row = self.row(slot, beam)?;
        Ok(row[self.step_circ(pos)] as usize)
    }

    /// The raw cyclic row of `(slot, beam)`
    pub fn row(&self, slot: usize, beam: usize) -> Result<&[u32]> {
        if slot >= self.max_batch_size || beam >= self.max_beam_width {
            return Err(EngineError::invalid_argument(format!(
                "(slot {}, beam {}) outside {}x{} indirection table",
                slot, beam, self.max_batch_size, self.max_beam_width
            )));
        }
        let start = (slot * self.max_beam_width + beam) * self.max_attention_window;
        Ok(&self.table[start..start + self.max_attention_window])
    }

    pub fn step_circ(&self, pos: usize) -> usize {
        step_circ(pos, self.max_attention_window, self.sink_token_length)
    }

    /// Rewrite `slot`'s rows after the tracker committed a step.
    ///
    /// `finished_before` marks the beams that were already finished when the
    /// step began; their rows are left alone. Each remaining beam points its
    /// newest position at itself and inherits every earlier generated position
    /// from its parent's pre-step row.
    pub fn update(&mut self, slot: usize, hyps: &BeamHypotheses, finished_before: &[bool]) -> Result<()> {
        let width = hyps.beam_width(slot);
        if width <= 1 {
            return Ok(());
        }
        if slot >= self.max_batch_size || width > self.max_beam_width {
            return Err(EngineError::invariant(format!(
                "slot {} with {} beams does not fit the indirection table",
                slot, width
            )));
        }
        if finished_before.len() != width {
            return Err(EngineError::invariant(format!(
                "finished mask of {} entries for {} beams",
                finished_before.len(),
                width
            )));
        }

        let window = self.max_attention_window;
        let block = self.slot_range(slot);
        let snapshot = self.table[block.clone()].to_vec();
        let input_len = hyps.input_length(slot);

        for beam in (0..width).filter(|&b| !finished_before[b]) {
            let seq_len = hyps.sequence_length(slot, beam).ok_or_else(|| {
                EngineError::configuration("cache indirection needs sequence lengths")
            })?;
            if seq_len <= input_len {
                continue;
            }
            let last = seq_len - 1;
            let parent = hyps.parent_id(slot, beam, last).ok_or_else(|| {
                EngineError::invariant(format!("slot {} beam {} has no parent at {}", slot, beam, last))
            })?;

            let row = block.start + beam * window;
            let parent_row = parent * window;
            for pos in input_len..seq_len {
                let c = self.step_circ(pos);
                self.table[row + c] = if pos == last {
                    beam as u32
                } else {
                    snapshot[parent_row + c]
                };
            }
        }
        Ok(())
    }

    fn slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        let stride = self.max_beam_width * self.max_attention_window;
        slot * stride..(slot + 1) * stride
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::{BeamStep, FinishedState, TrackerBuffers};

    fn step(token: u32, parent: usize) -> BeamStep {
        BeamStep {
            token,
            log_prob: -1.0,
            cum_log_prob: -1.0,
            parent,
            finished: FinishedState::Unfinished,
        }
    }

    fn commit(
        hyps: &mut BeamHypotheses,
        indirection: &mut CacheIndirection,
        slot: usize,
        outputs: &[BeamStep],
    ) {
        let finished_before = hyps.finished_mask(slot);
        hyps.commit(slot, outputs).unwrap();
        indirection.update(slot, hyps, &finished_before).unwrap();
    }

    #[test]
    fn test_step_circ() {
        assert_eq!(step_circ(2, 8, 4), 2);
        assert_eq!(step_circ(4, 8, 4), 4);
        assert_eq!(step_circ(7, 8, 4), 7);
        assert_eq!(step_circ(8, 8, 4), 4);
        assert_eq!(step_circ(13, 8, 4), 5);
        assert_eq!(step_circ(10, 8, 0), 2);
    }

    #[test]
    fn test_sink_must_fit_window() {
        assert!(matches!(CacheIndirection::new(1, 2, 4, 4), Err(EngineError::Configuration(_))));
        assert!(CacheIndirection::new(1, 2, 4, 3).is_ok());
    }

    #[test]
    fn test_single_beam_is_identity() {
        let mut hyps = BeamHypotheses::new(2, 4, 16, TrackerBuffers::default()).unwrap();
        let mut ind = CacheIndirection::new(2, 4, 16, 0).unwrap();
        hyps.init_slot(0, 1, 3, 8, None).unwrap();
        for t in 0..5 {
            commit(&mut hyps, &mut ind, 0, &[step(t, 0)]);
        }
        assert!(ind.row(0, 0).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_width_four_parent_two() {
        let mut hyps = BeamHypotheses::new(1, 4, 16, TrackerBuffers::default()).unwrap();
        let mut ind = CacheIndirection::new(1, 4, 16, 0).unwrap();
        hyps.init_slot(0, 4, 3, 8, None).unwrap();

        // position 3 branches off beam 0, position 4 keeps each lineage
        commit(&mut hyps, &mut ind, 0, &[step(1, 0), step(2, 0), step(3, 0), step(4, 0)]);
        commit(&mut hyps, &mut ind, 0, &[step(1, 0), step(2, 1), step(3, 2), step(4, 3)]);
        // position 5: beam 2 extends beam 2
        commit(&mut hyps, &mut ind, 0, &[step(1, 0), step(2, 1), step(3, 2), step(4, 3)]);

        assert_eq!(hyps.sequence_length(0, 2), Some(6));
        assert_eq!(ind.get(0, 2, 5).unwrap(), 2);
        assert_eq!(ind.get(0, 2, 4).unwrap(), 2);
        assert_eq!(ind.get(0, 2, 3).unwrap(), 2);
        assert_eq!(ind.get(0, 3, 5).unwrap(), 3);
        // context positions are untouched
        assert_eq!(ind.get(0, 2, 1).unwrap(), 0);
    }

    #[test]
    fn test_copies_parent_history() {
        let mut hyps = BeamHypotheses::new(1, 2, 16, TrackerBuffers::default()).unwrap();
        let mut ind = CacheIndirection::new(1, 2, 16, 0).unwrap();
        hyps.init_slot(0, 2, 2, 8, None).unwrap();

        commit(&mut hyps, &mut ind, 0, &[step(1, 0), step(2, 0)]);
        commit(&mut hyps, &mut ind, 0, &[step(3, 0), step(4, 1)]);
        // both beams continue beam 1
        commit(&mut hyps, &mut ind, 0, &[step(5, 1), step(6, 1)]);

        assert_eq!(ind.get(0, 0, 4).unwrap(), 0);
        assert_eq!(ind.get(0, 0, 3).unwrap(), 1);
        assert_eq!(ind.get(0, 0, 2).unwrap(), 1);
        assert_eq!(ind.get(0, 1, 4).unwrap(), 1);
        assert_eq!(ind.get(0, 1, 3).unwrap(), 1);
    }

    #[test]
    fn test_finished_beam_row_untouched() {
        let mut hyps = BeamHypotheses::new(1, 2, 16, TrackerBuffers::default()).unwrap();
        let mut ind = CacheIndirection::new(1, 2, 16, 0).unwrap();
        hyps.init_slot(0, 2, 1, 8, None).unwrap();

        let mut first = [step(1, 0), step(2, 0)];
        first[1].finished = FinishedState::EndId;
        commit(&mut hyps, &mut ind, 0, &first);
        let frozen = ind.row(0, 1).unwrap().to_vec();
        commit(&mut hyps, &mut ind, 0, &[step(3, 0), step(0, 0)]);
        assert_eq!(ind.row(0, 1).unwrap(), frozen.as_slice());
    }

    #[test]
    fn test_cyclic_window_with_sink() {
        let mut hyps = BeamHypotheses::new(1, 2, 32, TrackerBuffers::default()).unwrap();
        let mut ind = CacheIndirection::new(1, 2, 6, 2).unwrap();
        hyps.init_slot(0, 2, 2, 16, None).unwrap();

        for _ in 0..6 {
            commit(&mut hyps, &mut ind, 0, &[step(1, 0), step(2, 1)]);
        }
        // positions 2..8; position 7 wraps to cyclic slot 3
        assert_eq!(ind.step_circ(7), 3);
        assert_eq!(ind.get(0, 1, 7).unwrap(), 1);
        // sink positions are never rewritten
        assert_eq!(ind.row(0, 1).unwrap()[0], 0);
        assert_eq!(ind.row(0, 1).unwrap()[1], 0);
    }

    /// Each cyclic cell holds the lineage owner of the newest position mapped onto it
    fn assert_rows_follow_lineage(hyps: &BeamHypotheses, ind: &CacheIndirection, slot: usize) {
        let input_len = hyps.input_length(slot);
        for beam in 0..hyps.beam_width(slot) {
            let seq_len = hyps.sequence_length(slot, beam).unwrap();
            let row = ind.row(slot, beam).unwrap();
            let mut seen = vec![false; ind.max_attention_window()];
            let mut owner = beam;
            for pos in (input_len..seq_len).rev() {
                let c = ind.step_circ(pos);
                if !seen[c] {
                    seen[c] = true;
                    assert_eq!(row[c] as usize, owner, "beam {} position {}", beam, pos);
                }
                owner = hyps.parent_id(slot, owner, pos).unwrap();
            }
            for c in (0..row.len()).filter(|&c| !seen[c]) {
                assert_eq!(row[c], 0, "beam {} cell {}", beam, c);
            }
        }
    }

    #[test]
    fn test_wrapped_window_follows_reordered_parents() {
        let mut hyps = BeamHypotheses::new(1, 3, 32, TrackerBuffers::default()).unwrap();
        let mut ind = CacheIndirection::new(1, 3, 6, 2).unwrap();
        hyps.init_slot(0, 3, 3, 16, None).unwrap();

        let schedule = [
            [0, 0, 0],
            [2, 0, 1],
            [1, 1, 0],
            [0, 2, 2],
            [2, 2, 1],
            [1, 0, 0],
            [0, 1, 2],
            [2, 0, 1],
        ];
        for (t, parents) in schedule.iter().enumerate() {
            let outputs: Vec<_> = parents
                .iter()
                .enumerate()
                .map(|(beam, &parent)| step((10 * t + beam) as u32, parent))
                .collect();
            commit(&mut hyps, &mut ind, 0, &outputs);
        }

        // positions 3..11 wrap the four non-sink cells twice
        assert_eq!(hyps.sequence_length(0, 0), Some(11));
        assert_eq!(ind.step_circ(10), ind.step_circ(6));
        for beam in 0..3 {
            assert_eq!(ind.get(0, beam, 10).unwrap(), beam);
            assert_eq!(&ind.row(0, beam).unwrap()[..2], &[0, 0]);
        }
        // beam 0 extended beam 2 in the last step, so it reads position 9 from beam 2
        assert_eq!(ind.get(0, 0, 9).unwrap(), 2);
        assert_rows_follow_lineage(&hyps, &ind, 0);
    }

    #[test]
    fn test_reset_slot_restores_identity() {
        let mut hyps = BeamHypotheses::new(1, 2, 16, TrackerBuffers::default()).unwrap();
        let mut ind = CacheIndirection::new(1, 2, 16, 0).unwrap();
        hyps.init_slot(0, 2, 1, 8, None).unwrap();
        commit(&mut hyps, &mut ind, 0, &[step(1, 0), step(2, 0)]);
        assert_eq!(ind.get(0, 1, 1).unwrap(), 1);
        ind.reset_slot(0);
        assert!(ind.row(0, 1).unwrap().iter().all(|&b| b == 0));
    }
}
