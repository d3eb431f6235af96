use beamforge_core::*;
use proptest::prelude::*;

fn step(token: TokenId, parent: usize) -> BeamStep {
    BeamStep {
        token,
        log_prob: -1.0,
        cum_log_prob: -1.0,
        parent,
        finished: FinishedState::Unfinished,
    }
}

fn decoding(max_beam_width: usize, max_seq_len: usize) -> DecodingState {
    DecodingState::new(&SchedulerConfig {
        max_batch_size: 2,
        max_beam_width,
        max_input_len: max_seq_len,
        max_seq_len,
        max_attention_window: max_seq_len,
        ..Default::default()
    })
    .unwrap()
}

fn windowed_decoding(max_attention_window: usize, sink_token_length: usize) -> DecodingState {
    DecodingState::new(&SchedulerConfig {
        max_batch_size: 1,
        max_input_len: 32,
        max_seq_len: 32,
        max_attention_window,
        sink_token_length,
        ..Default::default()
    })
    .unwrap()
}

proptest! {
    #[test]
    fn context_chunks_cover_prompt_once(prompt_len in 1usize..200, chunk in 1usize..300) {
        let mut request = Request::new(0, vec![1; prompt_len], RequestConfig::new(1)).unwrap();
        let mut covered = 0;
        loop {
            request.set_context_chunk_size(chunk).unwrap();
            let len = request.next_context_chunk_len();
            prop_assert_eq!(len, chunk.min(prompt_len - covered));
            let is_last = request.is_last_context_chunk();
            let before = request.context_current_position();
            request.move_to_next_context_chunk().unwrap();
            prop_assert!(request.context_current_position() > before);
            covered += len;
            if is_last {
                break;
            }
        }
        prop_assert_eq!(covered, prompt_len);
        prop_assert_eq!(request.context_remaining_length(), 0);
    }

    #[test]
    fn single_beam_indirection_is_identity(prompt_len in 1usize..8, steps in 1usize..24) {
        let mut state = decoding(4, 64);
        let request = Request::new(0, vec![1; prompt_len], RequestConfig::new(24)).unwrap();
        state.init_slot(1, &request).unwrap();
        for t in 0..steps {
            state.commit(1, &[step(t as TokenId, 0)]).unwrap();
        }
        for pos in 0..prompt_len + steps {
            prop_assert_eq!(state.indirection().get(1, 0, pos).unwrap(), 0);
        }
    }

    #[test]
    fn beam_indirection_matches_lineage(
        width in 2usize..5,
        parents in prop::collection::vec(prop::collection::vec(0usize..4, 4), 1..12),
    ) {
        let prompt_len = 3;
        let mut state = decoding(4, 32);
        let config = RequestConfig::new(16).with_sampling(SamplingConfig::beam_search(width));
        let request = Request::new(0, vec![1; prompt_len], config).unwrap();
        state.init_slot(0, &request).unwrap();

        for (t, row) in parents.iter().enumerate() {
            let outputs: Vec<_> = (0..width)
                .map(|beam| step((t * 10 + beam) as TokenId, row[beam] % width))
                .collect();
            state.commit(0, &outputs).unwrap();
        }

        let hyps = state.hypotheses();
        let seq_len = prompt_len + parents.len();
        for beam in 0..width {
            let mut owner = beam;
            for pos in (prompt_len..seq_len).rev() {
                prop_assert_eq!(state.indirection().get(0, beam, pos).unwrap(), owner);
                owner = hyps.parent_id(0, owner, pos).unwrap();
            }
        }

        let gathered = hyps.gather_tree(0).unwrap();
        prop_assert!(gathered.tokens.iter().all(|t| t.len() == parents.len()));
    }

    #[test]
    fn wrapped_indirection_matches_lineage(
        width in 2usize..5,
        sink in 1usize..4,
        span in 1usize..5,
        prompt_len in 1usize..7,
        parents in prop::collection::vec(prop::collection::vec(0usize..4, 4), 9..20),
    ) {
        let window = sink + span;
        let mut state = windowed_decoding(window, sink);
        let config = RequestConfig::new(24).with_sampling(SamplingConfig::beam_search(width));
        let request = Request::new(0, vec![1; prompt_len], config).unwrap();
        state.init_slot(0, &request).unwrap();

        for (t, row) in parents.iter().enumerate() {
            let outputs: Vec<_> = (0..width)
                .map(|beam| step((t * 10 + beam) as TokenId, row[beam] % width))
                .collect();
            state.commit(0, &outputs).unwrap();
        }

        // every cell holds the lineage owner of the newest position that maps onto it
        let hyps = state.hypotheses();
        let indirection = state.indirection();
        let seq_len = prompt_len + parents.len();
        for beam in 0..width {
            let cells = indirection.row(0, beam).unwrap();
            let mut seen = vec![false; window];
            let mut owner = beam;
            for pos in (prompt_len..seq_len).rev() {
                let c = step_circ(pos, window, sink);
                if !seen[c] {
                    seen[c] = true;
                    prop_assert_eq!(cells[c] as usize, owner);
                }
                owner = hyps.parent_id(0, owner, pos).unwrap();
            }
            for c in (0..window).filter(|&c| !seen[c]) {
                prop_assert_eq!(cells[c], 0);
            }
        }
    }

    #[test]
    fn finished_beams_pad_to_longest(width in 2usize..5, stop_at in 1usize..6, extra in 1usize..6) {
        let mut state = decoding(4, 32);
        let config = RequestConfig::new(16)
            .with_sampling(SamplingConfig::beam_search(width))
            .with_end_id(99);
        let request = Request::new(0, vec![1, 2], config).unwrap();
        state.init_slot(0, &request).unwrap();

        for t in 0..stop_at + extra {
            let outputs: Vec<_> = (0..width)
                .map(|beam| {
                    let mut s = step(t as TokenId, beam);
                    if beam == 0 && t + 1 == stop_at {
                        s.token = 99;
                        s.finished = FinishedState::EndId;
                    }
                    s
                })
                .collect();
            state.commit(0, &outputs).unwrap();
        }

        let gathered = state.hypotheses().gather_tree(0).unwrap();
        prop_assert!(gathered.tokens.iter().all(|t| t.len() == stop_at + extra));
        prop_assert!(gathered.tokens[0][stop_at - 1..].iter().all(|&t| t == 99));
        prop_assert_eq!(state.hypotheses().sequence_length(0, 0), Some(2 + stop_at));
    }

    #[test]
    fn step_circ_stays_in_window(pos in 0usize..10_000, window in 1usize..64, sink in 0usize..64) {
        prop_assume!(sink < window);
        let c = step_circ(pos, window, sink);
        prop_assert!(c < window);
        if pos < sink {
            prop_assert_eq!(c, pos);
        } else {
            prop_assert!(c >= sink);
        }
    }
}
