//! End-to-end engine tests against a deterministic mock model.
//!
//! The mock returns a one-hot logits row predicting `t + 1` after token
//! `t`, with 1000 as the conventional EOS id.

use std::sync::{Arc, Mutex};

use candle_core::{Device, Tensor};
use microbatch::core::block_manager::CopyOp;
use microbatch::core::sequence::{SequenceGroup, SequenceId};
use microbatch::engine::{ModelInput, ModelStep};
use microbatch::{
    BasicSampler, Error, LLMEngine, Result, Sampler, SamplingParams, SchedulerConfig,
    SchedulerPolicy,
};

const VOCAB: usize = 1100;
const EOS: i64 = 1000;

/// Mock model: one-hot logits at `last_token + 1` for every sampling row.
struct SuccessorModel {
    copies: Arc<Mutex<Vec<CopyOp>>>,
}

impl SuccessorModel {
    fn new() -> (Self, Arc<Mutex<Vec<CopyOp>>>) {
        let copies = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                copies: copies.clone(),
            },
            copies,
        )
    }
}

impl ModelStep for SuccessorModel {
    fn copy_blocks(&mut self, copies: &[CopyOp]) -> Result<()> {
        self.copies.lock().unwrap().extend_from_slice(copies);
        Ok(())
    }

    fn forward(&mut self, input: &ModelInput) -> Result<Tensor> {
        let rows: Vec<_> = input.sequences.iter().filter(|s| s.sample).collect();
        let mut data = vec![0f32; rows.len() * VOCAB];
        for (row, seq) in rows.iter().enumerate() {
            let last = *seq.token_ids.last().unwrap();
            let next = (last + 1) as usize % VOCAB;
            data[row * VOCAB + next] = 10.0;
        }
        Ok(Tensor::from_vec(data, (rows.len(), VOCAB), &Device::Cpu)?)
    }
}

fn greedy(max_new_tokens: usize) -> SamplingParams {
    SamplingParams::default()
        .temperature(0.0)
        .max_new_tokens(max_new_tokens)
        .eos_token_id(EOS)
}

fn engine(config: SchedulerConfig) -> (LLMEngine, Arc<Mutex<Vec<CopyOp>>>) {
    let (model, copies) = SuccessorModel::new();
    let engine = LLMEngine::new(
        Box::new(model),
        Box::new(BasicSampler::with_seed(0)),
        config,
    )
    .unwrap();
    (engine, copies)
}

fn config(tokens: usize, seqs: usize, blocks: usize, block_size: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_num_batched_tokens: tokens,
        max_num_seqs: seqs,
        num_kv_blocks: blocks,
        block_size,
        policy: SchedulerPolicy::PrefillFirst,
    }
}

#[test]
fn test_single_request_greedy() {
    let (mut engine, _) = engine(config(64, 8, 16, 16));
    let results = engine
        .generate(vec![vec![5, 6, 7]], vec![greedy(4)])
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].request_id, 0);
    assert_eq!(results[0].generated_ids, vec![vec![8, 9, 10, 11]]);
    assert!(!engine.has_unfinished_requests());
}

#[test]
fn test_two_requests_chunked_prefill() {
    let (mut engine, _) = engine(config(4, 8, 16, 16));
    let results = engine
        .generate(
            vec![vec![1, 2], vec![20, 21, 22, 23]],
            vec![greedy(2), greedy(2)],
        )
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].generated_ids, vec![vec![3, 4]]);
    assert_eq!(results[1].generated_ids, vec![vec![24, 25]]);
}

#[test]
fn test_streaming_through_handle() {
    let (mut engine, _) = engine(config(64, 8, 16, 16));
    let handle = engine.add_request(7, vec![5, 6, 7], greedy(3)).unwrap();

    // Tick 1: prefill + first token.
    engine.step().unwrap();
    assert!(handle.can_read());
    let outputs = handle.read().unwrap();
    assert_eq!(outputs.values().next().unwrap().token_id, 8);
    assert!(!handle.finished());

    while engine.has_unfinished_requests() {
        engine.step().unwrap();
    }
    let raw = handle.read_all();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].generated_ids, vec![9, 10]);
    assert!(handle.finished());
}

#[test]
fn test_preemption_recomputes_without_duplicates() {
    // Four blocks of four slots: three one-block prompts fit, the first
    // decode wave does not.
    let (mut engine, _) = engine(config(64, 8, 4, 4));
    let prompts = vec![
        vec![10, 11, 12, 13],
        vec![20, 21, 22, 23],
        vec![30, 31, 32, 33],
    ];
    let params = vec![greedy(2), greedy(2), greedy(2)];

    let handles: Vec<_> = prompts
        .iter()
        .enumerate()
        .map(|(i, p)| {
            engine
                .add_request(i as u64, p.clone(), params[i].clone())
                .unwrap()
        })
        .collect();

    let mut results = Vec::new();
    while engine.has_unfinished_requests() {
        results.extend(engine.step().unwrap());
    }
    results.sort_by_key(|r| r.request_id);

    assert_eq!(results[0].generated_ids, vec![vec![14, 15]]);
    assert_eq!(results[1].generated_ids, vec![vec![24, 25]]);
    assert_eq!(results[2].generated_ids, vec![vec![34, 35]]);

    // The preempted request's stream carries no duplicated prefix.
    let raw = handles[2].read_all();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].generated_ids, vec![34, 35]);

    // Everything was reclaimed.
    assert_eq!(engine.scheduler().block_manager().free_count(), 4);
    assert_eq!(engine.scheduler().block_manager().total_ref_count(), 0);
}

#[test]
fn test_cancellation_mid_decode() {
    let (mut engine, _) = engine(config(64, 8, 16, 16));
    let free_before = engine.scheduler().block_manager().free_count();
    let handle = engine.add_request(0, vec![5, 6, 7], greedy(10)).unwrap();

    engine.step().unwrap();
    engine.step().unwrap();
    handle.cancel();
    let results = engine.step().unwrap();

    assert_eq!(results.len(), 1);
    assert!(handle.finished() || handle.can_read());
    let raw = handle.read_all();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].generated_ids, vec![8, 9]);
    assert!(handle.finished());
    assert_eq!(engine.scheduler().block_manager().free_count(), free_before);
    assert!(!engine.has_unfinished_requests());
}

#[test]
fn test_eos_finishes_within_tick() {
    let (mut engine, _) = engine(config(64, 8, 16, 16));
    engine.add_request(0, vec![997, 998, 999], greedy(10)).unwrap();

    // The first sampled token is the EOS itself.
    let results = engine.step().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].generated_ids, vec![vec![EOS]]);
    assert!(!engine.has_unfinished_requests());
}

#[test]
fn test_ignore_eos_keeps_generating() {
    let (mut engine, _) = engine(config(64, 8, 16, 16));
    let mut params = greedy(3);
    params.ignore_eos = true;
    let results = engine.generate(vec![vec![997, 998, 999]], vec![params]).unwrap();
    assert_eq!(results[0].generated_ids, vec![vec![1000, 1001, 1002]]);
}

#[test]
fn test_results_sorted_by_request_id() {
    // Request 0 has the longest prompt and finishes last.
    let (mut engine, _) = engine(config(4, 8, 32, 16));
    let results = engine
        .generate(
            vec![vec![50, 51, 52, 53, 54, 55, 56, 57], vec![1, 2], vec![30, 31]],
            vec![greedy(4), greedy(2), greedy(2)],
        )
        .unwrap();

    let ids: Vec<u64> = results.iter().map(|r| r.request_id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(results[0].generated_ids, vec![vec![58, 59, 60, 61]]);
    assert_eq!(results[1].generated_ids, vec![vec![3, 4]]);
    assert_eq!(results[2].generated_ids, vec![vec![32, 33]]);
}

#[test]
fn test_determinism_across_runs() {
    let run = || {
        let (mut engine, _) = engine(config(5, 4, 8, 4));
        engine
            .generate(
                vec![vec![1, 2, 3], vec![20, 21, 22, 23, 24], vec![40, 41]],
                vec![greedy(3), greedy(2), greedy(4)],
            )
            .unwrap()
    };
    let a = run();
    let b = run();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.request_id, y.request_id);
        assert_eq!(x.generated_ids, y.generated_ids);
        assert_eq!(x.cumulative_log_prob.to_bits(), y.cumulative_log_prob.to_bits());
    }
}

#[test]
fn test_invalid_requests_rejected() {
    let (mut engine, _) = engine(config(64, 8, 4, 4));

    assert!(matches!(
        engine.add_request(0, vec![], greedy(1)),
        Err(Error::InvalidRequest { .. })
    ));

    engine.add_request(0, vec![1, 2], greedy(1)).unwrap();
    assert!(matches!(
        engine.add_request(0, vec![1, 2], greedy(1)),
        Err(Error::InvalidRequest { .. })
    ));

    // 17 tokens can never fit 4 blocks of 4 slots.
    assert!(matches!(
        engine.add_request(1, (0..17).collect(), greedy(1)),
        Err(Error::CapacityExhausted { .. })
    ));
}

#[test]
fn test_failing_model_leaves_engine_quiescent() {
    struct FailingModel;
    impl ModelStep for FailingModel {
        fn copy_blocks(&mut self, _copies: &[CopyOp]) -> Result<()> {
            Ok(())
        }
        fn forward(&mut self, _input: &ModelInput) -> Result<Tensor> {
            Err(Error::ModelStep("device lost".to_string()))
        }
    }

    let mut engine = LLMEngine::new(
        Box::new(FailingModel),
        Box::new(BasicSampler::with_seed(0)),
        config(64, 8, 16, 16),
    )
    .unwrap();
    engine.add_request(0, vec![1, 2], greedy(2)).unwrap();

    assert!(matches!(engine.step(), Err(Error::ModelStep(_))));
    assert!(matches!(engine.step(), Err(Error::EngineAborted)));
    assert!(matches!(
        engine.add_request(1, vec![3], greedy(1)),
        Err(Error::EngineAborted)
    ));
}

/// Forks the primary sequence at its first sampling step, then decodes
/// both hypotheses greedily with diverging first tokens.
struct ForkSampler;

impl Sampler for ForkSampler {
    fn sample(&mut self, group: &mut SequenceGroup, logits: &[(SequenceId, Tensor)]) -> Result<()> {
        let max_new_tokens = group.sampling_params().max_new_tokens;
        if group.num_total_seqs() == 1 {
            let (parent, row) = (&logits[0].0, &logits[0].1);
            let token = argmax(row);
            let child = group.fork_sequence(*parent)?;
            group
                .get_sequence_mut(*parent)
                .unwrap()
                .append_token(token, -0.1);
            group
                .get_sequence_mut(child)
                .unwrap()
                .append_token(token + 1, -0.2);
        } else {
            for (seq_id, row) in logits {
                let token = argmax(row);
                group
                    .get_sequence_mut(*seq_id)
                    .unwrap()
                    .append_token(token, -0.1);
            }
        }

        let done: Vec<SequenceId> = group
            .running_sequences()
            .filter(|s| s.generated_len() >= max_new_tokens)
            .map(|s| s.seq_id())
            .collect();
        for seq_id in done {
            group
                .get_sequence_mut(seq_id)
                .unwrap()
                .finish(microbatch::FinishReason::MaxTokens);
        }
        Ok(())
    }
}

fn argmax(row: &Tensor) -> i64 {
    let values: Vec<f32> = row.to_vec1().unwrap();
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best as i64
}

#[test]
fn test_beam_fork_shares_blocks_then_cows() {
    let (model, copies) = SuccessorModel::new();
    let mut engine = LLMEngine::new(
        Box::new(model),
        Box::new(ForkSampler),
        config(64, 8, 8, 16),
    )
    .unwrap();
    engine
        .add_request(0, vec![1], SamplingParams::default().max_new_tokens(2))
        .unwrap();

    // Tick 1: prefill, fork, one token per sibling.
    engine.step().unwrap();
    let manager = engine.scheduler().block_manager();
    // Parent and child share the one allocated block.
    assert_eq!(manager.table(1).unwrap(), manager.table(2).unwrap());
    assert_eq!(manager.total_ref_count(), 2);
    assert_eq!(manager.free_count(), 7);
    assert!(copies.lock().unwrap().is_empty());

    // Tick 2: the first sibling write copies the shared block once.
    let results = engine.step().unwrap();
    assert_eq!(copies.lock().unwrap().len(), 1);

    // Both hypotheses finished; best beam-search score first.
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].generated_ids.len(), 2);
    assert_eq!(results[0].generated_ids[0], vec![2, 3]);
    assert_eq!(results[0].generated_ids[1], vec![3, 4]);
    assert!((results[0].cumulative_log_prob - (-0.2)).abs() < 1e-6);
}
