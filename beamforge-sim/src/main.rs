//! Beamforge Sim - drives the scheduler with the reference host decoder
//!
//! Submits a synthetic workload, runs the engine until every request has
//! retired and prints the final statistics as JSON.

use std::str::FromStr;

use anyhow::Context;
use beamforge_core::{
    Engine, FinishReason, ReferenceConfig, ReferenceDecoder, RequestConfig, RequestHandle,
    RequestId, SamplingConfig, SchedulerConfig, TokenId,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MAX_STEPS: usize = 100_000;

#[derive(Debug, Serialize)]
struct RequestSummary {
    request_id: RequestId,
    responses: usize,
    tokens_received: usize,
    finish_reason: Option<FinishReason>,
    error: Option<String>,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn load_config() -> anyhow::Result<SchedulerConfig> {
    let mut config = match std::env::var("BEAMFORGE_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))?
        }
        Err(_) => SchedulerConfig {
            max_batch_size: 4,
            max_input_len: 64,
            max_seq_len: 128,
            max_attention_window: 128,
            max_num_tokens: Some(96),
            enable_chunked_context: true,
            context_chunk_unit: 8,
            preempt_lower_priority: true,
            ..Default::default()
        },
    };
    config.max_batch_size = env_or("BEAMFORGE_MAX_BATCH", config.max_batch_size);
    Ok(config)
}

async fn collect(mut handle: RequestHandle, streaming: bool) -> RequestSummary {
    let mut summary = RequestSummary {
        request_id: handle.id,
        responses: 0,
        tokens_received: 0,
        finish_reason: None,
        error: None,
    };
    while let Some(response) = handle.responses.recv().await {
        summary.responses += 1;
        let longest = response.beams.iter().map(Vec::len).max().unwrap_or(0);
        // Streaming single-beam responses carry deltas
        if streaming && response.beams.len() == 1 {
            summary.tokens_received += longest;
        } else {
            summary.tokens_received = longest;
        }
        if response.is_final {
            summary.finish_reason = response.finish_reason;
            summary.error = response.error;
        }
    }
    summary
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BEAMFORGE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let num_requests: usize = env_or("BEAMFORGE_REQUESTS", 16);
    let beam_width: usize = env_or("BEAMFORGE_BEAM_WIDTH", 2).min(config.max_beam_width);
    let streaming: bool = env_or("BEAMFORGE_STREAMING", true);

    let decoder = ReferenceDecoder::new(ReferenceConfig {
        seed: env_or("BEAMFORGE_SEED", 42),
        ..Default::default()
    });
    let vocab = decoder.vocab_size() as TokenId;
    let mut engine = Engine::new(config.clone(), decoder)?;

    info!(
        "Submitting {} requests to {} slots (beam width {})",
        num_requests, config.max_batch_size, beam_width
    );
    let mut collectors = Vec::with_capacity(num_requests);
    for i in 0..num_requests {
        let prompt_len = 4 + (i * 5) % config.max_input_len.saturating_sub(4).max(1);
        let prompt: Vec<TokenId> = (0..prompt_len)
            .map(|t| ((i * 31 + t * 7) as TokenId) % vocab)
            .collect();
        let sampling = if i % 4 == 3 {
            SamplingConfig::beam_search(beam_width)
        } else {
            SamplingConfig {
                temperature: Some(0.8),
                top_k: Some(40),
                random_seed: Some(i as u64),
                ..Default::default()
            }
        };
        let max_new_tokens = (8 + i % 16).min(config.max_seq_len.saturating_sub(prompt_len));
        let request = RequestConfig::new(max_new_tokens)
            .with_sampling(sampling)
            .with_priority((i % 3) as u32)
            .with_end_id(vocab - 1)
            .with_streaming(streaming);

        match engine.submit(prompt, request) {
            Ok(handle) => collectors.push(tokio::spawn(collect(handle, streaming))),
            Err(err) => warn!("Request {} rejected: {}", i, err),
        }
    }

    let engine = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let done = engine.run_to_completion(MAX_STEPS)?;
        info!("{} requests retired", done.len());
        Ok(engine)
    })
    .await??;

    for collector in collectors {
        let summary = collector.await?;
        info!("{}", serde_json::to_string(&summary)?);
    }

    println!("{}", serde_json::to_string_pretty(&engine.stats())?);
    Ok(())
}
