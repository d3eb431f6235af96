//! Decode engine with continuous batching
//!
//! Pairs a [`Scheduler`] with the compute step that executes its batches and
//! keeps running statistics over the steps it drives.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::compute::ComputeStep;
use crate::config::{RequestConfig, SchedulerConfig};
use crate::error::{EngineError, Result};
use crate::request::{Request, TokenId};
use crate::scheduler::{RequestHandle, Scheduler, SchedulerStats, StepReport};

/// Statistics for the engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub scheduler: SchedulerStats,
    pub current_batch_size: usize,
    pub current_step_tokens: usize,
    pub elapsed_secs: f64,
    pub tokens_per_second: f64,
}

pub struct Engine<C: ComputeStep> {
    scheduler: Scheduler,
    compute: C,
    started: Instant,
    last_report: Option<(usize, usize)>,
}

impl<C: ComputeStep> Engine<C> {
    pub fn new(config: SchedulerConfig, compute: C) -> Result<Self> {
        info!("Initializing decode engine...");
        Ok(Self {
            scheduler: Scheduler::new(config)?,
            compute,
            started: Instant::now(),
            last_report: None,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// For pause and abort between steps
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn compute(&self) -> &C {
        &self.compute
    }

    pub fn submit(&mut self, prompt: Vec<TokenId>, config: RequestConfig) -> Result<RequestHandle> {
        self.scheduler.add_request(prompt, config)
    }

    /// Process one step of batched decoding
    pub fn step(&mut self) -> Result<StepReport> {
        let report = self.scheduler.step(&mut self.compute)?;
        if !report.is_idle() {
            let batch_size = report.context_requests.len() + report.generation_requests.len();
            self.last_report = Some((batch_size, report.num_tokens));
        }
        Ok(report)
    }

    /// Step until every request has retired, at most `max_steps` times
    pub fn run_to_completion(&mut self, max_steps: usize) -> Result<Vec<Request>> {
        let mut steps = 0;
        while self.scheduler.has_work() {
            if steps == max_steps {
                return Err(EngineError::invalid_state(format!(
                    "{} requests still live after {} steps",
                    self.scheduler.num_active(),
                    max_steps
                )));
            }
            let report = self.step()?;
            if report.is_idle() {
                return Err(EngineError::invariant(format!(
                    "no request could be scheduled with {} live",
                    self.scheduler.num_active()
                )));
            }
            steps += 1;
        }
        debug!("Drained all requests in {} steps", steps);
        Ok(self.scheduler.take_completed())
    }

    pub fn stats(&self) -> EngineStats {
        let scheduler = self.scheduler.stats();
        let elapsed_secs = self.started.elapsed().as_secs_f64();
        let (current_batch_size, current_step_tokens) = self.last_report.unwrap_or_default();
        EngineStats {
            scheduler,
            current_batch_size,
            current_step_tokens,
            elapsed_secs,
            tokens_per_second: if elapsed_secs > 0.0 {
                scheduler.generated_tokens as f64 / elapsed_secs
            } else {
                0.0
            },
        }
    }
}
