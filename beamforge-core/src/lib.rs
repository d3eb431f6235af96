//! Beamforge Core - request orchestration for batched decoding
//!
//! This crate implements the bookkeeping around an external compute step:
//! - Request lifecycle with chunked context, pause and resume, draft tokens
//! - Beam hypothesis tracking and lineage reconstruction
//! - Cache indirection over a cyclic attention window with sink tokens
//! - Batch slot allocation and step scheduling under a token budget
//! - A deterministic reference decoder for running the loop on the host

pub mod error;
pub mod tensor;
pub mod config;
pub mod ledger;
pub mod chunk;
pub mod request;
pub mod beam;
pub mod cache_indirection;
pub mod decoding;
pub mod slots;
pub mod compute;
pub mod scheduler;
pub mod engine;
pub mod reference;

pub use error::{EngineError, Result};
pub use tensor::{DeviceTensor, HostTensor, MemoryKind, TensorHandle, TensorPtr};
pub use config::{EarlyStopping, RequestConfig, SamplingConfig, SchedulerConfig, MAX_BEAM_WIDTH};
pub use request::{FinishReason, Request, RequestId, RequestState, TokenId};
pub use beam::{BeamHypotheses, BeamSetupParams, BeamStep, FinishedState, GatheredBeams, TrackerBuffers};
pub use cache_indirection::{step_circ, CacheIndirection};
pub use decoding::DecodingState;
pub use slots::{SlotAllocator, SlotStats};
pub use compute::{ComputeStep, SlotInput, SlotOutput, StepInputs, StepOutputs, StepPhase};
pub use scheduler::{RequestHandle, Response, Scheduler, SchedulerStats, StepReport};
pub use engine::{Engine, EngineStats};
pub use reference::{ReferenceConfig, ReferenceDecoder, Sampler};
