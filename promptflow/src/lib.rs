//! # Promptflow
//!
//! A resilient orchestration engine for multi-stage LLM content pipelines.
//!
//! Promptflow drives a configured sequence of content-generation stages
//! (requirements, design, plan, code, review) against external completion
//! endpoints, with support for:
//!
//! - **Rate limiting and circuit breaking**: per-model token buckets, a
//!   global in-flight cap, and failure isolation with cooldowns
//! - **Failover dispatch**: ordered candidate models with transient-failure
//!   backoff and automatic fallback
//! - **Context management**: overlapping chunking, embedding-based
//!   retrieval, and TTL response caching with single-flight collapsing
//! - **Validated outputs**: structural/schema/consistency gating with
//!   bounded feedback retries
//! - **Partial-failure sequencing**: failed stages never abort the run;
//!   dependents are skipped and every failure reason is preserved
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use promptflow::prelude::*;
//!
//! let orchestrator = PipelineOrchestrator::new(
//!     config, roles, dispatcher, memory, gate, clock,
//! );
//! let result = orchestrator.run("user_idea", "Design a login API").await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod limiter;
pub mod memory;
pub mod pipeline;
pub mod roles;
pub mod testing;
pub mod validate;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::{
        ContextStrategy, EngineConfig, MemorySettings, ModelParams, ParticipantSpec,
        RateLimitSettings, SchemaSpec, StageDefinition, StageKind, ValidationSpec,
    };
    pub use crate::dispatch::{
        Completion, CompletionProvider, CompletionRequest, DispatchRequest, ModelDispatcher,
    };
    pub use crate::errors::{
        CircuitOpenError, ConfigError, DispatchError, EngineError, ProviderError,
        ProviderErrorKind, StageError, ValidationCheck, ValidationFailure,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::limiter::{
        BackoffPolicy, BackoffState, CircuitBreaker, CircuitState, RateLimiter,
    };
    pub use crate::memory::{Chunker, Embedder, MemoryManager, ResponseCache, Summarizer};
    pub use crate::pipeline::{
        CancelToken, PipelineOrchestrator, RunResult, RunStatus, StageRecord, StageStatus,
    };
    pub use crate::roles::{RoleRegistry, RoleSpec};
    pub use crate::validate::ValidationGate;
}
