//! KV Orchagent - dependency-aware configuration reconciliation
//!
//! Translates declarative key-value intent into ordered create, update and
//! delete calls against a southbound device, tracking dependencies between
//! values and the state of every value.
//!
//! # Architecture
//!
//! ```text
//! [init file / watchers] ─┐
//!                         ├──> [Dispatcher] ──> [KvScheduler] ──> descriptors ──> [device]
//! [Configurator] ─────────┘         │                 │
//!                                   ↓                 ↓
//!                               [Store]       [StatusPublisher]
//! ```
//!
//! # Key Components
//!
//! - [`scheduler::KvScheduler`]: transaction engine over the dependency graph
//! - [`orchestrator::Dispatcher`]: merges data sources into transactions
//! - [`configurator::Configurator`]: northbound request/response API
//! - [`daemon::Agent`]: assembly and lifecycle
//! - [`interface`], [`acl`]: descriptors of the in-memory [`device`]

// ============================================================================
// Engine
// ============================================================================

pub mod notify;
pub mod scheduler;

// ============================================================================
// Orchestration
// ============================================================================

pub mod configurator;
pub mod models;
pub mod orchestrator;

// ============================================================================
// Southbound
// ============================================================================

pub mod acl;
pub mod device;
pub mod interface;
pub mod net;

// ============================================================================
// Runtime
// ============================================================================

pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;

// ============================================================================
// Re-exports
// ============================================================================

pub use kv_orch_common::{
    BaseValueStatus, CommitResult, Dependency, Descriptor, DescriptorAdapter, KeyIntent,
    KvDescriptor, KvError, KvResult, ResyncType, RetryPolicy, TransactionError, TxnOptions,
    ValueOrigin, ValueState, ValueStatus,
};

pub use configurator::Configurator;
pub use daemon::{Agent, AgentBuilder};
pub use error::{OrchResult, OrchestratorError};
pub use orchestrator::{Dispatcher, PushContext, PushResult};
pub use scheduler::KvScheduler;
