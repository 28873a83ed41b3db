//! Agent assembly and lifecycle.
//!
//! The [`AgentBuilder`] wires the scheduler, the descriptors of the mock
//! device, the orchestrator and the configurator together; [`Agent::run`]
//! drives the background tasks until shutdown:
//!
//! ```text
//! [init file] ─┐
//! [watchers] ──┼──> [aggregator] ──┐
//!              │                   ├──> [dispatcher] ──> [KvScheduler] ──> [MockDevice]
//! [configurator] ──────────────────┘                          ▲               │
//!                                                             └── SB events ──┘
//! ```

mod agent;

pub use agent::{Agent, AgentBuilder};
