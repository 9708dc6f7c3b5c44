//! Execution units, their pool, and the block scheduler
//!
//! This module owns everything that runs off the coordinator thread, plus
//! the bookkeeping the coordinator needs to drive it.
//!
//! # Architecture Responsibilities
//!
//! ## What This Module Does:
//! - **Unit Abstraction**: [`ExecutionUnit`] is the only thing the coordinator
//!   knows about a worker: an id, a `send`, and a `terminate`
//! - **Default Transport**: [`ThreadSpawner`] runs each unit on a named OS
//!   thread with a crossbeam inbox; replies share one event channel
//! - **Pool Lifecycle**: [`UnitPool`] creates units lazily, reuses them across
//!   configurations and counts readiness per configure round
//! - **Scheduling**: [`Scheduler`] hands the next block index to whichever unit
//!   goes idle first and owns the `unit -> block` assignments
//!
//! ## What This Module Does NOT Do:
//! - **Arena Access**: units only ever see the bytes moved to them in a task
//! - **Lifecycle Decisions**: whether a reply is fatal, and what happens next,
//!   is the coordinator's call
//!
//! # Message Flow
//!
//! ```text
//! ┌─────────────────┐  Configure / Task / Free / Ack   ┌─────────────────┐
//! │                 │ ───────────────────────────────▶ │  unit #0 inbox  │
//! │   Coordinator   │ ───────────────────────────────▶ │  unit #1 inbox  │
//! │                 │                                  │       ...       │
//! │ • Scheduler     │ ◀─────────────────────────────── │                 │
//! │ • UnitPool      │   UnitEvent { unit, message }    │  (one thread    │
//! │                 │   Ready / Done / Fail / Progress │   per unit)     │
//! └─────────────────┘                                  └─────────────────┘
//! ```

pub mod pool;
pub mod scheduler;
pub mod unit;

// Re-export main types for easier access
pub use pool::{Readiness, UnitPool};
pub use scheduler::{Completion, Counters, Scheduler};
pub use unit::{ExecutionUnit, ThreadSpawner, ThreadUnit, UnitSpawner};
