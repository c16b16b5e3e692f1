//! Strata Core
//!
//! Threading building blocks shared by the capture and mapping crates.
//!
//! ## Modules
//!
//! - [`worker`]: cancellable workers on dedicated threads
//! - [`rate`]: cycle timing for fixed-frequency loops
//! - [`pool`]: fixed-capacity slot pools for producer/consumer handoff
//!
//! ## Example
//!
//! ```ignore
//! use strata_core::{Runnable, WorkerBuilder};
//! use std::ops::ControlFlow;
//!
//! struct Tick;
//!
//! impl Runnable for Tick {
//!     fn run_once(&mut self) -> ControlFlow<()> {
//!         ControlFlow::Continue(())
//!     }
//! }
//!
//! let mut worker = WorkerBuilder::new("tick").frequency(30.0).spawn(Tick)?;
//! worker.sleep();
//! worker.ensure_completion();
//! ```

pub mod error;
pub mod pool;
pub mod rate;
pub mod worker;

pub use error::{PoolError, WorkerError};
pub use pool::{BufferPool, ClaimRole, PoolStats, SlotClaim, SlotStatus};
pub use rate::RateLimiter;
pub use worker::{Runnable, Worker, WorkerBuilder, WorkerState, WorkerWaker};
