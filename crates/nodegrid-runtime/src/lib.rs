//! nodegrid-runtime — shared machinery for the three controllers.
//!
//! # Components
//!
//! - **`context`** — `ControllerContext`: registry, backend, config and clock
//!   handed to every controller at construction; there is no global state
//! - **`error`** — `ControllerError` taxonomy and its requeue policy
//! - **`backoff`** — capped exponential backoff
//! - **`queue`** — `WorkQueue`: deduplicating per-key queue; a key is never
//!   handed to two workers at once
//! - **`reconciler`** — `Reconciler` trait and the bounded worker pool
//! - **`leader`** — lease-based leader election over the registry

pub mod backoff;
pub mod context;
pub mod error;
pub mod leader;
pub mod queue;
pub mod reconciler;

pub use backoff::Backoff;
pub use context::{Clock, ControllerContext};
pub use error::{ControllerError, ControllerResult, Requeue};
pub use leader::LeaderElector;
pub use queue::WorkQueue;
pub use reconciler::{Action, Reconciler, run_workers, spawn_resync};
