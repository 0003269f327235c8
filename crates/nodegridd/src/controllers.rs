//! Controller wiring for the leader.
//!
//! ```text
//!   resync timer ──► allocation queue ──► AllocationController workers
//!   API POST ─────┘        │ retired nodes
//!                          ▼
//!   consolidation timer ─► termination queue ──► TerminationController workers
//!   API DELETE ──────────┘
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use nodegrid_allocation::AllocationController;
use nodegrid_consolidation::Consolidator;
use nodegrid_core::NodeId;
use nodegrid_runtime::{Backoff, ControllerContext, WorkQueue, run_workers, spawn_resync};
use nodegrid_termination::{BudgetedEvictor, TerminationController};

/// Work queues shared between the controllers and the API.
#[derive(Clone)]
pub struct Queues {
    pub allocation: WorkQueue<String>,
    pub termination: WorkQueue<NodeId>,
}

impl Queues {
    pub fn new(ctx: &ControllerContext) -> Self {
        let allocation = &ctx.config.allocation;
        let termination = &ctx.config.termination;
        Self {
            allocation: WorkQueue::new(Backoff::new(
                allocation.launch_backoff_base,
                allocation.launch_backoff_max,
            )),
            termination: WorkQueue::new(Backoff::new(
                termination.terminate_backoff_base,
                termination.terminate_backoff_max,
            )),
        }
    }
}

/// Start the allocation and termination worker pools, their resync timers
/// and the consolidation loop. Everything stops when `shutdown` flips.
pub fn spawn_controllers(
    ctx: &ControllerContext,
    queues: &Queues,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let workers = ctx.config.controller.workers.max(1);
    let resync = ctx.config.controller.resync_interval;

    let allocator = Arc::new(
        AllocationController::new(ctx.clone()).with_termination_queue(queues.termination.clone()),
    );
    let evictor = Arc::new(BudgetedEvictor::new(ctx.registry.clone()));
    let terminator = Arc::new(TerminationController::new(ctx.clone(), evictor));
    let consolidator =
        Consolidator::new(ctx.clone()).with_termination_queue(queues.termination.clone());

    let mut handles = run_workers(
        Arc::clone(&allocator),
        queues.allocation.clone(),
        workers,
        shutdown.clone(),
    );
    handles.extend(run_workers(
        Arc::clone(&terminator),
        queues.termination.clone(),
        workers,
        shutdown.clone(),
    ));
    handles.push(spawn_resync(allocator, queues.allocation.clone(), resync, shutdown.clone()));
    handles.push(spawn_resync(terminator, queues.termination.clone(), resync, shutdown.clone()));

    let interval = ctx.config.consolidation.interval;
    handles.push(tokio::spawn(async move {
        consolidator.run(interval, shutdown).await;
    }));

    info!(workers, resync = ?resync, consolidation = ?interval, "controllers started");
    handles
}
