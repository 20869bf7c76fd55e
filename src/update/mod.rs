pub use super::{Error, ErrorKind, Result, ResultExt};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agent::Agent;
use clock::Clock;
use cpi::Cloud;
use store::Store;

/// Resource pool reconciliation
pub mod pools;

/// Per-instance transition pipeline
pub mod instance;

/// Canary-then-batch rollout of one job
pub mod job;

/// Serial/parallel scheduling of many job updaters
pub mod batch;

/// Cooperative cancellation token
///
/// Set once, read at every suspension point; in-flight transitions finish
/// their current step and then bail with `Cancelled`.
#[derive(Clone, Default)]
pub struct Canceller {
    flag: Arc<AtomicBool>,
}

impl Canceller {
    pub fn new() -> Canceller {
        Canceller::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.cancelled() {
            return Err(ErrorKind::Cancelled.into());
        }
        Ok(())
    }
}

/// Everything an updater thread needs, cheaply cloneable
#[derive(Clone)]
pub struct UpdateCtx {
    pub deployment: String,
    pub store: Store,
    pub cloud: Arc<dyn Cloud>,
    pub agent: Arc<dyn Agent>,
    pub clock: Arc<dyn Clock>,
    pub cancel: Canceller,
    /// Agent poll cadence inside watch windows
    pub poll_ms: u64,
    /// Global concurrency cap for this deployment
    pub cap: usize,
}
