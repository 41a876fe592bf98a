use crate::error::{HaloError, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Pipeline phases. Cancellation is only honoured at their boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    IndexBuild,
    Linking,
    DensityEstimation,
    ChainStep,
    Regroup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IndexBuild => "index build",
            Self::Linking => "linking",
            Self::DensityEstimation => "density estimation",
            Self::ChainStep => "chain step",
            Self::Regroup => "regroup",
        };
        f.write_str(name)
    }
}

/// Cloneable cancellation flag shared between the caller and a running pass.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Fails with `Cancelled(completed)` if cancellation was requested.
    pub fn check(&self, completed: Phase) -> Result<()> {
        if self.is_cancelled() {
            tracing::info!(phase = %completed, "cancelled");
            return Err(HaloError::Cancelled(completed));
        }
        Ok(())
    }
}
