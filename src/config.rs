use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How many records or graph nodes a long-running phase processes between
/// cancellation checks.
pub const CANCEL_CHECK_INTERVAL: usize = 8 * 1024;

/// Cooperative cancellation handle, cloneable across threads.
///
/// A build observing a cancelled token stops at the next check interval,
/// discards its temporary files and returns `HprofRetainError::Cancelled`.
#[derive(Debug, Clone, Default)]
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
}

/// Options accepted by `Snapshot::open` and the index builder.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Peak working-set bound in bytes for any single phase. Buffer pools,
    /// the inbound inversion partitions, the page cache and the graph-phase
    /// arrays are all sized from this.
    pub memory_budget: usize,
    /// Rebuild the index even if a fresh one exists next to the dump.
    pub rebuild: bool,
    pub cancel: CancelToken,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        AnalysisOptions {
            memory_budget: 1024 * 1024 * 1024,
            rebuild: false,
            cancel: CancelToken::new(),
        }
    }
}

impl AnalysisOptions {
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_rebuild(mut self, rebuild: bool) -> Self {
        self.rebuild = rebuild;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
