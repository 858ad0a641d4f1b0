use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dtx_common::{DtxError, EngineConfig, JobId, Location, Result};
use dtx_storage::{BruteForceDistanceTool, DistanceTool, RegionRouter};

/// Cooperative cancellation flag shared by every vertex of one running job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    canceled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, not-canceled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the job canceled. Idempotent.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// True once [`CancelToken::cancel`] was called.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// `Err(Canceled)` once canceled; called before every upstream pull and remote call.
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_canceled() {
            Err(DtxError::Canceled(format!("{what}: job canceled")))
        } else {
            Ok(())
        }
    }
}

/// Explicitly constructed services handed to operators.
///
/// Replaces any process-wide tool lookup: whoever builds the task context decides which
/// distance implementation vector scans use.
#[derive(Clone)]
pub struct Tools {
    /// Distance computation used by vector-distance scans.
    pub distance: Arc<dyn DistanceTool>,
}

impl Tools {
    /// Tools backed by the given distance implementation.
    pub fn new(distance: Arc<dyn DistanceTool>) -> Self {
        Self { distance }
    }
}

impl Default for Tools {
    fn default() -> Self {
        Self::new(Arc::new(BruteForceDistanceTool))
    }
}

impl std::fmt::Debug for Tools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tools")
            .field("distance", &self.distance.name())
            .finish()
    }
}

/// Per-job execution context shared by every vertex task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Job being executed.
    pub job_id: JobId,
    /// Node this context runs on.
    pub location: Location,
    /// Engine knobs (channel capacity, scan page size, lock TTL).
    pub config: EngineConfig,
    /// Store access; `None` for jobs that never touch a store.
    pub router: Option<Arc<RegionRouter>>,
    /// Injected operator services.
    pub tools: Tools,
    /// Cancellation shared by the job's vertices.
    pub cancel: CancelToken,
}

/// Shared handle passed to operators.
pub type SharedTaskContext = Arc<TaskContext>;

impl TaskContext {
    /// Context without store access, using default tools.
    pub fn new(job_id: JobId, location: Location, config: EngineConfig) -> Self {
        Self {
            job_id,
            location,
            config,
            router: None,
            tools: Tools::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Attaches store access.
    pub fn with_router(mut self, router: Arc<RegionRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Replaces the injected tools.
    pub fn with_tools(mut self, tools: Tools) -> Self {
        self.tools = tools;
        self
    }

    /// Store router, or an execution error when this context has none.
    pub fn router(&self) -> Result<&Arc<RegionRouter>> {
        self.router.as_ref().ok_or_else(|| {
            DtxError::Execution(format!("job {} has no store access", self.job_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::CancelToken;

    #[test]
    fn cancel_is_visible_to_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check("pull").is_ok());
        other.cancel();
        assert!(token.is_canceled());
        assert!(token.check("pull").is_err());
    }
}
