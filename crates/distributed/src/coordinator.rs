//! Transaction coordinator.
//!
//! Drives the commit protocol for one node:
//! - pre-write every participant; any failure rolls back all of them
//! - take a commit timestamp and commit every participant; any failure rolls back
//!
//! Each phase is rendered into its own job with a fresh cancellation token, so a failing
//! participant stops the rest of its phase and nothing of the next phase is dispatched.

use std::sync::Arc;

use dtx_common::{DtxError, EngineConfig, Location, Result, TxnId, global_metrics};
use dtx_execution::{Job, JobIdGenerator, JobResult, TaskContext, Tools, execute_job};
use dtx_storage::RegionRouter;
use tracing::{debug, error, info, warn};

use crate::render::render;
use crate::timestamp::TimestampOracle;
use crate::transaction::{Phase, Transaction, TxnState};

pub struct TransactionCoordinator {
    router: Arc<RegionRouter>,
    tso: Arc<dyn TimestampOracle>,
    config: EngineConfig,
    location: Location,
    tools: Tools,
    job_ids: JobIdGenerator,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("location", &self.location)
            .field("router", &self.router)
            .finish()
    }
}

impl TransactionCoordinator {
    pub fn new(
        router: Arc<RegionRouter>,
        tso: Arc<dyn TimestampOracle>,
        config: EngineConfig,
        location: Location,
    ) -> Self {
        let job_ids = JobIdGenerator::new(config.node_domain);
        Self {
            router,
            tso,
            config,
            location,
            tools: Tools::default(),
            job_ids,
        }
    }

    pub fn with_tools(mut self, tools: Tools) -> Self {
        self.tools = tools;
        self
    }

    pub fn router(&self) -> &Arc<RegionRouter> {
        &self.router
    }

    /// Starts a transaction at a fresh timestamp.
    pub fn begin(&self) -> Result<Transaction> {
        let start_ts = self.tso.next()?;
        Ok(Transaction::new(TxnId(start_ts), start_ts))
    }

    /// Pre-writes and commits `txn`; on failure the transaction is rolled back and the
    /// failure that aborted it is returned.
    pub async fn commit(&self, txn: &mut Transaction) -> Result<()> {
        if txn.is_empty() {
            txn.set_state(TxnState::Committed);
            return Ok(());
        }
        self.pre_write(txn).await?;
        self.commit_prewritten(txn).await
    }

    /// First phase: locks and stages every buffered write.
    pub async fn pre_write(&self, txn: &mut Transaction) -> Result<()> {
        match self.run_phase(txn, Phase::PreWrite).await {
            Ok(_) => {
                txn.set_state(TxnState::PreWritten);
                Ok(())
            }
            Err(e) => Err(self.abort(txn, Phase::PreWrite, e).await),
        }
    }

    /// Second phase of a pre-written transaction.
    pub async fn commit_prewritten(&self, txn: &mut Transaction) -> Result<()> {
        let commit_ts = self.tso.next()?;
        txn.set_commit_ts(commit_ts)?;
        match self.run_phase(txn, Phase::Commit).await {
            Ok(_) => {
                txn.set_state(TxnState::Committed);
                info!(
                    txn_id = %txn.id(),
                    start_ts = txn.start_ts(),
                    commit_ts,
                    participants = txn.participants().len(),
                    "transaction committed"
                );
                Ok(())
            }
            Err(e) => Err(self.abort(txn, Phase::Commit, e).await),
        }
    }

    /// Rolls back every participant of `txn`.
    pub async fn rollback(&self, txn: &mut Transaction) -> Result<()> {
        if !txn.is_empty() {
            self.run_phase(txn, Phase::Rollback).await?;
        }
        txn.set_state(TxnState::RolledBack);
        Ok(())
    }

    /// Compensates a failed phase. Returns the phase's own error; a rollback failure is only
    /// logged, since the locks it leaves behind expire with their TTL.
    async fn abort(
        &self,
        txn: &mut Transaction,
        phase: Phase,
        cause: DtxError,
    ) -> DtxError {
        warn!(txn_id = %txn.id(), phase = %phase, error = %cause, "phase failed; rolling back");
        if let Err(e) = self.rollback(txn).await {
            error!(txn_id = %txn.id(), error = %e, "rollback failed");
            txn.set_state(TxnState::RolledBack);
        }
        cause
    }

    async fn run_phase(&self, txn: &mut Transaction, phase: Phase) -> Result<JobResult> {
        let outcome = self.render_and_execute(txn, phase).await;
        let label = if outcome.is_ok() { "ok" } else { "failed" };
        global_metrics().inc_phase_outcome(phase.as_str(), label);
        outcome
    }

    async fn render_and_execute(&self, txn: &mut Transaction, phase: Phase) -> Result<JobResult> {
        txn.open_channels(self.router.directory())?;
        let mut job = Job::new(self.job_ids.next_id());
        render(&mut job, txn, phase, &self.location, true, &self.config)?;
        let ctx = TaskContext::new(job.id(), self.location.clone(), self.config.clone())
            .with_router(Arc::clone(&self.router))
            .with_tools(self.tools.clone());
        debug!(
            job_id = %job.id(),
            txn_id = %txn.id(),
            phase = %phase,
            channels = txn.channel_map().len(),
            "dispatching phase"
        );
        execute_job(Arc::new(job), Arc::new(ctx)).await
    }
}
