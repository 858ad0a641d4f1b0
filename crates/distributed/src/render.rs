//! Rendering of transaction phases into jobs.
//!
//! [`render`] picks the phase template by participant cardinality and walks it depth first.
//! Every visit returns the still-unconsumed outputs of the subtree; the parent links them to
//! the vertices it creates. A well-formed tree leaves nothing open at the top: the job ends in
//! a sink mutation vertex or in the coordinator root.

use dtx_common::{DtxError, EngineConfig, Location, Result};
use dtx_execution::{Job, Output};
use tracing::debug;

use crate::element::{Element, ElementName};
use crate::transaction::{Phase, Transaction};
use crate::visit;

/// Binds element leaves to vertices of one job.
pub struct RenderVisitor<'a> {
    pub(crate) job: &'a mut Job,
    pub(crate) txn: &'a Transaction,
    pub(crate) current_location: &'a Location,
    pub(crate) config: &'a EngineConfig,
}

impl<'a> RenderVisitor<'a> {
    pub fn new(
        job: &'a mut Job,
        txn: &'a Transaction,
        current_location: &'a Location,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            job,
            txn,
            current_location,
            config,
        }
    }

    /// Renders `element` and returns its open outputs.
    pub fn visit(&mut self, element: &Element) -> Result<Vec<Output>> {
        match element {
            Element::Leaf => Ok(Vec::new()),
            Element::Root(leaf) => visit::root(self, leaf),
            Element::ScanCache(leaf) => visit::scan_cache(self, leaf),
            Element::PreWrite(leaf) => visit::mutation(self, Phase::PreWrite, leaf),
            Element::Commit(leaf) => visit::mutation(self, Phase::Commit, leaf),
            Element::Rollback(leaf) => visit::mutation(self, Phase::Rollback, leaf),
            Element::StreamConverter(leaf) => visit::stream_converter(self, leaf),
            Element::Composite { children } => {
                if children.is_empty() {
                    return Err(DtxError::MalformedPlan(
                        "composite element without children".to_string(),
                    ));
                }
                let mut outputs = Vec::new();
                for child in children {
                    outputs.extend(self.visit(child)?);
                }
                Ok(outputs)
            }
        }
    }
}

/// Renders the `phase` template for `txn` into `job`.
///
/// The multi-partition template is used whenever the transaction's channel map is open.
pub fn render(
    job: &mut Job,
    txn: &Transaction,
    phase: Phase,
    current_location: &Location,
    check_root: bool,
    config: &EngineConfig,
) -> Result<Vec<Output>> {
    let name = ElementName::for_phase(phase, !txn.channel_map().is_empty());
    let outputs = render_element(
        job,
        txn,
        &name.template(),
        current_location,
        check_root,
        config,
    )?;
    debug!(
        job_id = %job.id(),
        txn_id = %txn.id(),
        phase = %phase,
        template = ?name,
        vertices = job.len(),
        job = ?job,
        "rendered transaction job"
    );
    Ok(outputs)
}

/// Renders an arbitrary element tree.
///
/// With `check_root`, any output left open at the top is a malformed plan.
pub fn render_element(
    job: &mut Job,
    txn: &Transaction,
    element: &Element,
    current_location: &Location,
    check_root: bool,
    config: &EngineConfig,
) -> Result<Vec<Output>> {
    if txn.participants().is_empty() {
        return Err(DtxError::Planning(format!(
            "{} has no participants to render",
            txn.id()
        )));
    }
    let outputs = RenderVisitor::new(job, txn, current_location, config).visit(element)?;
    if check_root && !outputs.is_empty() {
        return Err(DtxError::MalformedPlan(format!(
            "{} leaves {} open outputs; the plan must end at its root",
            job.id(),
            outputs.len()
        )));
    }
    Ok(outputs)
}
