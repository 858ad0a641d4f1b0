//! Job graph model.
//!
//! A [`Job`] owns its vertices; edges ([`Output`]) name their producer and consumers by
//! [`VertexId`] only, so the whole graph serializes as plain data. Vertex ids come from the
//! job's own sequence, seeded from the job id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use dtx_common::{DtxError, JobId, Location, PartitionId, Result, VertexId};
use serde::{Deserialize, Serialize};

use crate::params::{OperatorParams, VertexKind};

/// Stable id of an edge: producer plus position in its output list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputId {
    /// Producing vertex.
    pub producer: VertexId,
    /// Index into the producer's outputs.
    pub index: usize,
}

/// Routing hint carried by an edge crossing a node boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHint {
    /// Partition whose tuples travel on this edge, if partition-scoped.
    pub partition: Option<PartitionId>,
    /// Node the producer runs on.
    pub location: Location,
}

/// Typed edge from one producer to one or more consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    /// Edge id.
    pub id: OutputId,
    /// Consumers, recorded by id.
    pub consumers: Vec<VertexId>,
    /// Routing hint.
    pub hint: OutputHint,
}

/// One placed operator of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    /// Unique within the job.
    pub id: VertexId,
    /// Node that runs this vertex.
    pub location: Location,
    /// Operator parameters.
    pub params: OperatorParams,
    /// Outgoing edges; empty for sinks.
    pub outputs: Vec<Output>,
}

impl Vertex {
    /// Kind tag of this vertex's operator.
    pub fn kind(&self) -> VertexKind {
        self.params.kind()
    }

    /// True when nothing consumes this vertex's tuples inside the job.
    pub fn is_sink(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Identified collection of vertices for one phase or query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "JobRepr", into = "JobRepr")]
pub struct Job {
    id: JobId,
    next_seq: u64,
    vertices: BTreeMap<VertexId, Vertex>,
    root: Option<VertexId>,
}

// Wire form: vertices as a list, since JSON object keys must be strings.
#[derive(Serialize, Deserialize)]
struct JobRepr {
    id: JobId,
    next_seq: u64,
    vertices: Vec<Vertex>,
    root: Option<VertexId>,
}

impl From<Job> for JobRepr {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            next_seq: job.next_seq,
            vertices: job.vertices.into_values().collect(),
            root: job.root,
        }
    }
}

impl From<JobRepr> for Job {
    fn from(repr: JobRepr) -> Self {
        Self {
            id: repr.id,
            next_seq: repr.next_seq,
            vertices: repr.vertices.into_iter().map(|v| (v.id, v)).collect(),
            root: repr.root,
        }
    }
}

impl Job {
    /// Empty job; vertex ids start at `id.seq`.
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            next_seq: id.seq,
            vertices: BTreeMap::new(),
            root: None,
        }
    }

    /// Job id.
    pub fn id(&self) -> JobId {
        self.id
    }

    fn next_vertex_id(&mut self) -> VertexId {
        let id = VertexId(self.next_seq);
        self.next_seq += 1;
        id
    }

    /// Adds a vertex with a fresh id.
    pub fn add_vertex(&mut self, location: Location, params: OperatorParams) -> VertexId {
        let id = self.next_vertex_id();
        self.vertices.insert(
            id,
            Vertex {
                id,
                location,
                params,
                outputs: Vec::new(),
            },
        );
        id
    }

    /// Opens a new, not yet consumed output on `producer`.
    pub fn add_output(&mut self, producer: VertexId, partition: Option<PartitionId>) -> Result<Output> {
        let vertex = self.vertex_mut(producer)?;
        let output = Output {
            id: OutputId {
                producer,
                index: vertex.outputs.len(),
            },
            consumers: Vec::new(),
            hint: OutputHint {
                partition,
                location: vertex.location.clone(),
            },
        };
        vertex.outputs.push(output.clone());
        Ok(output)
    }

    /// Records `consumer` as a reader of `output`.
    pub fn link(&mut self, output: OutputId, consumer: VertexId) -> Result<()> {
        if !self.vertices.contains_key(&consumer) {
            return Err(DtxError::MalformedPlan(format!(
                "consumer {consumer} is not part of {}",
                self.id
            )));
        }
        let job_id = self.id;
        let out = self
            .vertex_mut(output.producer)?
            .outputs
            .get_mut(output.index)
            .ok_or_else(|| {
                DtxError::MalformedPlan(format!(
                    "output {}#{} does not exist in {job_id}",
                    output.producer, output.index
                ))
            })?;
        if !out.consumers.contains(&consumer) {
            out.consumers.push(consumer);
        }
        Ok(())
    }

    /// Designates the vertex whose results are the job's result.
    pub fn set_root(&mut self, root: VertexId) -> Result<()> {
        if let Some(existing) = self.root {
            return Err(DtxError::MalformedPlan(format!(
                "{} already has root {existing}",
                self.id
            )));
        }
        self.vertex(root)?;
        self.root = Some(root);
        Ok(())
    }

    /// Root vertex id, if one was designated.
    pub fn root(&self) -> Option<VertexId> {
        self.root
    }

    /// Vertex by id.
    pub fn vertex(&self, id: VertexId) -> Result<&Vertex> {
        self.vertices
            .get(&id)
            .ok_or_else(|| DtxError::MalformedPlan(format!("vertex {id} is not part of {}", self.id)))
    }

    fn vertex_mut(&mut self, id: VertexId) -> Result<&mut Vertex> {
        let job_id = self.id;
        self.vertices
            .get_mut(&id)
            .ok_or_else(|| DtxError::MalformedPlan(format!("vertex {id} is not part of {job_id}")))
    }

    /// Vertices in id order.
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.values()
    }

    /// Vertices placed on `location`; what one node materializes.
    pub fn vertices_at<'a>(&'a self, location: &'a Location) -> impl Iterator<Item = &'a Vertex> {
        self.vertices.values().filter(move |v| &v.location == location)
    }

    /// Vertices of one kind.
    pub fn vertices_of(&self, kind: VertexKind) -> Vec<&Vertex> {
        self.vertices.values().filter(|v| v.kind() == kind).collect()
    }

    /// Number of vertices.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// True when nothing was rendered.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Producers feeding `id`, in producer id order.
    pub fn inputs_of(&self, id: VertexId) -> Vec<VertexId> {
        self.vertices
            .values()
            .filter(|v| {
                v.outputs
                    .iter()
                    .any(|o| o.consumers.contains(&id))
            })
            .map(|v| v.id)
            .collect()
    }

    /// Structural checks run before dispatch: every edge has a consumer and the graph is
    /// acyclic.
    pub fn validate(&self) -> Result<()> {
        for v in self.vertices.values() {
            for out in &v.outputs {
                if out.consumers.is_empty() {
                    return Err(DtxError::MalformedPlan(format!(
                        "output {}#{} of {} has no consumer",
                        out.id.producer,
                        out.id.index,
                        self.id
                    )));
                }
                for c in &out.consumers {
                    self.vertex(*c)?;
                }
            }
        }
        // Kahn's algorithm over consumer edges.
        let mut indegree: BTreeMap<VertexId, usize> =
            self.vertices.keys().map(|id| (*id, 0)).collect();
        for v in self.vertices.values() {
            let consumers: BTreeSet<VertexId> = v
                .outputs
                .iter()
                .flat_map(|o| o.consumers.iter().copied())
                .collect();
            for c in consumers {
                *indegree.entry(c).or_default() += 1;
            }
        }
        let mut ready: Vec<VertexId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut seen = 0usize;
        while let Some(id) = ready.pop() {
            seen += 1;
            let consumers: BTreeSet<VertexId> = self.vertices[&id]
                .outputs
                .iter()
                .flat_map(|o| o.consumers.iter().copied())
                .collect();
            for c in consumers {
                if let Some(d) = indegree.get_mut(&c) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(c);
                    }
                }
            }
        }
        if seen != self.vertices.len() {
            return Err(DtxError::MalformedPlan(format!("{} contains a cycle", self.id)));
        }
        Ok(())
    }

    /// JSON form shipped to participant nodes.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| DtxError::Execution(format!("job serialization failed: {e}")))
    }

    /// Parses a job shipped by [`Job::to_json`].
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| DtxError::Execution(format!("job deserialization failed: {e}")))
    }
}

/// Issues cluster-unique job ids for one node domain.
///
/// Sequences advance in strides so the vertex ids of consecutive jobs never overlap.
#[derive(Debug)]
pub struct JobIdGenerator {
    domain: u64,
    next: AtomicU64,
}

/// Vertex ids available to one job.
pub const JOB_SEQ_STRIDE: u64 = 1 << 16;

impl JobIdGenerator {
    /// Generator for `domain`, starting at sequence `JOB_SEQ_STRIDE`.
    pub fn new(domain: u64) -> Self {
        Self {
            domain,
            next: AtomicU64::new(JOB_SEQ_STRIDE),
        }
    }

    /// Next job id.
    pub fn next_id(&self) -> JobId {
        JobId {
            domain: self.domain,
            seq: self.next.fetch_add(JOB_SEQ_STRIDE, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use dtx_common::{JobId, Location, PartitionId, VertexId};

    use super::{Job, JobIdGenerator};
    use crate::params::{OperatorParams, RootParam, StreamConverterParam};

    fn converter(p: u64) -> OperatorParams {
        OperatorParams::StreamConverter(StreamConverterParam {
            partition: PartitionId(p),
        })
    }

    #[test]
    fn vertex_ids_are_seeded_from_the_job_sequence() {
        let mut job = Job::new(JobId { domain: 1, seq: 100 });
        let a = job.add_vertex(Location::new("n1", 1), converter(1));
        let b = job.add_vertex(Location::new("n1", 1), converter(2));
        assert_eq!(a, VertexId(100));
        assert_eq!(b, VertexId(101));
    }

    #[test]
    fn dangling_output_fails_validation() {
        let mut job = Job::new(JobId { domain: 1, seq: 0 });
        let a = job.add_vertex(Location::new("n1", 1), converter(1));
        let out = job.add_output(a, Some(PartitionId(1))).expect("output");
        assert!(job.validate().is_err());
        let root = job.add_vertex(
            Location::new("n1", 1),
            OperatorParams::Root(RootParam { participants: 1 }),
        );
        job.link(out.id, root).expect("link");
        job.validate().expect("valid");
        assert_eq!(job.inputs_of(root), vec![a]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut job = Job::new(JobId { domain: 1, seq: 0 });
        let a = job.add_vertex(Location::new("n1", 1), converter(1));
        let b = job.add_vertex(Location::new("n1", 1), converter(2));
        let ab = job.add_output(a, None).expect("a->b");
        job.link(ab.id, b).expect("link");
        let ba = job.add_output(b, None).expect("b->a");
        job.link(ba.id, a).expect("link");
        assert!(job.validate().is_err());
    }

    #[test]
    fn job_survives_json_shipping() {
        let mut job = Job::new(JobId { domain: 2, seq: 7 });
        let a = job.add_vertex(Location::new("n1", 1), converter(1));
        job.set_root(a).expect("root");
        let copy = Job::from_json(&job.to_json().expect("json")).expect("parse");
        assert_eq!(copy.id(), job.id());
        assert_eq!(copy.root(), Some(a));
        assert_eq!(copy.vertex(a).expect("vertex"), job.vertex(a).expect("vertex"));
    }

    #[test]
    fn job_ids_do_not_share_vertex_ranges() {
        let ids = JobIdGenerator::new(3);
        let a = ids.next_id();
        let b = ids.next_id();
        assert_eq!(a.domain, 3);
        assert!(b.seq >= a.seq + super::JOB_SEQ_STRIDE);
    }
}
