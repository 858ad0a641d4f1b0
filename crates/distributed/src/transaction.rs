//! Client-side transaction state.
//!
//! A [`Transaction`] buffers mutations per participant partition until commit. At the start
//! of every phase the coordinator rebuilds the channel map from the partition directory; it
//! is read-only while the phase runs.

use std::collections::BTreeMap;
use std::fmt;

use dtx_common::{DtxError, Location, PartitionId, Result, TxnId};
use dtx_storage::{Mutation, PartitionDirectory};
use serde::{Deserialize, Serialize};

/// Commit protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    PreWrite,
    Commit,
    Rollback,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::PreWrite, Phase::Commit, Phase::Rollback];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreWrite => "pre_write",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Active,
    PreWritten,
    Committed,
    RolledBack,
}

/// Connection handle to one participant: the partition and the node serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub region: PartitionId,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    id: TxnId,
    start_ts: u64,
    commit_ts: Option<u64>,
    state: TxnState,
    primary_key: Option<Vec<u8>>,
    cache: BTreeMap<PartitionId, BTreeMap<Vec<u8>, Mutation>>,
    channel_map: BTreeMap<PartitionId, Channel>,
}

impl Transaction {
    pub fn new(id: TxnId, start_ts: u64) -> Self {
        Self {
            id,
            start_ts,
            commit_ts: None,
            state: TxnState::Active,
            primary_key: None,
            cache: BTreeMap::new(),
            channel_map: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn commit_ts(&self) -> Option<u64> {
        self.commit_ts
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Key locked first; commit of this key decides the transaction.
    pub fn primary_key(&self) -> Option<&[u8]> {
        self.primary_key.as_deref()
    }

    /// Buffers a mutation; a later write of the same key replaces the earlier one.
    pub fn buffer(&mut self, partition: PartitionId, mutation: Mutation) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(DtxError::Execution(format!(
                "{} is {:?} and no longer accepts writes",
                self.id, self.state
            )));
        }
        if self.primary_key.is_none() {
            self.primary_key = Some(mutation.key.clone());
        }
        self.cache
            .entry(partition)
            .or_default()
            .insert(mutation.key.clone(), mutation);
        Ok(())
    }

    /// Partitions with buffered writes, ascending.
    pub fn participants(&self) -> Vec<PartitionId> {
        self.cache.keys().copied().collect()
    }

    /// Buffered writes of one partition in key order.
    pub fn mutations(&self, partition: PartitionId) -> Vec<Mutation> {
        self.cache
            .get(&partition)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn channel_map(&self) -> &BTreeMap<PartitionId, Channel> {
        &self.channel_map
    }

    pub fn channel(&self, partition: PartitionId) -> Option<&Channel> {
        self.channel_map.get(&partition)
    }

    /// Rebuilds the channel map for a phase.
    ///
    /// A single-participant transaction runs locally and keeps the map empty; otherwise every
    /// participant gets a channel to its current leader.
    pub fn open_channels(&mut self, directory: &PartitionDirectory) -> Result<()> {
        self.channel_map.clear();
        if self.cache.len() <= 1 {
            return Ok(());
        }
        for partition in self.cache.keys() {
            let region = directory.region(*partition)?;
            self.channel_map.insert(
                *partition,
                Channel {
                    region: *partition,
                    location: region.leader,
                },
            );
        }
        Ok(())
    }

    /// Number of buffered writes, one per distinct key.
    pub fn len(&self) -> usize {
        self.cache.values().map(BTreeMap::len).sum()
    }

    pub fn set_commit_ts(&mut self, commit_ts: u64) -> Result<()> {
        if matches!(self.state, TxnState::Committed | TxnState::RolledBack) {
            return Err(DtxError::Execution(format!(
                "{} is {:?} and cannot take a commit ts",
                self.id, self.state
            )));
        }
        if commit_ts <= self.start_ts {
            return Err(DtxError::Execution(format!(
                "commit ts {commit_ts} of {} is not after start ts {}",
                self.id, self.start_ts
            )));
        }
        self.commit_ts = Some(commit_ts);
        Ok(())
    }

    pub(crate) fn set_state(&mut self, state: TxnState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use dtx_common::{Location, PartitionId, TableId, TxnId};
    use dtx_storage::{Mutation, MutationOp, PartitionDirectory, RegionDescriptor, RegionEpoch};

    use super::{Transaction, TxnState};

    fn put(key: &[u8], value: &[u8]) -> Mutation {
        Mutation {
            op: MutationOp::Put,
            key: key.to_vec(),
            value: Some(value.to_vec()),
        }
    }

    fn region(id: u64, leader: &str) -> RegionDescriptor {
        RegionDescriptor {
            id: PartitionId(id),
            table: TableId(1),
            start_key: vec![id as u8],
            end_key: vec![id as u8 + 1],
            leader: Location::new(leader, 1),
            peers: vec![Location::new(leader, 1)],
            epoch: RegionEpoch::new(1, 1),
        }
    }

    #[test]
    fn later_writes_replace_earlier_ones_and_first_key_is_primary() {
        let mut txn = Transaction::new(TxnId(1), 10);
        txn.buffer(PartitionId(2), put(b"b", b"1")).expect("buffer");
        txn.buffer(PartitionId(1), put(b"a", b"1")).expect("buffer");
        txn.buffer(PartitionId(2), put(b"b", b"2")).expect("buffer");
        assert_eq!(txn.primary_key(), Some(&b"b"[..]));
        assert_eq!(txn.participants(), vec![PartitionId(1), PartitionId(2)]);
        let muts = txn.mutations(PartitionId(2));
        assert_eq!(muts.len(), 1);
        assert_eq!(muts[0].value.as_deref(), Some(&b"2"[..]));
        assert_eq!(txn.len(), 2);
    }

    #[test]
    fn channel_map_is_empty_for_one_participant() {
        let dir = PartitionDirectory::from_regions([region(1, "n1"), region(2, "n2")]);
        let mut txn = Transaction::new(TxnId(1), 10);
        txn.buffer(PartitionId(1), put(b"a", b"1")).expect("buffer");
        txn.open_channels(&dir).expect("open");
        assert!(txn.channel_map().is_empty());

        txn.buffer(PartitionId(2), put(b"b", b"1")).expect("buffer");
        txn.open_channels(&dir).expect("open");
        assert_eq!(txn.channel_map().len(), 2);
        assert_eq!(
            txn.channel(PartitionId(2)).expect("channel").location,
            Location::new("n2", 1)
        );
    }

    #[test]
    fn finished_transactions_reject_writes() {
        let mut txn = Transaction::new(TxnId(1), 10);
        txn.set_state(TxnState::Committed);
        assert!(txn.buffer(PartitionId(1), put(b"a", b"1")).is_err());
        let err = txn.set_commit_ts(20).expect_err("finished");
        assert!(err.to_string().contains("cannot take a commit ts"), "{err}");
        assert_eq!(txn.commit_ts(), None);
    }

    #[test]
    fn commit_ts_must_follow_start_ts() {
        let mut txn = Transaction::new(TxnId(1), 10);
        assert!(txn.set_commit_ts(10).is_err());
        txn.set_commit_ts(11).expect("later ts");
        assert_eq!(txn.commit_ts(), Some(11));
    }
}
