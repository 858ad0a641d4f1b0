//! Transaction element trees.
//!
//! An element tree describes the shape of one phase's job independently of the transaction
//! it is rendered for. Each leaf wraps the element producing its input; [`Element::Leaf`]
//! terminates a chain. The render visitor turns a tree into vertices.

use serde::{Deserialize, Serialize};

use crate::transaction::Phase;

/// Coordinator vertex gathering every participant's acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootLeaf {
    pub data: Box<Element>,
}

/// Source vertex replaying buffered mutations, one per participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCacheLeaf {
    pub data: Box<Element>,
}

/// Pre-write, commit or rollback of one participant.
///
/// A `sink` leaf ends the job itself; otherwise its acknowledgements flow on to a converter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationLeaf {
    pub data: Box<Element>,
    pub sink: bool,
}

/// Moves a participant's acknowledgements to the coordinator node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConverterLeaf {
    pub data: Box<Element>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Element {
    /// Terminal; renders nothing.
    Leaf,
    Root(RootLeaf),
    ScanCache(ScanCacheLeaf),
    PreWrite(MutationLeaf),
    Commit(MutationLeaf),
    Rollback(MutationLeaf),
    StreamConverter(StreamConverterLeaf),
    /// Structural grouping; must have at least one child.
    Composite { children: Vec<Element> },
}

impl Element {
    pub fn root(data: Element) -> Self {
        Element::Root(RootLeaf {
            data: Box::new(data),
        })
    }

    pub fn scan_cache(data: Element) -> Self {
        Element::ScanCache(ScanCacheLeaf {
            data: Box::new(data),
        })
    }

    pub fn stream_converter(data: Element) -> Self {
        Element::StreamConverter(StreamConverterLeaf {
            data: Box::new(data),
        })
    }

    /// Mutation leaf of `phase`.
    pub fn mutation(phase: Phase, data: Element, sink: bool) -> Self {
        let leaf = MutationLeaf {
            data: Box::new(data),
            sink,
        };
        match phase {
            Phase::PreWrite => Element::PreWrite(leaf),
            Phase::Commit => Element::Commit(leaf),
            Phase::Rollback => Element::Rollback(leaf),
        }
    }
}

/// Named templates, one per phase and participant cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementName {
    SingleTransactionPreWrite,
    MultiTransactionPreWrite,
    SingleTransactionCommit,
    MultiTransactionCommit,
    SingleTransactionRollback,
    MultiTransactionRollback,
}

impl ElementName {
    /// Template for `phase`; `multi` when the transaction has an open channel map.
    pub fn for_phase(phase: Phase, multi: bool) -> Self {
        match (phase, multi) {
            (Phase::PreWrite, false) => ElementName::SingleTransactionPreWrite,
            (Phase::PreWrite, true) => ElementName::MultiTransactionPreWrite,
            (Phase::Commit, false) => ElementName::SingleTransactionCommit,
            (Phase::Commit, true) => ElementName::MultiTransactionCommit,
            (Phase::Rollback, false) => ElementName::SingleTransactionRollback,
            (Phase::Rollback, true) => ElementName::MultiTransactionRollback,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            ElementName::SingleTransactionPreWrite | ElementName::MultiTransactionPreWrite => {
                Phase::PreWrite
            }
            ElementName::SingleTransactionCommit | ElementName::MultiTransactionCommit => {
                Phase::Commit
            }
            ElementName::SingleTransactionRollback | ElementName::MultiTransactionRollback => {
                Phase::Rollback
            }
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(
            self,
            ElementName::MultiTransactionPreWrite
                | ElementName::MultiTransactionCommit
                | ElementName::MultiTransactionRollback
        )
    }

    /// Builds the template tree.
    ///
    /// Single: `mutation(sink) <- scan_cache <- leaf`.
    /// Multi: `root <- stream_converter <- mutation <- scan_cache <- leaf`.
    pub fn template(&self) -> Element {
        let source = Element::scan_cache(Element::Leaf);
        if self.is_multi() {
            Element::root(Element::stream_converter(Element::mutation(
                self.phase(),
                source,
                false,
            )))
        } else {
            Element::mutation(self.phase(), source, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Element, ElementName};
    use crate::transaction::Phase;

    #[test]
    fn lookup_covers_every_phase_and_cardinality() {
        for phase in Phase::ALL {
            for multi in [false, true] {
                let name = ElementName::for_phase(phase, multi);
                assert_eq!(name.phase(), phase);
                assert_eq!(name.is_multi(), multi);
            }
        }
    }

    #[test]
    fn multi_templates_are_rooted() {
        let t = ElementName::MultiTransactionCommit.template();
        let Element::Root(root) = &t else {
            panic!("multi template must start at the root: {t:?}");
        };
        assert!(matches!(*root.data, Element::StreamConverter(_)));

        let single = ElementName::SingleTransactionCommit.template();
        let Element::Commit(leaf) = &single else {
            panic!("single commit template: {single:?}");
        };
        assert!(leaf.sink);
    }
}
