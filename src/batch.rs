//! Mutation batcher: coalesces bursts of child mounts per parent.
//!
//! Every enqueue restarts the idle window (rolling debounce). Inserts under
//! the same parent are spliced into one pending copy of that parent, and a
//! flush emits a single mount per pending parent. Re-sending a whole parent
//! is safe because operations describe mirror state; they are not commands.

use crate::identity::NodeId;
use crate::tree::{Anchor, MirroredNode, Operation, TreeMirror};

use std::time::{Duration, Instant};

/// Where the batcher reads a parent's current state on first enqueue.
pub trait SnapshotSource {
    /// The parent's own parent (`None` for a root) and its current subtree.
    fn parent_snapshot(&self, id: &NodeId) -> Option<(Option<NodeId>, MirroredNode)>;
}

impl SnapshotSource for TreeMirror {
    fn parent_snapshot(&self, id: &NodeId) -> Option<(Option<NodeId>, MirroredNode)> {
        let record = self.record(id)?;
        Some((record.parent_id.clone(), self.snapshot(id)?))
    }
}

#[derive(Debug)]
struct PendingParent {
    grandparent: Option<NodeId>,
    node: MirroredNode,
}

#[derive(Debug)]
pub struct MutationBatcher {
    window: Duration,
    pending: Vec<PendingParent>,
    last_enqueue: Option<Instant>,
}

impl MutationBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
            last_enqueue: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_parents(&self) -> usize {
        self.pending.len()
    }

    /// When the current burst flushes, if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        self.last_enqueue.map(|t| t + self.window)
    }

    /// Queue `node` under `parent_id`. Returns false when the insert was
    /// dropped (unknown parent, or anchor sibling missing from the batch).
    pub fn enqueue(
        &mut self,
        now: Instant,
        source: &dyn SnapshotSource,
        parent_id: &NodeId,
        anchor: &Anchor,
        node: MirroredNode,
    ) -> bool {
        self.last_enqueue = Some(now);

        let index = match self.pending.iter().position(|p| &p.node.id == parent_id) {
            Some(i) => i,
            None => {
                let Some((grandparent, snapshot)) = source.parent_snapshot(parent_id) else {
                    tracing::error!(parent = %parent_id, node = %node.id, "batched mount under unknown parent; dropping");
                    return false;
                };
                self.pending.push(PendingParent {
                    grandparent,
                    node: snapshot,
                });
                self.pending.len() - 1
            }
        };

        let children = &mut self.pending[index].node.children;
        if let Some(existing) = children.iter_mut().find(|c| c.id == node.id) {
            *existing = node;
            return true;
        }

        let siblings: Vec<NodeId> = children.iter().map(|c| c.id.clone()).collect();
        match anchor.resolve_index(&siblings) {
            Some(at) => {
                children.insert(at, node);
                true
            }
            None => {
                tracing::error!(
                    parent = %parent_id,
                    node = %node.id,
                    anchor = ?anchor.reference_id,
                    "anchor sibling not found in pending batch; dropping"
                );
                false
            }
        }
    }

    /// Flush if the idle window has elapsed since the last enqueue.
    pub fn poll(&mut self, now: Instant) -> Vec<Operation> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.flush(),
            _ => Vec::new(),
        }
    }

    /// Emit one mount per pending parent, in first-enqueue order.
    pub fn flush(&mut self) -> Vec<Operation> {
        self.last_enqueue = None;
        self.pending
            .drain(..)
            .map(|p| match p.grandparent {
                Some(parent_id) => Operation::MountNode {
                    parent_id,
                    anchor: Anchor::none(),
                    node: p.node,
                },
                None => Operation::MountRoot { node: p.node },
            })
            .collect()
    }
}
