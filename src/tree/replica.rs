//! Receiving-side copy of a mirrored tree.
//!
//! Applies [`Operation`]s as they arrive over the relay. Operations that
//! reference a parent the replica does not hold are dropped with a warning.
//! A mount whose anchor sibling has not arrived yet is parked under its
//! parent and retried after every insert there, so sibling mounts converge
//! to host order regardless of arrival order.

use crate::diagnostics;
use crate::host::NodeKind;
use crate::identity::NodeId;
use crate::tree::node::{Anchor, MirroredNode, NodePatch, Operation};

use std::collections::HashMap;

/// What happened to one applied operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    Deferred,
    Dropped,
}

#[derive(Debug, Clone)]
struct Entry {
    kind: NodeKind,
    display_name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Default)]
pub struct Replica {
    entries: HashMap<NodeId, Entry>,
    roots: Vec<NodeId>,
    deferred: HashMap<NodeId, Vec<(Anchor, MirroredNode)>>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mounts still waiting for their anchor sibling.
    pub fn deferred_len(&self) -> usize {
        self.deferred.values().map(Vec::len).sum()
    }

    pub fn apply(&mut self, op: &Operation) -> Applied {
        match op {
            Operation::MountRoot { node } => {
                self.mount_root(node);
                Applied::Applied
            }
            Operation::MountNode {
                parent_id,
                anchor,
                node,
            } => self.mount_node(parent_id, anchor, node),
            Operation::UpdateNode { id, patch } => self.update_node(id, patch),
            Operation::UnmountNode { parent_id, id } => self.unmount_node(parent_id.as_ref(), id),
        }
    }

    /// Replace everything with a full skeleton.
    pub fn reset(&mut self, roots: &[MirroredNode]) {
        self.entries.clear();
        self.roots.clear();
        self.deferred.clear();
        for root in roots {
            self.mount_root(root);
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<MirroredNode> {
        let entry = self.entries.get(id)?;
        Some(MirroredNode {
            id: id.clone(),
            kind: entry.kind,
            display_name: entry.display_name.clone(),
            children: entry.children.iter().filter_map(|c| self.get(c)).collect(),
        })
    }

    pub fn skeleton(&self) -> Vec<MirroredNode> {
        self.roots.iter().filter_map(|r| self.get(r)).collect()
    }

    fn mount_root(&mut self, node: &MirroredNode) {
        let position = self.roots.iter().position(|r| r == &node.id);
        if self.entries.contains_key(&node.id) {
            self.detach(&node.id);
            self.remove_subtree(&node.id);
        }
        self.index_subtree(None, node);
        match position {
            Some(i) => self.roots.insert(i.min(self.roots.len()), node.id.clone()),
            None => self.roots.push(node.id.clone()),
        }
    }

    fn mount_node(&mut self, parent_id: &NodeId, anchor: &Anchor, node: &MirroredNode) -> Applied {
        if !self.entries.contains_key(parent_id) {
            diagnostics::warn(format!(
                "mount of {} under unknown parent {}; dropping",
                node.id, parent_id
            ));
            return Applied::Dropped;
        }

        // A re-sent node is an idempotent observation: replace it in place.
        let same_parent = self
            .entries
            .get(&node.id)
            .is_some_and(|e| e.parent.as_ref() == Some(parent_id));
        if same_parent {
            let index = self.entries[parent_id]
                .children
                .iter()
                .position(|c| c == &node.id);
            self.remove_subtree(&node.id);
            self.index_subtree(Some(parent_id), node);
            if let (Some(index), Some(parent)) = (index, self.entries.get_mut(parent_id)) {
                parent.children[index] = node.id.clone();
            }
            self.retry_deferred(parent_id);
            return Applied::Applied;
        }

        if !self.try_insert(parent_id, anchor, node) {
            diagnostics::warn(format!(
                "mount of {} under {} waits for anchor {:?}; deferring",
                node.id, parent_id, anchor
            ));
            self.deferred
                .entry(parent_id.clone())
                .or_default()
                .push((anchor.clone(), node.clone()));
            return Applied::Deferred;
        }
        self.retry_deferred(parent_id);
        Applied::Applied
    }

    fn update_node(&mut self, id: &NodeId, patch: &NodePatch) -> Applied {
        let Some(entry) = self.entries.get_mut(id) else {
            diagnostics::warn(format!("update for unknown node {}; dropping", id));
            return Applied::Dropped;
        };
        if let Some(kind) = patch.kind {
            entry.kind = kind;
        }
        if let Some(name) = &patch.display_name {
            entry.display_name = name.clone();
        }
        Applied::Applied
    }

    fn unmount_node(&mut self, parent_id: Option<&NodeId>, id: &NodeId) -> Applied {
        if let Some(parent) = parent_id {
            if !self.entries.contains_key(parent) {
                diagnostics::warn(format!(
                    "unmount of {} under unknown parent {}; dropping",
                    id, parent
                ));
                return Applied::Dropped;
            }
        }
        if !self.entries.contains_key(id) {
            tracing::debug!(id = %id, "unmount for unknown node");
            return Applied::Dropped;
        }
        self.detach(id);
        self.remove_subtree(id);
        Applied::Applied
    }

    fn try_insert(&mut self, parent_id: &NodeId, anchor: &Anchor, node: &MirroredNode) -> bool {
        let Some(index) = self
            .entries
            .get(parent_id)
            .and_then(|p| anchor.resolve_index(&p.children))
        else {
            return false;
        };
        if self.entries.contains_key(&node.id) {
            self.detach(&node.id);
            self.remove_subtree(&node.id);
        }
        self.index_subtree(Some(parent_id), node);
        if let Some(parent) = self.entries.get_mut(parent_id) {
            let index = index.min(parent.children.len());
            parent.children.insert(index, node.id.clone());
        }
        true
    }

    fn retry_deferred(&mut self, parent_id: &NodeId) {
        loop {
            let Some(waiting) = self.deferred.remove(parent_id) else {
                return;
            };
            let mut progressed = false;
            let mut still_waiting = Vec::new();
            for (anchor, node) in waiting {
                if self.try_insert(parent_id, &anchor, &node) {
                    progressed = true;
                } else {
                    still_waiting.push((anchor, node));
                }
            }
            if !still_waiting.is_empty() {
                self.deferred.insert(parent_id.clone(), still_waiting);
            }
            if !progressed {
                return;
            }
        }
    }

    fn index_subtree(&mut self, parent: Option<&NodeId>, node: &MirroredNode) {
        self.entries.insert(
            node.id.clone(),
            Entry {
                kind: node.kind,
                display_name: node.display_name.clone(),
                parent: parent.cloned(),
                children: node.children.iter().map(|c| c.id.clone()).collect(),
            },
        );
        for child in &node.children {
            self.index_subtree(Some(&node.id), child);
        }
    }

    fn detach(&mut self, id: &NodeId) {
        let parent = self.entries.get(id).and_then(|e| e.parent.clone());
        match parent {
            Some(p) => {
                if let Some(entry) = self.entries.get_mut(&p) {
                    entry.children.retain(|c| c != id);
                }
            }
            None => self.roots.retain(|r| r != id),
        }
    }

    fn remove_subtree(&mut self, id: &NodeId) {
        if let Some(parked) = self.deferred.remove(id) {
            diagnostics::warn(format!(
                "discarding {} deferred mount(s) under removed node {}",
                parked.len(),
                id
            ));
        }
        if let Some(entry) = self.entries.remove(id) {
            for child in &entry.children {
                self.remove_subtree(child);
            }
        }
    }
}
