//! Emitting-side tree mirror.
//!
//! Turns raw lifecycle callbacks from an adapter into minimal [`Operation`]s
//! while keeping one [`ExistingNodeRecord`] per live node. Records are the
//! source of truth for anchors, orphan suppression, and snapshots.

use crate::diagnostics;
use crate::error::MirrorError;
use crate::host::{HostHandle, HostTree, NodeKind};
use crate::identity::{IdentityResolver, NodeId};
use crate::tree::node::{Anchor, ExistingNodeRecord, MirroredNode, NodePatch, Operation};

use std::collections::HashMap;

#[derive(Debug)]
pub struct TreeMirror {
    resolver: IdentityResolver,
    records: HashMap<NodeId, ExistingNodeRecord>,
    roots: Vec<NodeId>,
}

impl TreeMirror {
    pub fn new(resolver: IdentityResolver) -> Self {
        Self {
            resolver,
            records: HashMap::new(),
            roots: Vec::new(),
        }
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn record(&self, id: &NodeId) -> Option<&ExistingNodeRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Id of a handle whose node is currently mounted.
    pub fn lookup(&self, handle: HostHandle) -> Option<&NodeId> {
        self.resolver
            .lookup(handle)
            .filter(|id| self.records.contains_key(*id))
    }

    /// Latest host handle recorded for `id`.
    pub fn handle_of(&self, id: &NodeId) -> Option<HostHandle> {
        self.records.get(id).map(|r| r.host_handle)
    }

    /// Mount a brand new root and everything below it.
    pub fn mount_root(
        &mut self,
        host: &dyn HostTree,
        handle: HostHandle,
    ) -> Result<Vec<Operation>, MirrorError> {
        let node = self.build_subtree(host, handle, None)?;
        if !self.roots.contains(&node.id) {
            self.roots.push(node.id.clone());
        }
        Ok(vec![Operation::MountRoot { node }])
    }

    /// Diff `next` against the version it replaced and emit patches and
    /// insertions. Sibling reordering is not detected.
    pub fn update(
        &mut self,
        host: &dyn HostTree,
        next: HostHandle,
        previous: Option<HostHandle>,
    ) -> Vec<Operation> {
        let previous = previous.or_else(|| host.previous_version(next));
        let mounted = self
            .lookup(next)
            .or_else(|| previous.and_then(|p| self.lookup(p)))
            .is_some();
        if !mounted {
            diagnostics::warn(format!("update for {} which is not mounted; ignoring", next));
            return Vec::new();
        }

        let id = self.resolver.resolve(next, previous);
        let mut ops = Vec::new();
        self.update_existing(host, next, &id, &mut ops);
        ops
    }

    /// Insert `handle` into a live `target` before `anchor`, the way
    /// block-based frameworks report insertions. When the target belongs to
    /// a different containing group than the new node, the group becomes
    /// the parent.
    pub fn insert(
        &mut self,
        host: &dyn HostTree,
        handle: HostHandle,
        target: Option<HostHandle>,
        anchor: Option<HostHandle>,
    ) -> Result<Vec<Operation>, MirrorError> {
        let target_id = target.and_then(|t| self.mounted_id(host, t));
        let group_id = host
            .containing_group(handle)
            .and_then(|g| self.mounted_id(host, g));

        let parent_id = match (target_id, group_id) {
            (Some(t), group) => {
                let target_group = self
                    .records
                    .get(&t)
                    .and_then(|r| r.containing_group_id.clone());
                match group {
                    Some(g) if target_group.as_ref() != Some(&g) && g != t => Some(g),
                    _ => Some(t),
                }
            }
            (None, group) => group,
        };

        let Some(parent_id) = parent_id else {
            return self.mount_root(host, handle);
        };

        let anchor = anchor
            .and_then(|a| self.mounted_id(host, a))
            .filter(|a| {
                self.records
                    .get(&parent_id)
                    .is_some_and(|p| p.children.contains(a))
            })
            .map(Anchor::before)
            .unwrap_or_else(Anchor::none);

        let node = self.build_subtree(host, handle, Some(&parent_id))?;
        self.attach_child(&parent_id, &node.id, &anchor);
        Ok(vec![Operation::MountNode {
            parent_id,
            anchor,
            node,
        }])
    }

    /// Forget a node. Emits nothing when an ancestor is already gone, since
    /// the far side dropped the whole subtree with that ancestor.
    /// `handle` may be either version of the node.
    pub fn unmount(&mut self, host: &dyn HostTree, handle: HostHandle) -> Vec<Operation> {
        let id = self.resolver.lookup(handle).cloned().or_else(|| {
            host.previous_version(handle)
                .and_then(|p| self.resolver.lookup(p))
                .cloned()
        });
        let Some(id) = id else {
            tracing::debug!(handle = %handle, "unmount for unknown handle");
            return Vec::new();
        };
        let Some(record) = self.records.remove(&id) else {
            return Vec::new();
        };

        let mut orphaned = false;
        let mut cursor = record.parent_id.clone();
        while let Some(ancestor) = cursor {
            match self.records.get(&ancestor) {
                Some(r) => cursor = r.parent_id.clone(),
                None => {
                    orphaned = true;
                    break;
                }
            }
        }

        match &record.parent_id {
            Some(parent) => {
                if let Some(p) = self.records.get_mut(parent) {
                    p.children.retain(|c| c != &id);
                }
            }
            None => self.roots.retain(|r| r != &id),
        }
        self.resolver.retire(&id);

        if orphaned {
            tracing::debug!(id = %id, "suppressing unmount of orphaned node");
            return Vec::new();
        }
        vec![Operation::UnmountNode {
            parent_id: record.parent_id,
            id,
        }]
    }

    /// Current subtree rooted at `id`.
    pub fn snapshot(&self, id: &NodeId) -> Option<MirroredNode> {
        let record = self.records.get(id)?;
        Some(MirroredNode {
            id: id.clone(),
            kind: record.kind,
            display_name: record.display_name.clone(),
            children: record
                .children
                .iter()
                .filter_map(|c| self.snapshot(c))
                .collect(),
        })
    }

    pub fn skeleton(&self) -> Vec<MirroredNode> {
        self.roots.iter().filter_map(|r| self.snapshot(r)).collect()
    }

    fn update_existing(
        &mut self,
        host: &dyn HostTree,
        handle: HostHandle,
        id: &NodeId,
        ops: &mut Vec<Operation>,
    ) {
        let kind = host.kind(handle);
        let display_name = host.display_name(handle);

        if let Some(record) = self.records.get_mut(id) {
            let mut patch = NodePatch::default();
            if record.kind != kind {
                record.kind = kind;
                patch.kind = Some(kind);
            }
            if record.display_name != display_name {
                record.display_name = display_name.clone();
                patch.display_name = Some(display_name);
            }
            record.host_handle = handle;
            if !patch.is_empty() {
                ops.push(Operation::UpdateNode {
                    id: id.clone(),
                    patch,
                });
            }
        }

        let children = host.children(handle);
        let mut last: Option<NodeId> = None;
        for (i, &child) in children.iter().enumerate() {
            if let Some(existing) = self.existing_id(host, child) {
                self.update_existing(host, child, &existing, ops);
                last = Some(existing);
                continue;
            }

            let anchor = match &last {
                Some(prev) => Anchor::after(prev.clone()),
                None => children[i + 1..]
                    .iter()
                    .find_map(|&s| self.existing_id(host, s))
                    .map(Anchor::before)
                    .unwrap_or_else(Anchor::none),
            };

            match self.build_subtree(host, child, Some(id)) {
                Ok(node) => {
                    self.attach_child(id, &node.id, &anchor);
                    last = Some(node.id.clone());
                    ops.push(Operation::MountNode {
                        parent_id: id.clone(),
                        anchor,
                        node,
                    });
                }
                Err(e) => diagnostics::warn(format!("skipping child {} of {}: {}", child, id, e)),
            }
        }
    }

    /// Mounted id for `handle` or its previous version, without minting.
    fn mounted_id(&self, host: &dyn HostTree, handle: HostHandle) -> Option<NodeId> {
        self.lookup(handle)
            .or_else(|| host.previous_version(handle).and_then(|p| self.lookup(p)))
            .cloned()
    }

    /// Mounted id for `handle` or its previous version, aliasing both.
    fn existing_id(&mut self, host: &dyn HostTree, handle: HostHandle) -> Option<NodeId> {
        let previous = host.previous_version(handle);
        let known = self
            .resolver
            .lookup(handle)
            .or_else(|| previous.and_then(|p| self.resolver.lookup(p)))
            .filter(|id| self.records.contains_key(*id))
            .is_some();
        known.then(|| self.resolver.resolve(handle, previous))
    }

    fn attach_child(&mut self, parent_id: &NodeId, child: &NodeId, anchor: &Anchor) {
        if let Some(parent) = self.records.get_mut(parent_id) {
            parent.children.retain(|c| c != child);
            let index = anchor
                .resolve_index(&parent.children)
                .unwrap_or(parent.children.len());
            parent.children.insert(index, child.clone());
        }
    }

    fn build_subtree(
        &mut self,
        host: &dyn HostTree,
        handle: HostHandle,
        parent_id: Option<&NodeId>,
    ) -> Result<MirroredNode, MirrorError> {
        let kind = host.kind(handle);
        if let NodeKind::Block(block) = kind {
            if !block.is_supported() {
                return Err(MirrorError::UnsupportedBlock { kind: block });
            }
        }

        let id = self.resolver.resolve(handle, host.previous_version(handle));
        let containing_group_id = host
            .containing_group(handle)
            .and_then(|g| self.resolver.lookup(g))
            .cloned();
        let display_name = host.display_name(handle);

        self.records.insert(
            id.clone(),
            ExistingNodeRecord {
                parent_id: parent_id.cloned(),
                containing_group_id,
                kind,
                display_name: display_name.clone(),
                host_handle: handle,
                children: Vec::new(),
            },
        );

        let mut node = MirroredNode::leaf(id.clone(), kind, display_name);
        for child in host.children(handle) {
            match self.build_subtree(host, child, Some(&id)) {
                Ok(built) => node.children.push(built),
                Err(e) => diagnostics::warn(format!("skipping child {} of {}: {}", child, id, e)),
            }
        }
        if let Some(record) = self.records.get_mut(&id) {
            record.children = node.children.iter().map(|c| c.id.clone()).collect();
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::BlockKind;
    use crate::identity::AdapterRegistry;
    use crate::script::{HostNodeSpec, HostTable};
    use pretty_assertions::assert_eq;

    fn mirror() -> TreeMirror {
        let resolver = AdapterRegistry::new().register("c").unwrap();
        TreeMirror::new(resolver)
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn names(nodes: &[MirroredNode]) -> Vec<String> {
        nodes.iter().map(|n| n.display_name.clone()).collect()
    }

    #[test]
    fn end_to_end_mount_child_then_unmount_root() {
        let mut host = HostTable::new();
        host.insert(HostNodeSpec::new(1, NodeKind::Component, "R"));
        let mut m = mirror();

        let ops = m.mount_root(&host, HostHandle(1)).unwrap();
        assert_eq!(
            ops,
            vec![Operation::MountRoot {
                node: MirroredNode::leaf(id("c:1"), NodeKind::Component, "R")
            }]
        );

        host.insert(HostNodeSpec::new(2, NodeKind::Component, "R").children([3]).previous(1));
        host.insert(HostNodeSpec::new(3, NodeKind::Element, "A"));
        let ops = m.update(&host, HostHandle(2), None);
        assert_eq!(
            ops,
            vec![Operation::MountNode {
                parent_id: id("c:1"),
                anchor: Anchor::none(),
                node: MirroredNode::leaf(id("c:2"), NodeKind::Element, "A"),
            }]
        );

        assert_eq!(
            m.unmount(&host, HostHandle(2)),
            vec![Operation::UnmountNode {
                parent_id: None,
                id: id("c:1")
            }]
        );
        // A's own unmount arrives later and is suppressed.
        assert_eq!(m.unmount(&host, HostHandle(3)), vec![]);
        assert!(m.is_empty());
        assert!(m.resolver().is_empty());
    }

    #[test]
    fn unmount_twice_is_a_noop() {
        let mut host = HostTable::new();
        host.insert(HostNodeSpec::new(1, NodeKind::Component, "R").children([2]));
        host.insert(HostNodeSpec::new(2, NodeKind::Element, "A"));
        let mut m = mirror();
        m.mount_root(&host, HostHandle(1)).unwrap();

        assert_eq!(m.unmount(&host, HostHandle(2)).len(), 1);
        assert_eq!(m.unmount(&host, HostHandle(2)), vec![]);
        assert_eq!(m.record(&id("c:1")).unwrap().children, Vec::<NodeId>::new());
    }

    #[test]
    fn successor_handles_resolve_to_the_mounted_node() {
        let mut host = HostTable::new();
        host.insert(HostNodeSpec::new(1, NodeKind::Component, "R").children([2]));
        host.insert(HostNodeSpec::new(2, NodeKind::Element, "A"));
        let mut m = mirror();
        m.mount_root(&host, HostHandle(1)).unwrap();

        // Newer versions of A the mirror has never seen.
        host.insert(HostNodeSpec::new(3, NodeKind::Element, "A").previous(2));
        host.insert(HostNodeSpec::new(4, NodeKind::Element, "B"));

        let ops = m
            .insert(&host, HostHandle(4), Some(HostHandle(1)), Some(HostHandle(3)))
            .unwrap();
        assert_eq!(
            ops,
            vec![Operation::MountNode {
                parent_id: id("c:1"),
                anchor: Anchor::before(id("c:2")),
                node: MirroredNode::leaf(id("c:3"), NodeKind::Element, "B"),
            }]
        );

        assert_eq!(
            m.unmount(&host, HostHandle(3)),
            vec![Operation::UnmountNode {
                parent_id: Some(id("c:1")),
                id: id("c:2"),
            }]
        );
        assert_eq!(m.len(), 2);
        assert_eq!(m.record(&id("c:1")).unwrap().children, vec![id("c:3")]);
    }

    #[test]
    fn update_patches_names_and_anchors_insertions() {
        let mut host = HostTable::new();
        host.insert(HostNodeSpec::new(1, NodeKind::Component, "List").children([2]));
        host.insert(HostNodeSpec::new(2, NodeKind::Element, "B"));
        let mut m = mirror();
        m.mount_root(&host, HostHandle(1)).unwrap();

        // Next version: A inserted before B, C appended, B renamed.
        host.insert(HostNodeSpec::new(10, NodeKind::Component, "List").children([11, 12, 13]).previous(1));
        host.insert(HostNodeSpec::new(11, NodeKind::Element, "A"));
        host.insert(HostNodeSpec::new(12, NodeKind::Element, "B2").previous(2));
        host.insert(HostNodeSpec::new(13, NodeKind::Element, "C"));

        let ops = m.update(&host, HostHandle(10), Some(HostHandle(1)));
        assert_eq!(
            ops,
            vec![
                Operation::MountNode {
                    parent_id: id("c:1"),
                    anchor: Anchor::before(id("c:2")),
                    node: MirroredNode::leaf(id("c:3"), NodeKind::Element, "A"),
                },
                Operation::UpdateNode {
                    id: id("c:2"),
                    patch: NodePatch {
                        kind: None,
                        display_name: Some("B2".to_string())
                    },
                },
                Operation::MountNode {
                    parent_id: id("c:1"),
                    anchor: Anchor::after(id("c:2")),
                    node: MirroredNode::leaf(id("c:4"), NodeKind::Element, "C"),
                },
            ]
        );
        assert_eq!(names(&m.skeleton()[0].children), vec!["A", "B2", "C"]);
        assert_eq!(m.handle_of(&id("c:2")), Some(HostHandle(12)));
    }

    #[test]
    fn insertion_resolves_parent_against_containing_group() {
        let mut host = HostTable::new();
        host.insert(HostNodeSpec::new(1, NodeKind::Component, "App").children([2, 3]));
        host.insert(HostNodeSpec::new(2, NodeKind::Element, "div"));
        host.insert(HostNodeSpec::new(3, NodeKind::Block(BlockKind::Each), "each"));
        let mut m = mirror();
        m.mount_root(&host, HostHandle(1)).unwrap();

        // Row lives in the each block although the host inserts it into div.
        host.insert(HostNodeSpec::new(4, NodeKind::Element, "li").group(3));
        let ops = m
            .insert(&host, HostHandle(4), Some(HostHandle(2)), None)
            .unwrap();
        assert_eq!(
            ops,
            vec![Operation::MountNode {
                parent_id: id("c:3"),
                anchor: Anchor::none(),
                node: MirroredNode::leaf(id("c:4"), NodeKind::Element, "li"),
            }]
        );

        // Same group as the target: the raw target is the parent, anchor honored.
        host.insert(HostNodeSpec::new(5, NodeKind::Text, "text").group(3));
        let ops = m
            .insert(&host, HostHandle(5), Some(HostHandle(4)), None)
            .unwrap();
        assert!(matches!(&ops[0], Operation::MountNode { parent_id, .. } if parent_id == &id("c:4")));

        host.insert(HostNodeSpec::new(6, NodeKind::Element, "li").group(3));
        let ops = m
            .insert(&host, HostHandle(6), Some(HostHandle(3)), Some(HostHandle(4)))
            .unwrap();
        assert!(matches!(&ops[0], Operation::MountNode { anchor, .. } if anchor == &Anchor::before(id("c:4"))));
        assert_eq!(m.record(&id("c:3")).unwrap().children, vec![id("c:6"), id("c:4")]);
    }

    #[test]
    fn unsupported_blocks_are_rejected_locally() {
        let mut host = HostTable::new();
        host.insert(HostNodeSpec::new(1, NodeKind::Component, "App").children([2, 3]));
        host.insert(HostNodeSpec::new(2, NodeKind::Block(BlockKind::Await), "await"));
        host.insert(HostNodeSpec::new(3, NodeKind::Element, "p"));
        let mut m = mirror();

        let ops = m.mount_root(&host, HostHandle(1)).unwrap();
        let Operation::MountRoot { node } = &ops[0] else {
            panic!("expected mount_root");
        };
        assert_eq!(names(&node.children), vec!["p"]);

        assert_eq!(
            m.mount_root(&host, HostHandle(2)).unwrap_err(),
            MirrorError::UnsupportedBlock {
                kind: BlockKind::Await
            }
        );
    }

    #[test]
    fn update_of_unmounted_node_is_ignored() {
        let mut host = HostTable::new();
        host.insert(HostNodeSpec::new(1, NodeKind::Component, "Ghost"));
        let mut m = mirror();
        assert_eq!(m.update(&host, HostHandle(1), None), vec![]);
    }
}
