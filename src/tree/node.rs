//! Mirrored node shapes and the operations that move them across the wire.
//!
//! JSON shapes (camelCase fields, snake_case tags):
//!   { "type": "mount_root",   "node": {..} }
//!   { "type": "mount_node",   "parentId": "c:1", "anchor": {..}, "node": {..} }
//!   { "type": "update_node",  "id": "c:4", "patch": { "displayName": "Row" } }
//!   { "type": "unmount_node", "parentId": null, "id": "c:1" }

use crate::host::{HostHandle, NodeKind};
use crate::identity::NodeId;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub display_name: String,
    #[serde(default)]
    pub children: Vec<MirroredNode>,
}

impl MirroredNode {
    pub fn leaf(id: NodeId, kind: NodeKind, display_name: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            display_name: display_name.into(),
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Before,
    After,
    None,
}

/// Where a newly mounted node goes among its siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    pub relation: Relation,
    pub reference_id: Option<NodeId>,
}

impl Anchor {
    /// Append (or mount as root).
    pub fn none() -> Self {
        Self {
            relation: Relation::None,
            reference_id: None,
        }
    }

    pub fn after(id: NodeId) -> Self {
        Self {
            relation: Relation::After,
            reference_id: Some(id),
        }
    }

    pub fn before(id: NodeId) -> Self {
        Self {
            relation: Relation::Before,
            reference_id: Some(id),
        }
    }

    /// Index to insert at in `siblings`, `None` when the reference is absent.
    pub fn resolve_index(&self, siblings: &[NodeId]) -> Option<usize> {
        match (&self.relation, &self.reference_id) {
            (Relation::After, Some(r)) => siblings.iter().position(|s| s == r).map(|i| i + 1),
            (Relation::Before, Some(r)) => siblings.iter().position(|s| s == r),
            _ => Some(siblings.len()),
        }
    }
}

/// Fields of a [`MirroredNode`] that changed in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<NodeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl NodePatch {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.display_name.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Operation {
    MountRoot {
        node: MirroredNode,
    },
    MountNode {
        parent_id: NodeId,
        anchor: Anchor,
        node: MirroredNode,
    },
    UpdateNode {
        id: NodeId,
        patch: NodePatch,
    },
    UnmountNode {
        parent_id: Option<NodeId>,
        id: NodeId,
    },
}

impl Operation {
    /// Id of the node the operation is about.
    pub fn subject(&self) -> &NodeId {
        match self {
            Operation::MountRoot { node } | Operation::MountNode { node, .. } => &node.id,
            Operation::UpdateNode { id, .. } | Operation::UnmountNode { id, .. } => id,
        }
    }
}

/// Per-id bookkeeping on the emitting side. `parent_id == None` marks a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingNodeRecord {
    pub parent_id: Option<NodeId>,
    pub containing_group_id: Option<NodeId>,
    pub kind: NodeKind,
    pub display_name: String,
    pub host_handle: HostHandle,
    pub children: Vec<NodeId>,
}
