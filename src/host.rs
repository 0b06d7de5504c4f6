//! Interface consumed from an instrumentation adapter.
//!
//! An adapter owns the framework's internal nodes; the mirror only ever sees
//! opaque [`HostHandle`]s and asks the adapter, through [`HostTree`], for the
//! few facts it needs: kind, display name, ordered children, the previous
//! version of a node, and the containing group a node was created in.

use crate::inspect::HostValue;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to one framework node instance at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostHandle(pub u64);

impl fmt::Display for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Structural block kinds that group nodes without being host siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    If,
    Each,
    Key,
    Slot,
    /// Pending/resolved/rejected branches; not modeled yet.
    Await,
}

impl BlockKind {
    pub fn is_supported(self) -> bool {
        !matches!(self, BlockKind::Await)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Component,
    Element,
    Text,
    Block(BlockKind),
}

/// The instrumentation sources this crate knows about.
///
/// Closed on purpose: each source is registered explicitly and at most one
/// adapter per kind may be active in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryKind {
    /// Reconciler-style frameworks that keep a previous/next version link.
    Fiber,
    /// Compiled frameworks that create nodes inside blocks.
    Compiled,
}

impl LibraryKind {
    /// Short tag prefixed to every id minted for this library.
    pub fn id_prefix(self) -> &'static str {
        match self {
            LibraryKind::Fiber => "f",
            LibraryKind::Compiled => "c",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LibraryKind::Fiber => "fiber",
            LibraryKind::Compiled => "compiled",
        }
    }
}

pub trait HostTree {
    fn kind(&self, node: HostHandle) -> NodeKind;

    fn display_name(&self, node: HostHandle) -> String;

    /// Ordered children, matching host sibling order.
    fn children(&self, node: HostHandle) -> Vec<HostHandle>;

    /// The instance this node replaced, if the framework links versions.
    fn previous_version(&self, _node: HostHandle) -> Option<HostHandle> {
        None
    }

    /// The block this node was created in, if any.
    fn containing_group(&self, _node: HostHandle) -> Option<HostHandle> {
        None
    }

    /// Raw state for deep inspection.
    fn inspect(&self, _node: HostHandle) -> Option<HostValue> {
        None
    }
}
