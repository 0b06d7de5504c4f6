//! Tree layer: mirrored node shapes, the emitting-side mirror, and the
//! receiving-side replica.

pub mod mirror;
pub mod node;
pub mod replica;

pub use mirror::TreeMirror;
pub use node::{Anchor, ExistingNodeRecord, MirroredNode, NodePatch, Operation, Relation};
pub use replica::{Applied, Replica};
