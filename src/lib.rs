//! Live mirror of framework component trees for a remote inspector.
//!
//! The instrumented side ([`Agent`]) watches host trees through adapters,
//! keeps a [`TreeMirror`] per library and streams [`Operation`]s. Relays
//! carry them across channels to an [`InspectorClient`], which keeps a
//! [`Replica`] and issues point queries.

pub mod agent;
pub mod batch;
pub mod channel;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod host;
pub mod identity;
pub mod inspect;
pub mod protocol;
pub mod relay;
pub mod replay;
pub mod script;
pub mod tree;

pub use agent::Agent;
pub use client::InspectorClient;
pub use config::InspectorConfig;
pub use error::{ChannelError, MirrorError};
pub use host::{HostHandle, HostTree, LibraryKind, NodeKind};
pub use identity::NodeId;
pub use relay::Relay;
pub use tree::{MirroredNode, Operation, Replica, TreeMirror};
