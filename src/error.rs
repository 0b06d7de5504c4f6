//! Typed errors for structural misuse.
//!
//! These are programmer errors: callers are expected to guard against them,
//! never to retry. Data inconsistencies are not errors; they are logged and
//! the single offending operation is dropped.

use crate::host::BlockKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel '{channel}' is not connected")]
    NotConnected { channel: String },

    #[error("channel '{channel}' is already connected")]
    AlreadyConnected { channel: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MirrorError {
    #[error("an adapter is already registered under prefix '{prefix}'")]
    AdapterAlreadyRegistered { prefix: String },

    #[error("invalid identity prefix '{prefix}' (expected lowercase ascii letters/digits)")]
    InvalidPrefix { prefix: String },

    #[error("no adapter registered for library '{library}'")]
    UnknownLibrary { library: String },

    #[error("block kind {kind:?} is not supported")]
    UnsupportedBlock { kind: BlockKind },
}
