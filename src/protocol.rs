//! Relay wire protocol.
//!
//! Every frame payload is one JSON [`Envelope`]:
//! {
//!   "requestId": "panel#7",    // set on requests that expect an answer
//!   "replyTo": "panel#7",      // set on the answer
//!   "trail": ["content"],      // relays the envelope already passed
//!   "message": { "type": "inspect_request", "ids": ["c:1"] }
//! }
//!
//! Operations nest under their own tag:
//! `{ "type": "operation", "operation": { "type": "mount_root", ... } }`.
//!
//! Decoding is strict: an unknown `type` is a decode error that the receiver
//! logs and ignores.

use crate::host::LibraryKind;
use crate::identity::NodeId;
use crate::inspect::InspectedNode;
use crate::tree::{MirroredNode, Operation};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Operation { operation: Operation },
    InspectRequest { ids: Vec<NodeId> },
    InspectResponse { items: Vec<InspectedNode> },
    LibraryAttached { library: LibraryKind },
    IsLibraryAttached,
    LibraryAttachedAnswer { attached: bool },
    GetFullSkeleton,
    FullSkeleton { roots: Vec<MirroredNode> },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Operation { .. } => "operation",
            Message::InspectRequest { .. } => "inspect_request",
            Message::InspectResponse { .. } => "inspect_response",
            Message::LibraryAttached { .. } => "library_attached",
            Message::IsLibraryAttached => "is_library_attached",
            Message::LibraryAttachedAnswer { .. } => "library_attached_answer",
            Message::GetFullSkeleton => "get_full_skeleton",
            Message::FullSkeleton { .. } => "full_skeleton",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub trail: Vec<String>,
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            request_id: None,
            reply_to: None,
            trail: Vec::new(),
            message,
        }
    }

    pub fn request(request_id: impl Into<String>, message: Message) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Self::new(message)
        }
    }

    pub fn reply(request_id: impl Into<String>, message: Message) -> Self {
        Self {
            reply_to: Some(request_id.into()),
            ..Self::new(message)
        }
    }

    pub fn encode(&self) -> serde_json::Value {
        // Envelope contains only JSON-representable data.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn decode(payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Envelope::deserialize(payload)
    }
}

impl From<Operation> for Message {
    fn from(operation: Operation) -> Self {
        Message::Operation { operation }
    }
}
