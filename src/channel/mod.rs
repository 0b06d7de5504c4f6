//! Duplex, named message pipes with a connect/disconnect lifecycle.
//!
//! Two flavors share the [`Channel`] surface:
//! - [`BroadcastChannel`]: peers in the same execution context talking over a
//!   shared [`BroadcastBus`], filtered by origin and by sender tag.
//! - [`PortChannel`]: an explicitly named connection across a context
//!   boundary, brokered by a [`PortHub`], with initiator and listener roles.
//!
//! Deliveries are always queued on the [`EventLoop`].

pub mod broadcast;
pub mod event_loop;
pub mod listeners;
pub mod port;

pub use broadcast::{BroadcastBus, BroadcastChannel};
pub use event_loop::EventLoop;
pub use listeners::{ListenerSnapshot, Listeners, Subscription};
pub use port::{PortChannel, PortHub};

use crate::error::ChannelError;

use serde::{Deserialize, Serialize};

/// What a transport carries. `payload` is an encoded protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: String,
    /// Declared origin of the sending context.
    pub origin: String,
    /// Tag of the sending endpoint.
    pub source: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connected,
}

pub trait Channel {
    fn name(&self) -> &str;

    fn state(&self) -> ChannelState;

    fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    fn connect(&self) -> Result<(), ChannelError>;

    fn disconnect(&self) -> Result<(), ChannelError>;

    /// Queue `payload` for the peer. Fails when disconnected.
    fn send(&self, payload: serde_json::Value) -> Result<(), ChannelError>;

    /// Register a listener. Allowed in any state; listeners registered while
    /// disconnected start receiving once connected, and survive reconnects.
    fn on_message(&self, callback: Box<dyn FnMut(&Frame)>) -> Subscription;
}
