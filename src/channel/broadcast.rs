//! Same-process broadcast channel.
//!
//! All endpoints of a [`BroadcastBus`] see every posted frame. An endpoint
//! ignores frames for other channel names, frames it sent itself (echo), and
//! frames whose declared origin differs from the one it expects.

use crate::channel::{Channel, ChannelState, EventLoop, Frame, Listeners, Subscription};
use crate::error::ChannelError;

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

#[derive(Clone)]
pub struct BroadcastBus {
    origin: String,
    event_loop: EventLoop,
    endpoints: Rc<RefCell<Vec<Weak<Endpoint>>>>,
}

impl std::fmt::Debug for BroadcastBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastBus")
            .field("origin", &self.origin)
            .field("endpoints", &self.endpoints.borrow().len())
            .finish()
    }
}

impl BroadcastBus {
    pub fn new(event_loop: &EventLoop, origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            event_loop: event_loop.clone(),
            endpoints: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Queue a frame for every connected endpoint. Also how foreign scripts
    /// sharing the context end up on the bus.
    pub fn post(&self, frame: Frame) {
        let endpoints = self.endpoints.clone();
        self.event_loop.post(move || {
            let live: Vec<Rc<Endpoint>> = endpoints
                .borrow()
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for endpoint in live {
                endpoint.receive(&frame);
            }
        });
    }

    fn attach(&self, endpoint: &Rc<Endpoint>) {
        let mut endpoints = self.endpoints.borrow_mut();
        endpoints.retain(|e| e.strong_count() > 0);
        endpoints.push(Rc::downgrade(endpoint));
    }

    fn detach(&self, endpoint: &Rc<Endpoint>) {
        let target = Rc::downgrade(endpoint);
        self.endpoints
            .borrow_mut()
            .retain(|e| e.strong_count() > 0 && !e.ptr_eq(&target));
    }
}

struct Endpoint {
    name: String,
    source: String,
    expected_origin: String,
    connected: Cell<bool>,
    listeners: Listeners<Frame>,
}

impl Endpoint {
    fn receive(&self, frame: &Frame) {
        if !self.connected.get() || frame.channel != self.name {
            return;
        }
        if frame.source == self.source {
            tracing::debug!(channel = %self.name, source = %frame.source, "dropping echoed frame");
            return;
        }
        if frame.origin != self.expected_origin {
            tracing::debug!(channel = %self.name, origin = %frame.origin, "dropping cross-origin frame");
            return;
        }
        self.listeners.dispatch(frame);
    }
}

#[derive(Clone)]
pub struct BroadcastChannel {
    bus: BroadcastBus,
    endpoint: Rc<Endpoint>,
}

impl std::fmt::Debug for BroadcastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("name", &self.endpoint.name)
            .field("source", &self.endpoint.source)
            .field("connected", &self.endpoint.connected.get())
            .finish()
    }
}

impl BroadcastChannel {
    /// `source` tags frames sent from this endpoint; it must differ from
    /// the peer's tag or the peer will treat them as echoes.
    pub fn new(bus: &BroadcastBus, name: impl Into<String>, source: impl Into<String>) -> Self {
        let expected_origin = bus.origin().to_string();
        Self {
            bus: bus.clone(),
            endpoint: Rc::new(Endpoint {
                name: name.into(),
                source: source.into(),
                expected_origin,
                connected: Cell::new(false),
                listeners: Listeners::new(),
            }),
        }
    }
}

impl Channel for BroadcastChannel {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    fn state(&self) -> ChannelState {
        if self.endpoint.connected.get() {
            ChannelState::Connected
        } else {
            ChannelState::Disconnected
        }
    }

    fn connect(&self) -> Result<(), ChannelError> {
        if self.endpoint.connected.get() {
            return Err(ChannelError::AlreadyConnected {
                channel: self.endpoint.name.clone(),
            });
        }
        self.bus.attach(&self.endpoint);
        self.endpoint.connected.set(true);
        self.endpoint.listeners.attach_all();
        Ok(())
    }

    fn disconnect(&self) -> Result<(), ChannelError> {
        if !self.endpoint.connected.get() {
            return Err(ChannelError::NotConnected {
                channel: self.endpoint.name.clone(),
            });
        }
        self.bus.detach(&self.endpoint);
        self.endpoint.connected.set(false);
        self.endpoint.listeners.detach_all();
        Ok(())
    }

    fn send(&self, payload: serde_json::Value) -> Result<(), ChannelError> {
        if !self.endpoint.connected.get() {
            return Err(ChannelError::NotConnected {
                channel: self.endpoint.name.clone(),
            });
        }
        self.bus.post(Frame {
            channel: self.endpoint.name.clone(),
            origin: self.bus.origin().to_string(),
            source: self.endpoint.source.clone(),
            payload,
        });
        Ok(())
    }

    fn on_message(&self, callback: Box<dyn FnMut(&Frame)>) -> Subscription {
        let attached = self.endpoint.connected.get();
        self.endpoint.listeners.add(callback, attached)
    }
}
