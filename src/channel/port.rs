//! Named connections across an execution-context boundary.
//!
//! A listener-role [`PortChannel`] registers its name with the [`PortHub`]
//! and waits. An initiator's `connect()` is matched against waiting
//! listeners by name; on a match both ends become connected and the
//! listener's `on_connect` callback runs (on every match, reconnects too).
//! Disconnecting either end disconnects both. Frames sent before the
//! disconnect still reach the listeners that were attached when they were
//! sent.

use crate::channel::{Channel, ChannelState, EventLoop, Frame, Listeners, Subscription};
use crate::error::ChannelError;

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Listener,
}

#[derive(Clone, Default)]
pub struct PortHub {
    event_loop: EventLoop,
    waiting: Rc<RefCell<Vec<Weak<Port>>>>,
}

impl std::fmt::Debug for PortHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHub")
            .field("listeners", &self.waiting.borrow().len())
            .finish()
    }
}

impl PortHub {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self {
            event_loop: event_loop.clone(),
            waiting: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn register(&self, port: &Rc<Port>) {
        let mut waiting = self.waiting.borrow_mut();
        waiting.retain(|p| p.strong_count() > 0);
        waiting.push(Rc::downgrade(port));
    }

    /// First idle listener registered under `name`.
    fn find_listener(&self, name: &str) -> Option<Rc<Port>> {
        self.waiting
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|p| p.name == name && !p.connected.get())
    }
}

struct Port {
    name: String,
    source: String,
    role: Role,
    connected: Cell<bool>,
    peer: RefCell<Option<Weak<Port>>>,
    listeners: Listeners<Frame>,
    on_connect: RefCell<Option<Box<dyn FnMut()>>>,
}

impl Port {
    fn open(&self, peer: Option<Weak<Port>>) {
        *self.peer.borrow_mut() = peer;
        self.connected.set(true);
        self.listeners.attach_all();
    }

    fn close(&self) -> Option<Rc<Port>> {
        self.connected.set(false);
        self.listeners.detach_all();
        self.peer.borrow_mut().take().and_then(|p| p.upgrade())
    }
}

#[derive(Clone)]
pub struct PortChannel {
    hub: PortHub,
    port: Rc<Port>,
}

impl std::fmt::Debug for PortChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortChannel")
            .field("name", &self.port.name)
            .field("role", &self.port.role)
            .field("connected", &self.port.connected.get())
            .finish()
    }
}

impl PortChannel {
    /// End that opens the connection with an explicit `connect()`.
    pub fn initiator(hub: &PortHub, name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::build(hub, name.into(), source.into(), Role::Initiator, None)
    }

    /// End that waits for an initiator with the same name.
    pub fn listener(
        hub: &PortHub,
        name: impl Into<String>,
        source: impl Into<String>,
        on_connect: Option<Box<dyn FnMut()>>,
    ) -> Self {
        let channel = Self::build(hub, name.into(), source.into(), Role::Listener, on_connect);
        hub.register(&channel.port);
        channel
    }

    fn build(
        hub: &PortHub,
        name: String,
        source: String,
        role: Role,
        on_connect: Option<Box<dyn FnMut()>>,
    ) -> Self {
        Self {
            hub: hub.clone(),
            port: Rc::new(Port {
                name,
                source,
                role,
                connected: Cell::new(false),
                peer: RefCell::new(None),
                listeners: Listeners::new(),
                on_connect: RefCell::new(on_connect),
            }),
        }
    }

    fn not_connected(&self) -> ChannelError {
        ChannelError::NotConnected {
            channel: self.port.name.clone(),
        }
    }
}

impl Channel for PortChannel {
    fn name(&self) -> &str {
        &self.port.name
    }

    fn state(&self) -> ChannelState {
        if self.port.connected.get() {
            ChannelState::Connected
        } else {
            ChannelState::Disconnected
        }
    }

    /// Initiator: open a connection. Listener: keep waiting (registration
    /// happens at construction and persists across connections).
    fn connect(&self) -> Result<(), ChannelError> {
        if self.port.connected.get() {
            return Err(ChannelError::AlreadyConnected {
                channel: self.port.name.clone(),
            });
        }
        if self.port.role == Role::Listener {
            return Ok(());
        }

        let Some(listener) = self.hub.find_listener(&self.port.name) else {
            tracing::debug!(channel = %self.port.name, "no listener for port; messages will go nowhere");
            self.port.open(None);
            return Ok(());
        };

        self.port.open(Some(Rc::downgrade(&listener)));
        listener.open(Some(Rc::downgrade(&self.port)));

        let weak = Rc::downgrade(&listener);
        self.hub.event_loop.post(move || {
            let Some(listener) = weak.upgrade() else {
                return;
            };
            if let Some(callback) = listener.on_connect.borrow_mut().as_mut() {
                callback();
            }
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), ChannelError> {
        if !self.port.connected.get() {
            return Err(self.not_connected());
        }
        if let Some(peer) = self.port.close() {
            peer.close();
        }
        Ok(())
    }

    fn send(&self, payload: serde_json::Value) -> Result<(), ChannelError> {
        if !self.port.connected.get() {
            return Err(self.not_connected());
        }
        let Some(peer) = self.port.peer.borrow().clone() else {
            return Ok(());
        };
        let frame = Frame {
            channel: self.port.name.clone(),
            origin: String::new(),
            source: self.port.source.clone(),
            payload,
        };
        let Some(peer) = peer.upgrade() else {
            return Ok(());
        };
        let snapshot = peer.listeners.snapshot();
        let listeners = peer.listeners.clone();
        self.hub.event_loop.post(move || listeners.deliver(snapshot, &frame));
        Ok(())
    }

    fn on_message(&self, callback: Box<dyn FnMut(&Frame)>) -> Subscription {
        let attached = self.port.connected.get();
        self.port.listeners.add(callback, attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn listener_connects_on_matching_name_and_calls_back_every_time() {
        let event_loop = EventLoop::new();
        let hub = PortHub::new(&event_loop);
        let connects = Rc::new(Cell::new(0));
        let c = connects.clone();
        let panel = PortChannel::listener(&hub, "panel", "background", Some(Box::new(move || c.set(c.get() + 1))));
        let other = PortChannel::initiator(&hub, "elsewhere", "devtools");
        let devtools = PortChannel::initiator(&hub, "panel", "devtools");

        other.connect().unwrap();
        assert!(!panel.is_connected());

        devtools.connect().unwrap();
        event_loop.run_until_idle();
        assert!(panel.is_connected());
        assert_eq!(connects.get(), 1);

        devtools.disconnect().unwrap();
        assert!(!panel.is_connected());
        devtools.connect().unwrap();
        event_loop.run_until_idle();
        assert_eq!(connects.get(), 2);
    }

    #[test]
    fn listener_registered_before_connect_survives_reconnect() {
        let event_loop = EventLoop::new();
        let hub = PortHub::new(&event_loop);
        let panel = PortChannel::listener(&hub, "panel", "background", None);
        let devtools = PortChannel::initiator(&hub, "panel", "devtools");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let _sub = devtools.on_message(Box::new(move |f: &Frame| s.borrow_mut().push(f.payload.clone())));

        devtools.connect().unwrap();
        devtools.disconnect().unwrap();
        assert!(matches!(panel.send(json!(0)), Err(ChannelError::NotConnected { .. })));

        devtools.connect().unwrap();
        panel.send(json!("hello")).unwrap();
        event_loop.run_until_idle();
        assert_eq!(*seen.borrow(), vec![json!("hello")]);
    }

    #[test]
    fn unsubscribed_listener_gets_nothing() {
        let event_loop = EventLoop::new();
        let hub = PortHub::new(&event_loop);
        let panel = PortChannel::listener(&hub, "panel", "background", None);
        let devtools = PortChannel::initiator(&hub, "panel", "devtools");

        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let sub = panel.on_message(Box::new(move |_| h.set(h.get() + 1)));
        sub.unsubscribe();

        devtools.connect().unwrap();
        devtools.send(json!(1)).unwrap();
        event_loop.run_until_idle();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn frame_sent_before_disconnect_is_still_delivered() {
        let event_loop = EventLoop::new();
        let hub = PortHub::new(&event_loop);
        let panel = PortChannel::listener(&hub, "panel", "background", None);
        let devtools = PortChannel::initiator(&hub, "panel", "devtools");

        let delivered = Rc::new(RefCell::new(Vec::new()));
        let d = delivered.clone();
        let _sub = panel.on_message(Box::new(move |f: &Frame| d.borrow_mut().push(f.payload.clone())));

        devtools.connect().unwrap();
        event_loop.run_until_idle();
        devtools.send(json!("bye")).unwrap();
        devtools.disconnect().unwrap();
        assert_eq!(panel.state(), ChannelState::Disconnected);

        event_loop.run_until_idle();
        assert_eq!(*delivered.borrow(), vec![json!("bye")]);

        // Nothing sent after the disconnect gets through.
        assert!(devtools.send(json!("late")).is_err());
        event_loop.run_until_idle();
        assert_eq!(delivered.borrow().len(), 1);
    }
}
