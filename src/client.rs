//! Render-layer facing client.
//!
//! Keeps a [`Replica`] of the mirrored forest current from the operation
//! stream and exposes the point queries (skeleton, inspect, attached).

use crate::channel::{Channel, Frame, Listeners, Subscription};
use crate::diagnostics;
use crate::error::ChannelError;
use crate::identity::NodeId;
use crate::inspect::InspectedNode;
use crate::protocol::{Envelope, Message};
use crate::relay::PendingReplies;
use crate::tree::{Applied, MirroredNode, Operation, Replica};

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

struct ClientState {
    replica: RefCell<Replica>,
    /// Set once a full skeleton arrived; until then the replica may be
    /// missing anything mounted before we connected.
    synced: Cell<bool>,
    attached: Cell<bool>,
    operations: Listeners<Operation>,
    replies: PendingReplies,
}

impl ClientState {
    fn receive(&self, frame: &Frame) {
        let envelope = match Envelope::decode(&frame.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                diagnostics::warn(format!("client: unrecognized message: {}", e));
                return;
            }
        };

        if let Some(key) = &envelope.reply_to {
            if self.replies.owns(key) {
                self.replies.resolve(key, envelope.message);
                return;
            }
        }

        match envelope.message {
            Message::Operation { operation } => {
                if self.replica.borrow_mut().apply(&operation) == Applied::Dropped {
                    return;
                }
                self.operations.dispatch(&operation);
            }
            Message::LibraryAttached { .. } => self.attached.set(true),
            Message::LibraryAttachedAnswer { attached: true } => self.attached.set(true),
            other => {
                tracing::debug!(kind = other.kind(), "client ignores message");
            }
        }
    }
}

#[derive(Clone)]
pub struct InspectorClient {
    state: Rc<ClientState>,
    channel: Rc<dyn Channel>,
    subscription: Rc<RefCell<Option<Subscription>>>,
}

impl std::fmt::Debug for InspectorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InspectorClient")
            .field("channel", &self.channel.name())
            .field("synced", &self.state.synced.get())
            .field("nodes", &self.state.replica.borrow().len())
            .finish()
    }
}

impl InspectorClient {
    /// `name` scopes this client's request ids.
    pub fn new(name: &str, channel: Rc<dyn Channel>) -> Self {
        let state = Rc::new(ClientState {
            replica: RefCell::new(Replica::new()),
            synced: Cell::new(false),
            attached: Cell::new(false),
            operations: Listeners::new(),
            replies: PendingReplies::new(name),
        });

        let weak: Weak<ClientState> = Rc::downgrade(&state);
        let subscription = channel.on_message(Box::new(move |frame: &Frame| {
            if let Some(state) = weak.upgrade() {
                state.receive(frame);
            }
        }));

        Self {
            state,
            channel,
            subscription: Rc::new(RefCell::new(Some(subscription))),
        }
    }

    pub fn channel(&self) -> &Rc<dyn Channel> {
        &self.channel
    }

    /// Observe operations after they were applied to the replica.
    pub fn subscribe(&self, callback: impl FnMut(&Operation) + 'static) -> Subscription {
        self.state.operations.add(callback, true)
    }

    /// The mirrored forest, or `None` when no full skeleton arrived yet.
    /// An empty forest is `Some(vec![])`.
    pub fn skeleton(&self) -> Option<Vec<MirroredNode>> {
        self.state
            .synced
            .get()
            .then(|| self.state.replica.borrow().skeleton())
    }

    pub fn node(&self, id: &NodeId) -> Option<MirroredNode> {
        self.state.replica.borrow().get(id)
    }

    /// Ask for the whole forest; the replica is reset when it arrives.
    pub fn request_full_skeleton(&self) -> Result<(), ChannelError> {
        let weak = Rc::downgrade(&self.state);
        self.request(Message::GetFullSkeleton, move |message| {
            let Some(state) = weak.upgrade() else {
                return;
            };
            match message {
                Message::FullSkeleton { roots } => {
                    state.replica.borrow_mut().reset(&roots);
                    state.synced.set(true);
                }
                other => diagnostics::warn(format!("expected full_skeleton, got {}", other.kind())),
            }
        })
    }

    pub fn inspect(
        &self,
        ids: Vec<NodeId>,
        reply: impl FnOnce(Vec<InspectedNode>) + 'static,
    ) -> Result<(), ChannelError> {
        self.request(Message::InspectRequest { ids }, move |message| match message {
            Message::InspectResponse { items } => reply(items),
            other => diagnostics::warn(format!("expected inspect_response, got {}", other.kind())),
        })
    }

    /// Answers from memory once an announcement was seen, else asks.
    pub fn is_library_attached(&self, reply: impl FnOnce(bool) + 'static) -> Result<(), ChannelError> {
        if self.state.attached.get() {
            reply(true);
            return Ok(());
        }
        let weak = Rc::downgrade(&self.state);
        self.request(Message::IsLibraryAttached, move |message| match message {
            Message::LibraryAttachedAnswer { attached } => {
                if let Some(state) = weak.upgrade() {
                    state.attached.set(state.attached.get() || attached);
                }
                reply(attached);
            }
            other => diagnostics::warn(format!(
                "expected library_attached_answer, got {}",
                other.kind()
            )),
        })
    }

    /// Stop listening; the replica is kept but no longer updated.
    pub fn close(&self) {
        if let Some(sub) = self.subscription.borrow_mut().take() {
            sub.unsubscribe();
        }
    }

    fn request(
        &self,
        message: Message,
        reply: impl FnOnce(Message) + 'static,
    ) -> Result<(), ChannelError> {
        let key = self.state.replies.register(Box::new(reply));
        if let Err(e) = self.channel.send(Envelope::request(key.clone(), message).encode()) {
            self.state.replies.cancel(&key);
            return Err(e);
        }
        Ok(())
    }
}
