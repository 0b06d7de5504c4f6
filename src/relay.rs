//! Multi-hop relay between channels.
//!
//! A [`Relay`] owns a set of named hops. Every envelope arriving on one hop
//! is forwarded to every other connected hop, never back to the hop it came
//! from, and never twice through the same relay (the envelope's trail).
//! Answers to the relay's own queries are consumed here and fire their
//! continuation at most once. The relay also remembers library-attached
//! announcements so it can answer "is a library attached?" for peers that
//! connect after the announcement went by.

use crate::channel::{Channel, Frame, Subscription};
use crate::diagnostics;
use crate::error::ChannelError;
use crate::host::LibraryKind;
use crate::protocol::{Envelope, Message};

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::{Rc, Weak};

pub type Reply = Box<dyn FnOnce(Message)>;

/// Outstanding queries of one endpoint, keyed `<owner>#<seq>`.
#[derive(Clone)]
pub struct PendingReplies {
    owner: Rc<str>,
    next: Rc<Cell<u64>>,
    waiting: Rc<RefCell<HashMap<String, Reply>>>,
}

impl std::fmt::Debug for PendingReplies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReplies")
            .field("owner", &self.owner)
            .field("waiting", &self.len())
            .finish()
    }
}

impl PendingReplies {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: Rc::from(owner),
            next: Rc::new(Cell::new(0)),
            waiting: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn register(&self, reply: Reply) -> String {
        self.next.set(self.next.get() + 1);
        let key = format!("{}#{}", self.owner, self.next.get());
        self.waiting.borrow_mut().insert(key.clone(), reply);
        key
    }

    /// Whether `key` was minted here (answered or not).
    pub fn owns(&self, key: &str) -> bool {
        key.strip_prefix(&*self.owner)
            .is_some_and(|rest| rest.starts_with('#'))
    }

    /// Fire the continuation for `key`. Late duplicates find nothing.
    pub fn resolve(&self, key: &str, message: Message) -> bool {
        let reply = self.waiting.borrow_mut().remove(key);
        match reply {
            Some(reply) => {
                reply(message);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, key: &str) {
        self.waiting.borrow_mut().remove(key);
    }

    pub fn len(&self) -> usize {
        self.waiting.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Hop {
    name: String,
    channel: Rc<dyn Channel>,
    subscription: Option<Subscription>,
}

struct RelayInner {
    name: String,
    hops: RefCell<Vec<Hop>>,
    attached: RefCell<BTreeSet<LibraryKind>>,
    replies: PendingReplies,
}

#[derive(Clone)]
pub struct Relay {
    inner: Rc<RelayInner>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hops: Vec<String> = self.inner.hops.borrow().iter().map(|h| h.name.clone()).collect();
        f.debug_struct("Relay")
            .field("name", &self.inner.name)
            .field("hops", &hops)
            .finish()
    }
}

impl Relay {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            inner: Rc::new(RelayInner {
                replies: PendingReplies::new(&name),
                name,
                hops: RefCell::new(Vec::new()),
                attached: RefCell::new(BTreeSet::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Start routing traffic arriving on `channel`, known here as `hop`.
    pub fn add_hop(&self, hop: impl Into<String>, channel: Rc<dyn Channel>) {
        let hop = hop.into();
        let weak: Weak<RelayInner> = Rc::downgrade(&self.inner);
        let from = hop.clone();
        let subscription = channel.on_message(Box::new(move |frame: &Frame| {
            if let Some(inner) = weak.upgrade() {
                inner.route(&from, frame);
            }
        }));

        self.remove_hop(&hop);
        self.inner.hops.borrow_mut().push(Hop {
            name: hop,
            channel,
            subscription: Some(subscription),
        });
    }

    pub fn remove_hop(&self, hop: &str) {
        let removed: Vec<Hop> = {
            let mut hops = self.inner.hops.borrow_mut();
            let (gone, kept): (Vec<Hop>, Vec<Hop>) = hops.drain(..).partition(|h| h.name == hop);
            *hops = kept;
            gone
        };
        for mut h in removed {
            if let Some(sub) = h.subscription.take() {
                sub.unsubscribe();
            }
        }
    }

    /// Libraries announced through this relay so far.
    pub fn attached_libraries(&self) -> Vec<LibraryKind> {
        self.inner.attached.borrow().iter().copied().collect()
    }

    /// Send a single-flight query on `hop`; `reply` fires at most once.
    pub fn request(
        &self,
        hop: &str,
        message: Message,
        reply: impl FnOnce(Message) + 'static,
    ) -> Result<(), ChannelError> {
        let channel = self.channel(hop).ok_or_else(|| ChannelError::NotConnected {
            channel: hop.to_string(),
        })?;
        let key = self.inner.replies.register(Box::new(reply));
        let mut envelope = Envelope::request(key.clone(), message);
        envelope.trail.push(self.inner.name.clone());
        if let Err(e) = channel.send(envelope.encode()) {
            self.inner.replies.cancel(&key);
            return Err(e);
        }
        Ok(())
    }

    /// Answer from memory when an announcement has been seen; otherwise ask
    /// every connected hop and take the first answer.
    pub fn is_library_attached(&self, reply: impl FnOnce(bool) + 'static) {
        if !self.inner.attached.borrow().is_empty() {
            reply(true);
            return;
        }

        let key = self.inner.replies.register(Box::new(move |message| match message {
            Message::LibraryAttachedAnswer { attached } => reply(attached),
            other => diagnostics::warn(format!(
                "expected library_attached_answer, got {}",
                other.kind()
            )),
        }));
        let mut envelope = Envelope::request(key, Message::IsLibraryAttached);
        envelope.trail.push(self.inner.name.clone());

        let sent = self.inner.broadcast(None, &envelope);
        if sent == 0 {
            tracing::debug!(relay = %self.inner.name, "no connected hop to ask; query stays pending");
        }
    }

    fn channel(&self, hop: &str) -> Option<Rc<dyn Channel>> {
        self.inner
            .hops
            .borrow()
            .iter()
            .find(|h| h.name == hop)
            .map(|h| h.channel.clone())
    }
}

impl RelayInner {
    fn route(&self, from: &str, frame: &Frame) {
        let mut envelope = match Envelope::decode(&frame.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                diagnostics::warn(format!(
                    "relay {}: unrecognized message on hop {}: {}",
                    self.name, from, e
                ));
                return;
            }
        };

        if envelope.trail.iter().any(|r| r == &self.name) {
            tracing::debug!(relay = %self.name, hop = %from, "envelope already passed this relay");
            return;
        }

        if let Message::LibraryAttached { library } = &envelope.message {
            self.attached.borrow_mut().insert(*library);
        }

        if let Some(key) = envelope.reply_to.clone() {
            if self.replies.owns(&key) {
                if !self.replies.resolve(&key, envelope.message) {
                    tracing::debug!(relay = %self.name, key = %key, "late duplicate answer ignored");
                }
                return;
            }
        }

        if let (Message::IsLibraryAttached, Some(key)) = (&envelope.message, &envelope.request_id) {
            if !self.attached.borrow().is_empty() {
                self.answer(from, key, Message::LibraryAttachedAnswer { attached: true });
                return;
            }
        }

        envelope.trail.push(self.name.clone());
        self.broadcast(Some(from), &envelope);
    }

    fn answer(&self, hop: &str, key: &str, message: Message) {
        let channel = self
            .hops
            .borrow()
            .iter()
            .find(|h| h.name == hop)
            .map(|h| h.channel.clone());
        let Some(channel) = channel else {
            return;
        };
        let mut envelope = Envelope::reply(key, message);
        envelope.trail.push(self.name.clone());
        if let Err(e) = channel.send(envelope.encode()) {
            diagnostics::warn(format!("relay {}: cannot answer on {}: {}", self.name, hop, e));
        }
    }

    /// Send to every connected hop except `skip`. Returns how many got it.
    fn broadcast(&self, skip: Option<&str>, envelope: &Envelope) -> usize {
        let targets: Vec<(String, Rc<dyn Channel>)> = self
            .hops
            .borrow()
            .iter()
            .filter(|h| Some(h.name.as_str()) != skip && h.channel.is_connected())
            .map(|h| (h.name.clone(), h.channel.clone()))
            .collect();

        let payload = envelope.encode();
        let mut sent = 0;
        for (name, channel) in targets {
            match channel.send(payload.clone()) {
                Ok(()) => sent += 1,
                Err(e) => diagnostics::warn(format!(
                    "relay {}: dropping {} for hop {}: {}",
                    self.name,
                    envelope.message.kind(),
                    name,
                    e
                )),
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{EventLoop, PortChannel, PortHub};
    use crate::identity::NodeId;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Rig {
        event_loop: EventLoop,
        relay: Relay,
        left: PortChannel,
        right: PortChannel,
    }

    fn rig() -> Rig {
        let event_loop = EventLoop::new();
        let hub = PortHub::new(&event_loop);
        let relay = Relay::new("background");
        for name in ["left", "right"] {
            let end = PortChannel::listener(&hub, name, "background", None);
            relay.add_hop(name, Rc::new(end));
        }
        let left = PortChannel::initiator(&hub, "left", "content");
        let right = PortChannel::initiator(&hub, "right", "panel");
        left.connect().unwrap();
        right.connect().unwrap();
        event_loop.run_until_idle();
        Rig { event_loop, relay, left, right }
    }

    fn record(channel: &PortChannel) -> (Rc<RefCell<Vec<Envelope>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let sub = channel.on_message(Box::new(move |frame: &Frame| {
            s.borrow_mut().push(Envelope::decode(&frame.payload).unwrap());
        }));
        (seen, sub)
    }

    #[test]
    fn forwards_to_other_hops_and_stamps_the_trail() {
        let rig = rig();
        let (left_seen, _l) = record(&rig.left);
        let (right_seen, _r) = record(&rig.right);

        let env = Envelope::new(Message::InspectRequest { ids: vec![NodeId::new("f:1")] });
        rig.left.send(env.encode()).unwrap();
        rig.event_loop.run_until_idle();

        assert!(left_seen.borrow().is_empty());
        let right_seen = right_seen.borrow();
        assert_eq!(right_seen.len(), 1);
        assert_eq!(right_seen[0].trail, vec!["background".to_string()]);
        assert_eq!(right_seen[0].message, env.message);
    }

    #[test]
    fn envelope_that_already_passed_is_dropped() {
        let rig = rig();
        let (right_seen, _r) = record(&rig.right);

        let mut env = Envelope::new(Message::GetFullSkeleton);
        env.trail.push("background".to_string());
        rig.left.send(env.encode()).unwrap();
        rig.left.send(json!({ "message": { "type": "teleport" } })).unwrap();
        rig.event_loop.run_until_idle();

        assert!(right_seen.borrow().is_empty());
    }

    #[test]
    fn continuation_fires_once_for_duplicate_answers() {
        let rig = rig();
        let (left_seen, _l) = record(&rig.left);
        let answers = Rc::new(RefCell::new(Vec::new()));
        let a = answers.clone();
        rig.relay
            .request("left", Message::GetFullSkeleton, move |m| a.borrow_mut().push(m))
            .unwrap();
        rig.event_loop.run_until_idle();

        let key = left_seen.borrow()[0].request_id.clone().unwrap();
        for _ in 0..2 {
            let reply = Envelope::reply(key.clone(), Message::FullSkeleton { roots: vec![] });
            rig.left.send(reply.encode()).unwrap();
        }
        rig.event_loop.run_until_idle();

        assert_eq!(*answers.borrow(), vec![Message::FullSkeleton { roots: vec![] }]);
    }

    #[test]
    fn remembered_announcement_answers_late_queries() {
        let rig = rig();
        let (right_seen, _r) = record(&rig.right);

        let announce = Envelope::new(Message::LibraryAttached { library: LibraryKind::Fiber });
        rig.left.send(announce.encode()).unwrap();
        rig.event_loop.run_until_idle();
        assert_eq!(rig.relay.attached_libraries(), vec![LibraryKind::Fiber]);

        let query = Envelope::request("panel#1", Message::IsLibraryAttached);
        rig.right.send(query.encode()).unwrap();
        rig.event_loop.run_until_idle();

        let last = right_seen.borrow().last().cloned().unwrap();
        assert_eq!(last.reply_to.as_deref(), Some("panel#1"));
        assert_eq!(last.message, Message::LibraryAttachedAnswer { attached: true });

        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        rig.relay.is_library_attached(move |yes| h.set(yes));
        assert!(hit.get());
    }

    #[test]
    fn pending_keys_are_owner_scoped() {
        let replies = PendingReplies::new("panel");
        let key = replies.register(Box::new(|_| {}));
        assert_eq!(key, "panel#1");
        assert!(replies.owns(&key));
        assert!(!replies.owns("panelx#1"));
        assert!(replies.resolve(&key, Message::GetFullSkeleton));
        assert!(!replies.resolve(&key, Message::GetFullSkeleton));
        assert!(replies.is_empty());
    }
}
