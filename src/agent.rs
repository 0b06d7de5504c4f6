//! Instrumented-side agent.
//!
//! Owns one [`TreeMirror`] per attached library, turns adapter lifecycle
//! callbacks into operations, and answers point queries from the far side.
//! With batching enabled, child mounts are held in a [`MutationBatcher`];
//! any other operation flushes the batch first so order is preserved.
//!
//! Time only moves through [`Agent::tick`]; adapter callbacks are stamped
//! with the most recent tick.

use crate::batch::MutationBatcher;
use crate::channel::{Channel, Frame, Subscription};
use crate::config::InspectorConfig;
use crate::diagnostics;
use crate::error::MirrorError;
use crate::host::{HostHandle, HostTree, LibraryKind};
use crate::identity::{AdapterRegistry, NodeId};
use crate::inspect::{dehydrate, DehydrateLimits, HostValue, InspectedNode};
use crate::protocol::{Envelope, Message};
use crate::tree::{MirroredNode, Operation, TreeMirror};

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::Instant;

struct Session {
    host: Rc<dyn HostTree>,
    mirror: TreeMirror,
}

struct AgentState {
    config: InspectorConfig,
    registry: AdapterRegistry,
    sessions: BTreeMap<LibraryKind, Session>,
    batcher: Option<MutationBatcher>,
}

impl AgentState {
    fn session_mut(&mut self, library: LibraryKind) -> Result<&mut Session, MirrorError> {
        self.sessions
            .get_mut(&library)
            .ok_or_else(|| MirrorError::UnknownLibrary {
                library: library.name().to_string(),
            })
    }

    fn skeleton(&self) -> Vec<MirroredNode> {
        self.sessions
            .values()
            .flat_map(|s| s.mirror.skeleton())
            .collect()
    }

    fn session_for(&self, id: &NodeId) -> Option<&Session> {
        let (prefix, _) = id.as_str().split_once(':')?;
        self.sessions
            .iter()
            .find(|(library, _)| library.id_prefix() == prefix)
            .map(|(_, s)| s)
    }

    fn inspect(&self, ids: &[NodeId]) -> Vec<InspectedNode> {
        let limits = DehydrateLimits {
            max_depth: self.config.inspect_max_depth,
            max_entries: self.config.inspect_max_entries,
        };

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(session) = self.session_for(id) else {
                diagnostics::warn(format!("inspect request for {} of no attached library", id));
                continue;
            };
            let Some(handle) = session.mirror.handle_of(id) else {
                diagnostics::warn(format!("inspect request for {} which is not mounted", id));
                continue;
            };
            let value = session.host.inspect(handle).unwrap_or(HostValue::Null);
            items.push(InspectedNode {
                id: id.clone(),
                data: dehydrate(&value, limits),
            });
        }
        items
    }

    /// Hold child mounts in the batcher; anything else flushes it first.
    fn route(&mut self, library: LibraryKind, ops: Vec<Operation>, now: Instant) -> Vec<Operation> {
        let Some(batcher) = self.batcher.as_mut() else {
            return ops;
        };
        let Some(session) = self.sessions.get(&library) else {
            return ops;
        };

        let mut outgoing = Vec::new();
        for op in ops {
            match op {
                Operation::MountNode {
                    parent_id,
                    anchor,
                    node,
                } => {
                    batcher.enqueue(now, &session.mirror, &parent_id, &anchor, node);
                }
                other => {
                    outgoing.extend(batcher.flush());
                    outgoing.push(other);
                }
            }
        }
        outgoing
    }
}

pub struct Agent {
    state: Rc<RefCell<AgentState>>,
    channel: Rc<dyn Channel>,
    now: Cell<Instant>,
    subscription: Option<Subscription>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Agent")
            .field("channel", &self.channel.name())
            .field("libraries", &state.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Agent {
    pub fn new(config: InspectorConfig, channel: Rc<dyn Channel>) -> Self {
        let batcher = config
            .batching
            .then(|| MutationBatcher::new(config.batch_window()));
        let state = Rc::new(RefCell::new(AgentState {
            config,
            registry: AdapterRegistry::new(),
            sessions: BTreeMap::new(),
            batcher,
        }));

        let weak_state = Rc::downgrade(&state);
        let weak_channel: Weak<dyn Channel> = Rc::downgrade(&channel);
        let subscription = channel.on_message(Box::new(move |frame: &Frame| {
            let (Some(state), Some(channel)) = (weak_state.upgrade(), weak_channel.upgrade()) else {
                return;
            };
            answer(&state, &*channel, frame);
        }));

        Self {
            state,
            channel,
            now: Cell::new(Instant::now()),
            subscription: Some(subscription),
        }
    }

    pub fn channel(&self) -> &Rc<dyn Channel> {
        &self.channel
    }

    /// Attach a library. Each library kind attaches at most once.
    pub fn register_adapter(
        &self,
        library: LibraryKind,
        host: Rc<dyn HostTree>,
    ) -> Result<(), MirrorError> {
        {
            let mut state = self.state.borrow_mut();
            let resolver = state.registry.register(library.id_prefix())?;
            state.sessions.insert(
                library,
                Session {
                    host,
                    mirror: TreeMirror::new(resolver),
                },
            );
        }
        tracing::debug!(library = library.name(), "adapter registered");
        self.send(Message::LibraryAttached { library });
        Ok(())
    }

    pub fn is_library_attached(&self) -> bool {
        !self.state.borrow().sessions.is_empty()
    }

    pub fn libraries(&self) -> Vec<LibraryKind> {
        self.state.borrow().sessions.keys().copied().collect()
    }

    pub fn skeleton(&self) -> Vec<MirroredNode> {
        self.state.borrow().skeleton()
    }

    /// Id of a mounted host node.
    pub fn node_id(&self, library: LibraryKind, handle: HostHandle) -> Option<NodeId> {
        self.state
            .borrow()
            .sessions
            .get(&library)?
            .mirror
            .lookup(handle)
            .cloned()
    }

    pub fn on_mount_root(&self, library: LibraryKind, handle: HostHandle) -> Result<(), MirrorError> {
        let ops = {
            let mut state = self.state.borrow_mut();
            let session = state.session_mut(library)?;
            session.mirror.mount_root(&*session.host, handle)?
        };
        self.emit(library, ops);
        Ok(())
    }

    pub fn on_update(
        &self,
        library: LibraryKind,
        next: HostHandle,
        previous: Option<HostHandle>,
    ) -> Result<(), MirrorError> {
        let ops = {
            let mut state = self.state.borrow_mut();
            let session = state.session_mut(library)?;
            session.mirror.update(&*session.host, next, previous)
        };
        self.emit(library, ops);
        Ok(())
    }

    /// Block-style insertion into `target` before `anchor`.
    pub fn on_insert(
        &self,
        library: LibraryKind,
        handle: HostHandle,
        target: Option<HostHandle>,
        anchor: Option<HostHandle>,
    ) -> Result<(), MirrorError> {
        let ops = {
            let mut state = self.state.borrow_mut();
            let session = state.session_mut(library)?;
            session.mirror.insert(&*session.host, handle, target, anchor)?
        };
        self.emit(library, ops);
        Ok(())
    }

    pub fn on_unmount(&self, library: LibraryKind, handle: HostHandle) -> Result<(), MirrorError> {
        let ops = {
            let mut state = self.state.borrow_mut();
            let session = state.session_mut(library)?;
            session.mirror.unmount(&*session.host, handle)
        };
        self.emit(library, ops);
        Ok(())
    }

    /// Advance the agent's clock and flush a batch whose window elapsed.
    pub fn tick(&self, now: Instant) {
        self.now.set(now);
        let ops = match self.state.borrow_mut().batcher.as_mut() {
            Some(batcher) => batcher.poll(now),
            None => Vec::new(),
        };
        self.send_operations(ops);
    }

    pub fn flush(&self) {
        let ops = match self.state.borrow_mut().batcher.as_mut() {
            Some(batcher) => batcher.flush(),
            None => Vec::new(),
        };
        self.send_operations(ops);
    }

    pub fn batch_deadline(&self) -> Option<Instant> {
        self.state
            .borrow()
            .batcher
            .as_ref()
            .and_then(MutationBatcher::deadline)
    }

    fn emit(&self, library: LibraryKind, ops: Vec<Operation>) {
        let outgoing = self
            .state
            .borrow_mut()
            .route(library, ops, self.now.get());
        self.send_operations(outgoing);
    }

    fn send_operations(&self, ops: Vec<Operation>) {
        for op in ops {
            self.send(Message::from(op));
        }
    }

    /// Messages emitted while disconnected are lost; the far side rebuilds
    /// from a full skeleton when it reconnects.
    fn send(&self, message: Message) {
        if !self.channel.is_connected() {
            tracing::debug!(kind = message.kind(), "agent channel disconnected; dropping");
            return;
        }
        if let Err(e) = self.channel.send(Envelope::new(message).encode()) {
            diagnostics::warn(format!("agent: {}", e));
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(sub) = self.subscription.take() {
            sub.unsubscribe();
        }
    }
}

fn answer(state: &RefCell<AgentState>, channel: &dyn Channel, frame: &Frame) {
    let envelope = match Envelope::decode(&frame.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            diagnostics::warn(format!("agent: unrecognized message: {}", e));
            return;
        }
    };
    let Some(key) = envelope.request_id else {
        tracing::debug!(kind = envelope.message.kind(), "agent ignores non-query message");
        return;
    };

    let reply = {
        let state = state.borrow();
        match envelope.message {
            Message::InspectRequest { ids } => Message::InspectResponse {
                items: state.inspect(&ids),
            },
            Message::GetFullSkeleton => Message::FullSkeleton {
                roots: state.skeleton(),
            },
            Message::IsLibraryAttached => Message::LibraryAttachedAnswer {
                attached: !state.sessions.is_empty(),
            },
            other => {
                tracing::debug!(kind = other.kind(), "agent cannot answer");
                return;
            }
        }
    };

    if let Err(e) = channel.send(Envelope::reply(key, reply).encode()) {
        diagnostics::warn(format!("agent: cannot answer: {}", e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BroadcastBus, BroadcastChannel, EventLoop};
    use crate::host::NodeKind;
    use crate::inspect::InspectedValue;
    use crate::script::{HostNodeSpec, HostTable};
    use crate::tree::Anchor;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Rig {
        event_loop: EventLoop,
        agent: Agent,
        peer: BroadcastChannel,
        seen: Rc<RefCell<Vec<Envelope>>>,
        _sub: Subscription,
    }

    fn rig(config: InspectorConfig) -> Rig {
        let event_loop = EventLoop::new();
        let bus = BroadcastBus::new(&event_loop, config.origin.clone());
        let ours = BroadcastChannel::new(&bus, "devtree", "agent");
        let peer = BroadcastChannel::new(&bus, "devtree", "content");
        ours.connect().unwrap();
        peer.connect().unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let sub = peer.on_message(Box::new(move |frame: &Frame| {
            s.borrow_mut().push(Envelope::decode(&frame.payload).unwrap());
        }));
        let agent = Agent::new(config, Rc::new(ours));
        Rig {
            event_loop,
            agent,
            peer,
            seen,
            _sub: sub,
        }
    }

    fn messages(rig: &Rig) -> Vec<Message> {
        rig.event_loop.run_until_idle();
        rig.seen.borrow_mut().drain(..).map(|e| e.message).collect()
    }

    fn host() -> Rc<dyn HostTree> {
        let mut host = HostTable::new();
        host.insert(HostNodeSpec::new(1, NodeKind::Component, "R").children([3]));
        host.insert(HostNodeSpec::new(2, NodeKind::Component, "R").children([3, 4, 5]).previous(1));
        host.insert(HostNodeSpec::new(3, NodeKind::Element, "A").state(serde_json::json!({ "n": 1 })));
        host.insert(HostNodeSpec::new(4, NodeKind::Element, "B"));
        host.insert(HostNodeSpec::new(5, NodeKind::Element, "C"));
        Rc::new(host)
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn registration_announces_and_rejects_duplicates() {
        let rig = rig(InspectorConfig::default());
        rig.agent.register_adapter(LibraryKind::Fiber, host()).unwrap();
        assert!(matches!(
            rig.agent.register_adapter(LibraryKind::Fiber, host()),
            Err(MirrorError::AdapterAlreadyRegistered { .. })
        ));
        assert!(matches!(
            rig.agent.on_mount_root(LibraryKind::Compiled, HostHandle(1)),
            Err(MirrorError::UnknownLibrary { .. })
        ));
        assert_eq!(
            messages(&rig),
            vec![Message::LibraryAttached {
                library: LibraryKind::Fiber
            }]
        );
    }

    #[test]
    fn unbatched_operations_stream_in_order() {
        let rig = rig(InspectorConfig::default());
        rig.agent.register_adapter(LibraryKind::Fiber, host()).unwrap();
        rig.agent.on_mount_root(LibraryKind::Fiber, HostHandle(1)).unwrap();
        rig.agent.on_update(LibraryKind::Fiber, HostHandle(2), None).unwrap();

        let kinds: Vec<Message> = messages(&rig).into_iter().skip(2).collect();
        assert_eq!(
            kinds,
            vec![
                Message::from(Operation::MountNode {
                    parent_id: id("f:1"),
                    anchor: Anchor::after(id("f:2")),
                    node: MirroredNode::leaf(id("f:3"), NodeKind::Element, "B"),
                }),
                Message::from(Operation::MountNode {
                    parent_id: id("f:1"),
                    anchor: Anchor::after(id("f:3")),
                    node: MirroredNode::leaf(id("f:4"), NodeKind::Element, "C"),
                }),
            ]
        );
    }

    #[test]
    fn batched_mounts_flush_once_after_the_idle_window() {
        let config = InspectorConfig {
            batching: true,
            ..InspectorConfig::default()
        };
        let rig = rig(config);
        let t0 = Instant::now();
        rig.agent.tick(t0);
        rig.agent.register_adapter(LibraryKind::Fiber, host()).unwrap();
        rig.agent.on_mount_root(LibraryKind::Fiber, HostHandle(1)).unwrap();
        messages(&rig);

        rig.agent.on_update(LibraryKind::Fiber, HostHandle(2), None).unwrap();
        assert!(messages(&rig).is_empty());

        rig.agent.tick(t0 + Duration::from_millis(50));
        assert!(messages(&rig).is_empty());

        rig.agent.tick(t0 + Duration::from_millis(100));
        let flushed = messages(&rig);
        assert_eq!(flushed.len(), 1);
        let Message::Operation {
            operation: Operation::MountRoot { node },
        } = &flushed[0]
        else {
            panic!("expected a root mount, got {:?}", flushed[0]);
        };
        let names: Vec<&str> = node.children.iter().map(|c| c.display_name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(rig.agent.batch_deadline(), None);
    }

    #[test]
    fn other_operations_flush_the_batch_first() {
        let config = InspectorConfig {
            batching: true,
            ..InspectorConfig::default()
        };
        let rig = rig(config);
        rig.agent.register_adapter(LibraryKind::Fiber, host()).unwrap();
        rig.agent.on_mount_root(LibraryKind::Fiber, HostHandle(1)).unwrap();
        rig.agent.on_update(LibraryKind::Fiber, HostHandle(2), None).unwrap();
        rig.agent.on_unmount(LibraryKind::Fiber, HostHandle(4)).unwrap();

        let kinds: Vec<&'static str> = messages(&rig)
            .iter()
            .map(|m| match m {
                Message::Operation { operation } => match operation {
                    Operation::MountRoot { .. } => "mount_root",
                    Operation::MountNode { .. } => "mount_node",
                    Operation::UpdateNode { .. } => "update_node",
                    Operation::UnmountNode { .. } => "unmount_node",
                },
                other => other.kind(),
            })
            .collect();
        assert_eq!(kinds, vec!["library_attached", "mount_root", "mount_root", "unmount_node"]);
    }

    #[test]
    fn answers_queries_addressed_by_request_id() {
        let rig = rig(InspectorConfig::default());
        rig.agent.register_adapter(LibraryKind::Fiber, host()).unwrap();
        rig.agent.on_mount_root(LibraryKind::Fiber, HostHandle(1)).unwrap();
        messages(&rig);

        let ask = |key: &str, message: Message| {
            rig.peer.send(Envelope::request(key, message).encode()).unwrap();
        };
        ask("panel#1", Message::IsLibraryAttached);
        ask("panel#2", Message::InspectRequest { ids: vec![id("f:2"), id("f:99")] });
        ask("panel#3", Message::GetFullSkeleton);
        rig.event_loop.run_until_idle();

        let replies: Vec<(Option<String>, Message)> = rig
            .seen
            .borrow_mut()
            .drain(..)
            .map(|e| (e.reply_to, e.message))
            .collect();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], (Some("panel#1".to_string()), Message::LibraryAttachedAnswer { attached: true }));

        let Message::InspectResponse { items } = &replies[1].1 else {
            panic!("expected inspect response");
        };
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id("f:2"));
        assert!(matches!(items[0].data, InspectedValue::Object { .. }));

        let Message::FullSkeleton { roots } = &replies[2].1 else {
            panic!("expected skeleton");
        };
        assert_eq!(roots, &rig.agent.skeleton());
    }

    #[test]
    fn disconnected_agent_keeps_mirroring() {
        let rig = rig(InspectorConfig::default());
        rig.agent.channel().disconnect().unwrap();
        rig.agent.register_adapter(LibraryKind::Fiber, host()).unwrap();
        rig.agent.on_mount_root(LibraryKind::Fiber, HostHandle(1)).unwrap();
        assert!(messages(&rig).is_empty());
        assert_eq!(rig.agent.skeleton().len(), 1);
    }
}
