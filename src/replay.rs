//! Drive a validated [`Script`] through the full pipeline:
//! agent -> broadcast -> relay -> port -> client.

use crate::agent::Agent;
use crate::channel::{BroadcastBus, BroadcastChannel, Channel, EventLoop, PortChannel, PortHub};
use crate::client::InspectorClient;
use crate::config::InspectorConfig;
use crate::diagnostics;
use crate::error::MirrorError;
use crate::inspect::InspectedNode;
use crate::relay::Relay;
use crate::script::{Event, Script};
use crate::tree::{MirroredNode, Operation};

use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const PAGE_CHANNEL: &str = "devtree";
pub const PANEL_PORT: &str = "devtree-panel";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    /// Operations as the client applied them.
    pub operations: Vec<Operation>,
    /// What the client ended up with.
    pub skeleton: Option<Vec<MirroredNode>>,
    /// What the agent's mirror holds.
    pub mirror: Vec<MirroredNode>,
    pub converged: bool,
    pub inspections: Vec<InspectedNode>,
    pub attached: bool,
}

pub fn replay(script: &Script, config: &InspectorConfig) -> anyhow::Result<ReplayReport> {
    let event_loop = EventLoop::new();
    let bus = BroadcastBus::new(&event_loop, config.origin.clone());
    let hub = PortHub::new(&event_loop);

    let agent_end = BroadcastChannel::new(&bus, PAGE_CHANNEL, "agent");
    let content_end = BroadcastChannel::new(&bus, PAGE_CHANNEL, "content");
    let relay_port = PortChannel::listener(&hub, PANEL_PORT, "content", None);
    let panel_port = PortChannel::initiator(&hub, PANEL_PORT, "panel");

    let relay = Relay::new("content");
    relay.add_hop("page", Rc::new(content_end.clone()));
    relay.add_hop("panel", Rc::new(relay_port));
    let client = InspectorClient::new("panel", Rc::new(panel_port.clone()));
    let agent = Agent::new(config.clone(), Rc::new(agent_end.clone()));

    agent_end.connect()?;
    content_end.connect()?;
    panel_port.connect()?;
    event_loop.run_until_idle();

    client.request_full_skeleton()?;
    event_loop.run_until_idle();

    let operations = Rc::new(RefCell::new(Vec::new()));
    let log = operations.clone();
    let _sub = client.subscribe(move |op: &Operation| log.borrow_mut().push(op.clone()));

    let library = script.library;
    agent.register_adapter(library, Rc::new(script.host.clone()))?;
    event_loop.run_until_idle();

    let inspections = Rc::new(RefCell::new(Vec::new()));
    let mut now = Instant::now();
    agent.tick(now);

    for event in &script.events {
        tracing::debug!(?event, "replaying");
        let result = match *event {
            Event::MountRoot(handle) => agent.on_mount_root(library, handle),
            Event::Update { next, previous } => agent.on_update(library, next, previous),
            Event::Insert {
                handle,
                target,
                anchor,
            } => agent.on_insert(library, handle, target, anchor),
            Event::Unmount(handle) => agent.on_unmount(library, handle),
            Event::Inspect(handle) => {
                match agent.node_id(library, handle) {
                    Some(id) => {
                        let sink = inspections.clone();
                        client.inspect(vec![id], move |items| sink.borrow_mut().extend(items))?;
                    }
                    None => diagnostics::warn(format!("inspect {}: node is not mounted", handle)),
                }
                Ok(())
            }
            Event::Tick(ms) => {
                now += Duration::from_millis(ms);
                agent.tick(now);
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(e @ MirrorError::UnsupportedBlock { .. }) => {
                diagnostics::warn(format!("{:?}: {}", event, e));
            }
            Err(e) => return Err(e.into()),
        }
        event_loop.run_until_idle();
    }

    agent.flush();
    event_loop.run_until_idle();

    let attached = Rc::new(Cell::new(false));
    let answer = attached.clone();
    client.is_library_attached(move |yes| answer.set(yes))?;
    event_loop.run_until_idle();

    let skeleton = client.skeleton();
    let mirror = agent.skeleton();
    let converged = skeleton.as_ref() == Some(&mirror);
    if !converged {
        diagnostics::warn("client skeleton differs from the agent's mirror");
    }

    Ok(ReplayReport {
        operations: operations.take(),
        skeleton,
        mirror,
        converged,
        inspections: inspections.take(),
        attached: attached.get(),
    })
}
