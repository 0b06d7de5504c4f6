//! Replay scripts (script.json).
//!
//! JSON shape:
//! {
//!   "library": "fiber",                 // "fiber" | "compiled"
//!   "nodes": [
//!     {
//!       "handle": 1,
//!       "kind": "component",            // component | element | text | {"block": "each"}
//!       "name": "App",
//!       "children": [2, 3],             // host order
//!       "previous": null,               // version this node replaced
//!       "group": null,                  // containing block
//!       "state": { "count": 1 }         // what inspection sees
//!     }
//!   ],
//!   "events": [
//!     "mount_root 1",
//!     "update 4 <- 1",
//!     "insert 7 into 3 before 5",
//!     "unmount 4",
//!     "inspect 2",
//!     "tick 150"
//!   ]
//! }
//!
//! Every node version is listed up front with its own handle, so the table
//! is immutable while the events play.

use crate::diagnostics;
use crate::host::{HostHandle, HostTree, LibraryKind, NodeKind};
use crate::inspect::HostValue;

use anyhow::{Context, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostNodeSpec {
    pub handle: u64,
    pub kind: NodeKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub children: Vec<u64>,
    #[serde(default)]
    pub previous: Option<u64>,
    #[serde(default)]
    pub group: Option<u64>,
    #[serde(default)]
    pub state: Option<serde_json::Value>,
}

impl HostNodeSpec {
    pub fn new(handle: u64, kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            handle,
            kind,
            name: name.into(),
            children: Vec::new(),
            previous: None,
            group: None,
            state: None,
        }
    }

    pub fn children(mut self, children: impl IntoIterator<Item = u64>) -> Self {
        self.children = children.into_iter().collect();
        self
    }

    pub fn previous(mut self, handle: u64) -> Self {
        self.previous = Some(handle);
        self
    }

    pub fn group(mut self, handle: u64) -> Self {
        self.group = Some(handle);
        self
    }

    pub fn state(mut self, state: serde_json::Value) -> Self {
        self.state = Some(state);
        self
    }
}

/// A static host tree backed by a table of node versions.
#[derive(Debug, Clone, Default)]
pub struct HostTable {
    nodes: HashMap<HostHandle, HostNodeSpec>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node version. Returns the replaced one.
    pub fn insert(&mut self, spec: HostNodeSpec) -> Option<HostNodeSpec> {
        self.nodes.insert(HostHandle(spec.handle), spec)
    }

    pub fn contains(&self, handle: HostHandle) -> bool {
        self.nodes.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl HostTree for HostTable {
    fn kind(&self, node: HostHandle) -> NodeKind {
        self.nodes.get(&node).map_or(NodeKind::Text, |n| n.kind)
    }

    fn display_name(&self, node: HostHandle) -> String {
        self.nodes.get(&node).map(|n| n.name.clone()).unwrap_or_default()
    }

    fn children(&self, node: HostHandle) -> Vec<HostHandle> {
        self.nodes
            .get(&node)
            .map(|n| n.children.iter().copied().map(HostHandle).collect())
            .unwrap_or_default()
    }

    fn previous_version(&self, node: HostHandle) -> Option<HostHandle> {
        self.nodes.get(&node)?.previous.map(HostHandle)
    }

    fn containing_group(&self, node: HostHandle) -> Option<HostHandle> {
        self.nodes.get(&node)?.group.map(HostHandle)
    }

    fn inspect(&self, node: HostHandle) -> Option<HostValue> {
        self.nodes.get(&node)?.state.as_ref().map(HostValue::from)
    }
}

/// One lifecycle callback, as an adapter would deliver it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    MountRoot(HostHandle),
    Update {
        next: HostHandle,
        previous: Option<HostHandle>,
    },
    Insert {
        handle: HostHandle,
        target: Option<HostHandle>,
        anchor: Option<HostHandle>,
    },
    Unmount(HostHandle),
    Inspect(HostHandle),
    /// Advance the clock by this many milliseconds.
    Tick(u64),
}

impl Event {
    fn handles(&self) -> Vec<HostHandle> {
        match *self {
            Event::MountRoot(h) | Event::Unmount(h) | Event::Inspect(h) => vec![h],
            Event::Update { next, previous } => std::iter::once(next).chain(previous).collect(),
            Event::Insert {
                handle,
                target,
                anchor,
            } => std::iter::once(handle).chain(target).chain(anchor).collect(),
            Event::Tick(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptSpec {
    pub library: LibraryKind,

    #[serde(default)]
    pub nodes: Vec<HostNodeSpec>,

    #[serde(default)]
    pub events: Vec<String>,
}

/// Validated script ready to replay.
#[derive(Debug, Clone)]
pub struct Script {
    pub library: LibraryKind,
    pub host: HostTable,
    pub events: Vec<Event>,
}

impl ScriptSpec {
    pub fn from_json_file(path: &str) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| diagnostics::error_message(format!("read script file {}", path)))?;
        serde_json::from_str(&text)
            .with_context(|| diagnostics::error_message(format!("parse script file {}", path)))
    }

    /// Check references, parse events, and build the host table.
    pub fn validate_and_build(&self) -> anyhow::Result<Script> {
        let mut nodes: BTreeMap<u64, &HostNodeSpec> = BTreeMap::new();
        for node in &self.nodes {
            if nodes.insert(node.handle, node).is_some() {
                bail!(diagnostics::error_message(format!(
                    "duplicate node handle in script: {}",
                    node.handle
                )));
            }
        }

        for node in nodes.values() {
            for child in &node.children {
                if !nodes.contains_key(child) {
                    bail!(diagnostics::error_message(format!(
                        "node {} lists unknown child {}",
                        node.handle, child
                    )));
                }
            }
            for (what, other) in [("previous", node.previous), ("group", node.group)] {
                if let Some(other) = other {
                    if !nodes.contains_key(&other) {
                        bail!(diagnostics::error_message(format!(
                            "node {} has unknown {} {}",
                            node.handle, what, other
                        )));
                    }
                }
            }
        }

        let events = parse_events(&self.events)?;
        for (i, event) in events.iter().enumerate() {
            for handle in event.handles() {
                if !nodes.contains_key(&handle.0) {
                    bail!(diagnostics::error_message(format!(
                        "event {} ({:?}) references unknown node {}",
                        i + 1,
                        event,
                        handle.0
                    )));
                }
            }
        }

        let mut host = HostTable::new();
        for node in nodes.into_values() {
            host.insert(node.clone());
        }

        Ok(Script {
            library: self.library,
            host,
            events,
        })
    }
}

/// Parse textual events. Blank lines and `#` comments are skipped.
pub fn parse_events(lines: &[String]) -> anyhow::Result<Vec<Event>> {
    let line_re = Regex::new(r"^\s*([a-z_]+)\s*(.*?)\s*$")?;
    let one_re = Regex::new(r"^(\d+)$")?;
    let update_re = Regex::new(r"^(\d+)(?:\s*<-\s*(\d+))?$")?;
    let insert_re = Regex::new(r"^(\d+)(?:\s+into\s+(\d+))?(?:\s+before\s+(\d+))?$")?;

    let mut out = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let lno = i + 1;
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let Some(caps) = line_re.captures(line) else {
            bail!(diagnostics::error_message(format!(
                "event {}: cannot parse {:?}",
                lno, line
            )));
        };
        let verb = &caps[1];
        let args = &caps[2];
        let bad = || diagnostics::error_message(format!("event {}: bad arguments for {}: {:?}", lno, verb, args));

        let event = match verb {
            "mount_root" | "unmount" | "inspect" | "tick" => {
                let caps = one_re.captures(args).with_context(bad)?;
                let n = parse_number(&caps[1]).with_context(bad)?;
                match verb {
                    "mount_root" => Event::MountRoot(HostHandle(n)),
                    "unmount" => Event::Unmount(HostHandle(n)),
                    "inspect" => Event::Inspect(HostHandle(n)),
                    _ => Event::Tick(n),
                }
            }
            "update" => {
                let caps = update_re.captures(args).with_context(bad)?;
                Event::Update {
                    next: HostHandle(parse_number(&caps[1]).with_context(bad)?),
                    previous: optional_handle(caps.get(2)).with_context(bad)?,
                }
            }
            "insert" => {
                let caps = insert_re.captures(args).with_context(bad)?;
                Event::Insert {
                    handle: HostHandle(parse_number(&caps[1]).with_context(bad)?),
                    target: optional_handle(caps.get(2)).with_context(bad)?,
                    anchor: optional_handle(caps.get(3)).with_context(bad)?,
                }
            }
            other => bail!(diagnostics::error_message(format!(
                "event {}: unknown event {:?}",
                lno, other
            ))),
        };
        out.push(event);
    }
    Ok(out)
}

fn parse_number(s: &str) -> anyhow::Result<u64> {
    s.parse::<u64>()
        .with_context(|| format!("bad number {}", s))
}

fn optional_handle(m: Option<regex::Match<'_>>) -> anyhow::Result<Option<HostHandle>> {
    m.map(|m| parse_number(m.as_str()).map(HostHandle)).transpose()
}
