//! Stable logical ids for opaque host handles.
//!
//! A framework may replace a node with a "next version" of itself; both
//! handles must resolve to the same [`NodeId`]. Ids are minted per resolver
//! as `<prefix>:<counter>`, the prefix being unique per registered adapter,
//! so ids stay globally unique across instrumentation sources.

use crate::error::MirrorError;
use crate::host::HostHandle;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct IdentityResolver {
    prefix: String,
    next: u64,
    by_handle: HashMap<HostHandle, NodeId>,
    // Reverse index so a retired id drops every alias at once.
    handles_by_id: HashMap<NodeId, Vec<HostHandle>>,
}

impl IdentityResolver {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: 0,
            by_handle: HashMap::new(),
            handles_by_id: HashMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolve `handle` to its id, minting one if neither `handle` nor its
    /// previous version has been seen.
    pub fn resolve(&mut self, handle: HostHandle, previous: Option<HostHandle>) -> NodeId {
        if let Some(id) = self.by_handle.get(&handle).cloned() {
            if let Some(prev) = previous {
                if !self.by_handle.contains_key(&prev) {
                    self.alias(prev, &id);
                }
            }
            return id;
        }

        if let Some(id) = previous.and_then(|prev| self.by_handle.get(&prev).cloned()) {
            self.alias(handle, &id);
            return id;
        }

        self.next += 1;
        let id = NodeId(format!("{}:{}", self.prefix, self.next));
        self.alias(handle, &id);
        if let Some(prev) = previous {
            self.alias(prev, &id);
        }
        id
    }

    /// Id of a handle that was already resolved, without minting.
    pub fn lookup(&self, handle: HostHandle) -> Option<&NodeId> {
        self.by_handle.get(&handle)
    }

    /// Forget every handle aliased to `id`. Called once its record is gone.
    pub fn retire(&mut self, id: &NodeId) {
        if let Some(handles) = self.handles_by_id.remove(id) {
            for handle in handles {
                self.by_handle.remove(&handle);
            }
        }
    }

    /// Number of live handle associations.
    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    fn alias(&mut self, handle: HostHandle, id: &NodeId) {
        self.by_handle.insert(handle, id.clone());
        self.handles_by_id.entry(id.clone()).or_default().push(handle);
    }
}

/// Hands out resolvers, one per identity prefix.
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    prefixes: HashSet<String>,
}

fn prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9]{0,7}$").expect("static regex"))
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `prefix` and return the resolver that owns it.
    pub fn register(&mut self, prefix: &str) -> Result<IdentityResolver, MirrorError> {
        if !prefix_re().is_match(prefix) {
            return Err(MirrorError::InvalidPrefix {
                prefix: prefix.to_string(),
            });
        }
        if !self.prefixes.insert(prefix.to_string()) {
            return Err(MirrorError::AdapterAlreadyRegistered {
                prefix: prefix.to_string(),
            });
        }
        Ok(IdentityResolver::new(prefix))
    }

    pub fn is_registered(&self, prefix: &str) -> bool {
        self.prefixes.contains(prefix)
    }
}
