//! Prefix tree routing every topic to the backend broker that owns its subtree.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{json, Map, Value};

use crate::topic::{segments, validate_host, validate_route_topic};
use crate::types::Endpoint;
use crate::{FedError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingNode {
    endpoint: Option<Endpoint>,
    children: BTreeMap<String, RoutingNode>,
}

impl RoutingNode {
    #[inline]
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    #[inline]
    pub fn children(&self) -> &BTreeMap<String, RoutingNode> {
        &self.children
    }

    fn collect_endpoints(&self, out: &mut Vec<Endpoint>) {
        for child in self.children.values() {
            if let Some(ep) = child.endpoint.as_ref() {
                out.push(ep.clone());
            }
            child.collect_endpoints(out);
        }
    }

    fn to_json(&self) -> Value {
        let mut children = Map::new();
        for (segment, child) in self.children.iter() {
            children.insert(segment.clone(), child.to_json());
        }
        let (host, port) = match self.endpoint.as_ref() {
            Some(ep) => (ep.host.as_str(), ep.port),
            None => ("", 0),
        };
        json!({
            "host": host,
            "port": port,
            "children": children,
        })
    }
}

/// Per-process replica of the global broker table.
///
/// Every node reachable from the root carries an endpoint once the root has been set, a node's
/// endpoint applies to its whole subtree unless a descendant overrides it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    root: RoutingNode,
}

impl RoutingTable {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn root(&self) -> Option<&Endpoint> {
        self.root.endpoint.as_ref()
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.root.endpoint.is_some()
    }

    /// Endpoint of the deepest node on the topic's path.
    ///
    /// Callers may fall back to [`RoutingTable::root`] on a `TopicFormat` error.
    pub fn lookup(&self, topic: &str) -> Result<Endpoint> {
        validate_route_topic(topic)?;
        let mut node = &self.root;
        let mut endpoint = self.root.endpoint.as_ref();
        for segment in segments(topic) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if child.endpoint.is_some() {
                        endpoint = child.endpoint.as_ref();
                    }
                }
                None => break,
            }
        }
        endpoint.cloned().ok_or_else(|| FedError::NotFound(format!("routing table is empty, topic: {topic}")))
    }

    /// Endpoints from the root down to the node addressed by `topic`, deepest last.
    ///
    /// Stops at the first missing segment; a parent and child sharing an endpoint both appear.
    pub fn lookup_subtree_endpoints(&self, topic: &str) -> Result<Vec<Endpoint>> {
        validate_route_topic(topic)?;
        let mut chain = Vec::new();
        let mut node = &self.root;
        if let Some(ep) = node.endpoint.as_ref() {
            chain.push(ep.clone());
        }
        for segment in segments(topic) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if let Some(ep) = child.endpoint.as_ref() {
                        chain.push(ep.clone());
                    }
                }
                None => break,
            }
        }
        Ok(chain)
    }

    /// Endpoint of the deepest node reached for `topic`, then every descendant endpoint in pre-order.
    pub fn subtree_endpoints(&self, topic: &str) -> Result<Vec<Endpoint>> {
        validate_route_topic(topic)?;
        let mut node = &self.root;
        for segment in segments(topic) {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => break,
            }
        }
        let mut endpoints = Vec::new();
        if let Some(ep) = node.endpoint.as_ref() {
            endpoints.push(ep.clone());
        }
        node.collect_endpoints(&mut endpoints);
        Ok(endpoints)
    }

    /// Hands the subtree at `topic` to `host:port`, discarding any finer routing below it.
    pub fn update(&mut self, topic: &str, host: &str, port: u16) -> Result<()> {
        validate_route_topic(topic)?;
        validate_host(host)?;
        let endpoint = Endpoint::new(host, port);
        let mut node = &mut self.root;
        for segment in segments(topic) {
            if node.endpoint.is_none() {
                node.endpoint = Some(endpoint.clone());
            }
            node = node.children.entry(segment.to_owned()).or_default();
        }
        node.endpoint = Some(endpoint);
        node.children.clear();
        Ok(())
    }

    #[inline]
    pub fn to_json(&self) -> Value {
        self.root.to_json()
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}
