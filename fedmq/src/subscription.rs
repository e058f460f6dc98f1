//! Reference-counted, wildcard-aware mirror of the topics subscribed through one backend connection.
//!
//! Every node counts the local registrations of its exact topic. A multi-level wildcard `P/#` is
//! kept as the `#` child of `P` and covers `P` itself and every node below it. At most one upstream
//! subscription is held per distinct scope: a topic covered by a counted wildcard stays dormant
//! (counted, not subscribed) until that wildcard goes away.
//!
//! The tracker does no I/O. Each change returns the ordered [`Action`]s the owner must perform
//! upstream.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::topic::{join, segments, validate_route_topic, validate_subscription_topic, MULTI_LEVEL_WILDCARD};
use crate::{FedError, Result};

type NodeId = usize;

const ROOT: NodeId = 0;

/// An upstream call the tracker asks its owner to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Debug, Clone, Default)]
struct SubscriptionNode {
    parent: Option<NodeId>,
    segment: String,
    children: BTreeMap<String, NodeId>,
    subscriber_count: u32,
    active_topic: Option<String>,
}

impl SubscriptionNode {
    #[inline]
    fn is_wildcard(&self) -> bool {
        self.segment == MULTI_LEVEL_WILDCARD
    }

    #[inline]
    fn is_unused(&self) -> bool {
        self.subscriber_count == 0 && self.children.is_empty() && self.active_topic.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    nodes: Vec<Option<SubscriptionNode>>,
    free: Vec<NodeId>,
}

impl Default for SubscriptionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionTracker {
    #[inline]
    pub fn new() -> Self {
        SubscriptionTracker { nodes: vec![Some(SubscriptionNode::default())], free: Vec::new() }
    }

    /// Registers one more local subscriber of `topic`.
    pub fn increase(&mut self, topic: &str) -> Result<Vec<Action>> {
        validate_subscription_topic(topic)?;
        let segs: Vec<&str> = segments(topic).collect();
        let id = self.ensure(&segs)?;

        let node = self.get_mut(id)?;
        node.subscriber_count =
            node.subscriber_count.checked_add(1).ok_or_else(|| FedError::MaxSubscriberCount(topic.into()))?;
        if node.active_topic.is_some() || self.is_covered(id)? {
            return Ok(Vec::new());
        }

        let node = self.get_mut(id)?;
        node.active_topic = Some(topic.to_owned());
        let mut actions = vec![Action::Subscribe(topic.to_owned())];
        if node.is_wildcard() {
            let parent = self.parent_of(id)?;
            self.deactivate(parent, id, &mut actions)?;
        }
        Ok(actions)
    }

    /// Drops one local subscriber of `topic`.
    pub fn decrease(&mut self, topic: &str) -> Result<Vec<Action>> {
        validate_subscription_topic(topic)?;
        let segs: Vec<&str> = segments(topic).collect();
        let id = self.find(&segs).ok_or_else(|| FedError::NotFound(format!("subscription {topic}")))?;

        let node = self.get_mut(id)?;
        if node.subscriber_count == 0 {
            return Err(FedError::ZeroSubscriberCount(topic.into()));
        }
        node.subscriber_count -= 1;
        if node.subscriber_count > 0 {
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        if let Some(active) = node.active_topic.take() {
            actions.push(Action::Unsubscribe(active));
            if node.is_wildcard() {
                let parent = self.parent_of(id)?;
                self.activate_from(parent, &mut actions)?;
            }
        }
        self.prune(id)?;
        Ok(actions)
    }

    /// Local subscribers of exactly `topic`.
    pub fn subscriber_count(&self, topic: &str) -> Result<u32> {
        validate_subscription_topic(topic)?;
        let segs: Vec<&str> = segments(topic).collect();
        let id = self.find(&segs).ok_or_else(|| FedError::NotFound(format!("subscription {topic}")))?;
        Ok(self.get(id)?.subscriber_count)
    }

    /// Sum of all subscriber counts, saturating.
    pub fn total_subscribers(&self) -> u32 {
        self.nodes.iter().flatten().fold(0u32, |acc, n| acc.saturating_add(n.subscriber_count))
    }

    /// Topics currently holding an upstream subscription, sorted.
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.nodes.iter().flatten().filter_map(|n| n.active_topic.clone()).collect();
        topics.sort();
        topics
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.get(ROOT).and_then(|n| n.as_ref()).map(|n| n.is_unused()).unwrap_or(true)
    }

    /// Overrides the upstream state recorded for `topic` when its owner could not carry out an action.
    pub fn set_active(&mut self, topic: &str, active: bool) -> Result<()> {
        let segs: Vec<&str> = segments(topic).collect();
        let id = self.find(&segs).ok_or_else(|| FedError::NotFound(format!("subscription {topic}")))?;
        self.get_mut(id)?.active_topic = if active { Some(topic.to_owned()) } else { None };
        Ok(())
    }

    /// A new, fully inactive tracker holding a copy of the counts at and below routing topic `topic`.
    pub fn subset(&self, topic: &str) -> Result<SubscriptionTracker> {
        validate_route_topic(topic)?;
        let segs: Vec<&str> = segments(topic).collect();
        let mut subset = SubscriptionTracker::new();
        if let Some(src) = self.find(&segs) {
            let dst = subset.ensure(&segs)?;
            self.copy_into(src, &mut subset, dst)?;
        }
        Ok(subset)
    }

    /// Subscribes the minimal covering set for every counted topic not yet active.
    pub fn activate_all(&mut self) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        self.activate_from(ROOT, &mut actions)?;
        Ok(actions)
    }

    /// Forgets everything at and below routing topic `topic`.
    ///
    /// Returns the unsubscribes for the active topics that were dropped and the number of
    /// subscribers removed.
    pub fn detach_subtree(&mut self, topic: &str) -> Result<(Vec<Action>, u32)> {
        validate_route_topic(topic)?;
        let segs: Vec<&str> = segments(topic).collect();
        let id = match self.find(&segs) {
            Some(id) => id,
            None => return Ok((Vec::new(), 0)),
        };

        let mut actions = Vec::new();
        let mut removed = 0u32;
        self.drain(id, &mut actions, &mut removed)?;
        if id == ROOT {
            self.nodes.truncate(1);
            self.free.clear();
            self.nodes[ROOT] = Some(SubscriptionNode::default());
        } else {
            let parent = self.parent_of(id)?;
            let segment = self.get(id)?.segment.clone();
            self.get_mut(parent)?.children.remove(&segment);
            self.release(id);
            self.prune(parent)?;
        }
        Ok((actions, removed))
    }

    pub fn to_json(&self) -> Value {
        self.node_to_json(ROOT).unwrap_or(Value::Null)
    }

    fn node_to_json(&self, id: NodeId) -> Result<Value> {
        let node = self.get(id)?;
        let mut children = Map::new();
        for (segment, child) in node.children.iter() {
            children.insert(segment.clone(), self.node_to_json(*child)?);
        }
        Ok(json!({
            "topic": self.topic_of(id)?,
            "subscriber_count": node.subscriber_count,
            "active": node.active_topic.is_some(),
            "children": children,
        }))
    }

    #[inline]
    fn get(&self, id: NodeId) -> Result<&SubscriptionNode> {
        self.nodes
            .get(id)
            .and_then(|n| n.as_ref())
            .ok_or_else(|| FedError::StoredTypeMismatch(format!("subscription node {id} is vacant")))
    }

    #[inline]
    fn get_mut(&mut self, id: NodeId) -> Result<&mut SubscriptionNode> {
        self.nodes
            .get_mut(id)
            .and_then(|n| n.as_mut())
            .ok_or_else(|| FedError::StoredTypeMismatch(format!("subscription node {id} is vacant")))
    }

    #[inline]
    fn parent_of(&self, id: NodeId) -> Result<NodeId> {
        self.get(id)?
            .parent
            .ok_or_else(|| FedError::StoredTypeMismatch(format!("subscription node {id} has no parent")))
    }

    fn find(&self, segs: &[&str]) -> Option<NodeId> {
        let mut id = ROOT;
        for segment in segs {
            id = *self.nodes.get(id)?.as_ref()?.children.get(*segment)?;
        }
        Some(id)
    }

    fn ensure(&mut self, segs: &[&str]) -> Result<NodeId> {
        let mut id = ROOT;
        for segment in segs {
            id = match self.get(id)?.children.get(*segment) {
                Some(child) => *child,
                None => self.alloc(id, segment)?,
            };
        }
        Ok(id)
    }

    fn alloc(&mut self, parent: NodeId, segment: &str) -> Result<NodeId> {
        let node = SubscriptionNode { parent: Some(parent), segment: segment.to_owned(), ..Default::default() };
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.get_mut(parent)?.children.insert(segment.to_owned(), id);
        Ok(id)
    }

    #[inline]
    fn release(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes.get_mut(id) {
            if slot.take().is_some() {
                self.free.push(id);
            }
        }
    }

    fn topic_of(&self, id: NodeId) -> Result<String> {
        let mut segs = Vec::new();
        let mut cur = id;
        while cur != ROOT {
            let node = self.get(cur)?;
            segs.push(node.segment.as_str());
            cur = self.parent_of(cur)?;
        }
        segs.reverse();
        Ok(join(segs))
    }

    /// Whether a counted wildcard other than the node itself covers `id`.
    fn is_covered(&self, id: NodeId) -> Result<bool> {
        let node = self.get(id)?;
        let mut cur = if node.is_wildcard() {
            match node.parent {
                Some(p) => self.get(p)?.parent,
                None => None,
            }
        } else {
            Some(id)
        };
        while let Some(c) = cur {
            let n = self.get(c)?;
            if let Some(w) = n.children.get(MULTI_LEVEL_WILDCARD) {
                if *w != id && self.get(*w)?.subscriber_count > 0 {
                    return Ok(true);
                }
            }
            cur = n.parent;
        }
        Ok(false)
    }

    fn deactivate(&mut self, id: NodeId, skip: NodeId, out: &mut Vec<Action>) -> Result<()> {
        if let Some(active) = self.get_mut(id)?.active_topic.take() {
            out.push(Action::Unsubscribe(active));
        }
        let children: Vec<NodeId> = self.get(id)?.children.values().copied().filter(|c| *c != skip).collect();
        for child in children {
            self.deactivate(child, skip, out)?;
        }
        Ok(())
    }

    fn activate_from(&mut self, id: NodeId, out: &mut Vec<Action>) -> Result<()> {
        if let Some(w) = self.get(id)?.children.get(MULTI_LEVEL_WILDCARD).copied() {
            if self.get(w)?.subscriber_count > 0 {
                if self.get(w)?.active_topic.is_none() {
                    let topic = self.topic_of(w)?;
                    self.get_mut(w)?.active_topic = Some(topic.clone());
                    out.push(Action::Subscribe(topic));
                }
                return Ok(());
            }
        }

        let node = self.get(id)?;
        if node.subscriber_count > 0 && node.active_topic.is_none() {
            let topic = self.topic_of(id)?;
            self.get_mut(id)?.active_topic = Some(topic.clone());
            out.push(Action::Subscribe(topic));
        }

        let children: Vec<NodeId> = self
            .get(id)?
            .children
            .iter()
            .filter(|(segment, _)| segment.as_str() != MULTI_LEVEL_WILDCARD)
            .map(|(_, child)| *child)
            .collect();
        for child in children {
            self.activate_from(child, out)?;
        }
        Ok(())
    }

    fn drain(&mut self, id: NodeId, out: &mut Vec<Action>, removed: &mut u32) -> Result<()> {
        let node = self.get_mut(id)?;
        if let Some(active) = node.active_topic.take() {
            out.push(Action::Unsubscribe(active));
        }
        *removed = removed.saturating_add(node.subscriber_count);
        let children: Vec<NodeId> = node.children.values().copied().collect();
        for child in children {
            self.drain(child, out, removed)?;
            self.release(child);
        }
        Ok(())
    }

    fn prune(&mut self, id: NodeId) -> Result<()> {
        let mut cur = id;
        while cur != ROOT {
            let node = self.get(cur)?;
            if !node.is_unused() {
                break;
            }
            let parent = self.parent_of(cur)?;
            let segment = node.segment.clone();
            self.get_mut(parent)?.children.remove(&segment);
            self.release(cur);
            cur = parent;
        }
        Ok(())
    }

    fn copy_into(&self, src: NodeId, dst_tracker: &mut SubscriptionTracker, dst: NodeId) -> Result<()> {
        let node = self.get(src)?;
        dst_tracker.get_mut(dst)?.subscriber_count = node.subscriber_count;
        for (segment, child) in node.children.iter() {
            let d = dst_tracker.alloc(dst, segment)?;
            self.copy_into(*child, dst_tracker, d)?;
        }
        Ok(())
    }
}
