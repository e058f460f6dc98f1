//! In-process stand-in for a set of MQTT brokers, used to drive gateways and the manager without
//! network I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;

use crate::topic::matches;
use crate::transport::{Connector, Transport};
use crate::types::{Endpoint, HashMap, Message, Tx};
use crate::{FedError, Result};

/// Everything a client did against a broker, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Publish { topic: String, payload: Bytes, retain: bool },
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

struct MemoryClient {
    inbound: Tx,
    filters: BTreeSet<String>,
}

#[derive(Default)]
struct MemoryBroker {
    clients: BTreeMap<usize, MemoryClient>,
    retained: BTreeMap<String, Message>,
    calls: Vec<Call>,
    refuse_subscribe: bool,
}

impl MemoryBroker {
    fn route(&mut self, msg: &Message) {
        if msg.retain {
            if msg.payload.is_empty() {
                self.retained.remove(&msg.topic);
            } else {
                self.retained.insert(msg.topic.clone(), msg.clone());
            }
        }
        for client in self.clients.values() {
            if client.filters.iter().any(|f| matches(f, &msg.topic)) {
                deliver(&client.inbound, msg.clone());
            }
        }
    }
}

fn deliver(inbound: &Tx, msg: Message) {
    match inbound.try_send(msg) {
        Ok(()) => {}
        Err(TrySendError::Full(msg)) => log::warn!("inbound channel full, dropping message on {}", msg.topic),
        Err(TrySendError::Closed(_)) => {}
    }
}

#[derive(Default)]
struct BusInner {
    brokers: HashMap<Endpoint, MemoryBroker>,
    next_client: usize,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<BusInner>>,
}

impl MemoryBus {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_brokers(endpoints: &[Endpoint]) -> Self {
        let bus = Self::new();
        for ep in endpoints {
            bus.add_broker(ep);
        }
        bus
    }

    /// Starts accepting connections for `endpoint`.
    pub fn add_broker(&self, endpoint: &Endpoint) {
        self.inner.lock().brokers.entry(endpoint.clone()).or_default();
    }

    /// Takes `endpoint` offline, every client connected to it starts failing.
    pub fn remove_broker(&self, endpoint: &Endpoint) {
        self.inner.lock().brokers.remove(endpoint);
    }

    #[inline]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { bus: self.clone() }
    }

    pub fn calls(&self, endpoint: &Endpoint) -> Vec<Call> {
        self.inner.lock().brokers.get(endpoint).map(|b| b.calls.clone()).unwrap_or_default()
    }

    /// While set, subscribe requests to `endpoint` fail and are not recorded.
    pub fn refuse_subscribe(&self, endpoint: &Endpoint, refuse: bool) {
        if let Some(b) = self.inner.lock().brokers.get_mut(endpoint) {
            b.refuse_subscribe = refuse;
        }
    }

    pub fn clear_calls(&self, endpoint: &Endpoint) {
        if let Some(b) = self.inner.lock().brokers.get_mut(endpoint) {
            b.calls.clear();
        }
    }

    /// Messages published by clients of `endpoint`.
    pub fn published(&self, endpoint: &Endpoint) -> Vec<Message> {
        self.calls(endpoint)
            .into_iter()
            .filter_map(|c| match c {
                Call::Publish { topic, payload, retain } => Some(Message { topic, payload, retain }),
                _ => None,
            })
            .collect()
    }

    /// Current subscription filters of every client of `endpoint`, sorted, one entry per client.
    pub fn subscriptions(&self, endpoint: &Endpoint) -> Vec<String> {
        let inner = self.inner.lock();
        let mut filters: Vec<String> = inner
            .brokers
            .get(endpoint)
            .map(|b| b.clients.values().flat_map(|c| c.filters.iter().cloned()).collect())
            .unwrap_or_default();
        filters.sort();
        filters
    }

    pub fn clients(&self, endpoint: &Endpoint) -> usize {
        self.inner.lock().brokers.get(endpoint).map(|b| b.clients.len()).unwrap_or(0)
    }

    pub fn retained(&self, endpoint: &Endpoint, topic: &str) -> Option<Message> {
        self.inner.lock().brokers.get(endpoint).and_then(|b| b.retained.get(topic).cloned())
    }

    /// Publishes as an external client (a tool or a device), not recorded in the call log.
    pub fn inject<P: Into<Bytes>>(&self, endpoint: &Endpoint, topic: &str, payload: P, retain: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let broker = inner
            .brokers
            .get_mut(endpoint)
            .ok_or_else(|| FedError::Transport(format!("{endpoint} is not reachable")))?;
        broker.route(&Message { topic: topic.to_owned(), payload: payload.into(), retain });
        Ok(())
    }

    fn with_client<T, F>(&self, endpoint: &Endpoint, id: usize, f: F) -> Result<T>
    where
        F: FnOnce(&mut MemoryBroker) -> T,
    {
        let mut inner = self.inner.lock();
        match inner.brokers.get_mut(endpoint) {
            Some(broker) if broker.clients.contains_key(&id) => Ok(f(broker)),
            _ => Err(FedError::Transport(format!("not connected to {endpoint}"))),
        }
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    bus: MemoryBus,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint, inbound: Tx) -> Result<Box<dyn Transport>> {
        let mut inner = self.bus.inner.lock();
        let id = inner.next_client;
        let broker = inner
            .brokers
            .get_mut(endpoint)
            .ok_or_else(|| FedError::Transport(format!("connection refused by {endpoint}")))?;
        broker.clients.insert(id, MemoryClient { inbound, filters: BTreeSet::new() });
        broker.calls.push(Call::Connect);
        inner.next_client += 1;
        Ok(Box::new(MemoryTransport { bus: self.bus.clone(), endpoint: endpoint.clone(), id }))
    }
}

struct MemoryTransport {
    bus: MemoryBus,
    endpoint: Endpoint,
    id: usize,
}

#[async_trait]
impl Transport for MemoryTransport {
    #[inline]
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        self.bus.with_client(&self.endpoint, self.id, |broker| {
            broker.calls.push(Call::Publish { topic: topic.to_owned(), payload: payload.clone(), retain });
            broker.route(&Message { topic: topic.to_owned(), payload, retain });
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let id = self.id;
        let endpoint = &self.endpoint;
        self.bus.with_client(endpoint, id, |broker| {
            if broker.refuse_subscribe {
                return Err(FedError::Transport(format!("subscribe {topic} refused by {endpoint}")));
            }
            broker.calls.push(Call::Subscribe(topic.to_owned()));
            if let Some(client) = broker.clients.get_mut(&id) {
                client.filters.insert(topic.to_owned());
                for msg in broker.retained.values().filter(|m| matches(topic, &m.topic)) {
                    deliver(&client.inbound, msg.clone());
                }
            }
            Ok(())
        })?
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let id = self.id;
        self.bus.with_client(&self.endpoint, id, |broker| {
            broker.calls.push(Call::Unsubscribe(topic.to_owned()));
            if let Some(client) = broker.clients.get_mut(&id) {
                client.filters.remove(topic);
            }
        })
    }

    async fn disconnect(&self, _quiesce: Duration) -> Result<()> {
        let id = self.id;
        self.bus.with_client(&self.endpoint, id, |broker| {
            broker.calls.push(Call::Disconnect);
            broker.clients.remove(&id);
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let ep = Endpoint::new("localhost", 5000);
        let bus = MemoryBus::with_brokers(&[ep.clone()]);
        let (tx, mut rx) = mpsc::channel(16);
        let sub = bus.connector().connect(&ep, tx).await.unwrap();
        let (tx2, _rx2) = mpsc::channel(16);
        let publ = bus.connector().connect(&ep, tx2).await.unwrap();

        sub.subscribe("/1/#").await.unwrap();
        publ.publish("/1/2", Bytes::from_static(b"a"), false).await.unwrap();
        publ.publish("/2", Bytes::from_static(b"b"), false).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Message::new("/1/2", "a"));
        assert!(rx.try_recv().is_err());

        sub.unsubscribe("/1/#").await.unwrap();
        publ.publish("/1/2", Bytes::from_static(b"c"), false).await.unwrap();
        assert!(rx.try_recv().is_err());

        assert_eq!(
            bus.calls(&ep),
            vec![
                Call::Connect,
                Call::Connect,
                Call::Subscribe("/1/#".into()),
                Call::Publish { topic: "/1/2".into(), payload: Bytes::from_static(b"a"), retain: false },
                Call::Publish { topic: "/2".into(), payload: Bytes::from_static(b"b"), retain: false },
                Call::Unsubscribe("/1/#".into()),
                Call::Publish { topic: "/1/2".into(), payload: Bytes::from_static(b"c"), retain: false },
            ]
        );
        assert_eq!(bus.published(&ep).len(), 3);
    }

    #[tokio::test]
    async fn test_retained_and_refused() {
        let ep = Endpoint::new("localhost", 5000);
        let bus = MemoryBus::with_brokers(&[ep.clone()]);
        bus.inject(&ep, "/api/x", "v1", true).unwrap();
        bus.inject(&ep, "/api/x", "v2", true).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let c = bus.connector().connect(&ep, tx).await.unwrap();
        c.subscribe("/api/x").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"v2"));
        assert!(msg.retain);
        assert_eq!(bus.retained(&ep, "/api/x").unwrap().payload, Bytes::from_static(b"v2"));

        let (tx, _rx) = mpsc::channel(16);
        assert!(bus.connector().connect(&Endpoint::new("localhost", 5999), tx).await.is_err());

        c.disconnect(Duration::from_millis(10)).await.unwrap();
        assert_eq!(bus.clients(&ep), 0);
        assert!(c.publish("/1", Bytes::new(), false).await.is_err());
    }
}
