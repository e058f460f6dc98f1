use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::subscription::{Action, SubscriptionTracker};
use crate::transport::{Connector, Transport};
use crate::types::{Endpoint, Tx};
use crate::{FedError, Result};

/// A pooled connection to one backend broker together with the subscriptions routed through it.
pub struct BrokerConnection {
    transport: Box<dyn Transport>,
    tracker: Mutex<SubscriptionTracker>,
    subscriber_count: RwLock<u32>,
    last_publish: RwLock<Instant>,
}

impl BrokerConnection {
    #[inline]
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_tracker(transport, SubscriptionTracker::new())
    }

    fn with_tracker(transport: Box<dyn Transport>, tracker: SubscriptionTracker) -> Self {
        let subscriber_count = tracker.total_subscribers();
        Self {
            transport,
            tracker: Mutex::new(tracker),
            subscriber_count: RwLock::new(subscriber_count),
            last_publish: RwLock::new(Instant::now()),
        }
    }

    pub async fn connect(connector: &dyn Connector, endpoint: &Endpoint, inbound: Tx) -> Result<Self> {
        Ok(Self::new(connector.connect(endpoint, inbound).await?))
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        self.transport.endpoint()
    }

    pub async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        let res = self.transport.publish(topic, payload, retain).await;
        self.update_last_publish();
        res
    }

    /// Registers one local subscriber of `topic`, subscribing upstream when needed.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.inc_subscriber_count(topic)?;
        let res = self.tracker.lock().increase(topic);
        let actions = match res {
            Ok(actions) => actions,
            Err(e) => {
                self.dec_subscriber_count(1);
                return Err(e);
            }
        };
        self.apply(actions).await
    }

    /// Drops one local subscriber of `topic`, unsubscribing upstream when it was the last one.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let actions = self.tracker.lock().decrease(topic)?;
        self.dec_subscriber_count(1);
        self.apply(actions).await
    }

    /// Disconnects if nobody is subscribed and nothing was published within `idle`.
    pub async fn try_disconnect(&self, idle: Duration, quiesce: Duration) -> bool {
        if self.subscriber_count() != 0 {
            return false;
        }
        if self.last_publish().elapsed() < idle {
            return false;
        }
        if let Err(e) = self.disconnect(quiesce).await {
            log::warn!("disconnect from {} failed, {}", self.endpoint(), e);
        }
        true
    }

    #[inline]
    pub async fn disconnect(&self, quiesce: Duration) -> Result<()> {
        self.transport.disconnect(quiesce).await
    }

    /// Opens a connection to `endpoint` that inherits the subscriptions at and below `topic`.
    ///
    /// The new connection holds no upstream subscription until [`BrokerConnection::subscribe_all`].
    pub async fn spawn_subset(
        &self,
        connector: &dyn Connector,
        endpoint: &Endpoint,
        topic: &str,
        inbound: Tx,
    ) -> Result<BrokerConnection> {
        let tracker = self.tracker.lock().subset(topic)?;
        let transport = connector.connect(endpoint, inbound).await?;
        Ok(Self::with_tracker(transport, tracker))
    }

    pub async fn subscribe_all(&self) -> Result<()> {
        let actions = self.tracker.lock().activate_all()?;
        self.apply(actions).await
    }

    /// Hands off everything at and below `topic`: unsubscribes it upstream and forgets its subscribers.
    pub async fn unsubscribe_subtree(&self, topic: &str) -> Result<()> {
        let (actions, removed) = self.tracker.lock().detach_subtree(topic)?;
        self.dec_subscriber_count(removed);
        self.apply(actions).await
    }

    #[inline]
    pub fn subscriber_count(&self) -> u32 {
        *self.subscriber_count.read()
    }

    #[inline]
    pub fn last_publish(&self) -> Instant {
        *self.last_publish.read()
    }

    #[inline]
    pub fn update_last_publish(&self) {
        *self.last_publish.write() = Instant::now();
    }

    #[inline]
    pub fn active_topics(&self) -> Vec<String> {
        self.tracker.lock().active_topics()
    }

    #[inline]
    pub fn tracker_json(&self) -> serde_json::Value {
        self.tracker.lock().to_json()
    }

    fn inc_subscriber_count(&self, topic: &str) -> Result<()> {
        let mut count = self.subscriber_count.write();
        *count = count.checked_add(1).ok_or_else(|| FedError::MaxSubscriberCount(topic.into()))?;
        Ok(())
    }

    fn dec_subscriber_count(&self, n: u32) {
        let mut count = self.subscriber_count.write();
        *count = count.saturating_sub(n);
    }

    //A failed subscribe leaves its topic inactive so the next registration retries it. Unsubscribes
    //planned after it were meant to be covered by it, so they are withdrawn.
    async fn apply(&self, actions: Vec<Action>) -> Result<()> {
        let mut first_err = None;
        let mut uncovered = false;
        for action in actions {
            let res = match &action {
                Action::Subscribe(topic) => self.transport.subscribe(topic).await,
                Action::Unsubscribe(topic) if uncovered => {
                    self.tracker.lock().set_active(topic, true)?;
                    continue;
                }
                Action::Unsubscribe(topic) => self.transport.unsubscribe(topic).await,
            };
            if let Err(e) = res {
                log::warn!("{:?} on {} failed, {}", action, self.endpoint(), e);
                if let Action::Subscribe(topic) = &action {
                    self.tracker.lock().set_active(topic, false)?;
                    uncovered = true;
                }
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::{Call, MemoryBus};

    fn sub(t: &str) -> Call {
        Call::Subscribe(t.into())
    }

    fn unsub(t: &str) -> Call {
        Call::Unsubscribe(t.into())
    }

    async fn connect(bus: &MemoryBus, ep: &Endpoint) -> BrokerConnection {
        let (tx, _rx) = mpsc::channel(16);
        BrokerConnection::connect(&bus.connector(), ep, tx).await.unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_counts() {
        let ep = Endpoint::new("localhost", 5000);
        let bus = MemoryBus::with_brokers(&[ep.clone()]);
        let conn = connect(&bus, &ep).await;

        conn.subscribe("/1/#").await.unwrap();
        conn.subscribe("/1/2").await.unwrap();
        assert_eq!(conn.subscriber_count(), 2);
        assert_eq!(bus.calls(&ep), vec![Call::Connect, sub("/1/#")]);

        conn.unsubscribe("/1/#").await.unwrap();
        assert_eq!(conn.subscriber_count(), 1);
        assert_eq!(bus.calls(&ep)[2..], [unsub("/1/#"), sub("/1/2")]);

        assert!(matches!(conn.unsubscribe("/1/3").await, Err(FedError::NotFound(_))));
        assert!(matches!(conn.subscribe("/1/x/#").await, Err(FedError::TopicFormat(_))));
        assert_eq!(conn.subscriber_count(), 1);
        assert_eq!(bus.subscriptions(&ep), vec!["/1/2".to_string()]);
    }

    #[tokio::test]
    async fn test_spawn_subset_and_unsubscribe_subtree() {
        let old = Endpoint::new("localhost", 5000);
        let new = Endpoint::new("localhost", 5001);
        let bus = MemoryBus::with_brokers(&[old.clone(), new.clone()]);
        let conn = connect(&bus, &old).await;
        conn.subscribe("/1/2").await.unwrap();
        conn.subscribe("/1/3/#").await.unwrap();
        conn.subscribe("/2").await.unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let subset = conn.spawn_subset(&bus.connector(), &new, "/1", tx).await.unwrap();
        assert_eq!(subset.subscriber_count(), 2);
        assert!(bus.subscriptions(&new).is_empty());
        subset.subscribe_all().await.unwrap();
        assert_eq!(bus.subscriptions(&new), vec!["/1/2".to_string(), "/1/3/#".to_string()]);

        conn.unsubscribe_subtree("/1").await.unwrap();
        assert_eq!(conn.subscriber_count(), 1);
        assert_eq!(bus.subscriptions(&old), vec!["/2".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_subscribe_is_retried() {
        let ep = Endpoint::new("localhost", 5000);
        let bus = MemoryBus::with_brokers(&[ep.clone()]);
        let conn = connect(&bus, &ep).await;

        bus.refuse_subscribe(&ep, true);
        assert!(matches!(conn.subscribe("/1/2").await, Err(FedError::Transport(_))));
        assert_eq!(conn.subscriber_count(), 1);
        assert!(conn.active_topics().is_empty());

        bus.refuse_subscribe(&ep, false);
        conn.subscribe("/1/2").await.unwrap();
        assert_eq!(conn.active_topics(), vec!["/1/2".to_string()]);
        assert_eq!(bus.subscriptions(&ep), vec!["/1/2".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_wildcard_keeps_covered_topics() {
        let ep = Endpoint::new("localhost", 5000);
        let bus = MemoryBus::with_brokers(&[ep.clone()]);
        let conn = connect(&bus, &ep).await;
        conn.subscribe("/1/2").await.unwrap();

        bus.refuse_subscribe(&ep, true);
        assert!(conn.subscribe("/1/#").await.is_err());
        assert_eq!(conn.active_topics(), vec!["/1/2".to_string()]);
        assert_eq!(bus.subscriptions(&ep), vec!["/1/2".to_string()]);
        assert_eq!(bus.calls(&ep), vec![Call::Connect, sub("/1/2")]);

        bus.refuse_subscribe(&ep, false);
        conn.subscribe("/1/#").await.unwrap();
        assert_eq!(conn.subscriber_count(), 3);
        assert_eq!(bus.subscriptions(&ep), vec!["/1/#".to_string()]);
        assert_eq!(bus.calls(&ep)[2..], [sub("/1/#"), unsub("/1/2")]);

        conn.unsubscribe("/1/#").await.unwrap();
        conn.unsubscribe("/1/#").await.unwrap();
        assert_eq!(bus.subscriptions(&ep), vec!["/1/2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_disconnect() {
        let ep = Endpoint::new("localhost", 5000);
        let bus = MemoryBus::with_brokers(&[ep.clone()]);
        let conn = connect(&bus, &ep).await;
        let idle = Duration::from_secs(60);
        let quiesce = Duration::from_millis(100);

        conn.subscribe("/1").await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!conn.try_disconnect(idle, quiesce).await);

        conn.unsubscribe("/1").await.unwrap();
        conn.publish("/1", Bytes::from_static(b"x"), false).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!conn.try_disconnect(idle, quiesce).await);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(conn.try_disconnect(idle, quiesce).await);
        assert_eq!(bus.clients(&ep), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_still_updates_last_publish() {
        let ep = Endpoint::new("localhost", 5000);
        let bus = MemoryBus::with_brokers(&[ep.clone()]);
        let conn = connect(&bus, &ep).await;
        let before = conn.last_publish();
        bus.remove_broker(&ep);
        assert!(matches!(conn.publish("/1", Bytes::new(), false).await, Err(FedError::Transport(_))));
        assert!(conn.last_publish() >= before);
    }
}
