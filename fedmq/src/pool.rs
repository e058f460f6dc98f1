use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tokio::time::Instant;

use crate::broker::BrokerConnection;
use crate::routing::RoutingTable;
use crate::transport::Connector;
use crate::types::{DashMap, Endpoint, Tx};
use crate::{FedError, Result};

type PortMap = DashMap<u16, Arc<BrokerConnection>>;

/// Live backend connections of one gateway, indexed by host then port.
pub struct BrokerPool {
    brokers: DashMap<String, PortMap>,
    connector: Arc<dyn Connector>,
    inbound: Tx,
}

impl BrokerPool {
    /// Every connection opened by the pool delivers its inbound messages to `inbound`.
    pub fn new(connector: Arc<dyn Connector>, inbound: Tx) -> Self {
        Self { brokers: DashMap::default(), connector, inbound }
    }

    pub fn get_broker(&self, host: &str, port: u16) -> Result<Arc<BrokerConnection>> {
        self.brokers
            .get(host)
            .and_then(|ports| ports.get(&port).map(|c| c.value().clone()))
            .ok_or_else(|| FedError::NotFound(format!("broker {host}:{port}")))
    }

    #[inline]
    pub fn contains(&self, host: &str, port: u16) -> bool {
        self.brokers.get(host).map(|ports| ports.contains_key(&port)).unwrap_or(false)
    }

    /// Opens a new connection, a second connect to the same endpoint fails.
    pub async fn connect_broker(&self, host: &str, port: u16) -> Result<()> {
        if self.contains(host, port) {
            return Err(FedError::AlreadyConnected(format!("{host}:{port}")));
        }
        let endpoint = Endpoint::new(host, port);
        let conn = BrokerConnection::connect(self.connector.as_ref(), &endpoint, self.inbound.clone()).await?;
        self.insert(conn)?;
        log::info!("connected to broker {endpoint}");
        Ok(())
    }

    pub async fn get_or_connect_broker(&self, host: &str, port: u16) -> Result<Arc<BrokerConnection>> {
        if let Ok(conn) = self.get_broker(host, port) {
            return Ok(conn);
        }
        self.connect_broker(host, port).await?;
        self.get_broker(host, port)
    }

    /// Connects `new_host:new_port` as the future owner of `topic`.
    ///
    /// The new connection inherits the subscriptions the current owner holds at and below `topic`
    /// and subscribes them upstream. The routing table is left untouched.
    pub async fn add_subset_broker(
        &self,
        new_host: &str,
        new_port: u16,
        topic: &str,
        table: &RoutingTable,
    ) -> Result<()> {
        if self.contains(new_host, new_port) {
            return Err(FedError::AlreadyConnected(format!("{new_host}:{new_port}")));
        }
        let owner_ep = table.lookup(topic)?;
        let owner = self.get_broker(&owner_ep.host, owner_ep.port)?;
        let endpoint = Endpoint::new(new_host, new_port);
        let conn = owner.spawn_subset(self.connector.as_ref(), &endpoint, topic, self.inbound.clone()).await?;
        let conn = self.insert(conn)?;
        log::info!(
            "subset broker {endpoint} for {topic} spun off from {owner_ep}, {} subscribers inherited",
            conn.subscriber_count()
        );
        conn.subscribe_all().await
    }

    /// Evicts the connection if it has no subscribers and has been idle for `idle`.
    pub async fn try_disconnect_broker(&self, host: &str, port: u16, idle: Duration, quiesce: Duration) -> bool {
        let conn = match self.get_broker(host, port) {
            Ok(conn) => conn,
            Err(_) => return false,
        };
        if !conn.try_disconnect(idle, quiesce).await {
            return false;
        }
        self.remove(host, port);
        log::info!("idle broker {host}:{port} disconnected");
        true
    }

    pub async fn close_all_broker(&self, quiesce: Duration) {
        let conns: Vec<Arc<BrokerConnection>> =
            self.brokers.iter().flat_map(|ports| ports.iter().map(|c| c.value().clone()).collect::<Vec<_>>()).collect();
        self.brokers.clear();
        let results = join_all(conns.iter().map(|c| c.disconnect(quiesce))).await;
        for (conn, res) in conns.iter().zip(results) {
            if let Err(e) = res {
                log::warn!("close broker {} failed, {}", conn.endpoint(), e);
            }
        }
    }

    pub fn subscriber_count(&self, host: &str, port: u16) -> Result<u32> {
        Ok(self.get_broker(host, port)?.subscriber_count())
    }

    pub fn last_publish(&self, host: &str, port: u16) -> Result<Instant> {
        Ok(self.get_broker(host, port)?.last_publish())
    }

    /// Every pooled endpoint, sorted.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .brokers
            .iter()
            .flat_map(|ports| ports.iter().map(|c| c.value().endpoint().clone()).collect::<Vec<_>>())
            .collect();
        endpoints.sort();
        endpoints
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.brokers.iter().map(|ports| ports.len()).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, conn: BrokerConnection) -> Result<Arc<BrokerConnection>> {
        let endpoint = conn.endpoint().clone();
        let ports = self.brokers.entry(endpoint.host.clone()).or_default();
        let res = match ports.entry(endpoint.port) {
            Entry::Occupied(_) => Err(FedError::AlreadyConnected(endpoint.to_string())),
            Entry::Vacant(v) => {
                let conn = Arc::new(conn);
                v.insert(conn.clone());
                Ok(conn)
            }
        };
        res
    }

    fn remove(&self, host: &str, port: u16) {
        let empty = match self.brokers.get(host) {
            Some(ports) => {
                ports.remove(&port);
                ports.is_empty()
            }
            None => false,
        };
        if empty {
            self.brokers.remove_if(host, |_, ports| ports.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::{Call, MemoryBus};
    use crate::types::Rx;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("localhost", port)
    }

    fn pool(bus: &MemoryBus) -> (BrokerPool, Rx) {
        let (tx, rx) = mpsc::channel(64);
        (BrokerPool::new(Arc::new(bus.connector()), tx), rx)
    }

    fn connects(bus: &MemoryBus, ep: &Endpoint) -> usize {
        bus.calls(ep).into_iter().filter(|c| *c == Call::Connect).count()
    }

    #[tokio::test]
    async fn test_connect_broker_twice() {
        let bus = MemoryBus::with_brokers(&[ep(5000)]);
        let (pool, _rx) = pool(&bus);
        pool.connect_broker("localhost", 5000).await.unwrap();
        let first = pool.get_broker("localhost", 5000).unwrap();
        assert!(matches!(pool.connect_broker("localhost", 5000).await, Err(FedError::AlreadyConnected(_))));
        assert!(Arc::ptr_eq(&first, &pool.get_broker("localhost", 5000).unwrap()));
        assert_eq!(connects(&bus, &ep(5000)), 1);
        assert!(matches!(pool.get_broker("localhost", 5001), Err(FedError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_get_or_connect_connects_once() {
        let bus = MemoryBus::with_brokers(&[ep(5000)]);
        let (pool, _rx) = pool(&bus);
        let a = pool.get_or_connect_broker("localhost", 5000).await.unwrap();
        let b = pool.get_or_connect_broker("localhost", 5000).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connects(&bus, &ep(5000)), 1);
        assert_eq!(pool.endpoints(), vec![ep(5000)]);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let bus = MemoryBus::new();
        let (pool, _rx) = pool(&bus);
        assert!(matches!(pool.connect_broker("localhost", 5000).await, Err(FedError::Transport(_))));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_add_subset_broker() {
        let bus = MemoryBus::with_brokers(&[ep(5000), ep(5001)]);
        let (pool, _rx) = pool(&bus);
        let mut table = RoutingTable::new();
        table.update("/", "localhost", 5000).unwrap();

        assert!(matches!(
            pool.add_subset_broker("localhost", 5001, "/1", &table).await,
            Err(FedError::NotFound(_))
        ));

        let root = pool.get_or_connect_broker("localhost", 5000).await.unwrap();
        root.subscribe("/1/2").await.unwrap();
        root.subscribe("/1/3/#").await.unwrap();
        root.subscribe("/2").await.unwrap();

        pool.add_subset_broker("localhost", 5001, "/1", &table).await.unwrap();
        assert_eq!(bus.subscriptions(&ep(5001)), vec!["/1/2".to_string(), "/1/3/#".to_string()]);
        assert_eq!(pool.subscriber_count("localhost", 5001).unwrap(), 2);
        assert_eq!(bus.subscriptions(&ep(5000)), vec!["/1/2".to_string(), "/1/3/#".to_string(), "/2".to_string()]);
        assert_eq!(table.lookup("/1/2").unwrap(), ep(5000));

        assert!(matches!(
            pool.add_subset_broker("localhost", 5001, "/1", &table).await,
            Err(FedError::AlreadyConnected(_))
        ));
        assert!(matches!(
            pool.add_subset_broker("localhost", 5002, "/1/9", &table).await,
            Err(FedError::TopicFormat(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_disconnect_broker() {
        let bus = MemoryBus::with_brokers(&[ep(5000), ep(5001)]);
        let (pool, _rx) = pool(&bus);
        let idle = Duration::from_secs(60);
        let quiesce = Duration::from_millis(100);
        let busy = pool.get_or_connect_broker("localhost", 5000).await.unwrap();
        busy.subscribe("/1").await.unwrap();
        pool.connect_broker("localhost", 5001).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(!pool.try_disconnect_broker("localhost", 5000, idle, quiesce).await);
        assert!(pool.try_disconnect_broker("localhost", 5001, idle, quiesce).await);
        assert!(!pool.try_disconnect_broker("localhost", 5001, idle, quiesce).await);
        assert_eq!(pool.endpoints(), vec![ep(5000)]);
        assert_eq!(bus.clients(&ep(5001)), 0);
    }

    #[tokio::test]
    async fn test_close_all_broker() {
        let bus = MemoryBus::with_brokers(&[ep(5000), ep(5001), Endpoint::new("127.0.0.1", 5000)]);
        let (pool, _rx) = pool(&bus);
        pool.connect_broker("localhost", 5000).await.unwrap();
        pool.connect_broker("localhost", 5001).await.unwrap();
        pool.connect_broker("127.0.0.1", 5000).await.unwrap();
        assert_eq!(pool.len(), 3);
        pool.get_broker("localhost", 5000).unwrap().subscribe("/1").await.unwrap();

        pool.close_all_broker(Duration::from_millis(100)).await;
        assert!(pool.is_empty());
        assert_eq!(bus.clients(&ep(5000)), 0);
        assert_eq!(bus.clients(&ep(5001)), 0);
        assert_eq!(bus.calls(&ep(5000)).last(), Some(&Call::Disconnect));
    }
}
