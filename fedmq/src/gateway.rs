//! Gateway node.
//!
//! Client requests arriving on the front-end broker are routed through the local [`RoutingTable`]
//! to a pooled backend connection. Broker table broadcasts from the manager drive the
//! repartition state machine:
//!
//! * `Uninitialized`: the first table is applied in order without any handshake.
//! * `Steady`: a table carrying one new entry spins off a subset broker, starts the dual-publish
//!   window and acknowledges the version.
//! * `Migrating`: the manager's `complete` signal hands the subtree to the new broker for good.
//!   Any other table change while migrating is a protocol violation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use itertools::Itertools;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use fedmq_conf::GatewayConfig;

use crate::pool::BrokerPool;
use crate::routing::RoutingTable;
use crate::stats::Stats;
use crate::topic::{is_within, publish_route_key, route_key, validate_host, validate_route_topic};
use crate::transport::{Connector, Transport};
use crate::types::{
    AllDistributedBrokerInfo, DistributedBrokerInfo, Endpoint, GatewayStatus, Message, Rx, Status,
    INITIAL_VERSION, STATUS_COMPLETE, TOPIC_BROKER_TABLE, TOPIC_FORWARD, TOPIC_GATEWAY_NOTICE, TOPIC_REGISTER,
    TOPIC_UNREGISTER, TOPIC_UPDATE_STATUS,
};
use crate::{FedError, Result};

const FORWARD_FILTER: &str = "/forward/#";

/// A broker table change this gateway has applied but not yet finalized.
#[derive(Debug, Clone)]
pub struct Migration {
    pub entry: DistributedBrokerInfo,
    pub version: i64,
    pub since: Instant,
    //subset broker connected and subscribed, version acknowledged
    pub ready: bool,
}

#[derive(Debug, Clone)]
pub enum State {
    Uninitialized,
    Steady,
    Migrating(Migration),
}

pub struct Gateway {
    cfg: GatewayConfig,
    identity: Endpoint,
    control: Box<dyn Transport>,
    front: Box<dyn Transport>,
    control_rx: Rx,
    front_rx: Rx,
    backend_rx: Rx,
    pool: BrokerPool,
    table: RoutingTable,
    known: Vec<DistributedBrokerInfo>,
    version: i64,
    state: State,
    stats: Stats,
}

impl Gateway {
    /// Connects to the manager bus and the front-end broker and announces the gateway.
    ///
    /// Any failure here is fatal, the gateway cannot run without its control channel.
    pub async fn connect(cfg: GatewayConfig, connector: Arc<dyn Connector>, channel_capacity: usize) -> Result<Self> {
        let identity = Endpoint::new(cfg.host.clone(), cfg.port);
        let manager = Endpoint::new(cfg.manager_host.clone(), cfg.manager_port);
        let (control_tx, control_rx) = mpsc::channel(channel_capacity);
        let (front_tx, front_rx) = mpsc::channel(channel_capacity);
        let (backend_tx, backend_rx) = mpsc::channel(channel_capacity);

        let control = connector.connect(&manager, control_tx).await?;
        for topic in [TOPIC_BROKER_TABLE, TOPIC_UPDATE_STATUS] {
            control.subscribe(topic).await?;
        }
        let front = connector.connect(&identity, front_tx).await?;
        for topic in [TOPIC_REGISTER, TOPIC_UNREGISTER, FORWARD_FILTER] {
            front.subscribe(topic).await?;
        }

        let gateway = Self {
            cfg,
            identity,
            control,
            front,
            control_rx,
            front_rx,
            backend_rx,
            pool: BrokerPool::new(connector, backend_tx),
            table: RoutingTable::new(),
            known: Vec::new(),
            version: INITIAL_VERSION,
            state: State::Uninitialized,
            stats: Stats::new(),
        };
        gateway.publish_status(Status::Up, INITIAL_VERSION).await?;
        log::info!("gateway {} is up, manager bus {}", gateway.identity, manager);
        Ok(gateway)
    }

    #[inline]
    pub fn identity(&self) -> &Endpoint {
        &self.identity
    }

    #[inline]
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    #[inline]
    pub fn pool(&self) -> &BrokerPool {
        &self.pool
    }

    #[inline]
    pub fn state(&self) -> &State {
        &self.state
    }

    #[inline]
    pub fn version(&self) -> i64 {
        self.version
    }

    #[inline]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Runs the event loop until `shutdown` resolves or a protocol violation occurs, then closes
    /// every connection.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut idle_tick = ticker(self.cfg.idle_check_interval);
        let mut stats_tick = ticker(self.cfg.stats_interval);
        let mut alert_tick = ticker(self.cfg.migration_alert_interval);

        let res = loop {
            let res = tokio::select! {
                _ = &mut shutdown => {
                    log::info!("gateway {} shutting down", self.identity);
                    break Ok(());
                }
                Some(msg) = self.control_rx.recv() => self.on_control(msg).await,
                Some(msg) = self.front_rx.recv() => {
                    self.on_front(msg).await;
                    Ok(())
                }
                Some(msg) = self.backend_rx.recv() => {
                    self.on_backend(msg).await;
                    Ok(())
                }
                _ = idle_tick.tick() => {
                    self.evict_idle().await;
                    Ok(())
                }
                _ = stats_tick.tick() => {
                    self.stats.log(self.pool.len());
                    Ok(())
                }
                _ = alert_tick.tick() => {
                    self.check_migration().await;
                    Ok(())
                }
            };
            if let Err(e) = res {
                log::error!("gateway {} stopped, {}", self.identity, e);
                break Err(e);
            }
        };
        self.close().await;
        res
    }

    /// Handles every message already queued without waiting for more, returns how many were handled.
    pub async fn process_pending(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            if let Ok(msg) = self.control_rx.try_recv() {
                self.on_control(msg).await?;
            } else if let Ok(msg) = self.front_rx.try_recv() {
                self.on_front(msg).await;
            } else if let Ok(msg) = self.backend_rx.try_recv() {
                self.on_backend(msg).await;
            } else {
                return Ok(handled);
            }
            handled += 1;
        }
    }

    /// Disconnects idle backend brokers that take no part in a pending migration.
    pub async fn evict_idle(&self) {
        let involved = match &self.state {
            State::Migrating(m) => {
                let mut endpoints = self.involved_endpoints(&m.entry.topic);
                endpoints.push(m.entry.broker_info.clone());
                endpoints
            }
            _ => Vec::new(),
        };
        for ep in self.pool.endpoints() {
            if involved.contains(&ep) {
                continue;
            }
            self.pool.try_disconnect_broker(&ep.host, ep.port, self.cfg.idle_timeout, self.cfg.quiesce).await;
        }
    }

    /// Alerts on a migration pending for longer than `migration_alert_interval`, retrying the
    /// subset broker or re-acknowledging the version.
    pub async fn check_migration(&mut self) {
        let mut m = match &self.state {
            State::Migrating(m) if m.since.elapsed() >= self.cfg.migration_alert_interval => m.clone(),
            _ => return,
        };
        log::warn!(
            "migration of {} to {} (version {}) pending for {:?}",
            m.entry.topic,
            m.entry.broker_info,
            m.version,
            m.since.elapsed()
        );
        if m.ready {
            self.ack(m.version).await;
        } else {
            self.prepare(&mut m).await;
            self.state = State::Migrating(m);
        }
    }

    /// Closes every backend connection, then the front-end and control connections.
    pub async fn close(&mut self) {
        self.pool.close_all_broker(self.cfg.quiesce).await;
        if let Err(e) = self.front.disconnect(self.cfg.quiesce).await {
            log::warn!("disconnect from front-end {} failed, {}", self.front.endpoint(), e);
        }
        if let Err(e) = self.control.disconnect(self.cfg.quiesce).await {
            log::warn!("disconnect from manager bus {} failed, {}", self.control.endpoint(), e);
        }
    }

    async fn on_control(&mut self, msg: Message) -> Result<()> {
        match self.handle_control(msg).await {
            Err(e) if !e.is_fatal() => {
                log::warn!("control message ignored, {}", e);
                Ok(())
            }
            res => res,
        }
    }

    async fn handle_control(&mut self, msg: Message) -> Result<()> {
        match msg.topic.as_str() {
            TOPIC_BROKER_TABLE => {
                if msg.payload.is_empty() {
                    return Ok(());
                }
                let info: AllDistributedBrokerInfo = serde_json::from_slice(&msg.payload)
                    .map_err(|e| FedError::Protocol(format!("malformed broker table, {e}")))?;
                self.on_broker_table(info).await
            }
            TOPIC_UPDATE_STATUS => {
                if is_complete(&msg.payload) {
                    self.on_update_complete().await
                } else {
                    log::debug!("ignore update status {:?}", msg.payload);
                    Ok(())
                }
            }
            _ => {
                log::debug!("unexpected control message on {}", msg.topic);
                Ok(())
            }
        }
    }

    async fn on_broker_table(&mut self, info: AllDistributedBrokerInfo) -> Result<()> {
        if info.version < self.version {
            log::debug!("stale broker table version {}, current {}", info.version, self.version);
            return Ok(());
        }
        if info.version == self.version {
            //rebroadcast of the table already applied
            match &self.state {
                State::Steady => self.ack(self.version).await,
                State::Migrating(m) if m.ready => self.ack(m.version).await,
                _ => {}
            }
            return Ok(());
        }
        validate_table(&info)?;
        if let State::Migrating(m) = &self.state {
            return Err(FedError::Protocol(format!(
                "broker table version {} received while version {} is still pending",
                info.version, m.version
            )));
        }
        if matches!(self.state, State::Uninitialized) {
            self.bootstrap(info).await
        } else {
            self.begin_migration(info).await
        }
    }

    async fn bootstrap(&mut self, info: AllDistributedBrokerInfo) -> Result<()> {
        for entry in info.brokers.iter() {
            let ep = &entry.broker_info;
            if !self.table.is_initialized() {
                self.table.update(&entry.topic, &ep.host, ep.port)?;
                if let Err(e) = self.pool.get_or_connect_broker(&ep.host, ep.port).await {
                    log::warn!("connect to broker {} failed, {}", ep, e);
                }
                continue;
            }
            let owner = self.table.lookup(&entry.topic)?;
            if let Err(e) = self.spin_off(entry, &owner).await {
                log::warn!("subset broker {} for {} not connected, {}", ep, entry.topic, e);
            }
            self.table.update(&entry.topic, &ep.host, ep.port)?;
        }
        self.known = info.brokers;
        self.version = info.version;
        self.state = State::Steady;
        log::info!("bootstrapped from broker table version {}, {} brokers", self.version, self.known.len());
        log::debug!("routing table: {}", self.table.to_json());
        self.ack(self.version).await;
        Ok(())
    }

    async fn begin_migration(&mut self, info: AllDistributedBrokerInfo) -> Result<()> {
        let mut added: Vec<DistributedBrokerInfo> =
            info.brokers.into_iter().filter(|b| !self.known.contains(b)).collect();
        if added.len() > 1 {
            return Err(FedError::Protocol(format!(
                "{} brokers added at version {}, only one change at a time is supported",
                added.len(),
                info.version
            )));
        }
        self.version = info.version;
        let entry = match added.pop() {
            Some(entry) => entry,
            None => {
                self.ack(self.version).await;
                return Ok(());
            }
        };
        let mut m = Migration { entry, version: info.version, since: Instant::now(), ready: false };
        self.prepare(&mut m).await;
        self.state = State::Migrating(m);
        Ok(())
    }

    //Opens the subset broker and acknowledges the version once it is subscribed.
    async fn prepare(&self, m: &mut Migration) {
        let owner = match self.table.lookup(&m.entry.topic) {
            Ok(owner) => owner,
            Err(e) => {
                log::error!("no owner for {}, {}", m.entry.topic, e);
                return;
            }
        };
        match self.spin_off(&m.entry, &owner).await {
            Ok(()) => {
                m.ready = true;
                log::info!(
                    "migrating {} from {} to {}, version {}",
                    m.entry.topic,
                    owner,
                    m.entry.broker_info,
                    m.version
                );
                self.ack(m.version).await;
            }
            Err(e) => {
                log::warn!("subset broker {} for {} not ready, {}", m.entry.broker_info, m.entry.topic, e);
            }
        }
    }

    async fn spin_off(&self, entry: &DistributedBrokerInfo, owner: &Endpoint) -> Result<()> {
        self.pool.get_or_connect_broker(&owner.host, owner.port).await?;
        let ep = &entry.broker_info;
        match self.pool.add_subset_broker(&ep.host, ep.port, &entry.topic, &self.table).await {
            Ok(()) | Err(FedError::AlreadyConnected(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn on_update_complete(&mut self) -> Result<()> {
        let m = match &self.state {
            State::Migrating(m) if m.ready => m.clone(),
            State::Migrating(m) => {
                log::warn!("complete received before subset broker {} is ready", m.entry.broker_info);
                return Ok(());
            }
            _ => {
                log::debug!("complete received without pending migration");
                return Ok(());
            }
        };
        let topic = m.entry.topic.as_str();
        let new = &m.entry.broker_info;
        for ep in self.involved_endpoints(topic).into_iter().unique().filter(|ep| ep != new) {
            if let Ok(conn) = self.pool.get_broker(&ep.host, ep.port) {
                if let Err(e) = conn.unsubscribe_subtree(topic).await {
                    log::warn!("unsubscribe {} on {} failed, {}", topic, ep, e);
                }
            }
        }
        self.table.update(topic, &new.host, new.port)?;
        log::info!("migration of {} to {} complete, version {}", topic, new, m.version);
        log::debug!("routing table: {}", self.table.to_json());
        self.known.push(m.entry);
        self.state = State::Steady;
        Ok(())
    }

    //Endpoints that may hold subscriptions under `topic`.
    fn involved_endpoints(&self, topic: &str) -> Vec<Endpoint> {
        let mut endpoints = self.table.lookup_subtree_endpoints(topic).unwrap_or_default();
        endpoints.extend(self.table.subtree_endpoints(topic).unwrap_or_default());
        endpoints
    }

    async fn on_front(&self, msg: Message) {
        let res = if msg.topic == TOPIC_REGISTER {
            self.register(&msg.payload).await
        } else if msg.topic == TOPIC_UNREGISTER {
            self.unregister(&msg.payload).await
        } else if let Some(topic) = msg.topic.strip_prefix(TOPIC_FORWARD) {
            self.forward(topic, msg.payload).await
        } else {
            log::debug!("unexpected front-end message on {}", msg.topic);
            return;
        };
        if let Err(e) = res {
            self.stats.dropped.inc();
            log::warn!("request on {} dropped, {}", msg.topic, e);
        }
    }

    async fn register(&self, payload: &Bytes) -> Result<()> {
        let topic = payload_topic(payload)?;
        let key = route_key(topic)?;
        let owner = self.table.lookup(key)?;
        self.pool.get_or_connect_broker(&owner.host, owner.port).await?.subscribe(topic).await?;
        if let Some(new) = self.dual_target(key) {
            if let Err(e) = self.pool.get_broker(&new.host, new.port)?.subscribe(topic).await {
                log::warn!("register {} on subset broker {} failed, {}", topic, new, e);
            }
        }
        self.stats.registers.inc();
        Ok(())
    }

    async fn unregister(&self, payload: &Bytes) -> Result<()> {
        let topic = payload_topic(payload)?;
        let key = route_key(topic)?;
        let owner = self.table.lookup(key)?;
        self.pool.get_broker(&owner.host, owner.port)?.unsubscribe(topic).await?;
        if let Some(new) = self.dual_target(key) {
            if let Err(e) = self.pool.get_broker(&new.host, new.port)?.unsubscribe(topic).await {
                log::warn!("unregister {} on subset broker {} failed, {}", topic, new, e);
            }
        }
        self.stats.unregisters.inc();
        Ok(())
    }

    async fn forward(&self, topic: &str, payload: Bytes) -> Result<()> {
        let key = publish_route_key(topic)?;
        let owner = self.table.lookup(key)?;
        let res = self.publish_to(&owner, topic, payload.clone()).await;
        if let Some(new) = self.dual_target(key) {
            if let Err(e) = self.publish_to(new, topic, payload).await {
                log::warn!("dual publish of {} to {} failed, {}", topic, new, e);
            }
        }
        res?;
        self.stats.forwards.inc();
        Ok(())
    }

    async fn publish_to(&self, ep: &Endpoint, topic: &str, payload: Bytes) -> Result<()> {
        self.pool.get_or_connect_broker(&ep.host, ep.port).await?.publish(topic, payload, false).await
    }

    //Subset broker that must also see requests routed by `key` during the dual-publish window.
    fn dual_target(&self, key: &str) -> Option<&Endpoint> {
        match &self.state {
            State::Migrating(m) if m.ready && is_within(key, &m.entry.topic) => Some(&m.entry.broker_info),
            _ => None,
        }
    }

    async fn on_backend(&self, msg: Message) {
        match self.front.publish(&msg.topic, msg.payload, msg.retain).await {
            Ok(()) => self.stats.deliveries.inc(),
            Err(e) => {
                self.stats.dropped.inc();
                log::warn!("deliver {} to front-end failed, {}", msg.topic, e);
            }
        }
    }

    async fn ack(&self, version: i64) {
        if let Err(e) = self.publish_status(Status::Complete, version).await {
            log::warn!("report complete for version {} failed, {}", version, e);
        }
    }

    async fn publish_status(&self, status: Status, version: i64) -> Result<()> {
        let payload =
            serde_json::to_vec(&GatewayStatus { broker_info: self.identity.clone(), status, version })?;
        self.control.publish(TOPIC_GATEWAY_NOTICE, Bytes::from(payload), false).await
    }
}

fn validate_table(info: &AllDistributedBrokerInfo) -> Result<()> {
    for entry in info.brokers.iter() {
        validate_route_topic(&entry.topic)
            .and_then(|_| validate_host(&entry.broker_info.host))
            .map_err(|e| FedError::Protocol(format!("invalid broker table entry, {e}")))?;
    }
    Ok(())
}

#[inline]
fn is_complete(payload: &[u8]) -> bool {
    std::str::from_utf8(payload).map(|s| s.trim().trim_matches('"') == STATUS_COMPLETE).unwrap_or(false)
}

#[inline]
fn payload_topic(payload: &Bytes) -> Result<&str> {
    std::str::from_utf8(payload).map(str::trim).map_err(|e| FedError::Msg(format!("topic is not utf-8, {e}")))
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport::{Call, MemoryBus};

    const MANAGER: u16 = 1883;
    const FRONT: u16 = 1884;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("localhost", port)
    }

    fn cfg() -> GatewayConfig {
        GatewayConfig { port: FRONT, manager_port: MANAGER, ..Default::default() }
    }

    fn bus() -> MemoryBus {
        MemoryBus::with_brokers(&[ep(MANAGER), ep(FRONT), ep(5000), ep(5001), ep(5002), ep(5003)])
    }

    fn table(version: i64, entries: &[(&str, u16)]) -> String {
        let brokers: Vec<_> = entries
            .iter()
            .map(|(topic, port)| json!({"topic": topic, "broker_info": {"host": "localhost", "port": port}}))
            .collect();
        json!({"version": version, "brokers": brokers}).to_string()
    }

    fn statuses(bus: &MemoryBus) -> Vec<GatewayStatus> {
        bus.published(&ep(MANAGER))
            .into_iter()
            .filter(|m| m.topic == TOPIC_GATEWAY_NOTICE)
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }

    fn published_topics(bus: &MemoryBus, port: u16) -> Vec<String> {
        bus.published(&ep(port)).into_iter().map(|m| m.topic).collect()
    }

    async fn gateway(bus: &MemoryBus, entries: &[(&str, u16)]) -> Gateway {
        bus.inject(&ep(MANAGER), TOPIC_BROKER_TABLE, table(0, entries), true).unwrap();
        let mut gw = Gateway::connect(cfg(), Arc::new(bus.connector()), 64).await.unwrap();
        gw.process_pending().await.unwrap();
        gw
    }

    #[tokio::test]
    async fn test_bootstrap() {
        let bus = bus();
        let gw = gateway(&bus, &[("/", 5000), ("/1", 5001)]).await;
        assert!(matches!(gw.state(), State::Steady));
        assert_eq!(gw.version(), 0);
        assert_eq!(gw.table().lookup("/1/2").unwrap(), ep(5001));
        assert_eq!(gw.table().lookup("/2").unwrap(), ep(5000));
        assert_eq!(gw.pool().endpoints(), vec![ep(5000), ep(5001)]);

        let statuses = statuses(&bus);
        assert_eq!(statuses.len(), 2);
        assert_eq!((statuses[0].status, statuses[0].version), (Status::Up, INITIAL_VERSION));
        assert_eq!((statuses[1].status, statuses[1].version), (Status::Complete, 0));
        assert_eq!(statuses[1].broker_info, ep(FRONT));
    }

    #[tokio::test]
    async fn test_control_channel_unreachable() {
        let bus = MemoryBus::with_brokers(&[ep(FRONT)]);
        assert!(Gateway::connect(cfg(), Arc::new(bus.connector()), 64).await.is_err());
    }

    #[tokio::test]
    async fn test_register_forward_deliver() {
        let bus = bus();
        let mut gw = gateway(&bus, &[("/", 5000)]).await;

        bus.inject(&ep(FRONT), TOPIC_REGISTER, "/1/2/#", false).unwrap();
        gw.process_pending().await.unwrap();
        assert_eq!(bus.subscriptions(&ep(5000)), vec!["/1/2/#".to_string()]);

        bus.inject(&ep(FRONT), "/forward/1/2/3", "hello", false).unwrap();
        gw.process_pending().await.unwrap();
        let sent = bus.published(&ep(5000));
        assert_eq!(sent, vec![Message::new("/1/2/3", "hello")]);
        assert!(bus.published(&ep(FRONT)).contains(&Message::new("/1/2/3", "hello")));

        bus.inject(&ep(FRONT), TOPIC_UNREGISTER, "/1/2/#", false).unwrap();
        bus.inject(&ep(FRONT), TOPIC_REGISTER, "/x", false).unwrap();
        bus.inject(&ep(FRONT), TOPIC_UNREGISTER, "/7", false).unwrap();
        bus.inject(&ep(FRONT), "/forward/1/+", "bad", false).unwrap();
        gw.process_pending().await.unwrap();
        assert!(bus.subscriptions(&ep(5000)).is_empty());

        let stats = gw.stats();
        assert_eq!(stats.registers.count(), 1);
        assert_eq!(stats.unregisters.count(), 1);
        assert_eq!(stats.forwards.count(), 1);
        assert_eq!(stats.deliveries.count(), 1);
        assert_eq!(stats.dropped.count(), 3);
    }

    #[tokio::test]
    async fn test_migration_dual_publish_and_finalize() {
        let bus = bus();
        let mut gw = gateway(&bus, &[("/", 5000)]).await;
        bus.inject(&ep(FRONT), TOPIC_REGISTER, "/1/2", false).unwrap();
        bus.inject(&ep(FRONT), TOPIC_REGISTER, "/2", false).unwrap();
        gw.process_pending().await.unwrap();

        bus.inject(&ep(MANAGER), TOPIC_BROKER_TABLE, table(1, &[("/", 5000), ("/1", 5001)]), true).unwrap();
        gw.process_pending().await.unwrap();
        assert!(matches!(gw.state(), State::Migrating(m) if m.ready && m.version == 1));
        assert_eq!(bus.subscriptions(&ep(5001)), vec!["/1/2".to_string()]);
        let last = statuses(&bus).pop().unwrap();
        assert_eq!((last.status, last.version), (Status::Complete, 1));

        //registrations inside the migrating subtree reach both brokers
        bus.inject(&ep(FRONT), TOPIC_REGISTER, "/1/3", false).unwrap();
        bus.inject(&ep(FRONT), "/forward/1/2", "m1", false).unwrap();
        bus.inject(&ep(FRONT), "/forward/2", "m2", false).unwrap();
        gw.process_pending().await.unwrap();
        assert_eq!(bus.subscriptions(&ep(5001)), vec!["/1/2".to_string(), "/1/3".to_string()]);
        assert_eq!(published_topics(&bus, 5000), vec!["/1/2".to_string(), "/2".to_string()]);
        assert_eq!(published_topics(&bus, 5001), vec!["/1/2".to_string()]);
        assert_eq!(gw.table().lookup("/1/2").unwrap(), ep(5000));

        bus.inject(&ep(MANAGER), TOPIC_UPDATE_STATUS, STATUS_COMPLETE, false).unwrap();
        gw.process_pending().await.unwrap();
        assert!(matches!(gw.state(), State::Steady));
        assert_eq!(gw.table().lookup("/1/2").unwrap(), ep(5001));
        assert_eq!(gw.table().lookup("/2").unwrap(), ep(5000));
        assert_eq!(bus.subscriptions(&ep(5000)), vec!["/2".to_string()]);

        bus.clear_calls(&ep(5000));
        bus.inject(&ep(FRONT), "/forward/1/3", "m3", false).unwrap();
        gw.process_pending().await.unwrap();
        assert!(published_topics(&bus, 5000).is_empty());
        assert_eq!(published_topics(&bus, 5001).last().map(String::as_str), Some("/1/3"));
    }

    #[tokio::test]
    async fn test_second_migration_is_fatal() {
        let bus = bus();
        let mut gw = gateway(&bus, &[("/", 5000)]).await;
        bus.inject(&ep(MANAGER), TOPIC_BROKER_TABLE, table(1, &[("/", 5000), ("/1", 5001)]), true).unwrap();
        gw.process_pending().await.unwrap();
        bus.inject(&ep(MANAGER), TOPIC_BROKER_TABLE, table(2, &[("/", 5000), ("/1", 5001), ("/2", 5002)]), true)
            .unwrap();
        let err = gw.process_pending().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_malformed_table_is_fatal() {
        let bus = bus();
        let mut gw = gateway(&bus, &[("/", 5000)]).await;
        bus.inject(&ep(MANAGER), TOPIC_BROKER_TABLE, "{\"version\":3}", true).unwrap();
        assert!(matches!(gw.process_pending().await, Err(FedError::Protocol(_))));
        bus.inject(&ep(MANAGER), TOPIC_BROKER_TABLE, table(4, &[("/", 5000), ("/1/7", 5001)]), true).unwrap();
        assert!(matches!(gw.process_pending().await, Err(FedError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_rebroadcast_is_acknowledged_again() {
        let bus = bus();
        let mut gw = gateway(&bus, &[("/", 5000)]).await;
        bus.inject(&ep(MANAGER), TOPIC_BROKER_TABLE, table(0, &[("/", 5000)]), true).unwrap();
        gw.process_pending().await.unwrap();
        let statuses = statuses(&bus);
        assert_eq!(statuses.len(), 3);
        assert!(statuses[1..].iter().all(|s| s.status == Status::Complete && s.version == 0));

        //a complete signal without a pending migration changes nothing
        bus.inject(&ep(MANAGER), TOPIC_UPDATE_STATUS, STATUS_COMPLETE, false).unwrap();
        gw.process_pending().await.unwrap();
        assert!(matches!(gw.state(), State::Steady));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_subset_broker_is_retried() {
        let bus = bus();
        let mut gw = gateway(&bus, &[("/", 5000)]).await;
        let new = Endpoint::new("localhost", 5009);
        bus.inject(
            &ep(MANAGER),
            TOPIC_BROKER_TABLE,
            table(1, &[("/", 5000), ("/1", new.port)]),
            true,
        )
        .unwrap();
        gw.process_pending().await.unwrap();
        assert!(matches!(gw.state(), State::Migrating(m) if !m.ready));
        assert_eq!(statuses(&bus).last().map(|s| s.version), Some(0));

        gw.check_migration().await;
        assert!(matches!(gw.state(), State::Migrating(m) if !m.ready));

        bus.add_broker(&new);
        tokio::time::advance(Duration::from_secs(31)).await;
        gw.check_migration().await;
        assert!(matches!(gw.state(), State::Migrating(m) if m.ready));
        assert_eq!(statuses(&bus).last().map(|s| s.version), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_skips_migrating_brokers() {
        let bus = bus();
        let mut gw = gateway(&bus, &[("/", 5000), ("/1", 5001), ("/2", 5002)]).await;
        bus.inject(
            &ep(MANAGER),
            TOPIC_BROKER_TABLE,
            table(1, &[("/", 5000), ("/1", 5001), ("/2", 5002), ("/1/0", 5003)]),
            true,
        )
        .unwrap();
        gw.process_pending().await.unwrap();
        assert!(matches!(gw.state(), State::Migrating(m) if m.ready));
        assert_eq!(gw.pool().len(), 4);

        tokio::time::advance(Duration::from_secs(600)).await;
        gw.evict_idle().await;
        assert_eq!(gw.pool().endpoints(), vec![ep(5000), ep(5001), ep(5003)]);
        assert_eq!(bus.clients(&ep(5002)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let bus = bus();
        let mut gw = gateway(&bus, &[("/", 5000)]).await;
        bus.inject(&ep(FRONT), TOPIC_REGISTER, "/1", false).unwrap();

        gw.run(tokio::time::sleep(Duration::from_millis(50))).await.unwrap();
        assert!(bus.calls(&ep(5000)).contains(&Call::Subscribe("/1".into())));
        assert_eq!(bus.calls(&ep(5000)).last(), Some(&Call::Disconnect));
        assert_eq!(bus.clients(&ep(FRONT)), 0);
        assert_eq!(bus.clients(&ep(MANAGER)), 0);
        assert!(gw.pool().is_empty());
    }
}
