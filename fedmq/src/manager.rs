//! Coordinator owning the authoritative broker table.
//!
//! Every accepted addition bumps the table version and is broadcast retained. Gateways report the
//! version they applied; once every known gateway reports the outstanding version the manager
//! publishes `complete` so gateways finalize the cutover.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use fedmq_conf::ManagerConfig;

use crate::topic::{segments, validate_host, validate_route_topic};
use crate::transport::{Connector, Transport};
use crate::types::{
    AllDistributedBrokerInfo, DistributedBrokerInfo, Endpoint, GatewayCoverArea, GatewayStatus, Message, Rx,
    Status, STATUS_COMPLETE, TOPIC_BROKER_ADD, TOPIC_BROKER_TABLE, TOPIC_GATEWAY_INFO, TOPIC_GATEWAY_NOTICE,
    TOPIC_GATEWAY_SET, TOPIC_UPDATE_STATUS,
};
use crate::{FedError, Result};

#[derive(Debug, Clone)]
struct Outstanding {
    version: i64,
    since: Instant,
    rebroadcasts: usize,
}

pub struct Manager {
    cfg: ManagerConfig,
    bus: Box<dyn Transport>,
    rx: Rx,
    table: AllDistributedBrokerInfo,
    statuses: BTreeMap<String, GatewayStatus>,
    areas: BTreeMap<String, (Endpoint, Vec<String>)>,
    outstanding: Option<Outstanding>,
}

impl Manager {
    pub async fn connect(cfg: ManagerConfig, connector: Arc<dyn Connector>, channel_capacity: usize) -> Result<Self> {
        let endpoint = Endpoint::new(cfg.host.clone(), cfg.port);
        let (tx, rx) = mpsc::channel(channel_capacity);
        let bus = connector.connect(&endpoint, tx).await?;
        for topic in [TOPIC_GATEWAY_NOTICE, TOPIC_GATEWAY_SET, TOPIC_BROKER_ADD] {
            bus.subscribe(topic).await?;
        }
        log::info!("manager connected to bus {}", endpoint);
        Ok(Self {
            cfg,
            bus,
            rx,
            table: AllDistributedBrokerInfo::default(),
            statuses: BTreeMap::new(),
            areas: BTreeMap::new(),
            outstanding: None,
        })
    }

    #[inline]
    pub fn table(&self) -> &AllDistributedBrokerInfo {
        &self.table
    }

    #[inline]
    pub fn status(&self, gateway: &Endpoint) -> Option<&GatewayStatus> {
        self.statuses.get(&gateway.key())
    }

    /// Version of the addition not yet acknowledged by every gateway.
    #[inline]
    pub fn outstanding(&self) -> Option<i64> {
        self.outstanding.as_ref().map(|o| o.version)
    }

    pub fn coverage(&self) -> Vec<GatewayCoverArea> {
        self.areas
            .values()
            .flat_map(|(ep, topics)| {
                topics.iter().map(move |topic| GatewayCoverArea { topic: topic.clone(), broker_info: ep.clone() })
            })
            .collect()
    }

    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let period = self.cfg.check_interval.max(std::time::Duration::from_millis(1));
        let mut check_tick = tokio::time::interval_at(Instant::now() + period, period);
        check_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("manager shutting down");
                    break;
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.on_message(msg).await,
                    None => {
                        log::error!("manager bus connection closed");
                        break;
                    }
                },
                _ = check_tick.tick() => self.check_migration().await,
            }
        }
        if let Err(e) = self.bus.disconnect(std::time::Duration::ZERO).await {
            log::warn!("disconnect from bus failed, {}", e);
        }
        Ok(())
    }

    /// Handles every message already queued without waiting for more, returns how many were handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.rx.try_recv() {
            self.on_message(msg).await;
            handled += 1;
        }
        handled
    }

    async fn on_message(&mut self, msg: Message) {
        let res = match msg.topic.as_str() {
            TOPIC_BROKER_ADD => match serde_json::from_slice::<DistributedBrokerInfo>(&msg.payload) {
                Ok(info) => self.add_broker(info).await,
                Err(e) => Err(e.into()),
            },
            TOPIC_GATEWAY_NOTICE => match serde_json::from_slice::<GatewayStatus>(&msg.payload) {
                Ok(status) => self.on_gateway_status(status).await,
                Err(e) => Err(e.into()),
            },
            TOPIC_GATEWAY_SET => match serde_json::from_slice::<GatewayCoverArea>(&msg.payload) {
                Ok(area) => self.set_gateway_area(area).await,
                Err(e) => Err(e.into()),
            },
            _ => {
                log::debug!("unexpected message on {}", msg.topic);
                Ok(())
            }
        };
        if let Err(e) = res {
            log::warn!("message on {} ignored, {}", msg.topic, e);
        }
    }

    /// Appends a broker to the table and broadcasts the new version.
    pub async fn add_broker(&mut self, info: DistributedBrokerInfo) -> Result<()> {
        validate_route_topic(&info.topic)?;
        validate_host(&info.broker_info.host)?;
        if let Some(o) = self.outstanding.as_ref() {
            return Err(FedError::Msg(format!(
                "add {} rejected, version {} is not acknowledged by every gateway",
                info.broker_info, o.version
            )));
        }
        if self.table.contains(&info.broker_info) {
            return Err(FedError::Duplicate(format!("broker {}", info.broker_info)));
        }

        log::info!("add broker {} for {}", info.broker_info, info.topic);
        let endpoint = info.broker_info.clone();
        self.table.brokers.push(info);
        self.table.version += 1;
        self.table.brokers.sort_by_key(|b| segments(&b.topic).count());
        //gateways never saw this version, so the table must not keep it
        if let Err(e) = self.publish_table().await {
            self.table.brokers.retain(|b| b.broker_info != endpoint);
            self.table.version -= 1;
            return Err(e);
        }
        if !self.statuses.is_empty() {
            self.outstanding = Some(Outstanding { version: self.table.version, since: Instant::now(), rebroadcasts: 0 });
        }
        Ok(())
    }

    async fn on_gateway_status(&mut self, status: GatewayStatus) -> Result<()> {
        if status.version > self.table.version {
            return Err(FedError::Msg(format!(
                "{} reports version {} ahead of table version {}",
                status.broker_info, status.version, self.table.version
            )));
        }
        let key = status.broker_info.key();
        match status.status {
            Status::Up => {
                log::info!("gateway {} is up", status.broker_info);
                self.areas.entry(key.clone()).or_insert_with(|| (status.broker_info.clone(), vec!["/".into()]));
                self.statuses.insert(key, status);
                self.publish_coverage().await?;
            }
            Status::Complete => {
                if status.version < self.table.version {
                    return Err(FedError::Msg(format!(
                        "stale complete from {} for version {}, table version {}",
                        status.broker_info, status.version, self.table.version
                    )));
                }
                if self.outstanding.is_none() && self.statuses.get(&key) == Some(&status) {
                    log::debug!("duplicate complete from {} for version {}", status.broker_info, status.version);
                    return Ok(());
                }
                log::info!("gateway {} applied version {}", status.broker_info, status.version);
                self.areas.entry(key.clone()).or_insert_with(|| (status.broker_info.clone(), vec!["/".into()]));
                self.statuses.insert(key, status);
            }
        }
        self.check_convergence().await
    }

    async fn check_convergence(&mut self) -> Result<()> {
        let version = match self.outstanding.as_ref() {
            Some(o) => o.version,
            None => return Ok(()),
        };
        if !self.lagging(version).is_empty() {
            return Ok(());
        }
        self.bus.publish(TOPIC_UPDATE_STATUS, Bytes::from_static(STATUS_COMPLETE.as_bytes()), false).await?;
        self.outstanding = None;
        log::info!("every gateway applied version {}, migration complete", version);
        Ok(())
    }

    //Gateways that have not reported `complete` for `version`.
    fn lagging(&self, version: i64) -> Vec<&Endpoint> {
        self.statuses
            .values()
            .filter(|s| !(s.status == Status::Complete && s.version == version))
            .map(|s| &s.broker_info)
            .collect()
    }

    /// Assigns an extra coverage area to a known gateway.
    pub async fn set_gateway_area(&mut self, area: GatewayCoverArea) -> Result<()> {
        validate_route_topic(&area.topic)?;
        let key = area.broker_info.key();
        let topics = match self.areas.get_mut(&key) {
            Some((_, topics)) => topics,
            None => return Err(FedError::NotFound(format!("gateway {}", area.broker_info))),
        };
        if topics.contains(&area.topic) {
            log::debug!("gateway {} already covers {}", area.broker_info, area.topic);
            return Ok(());
        }
        topics.push(area.topic);
        self.publish_coverage().await
    }

    /// Re-broadcasts the table for a migration not acknowledged within `migration_timeout`.
    pub async fn check_migration(&mut self) {
        let (version, since, rebroadcasts) = match self.outstanding.as_ref() {
            Some(o) => (o.version, o.since, o.rebroadcasts),
            None => return,
        };
        if since.elapsed() < self.cfg.migration_timeout {
            return;
        }
        let lagging = self.lagging(version).iter().map(|ep| ep.to_string()).collect::<Vec<_>>().join(", ");
        if rebroadcasts >= self.cfg.max_rebroadcasts {
            log::error!("migration to version {} stalled, waiting for {}", version, lagging);
            return;
        }
        log::warn!(
            "migration to version {} not acknowledged by {} after {:?}, rebroadcasting",
            version,
            lagging,
            since.elapsed()
        );
        if let Err(e) = self.publish_table().await {
            log::warn!("rebroadcast broker table failed, {}", e);
        }
        if let Some(o) = self.outstanding.as_mut() {
            o.rebroadcasts += 1;
            o.since = Instant::now();
        }
    }

    async fn publish_table(&self) -> Result<()> {
        let payload = serde_json::to_vec(&self.table)?;
        self.bus.publish(TOPIC_BROKER_TABLE, Bytes::from(payload), true).await
    }

    async fn publish_coverage(&self) -> Result<()> {
        let payload = serde_json::to_vec(&self.coverage())?;
        self.bus.publish(TOPIC_GATEWAY_INFO, Bytes::from(payload), true).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::transport::MemoryBus;

    fn bus_ep() -> Endpoint {
        Endpoint::new("127.0.0.1", 1883)
    }

    fn gw(port: u16) -> Endpoint {
        Endpoint::new("localhost", port)
    }

    async fn manager(bus: &MemoryBus) -> Manager {
        Manager::connect(ManagerConfig::default(), Arc::new(bus.connector()), 64).await.unwrap()
    }

    fn add(bus: &MemoryBus, topic: &str, port: u16) {
        let payload = json!({"broker_info": {"host": "127.0.0.1", "port": port}, "topic": topic});
        bus.inject(&bus_ep(), TOPIC_BROKER_ADD, payload.to_string(), false).unwrap();
    }

    fn report(bus: &MemoryBus, gateway: &Endpoint, status: &str, version: i64) {
        let payload = json!({"broker_info": gateway, "status": status, "version": version});
        bus.inject(&bus_ep(), TOPIC_GATEWAY_NOTICE, payload.to_string(), false).unwrap();
    }

    fn retained_table(bus: &MemoryBus) -> AllDistributedBrokerInfo {
        serde_json::from_slice(&bus.retained(&bus_ep(), TOPIC_BROKER_TABLE).unwrap().payload).unwrap()
    }

    fn completes(bus: &MemoryBus) -> usize {
        bus.published(&bus_ep()).iter().filter(|m| m.topic == TOPIC_UPDATE_STATUS).count()
    }

    #[tokio::test]
    async fn test_add_broker_sorted_and_duplicate() {
        let bus = MemoryBus::with_brokers(&[bus_ep()]);
        let mut m = manager(&bus).await;
        add(&bus, "/1/2", 5002);
        add(&bus, "/", 5000);
        add(&bus, "/1", 5001);
        add(&bus, "/3", 5001);
        add(&bus, "/1/9", 5003);
        bus.inject(&bus_ep(), TOPIC_BROKER_ADD, "not json", false).unwrap();
        assert_eq!(m.process_pending().await, 6);

        let table = retained_table(&bus);
        assert_eq!(table.version, 2);
        let topics: Vec<&str> = table.brokers.iter().map(|b| b.topic.as_str()).collect();
        assert_eq!(topics, vec!["/", "/1", "/1/2"]);
        assert_eq!(&table, m.table());
        assert!(m.outstanding().is_none());
        assert!(matches!(
            m.add_broker(DistributedBrokerInfo::new("/2", Endpoint::new("127.0.0.1", 5000))).await,
            Err(FedError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_broadcast_rolls_back_addition() {
        let bus = MemoryBus::with_brokers(&[bus_ep()]);
        let mut m = manager(&bus).await;
        add(&bus, "/", 5000);
        report(&bus, &gw(1884), "up", -1);
        m.process_pending().await;
        let before = m.table().clone();

        bus.remove_broker(&bus_ep());
        let info = DistributedBrokerInfo::new("/1", Endpoint::new("127.0.0.1", 5001));
        assert!(matches!(m.add_broker(info.clone()).await, Err(FedError::Transport(_))));
        assert_eq!(m.table(), &before);
        assert!(m.outstanding().is_none());

        //a retry is not mistaken for a duplicate
        assert!(matches!(m.add_broker(info).await, Err(FedError::Transport(_))));
        assert_eq!(m.table().version, 0);
        assert_eq!(m.table().brokers.len(), 1);
    }

    #[tokio::test]
    async fn test_completion_waits_for_every_gateway() {
        let bus = MemoryBus::with_brokers(&[bus_ep()]);
        let mut m = manager(&bus).await;
        add(&bus, "/", 5000);
        report(&bus, &gw(1884), "up", -1);
        report(&bus, &gw(1885), "up", -1);
        report(&bus, &gw(1884), "complete", 0);
        report(&bus, &gw(1885), "complete", 0);
        m.process_pending().await;
        assert_eq!(completes(&bus), 0);

        add(&bus, "/1", 5001);
        m.process_pending().await;
        assert_eq!(m.outstanding(), Some(1));

        //no second migration while the first is outstanding
        add(&bus, "/2", 5002);
        report(&bus, &gw(1884), "complete", 1);
        m.process_pending().await;
        assert_eq!(m.table().version, 1);
        assert_eq!(completes(&bus), 0);

        report(&bus, &gw(1885), "complete", 1);
        m.process_pending().await;
        assert_eq!(completes(&bus), 1);
        assert!(m.outstanding().is_none());
        assert_eq!(m.status(&gw(1885)).map(|s| s.version), Some(1));
    }

    #[tokio::test]
    async fn test_out_of_protocol_status_is_ignored() {
        let bus = MemoryBus::with_brokers(&[bus_ep()]);
        let mut m = manager(&bus).await;
        add(&bus, "/", 5000);
        report(&bus, &gw(1884), "complete", 7);
        report(&bus, &gw(1884), "down", 0);
        bus.inject(&bus_ep(), TOPIC_GATEWAY_NOTICE, "{}", false).unwrap();
        m.process_pending().await;
        assert!(m.status(&gw(1884)).is_none());

        report(&bus, &gw(1884), "complete", 0);
        report(&bus, &gw(1884), "complete", 0);
        m.process_pending().await;
        assert_eq!(m.status(&gw(1884)).map(|s| s.status), Some(Status::Complete));
        assert_eq!(completes(&bus), 0);
    }

    #[tokio::test]
    async fn test_coverage_map() {
        let bus = MemoryBus::with_brokers(&[bus_ep()]);
        let mut m = manager(&bus).await;
        report(&bus, &gw(1884), "up", -1);
        m.process_pending().await;
        let area = |topic: &str, port: u16| json!({"topic": topic, "broker_info": gw(port)}).to_string();
        bus.inject(&bus_ep(), TOPIC_GATEWAY_SET, area("/1", 1884), false).unwrap();
        bus.inject(&bus_ep(), TOPIC_GATEWAY_SET, area("/1", 1884), false).unwrap();
        bus.inject(&bus_ep(), TOPIC_GATEWAY_SET, area("/2", 1999), false).unwrap();
        m.process_pending().await;

        let retained = bus.retained(&bus_ep(), TOPIC_GATEWAY_INFO).unwrap();
        let coverage: Vec<GatewayCoverArea> = serde_json::from_slice(&retained.payload).unwrap();
        assert_eq!(coverage, m.coverage());
        let topics: Vec<&str> = coverage.iter().map(|c| c.topic.as_str()).collect();
        assert_eq!(topics, vec!["/", "/1"]);
        let publishes = bus.published(&bus_ep()).iter().filter(|m| m.topic == TOPIC_GATEWAY_INFO).count();
        assert_eq!(publishes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_migration_rebroadcasts() {
        let bus = MemoryBus::with_brokers(&[bus_ep()]);
        let mut m = manager(&bus).await;
        add(&bus, "/", 5000);
        report(&bus, &gw(1884), "up", -1);
        m.process_pending().await;
        add(&bus, "/1", 5001);
        m.process_pending().await;
        let tables = |bus: &MemoryBus| bus.published(&bus_ep()).iter().filter(|m| m.topic == TOPIC_BROKER_TABLE).count();
        assert_eq!(tables(&bus), 2);

        m.check_migration().await;
        assert_eq!(tables(&bus), 2);

        for round in 1..=5 {
            tokio::time::advance(Duration::from_secs(121)).await;
            m.check_migration().await;
            assert_eq!(tables(&bus), 2 + round.min(3));
        }
        assert_eq!(m.outstanding(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let bus = MemoryBus::with_brokers(&[bus_ep()]);
        let mut m = manager(&bus).await;
        add(&bus, "/", 5000);
        m.run(tokio::time::sleep(Duration::from_millis(50))).await.unwrap();
        assert_eq!(m.table().version, 0);
        assert_eq!(bus.clients(&bus_ep()), 0);
    }
}
