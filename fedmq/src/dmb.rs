//! Distributed broker registrar.
//!
//! Asks the manager to take a backend broker into the broker table and keeps asking, with
//! randomized exponential backoff, until the retained table lists it.

use std::future::Future;
use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bytes::Bytes;
use tokio::sync::mpsc;

use fedmq_conf::DmbConfig;

use crate::topic::{validate_host, validate_route_topic};
use crate::transport::{Connector, Transport};
use crate::types::{AllDistributedBrokerInfo, DistributedBrokerInfo, Endpoint, Message, Rx, TOPIC_BROKER_ADD, TOPIC_BROKER_TABLE};
use crate::{FedError, Result};

pub struct Registrar {
    cfg: DmbConfig,
    entry: DistributedBrokerInfo,
    bus: Box<dyn Transport>,
    rx: Rx,
}

impl Registrar {
    pub async fn connect(cfg: DmbConfig, connector: Arc<dyn Connector>, channel_capacity: usize) -> Result<Self> {
        validate_route_topic(&cfg.topic)?;
        validate_host(&cfg.host)?;
        let entry = DistributedBrokerInfo::new(cfg.topic.clone(), Endpoint::new(cfg.host.clone(), cfg.port));
        let manager = Endpoint::new(cfg.manager_host.clone(), cfg.manager_port);
        let (tx, rx) = mpsc::channel(channel_capacity);
        let bus = connector.connect(&manager, tx).await?;
        bus.subscribe(TOPIC_BROKER_TABLE).await?;
        Ok(Self { cfg, entry, bus, rx })
    }

    #[inline]
    pub fn entry(&self) -> &DistributedBrokerInfo {
        &self.entry
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.cfg.retry_initial)
            .with_max_interval(self.cfg.retry_max)
            .with_multiplier(self.cfg.retry_multiplier)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Sends add requests until the broker shows up in the table.
    ///
    /// Returns `false` when `shutdown` resolved first.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<bool>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut backoff = self.backoff();
        let registered = 'outer: loop {
            self.request().await;
            let wait = backoff.next_backoff().unwrap_or(self.cfg.retry_max);
            let deadline = tokio::time::sleep(wait);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break 'outer false,
                    msg = self.rx.recv() => match msg {
                        Some(msg) => if self.is_registered(&msg) {
                            break 'outer true;
                        },
                        None => return Err(FedError::Transport("manager bus connection closed".into())),
                    },
                    _ = &mut deadline => {
                        log::info!("{} not in broker table yet, retry after {:?}", self.entry.broker_info, wait);
                        break;
                    }
                }
            }
        };
        if registered {
            log::info!("broker {} registered for {}", self.entry.broker_info, self.entry.topic);
        }
        if let Err(e) = self.bus.disconnect(self.cfg.retry_initial).await {
            log::warn!("disconnect from manager bus failed, {}", e);
        }
        Ok(registered)
    }

    async fn request(&self) {
        let res = match serde_json::to_vec(&self.entry) {
            Ok(payload) => self.bus.publish(TOPIC_BROKER_ADD, Bytes::from(payload), false).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = res {
            log::warn!("add request for {} failed, {}", self.entry.broker_info, e);
        }
    }

    fn is_registered(&self, msg: &Message) -> bool {
        if msg.topic != TOPIC_BROKER_TABLE || msg.payload.is_empty() {
            return false;
        }
        match serde_json::from_slice::<AllDistributedBrokerInfo>(&msg.payload) {
            Ok(table) => table.contains(&self.entry.broker_info),
            Err(e) => {
                log::warn!("malformed broker table, {}", e);
                false
            }
        }
    }
}
